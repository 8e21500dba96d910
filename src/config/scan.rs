//! Z-scan parameter file.
//!
//! Plain `key = value` text shared with the acquisition GUI:
//!
//! ```text
//! Z Init (um) = 1.0
//! Z Final (um) = 1.5
//! Z Step (nm) = 100
//!
//! Camera settings :
//! Exposure time = 20000
//! FPS = 10
//! BlackLevel = 0
//!
//! Patterns loaded :
//! Pattern 1 = patterns/grid.bmp
//! ```
//!
//! Keys are matched by prefix and unknown lines are skipped, so the unit
//! suffixes and section headers are free text.

use super::ConfigError;
use crate::codec::PiezoPosition;
use crate::error::{LinkError, LinkResult};
use anyhow::Context;
use std::fmt::Write as _;
use std::path::Path;

/// Scan range plus the camera and pattern settings saved alongside it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScanParameters {
    /// First position, µm.
    pub z_init_um: f64,
    /// Scan end (exclusive), µm.
    pub z_final_um: f64,
    /// Step, nm.
    pub z_step_nm: f64,
    /// Camera exposure time.
    pub exposure_time: Option<f64>,
    /// Camera frame rate.
    pub fps: Option<u32>,
    /// Camera black level.
    pub black_level: Option<u32>,
    /// Pattern number and image path.
    pub patterns: Vec<(u32, String)>,
}

impl ScanParameters {
    /// Scan range with no camera or pattern settings. A decreasing range is
    /// swapped.
    pub fn new(z_init_um: f64, z_final_um: f64, z_step_nm: f64) -> Self {
        let mut params = Self {
            z_init_um,
            z_final_um,
            z_step_nm,
            ..Self::default()
        };
        params.order_range();
        params
    }

    fn order_range(&mut self) {
        if self.z_init_um > self.z_final_um {
            std::mem::swap(&mut self.z_init_um, &mut self.z_final_um);
        }
    }

    /// Parse file contents.
    ///
    /// # Errors
    /// [`ConfigError::ValidationError`] for a malformed value, a missing Z key
    /// or a non-positive step.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut params = Self::default();
        let (mut init, mut fin, mut step) = (None, None, None);

        for line in text.lines().map(str::trim) {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            if key.starts_with("Z Init") {
                init = Some(number(key, value)?);
            } else if key.starts_with("Z Final") {
                fin = Some(number(key, value)?);
            } else if key.starts_with("Z Step") {
                step = Some(number(key, value)?);
            } else if key.starts_with("Exposure time") {
                params.exposure_time = Some(number(key, value)?);
            } else if key.starts_with("FPS") {
                params.fps = Some(number(key, value)?);
            } else if key.starts_with("BlackLevel") {
                params.black_level = Some(number(key, value)?);
            } else if let Some(index) = key.strip_prefix("Pattern ") {
                params.patterns.push((number(key, index.trim())?, value.to_string()));
            }
        }

        let missing = |name: &str| ConfigError::ValidationError(format!("scan file has no '{name}' line"));
        params.z_init_um = init.ok_or_else(|| missing("Z Init"))?;
        params.z_final_um = fin.ok_or_else(|| missing("Z Final"))?;
        params.z_step_nm = step.ok_or_else(|| missing("Z Step"))?;
        if params.z_step_nm <= 0.0 || !params.z_step_nm.is_finite() {
            return Err(ConfigError::ValidationError(format!(
                "Z Step must be positive, got {}",
                params.z_step_nm
            )));
        }
        params.order_range();
        Ok(params)
    }

    /// Render in the file format, section headers included.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Z Init (um) = {}", self.z_init_um);
        let _ = writeln!(out, "Z Final (um) = {}", self.z_final_um);
        let _ = writeln!(out, "Z Step (nm) = {}", self.z_step_nm);
        out.push('\n');
        out.push_str("Camera settings :\n");
        if let Some(exposure) = self.exposure_time {
            let _ = writeln!(out, "Exposure time = {exposure}");
        }
        if let Some(fps) = self.fps {
            let _ = writeln!(out, "FPS = {fps}");
        }
        if let Some(level) = self.black_level {
            let _ = writeln!(out, "BlackLevel = {level}");
        }
        out.push('\n');
        out.push_str("Patterns loaded :\n");
        for (index, path) in &self.patterns {
            let _ = writeln!(out, "Pattern {index} = {path}");
        }
        out
    }

    /// Read a scan file.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scan parameters from {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid scan parameters in {}", path.display()))
    }

    /// Write a scan file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.render())
            .with_context(|| format!("Failed to write scan parameters to {}", path.display()))
    }

    /// Piezo set-points of the scan.
    ///
    /// Starts at Z Init and adds Z Step while below Z Final. Each value is
    /// split into whole µm and truncated nm. The last generated point is
    /// dropped.
    ///
    /// # Errors
    /// [`LinkError::Range`] for a non-positive step or a point outside the
    /// stage travel.
    pub fn z_positions(&self) -> LinkResult<Vec<PiezoPosition>> {
        if self.z_step_nm <= 0.0 || !self.z_step_nm.is_finite() {
            return Err(LinkError::Range(format!(
                "Z step must be positive, got {} nm",
                self.z_step_nm
            )));
        }
        let mut points = Vec::new();
        let mut z = self.z_init_um;
        while z < self.z_final_um {
            points.push(PiezoPosition::from_micrometers(z)?);
            z += self.z_step_nm * 1e-3;
        }
        points.pop();
        Ok(points)
    }
}

fn number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::ValidationError(format!("'{key}' has invalid value '{value}'")))
}
