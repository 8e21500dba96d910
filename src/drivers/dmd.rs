//! DLPC900 digital micromirror device over USB.
//!
//! The controller speaks 64-byte reports. Each command report opens with a
//! six byte header:
//!
//! | byte | meaning                                      |
//! |------|----------------------------------------------|
//! | 0    | flags: `0xC0` read, `0x40` write (reply requested) |
//! | 1    | sequence byte                                |
//! | 2..4 | payload length + 2, little endian            |
//! | 4    | command LSB                                  |
//! | 5    | command MSB                                  |
//!
//! A payload longer than 58 bytes spills into continuation reports of raw
//! 64-byte chunks, zero padded. The controller answers every report set with
//! one 64-byte reply.
//!
//! Sequencing is enforced in the type system:
//!
//! ```text
//! Dmd<Idle> --load_sequence--> Dmd<SequenceLoaded> --start_sequence--> Dmd<Running>
//!     ^                                                                    |
//!     +----------------------------- stop_sequence ------------------------+
//! ```
//!
//! A failed transition hands the device back in its previous state through
//! [`TransitionError`].
//!
//! Transfers are blocking. From async code, run them through
//! [`crate::runtime::HardwareRuntime::call_blocking`] or
//! `tokio::task::spawn_blocking`.

#[cfg(feature = "dmd_usb")]
use crate::config::DmdConfig;
use crate::error::{LinkError, LinkResult};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, trace, warn};

/// USB report size.
pub const REPORT_LEN: usize = 64;

/// Payload bytes that fit in the first report.
pub const FIRST_REPORT_PAYLOAD: usize = REPORT_LEN - HEADER_LEN;

/// Image data bytes per `0x1A2B` command.
pub const IMAGE_CHUNK_LEN: usize = 504;

/// Binary patterns merged into one 24-bit image plane.
pub const PATTERNS_PER_PLANE: usize = 24;

/// Size of the `Spld` image header.
pub const SPLD_HEADER_LEN: usize = 48;

/// Default USB vendor id of the DLPC900.
pub const DLPC900_VENDOR_ID: u16 = 0x0451;

/// Default USB product id of the DLPC900.
pub const DLPC900_PRODUCT_ID: u16 = 0xC900;

const HEADER_LEN: usize = 6;
const MAX_PATTERNS: usize = (1 << 11) - 1;
const MAX_24_BIT: u32 = (1 << 24) - 1;
const IMAGE_DATA_SEQUENCE: u8 = 0x11;
const ERROR_QUERY_SEQUENCE: u8 = 0x22;

/// Controller command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum DmdCommand {
    /// Last error code.
    ReadError = 0x0100,
    /// Controller reset.
    Reset = 0x0200,
    /// Hardware status.
    Status = 0x1A0A,
    /// Display mode.
    DisplayMode = 0x1A1B,
    /// Start, pause or stop the pattern sequence.
    PatternStartStop = 0x1A24,
    /// Announce an image upload.
    ImageUploadSetup = 0x1A2A,
    /// Image data chunk.
    ImageData = 0x1A2B,
    /// Pattern LUT size and repeat count.
    LutConfig = 0x1A31,
    /// One pattern LUT entry.
    PatternDefinition = 0x1A34,
}

impl DmdCommand {
    /// Command code.
    pub fn code(self) -> u16 {
        self as u16
    }
}

/// Report direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Query; the reply carries data.
    Read,
    /// Command; the reply is an acknowledgement.
    Write,
}

impl Direction {
    fn flags(self) -> u8 {
        match self {
            Direction::Read => 0xC0,
            Direction::Write => 0x40,
        }
    }
}

/// Controller display modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DisplayMode {
    /// Video input.
    Video = 0,
    /// Patterns from video input.
    PreStored = 1,
    /// Video pattern mode.
    VideoPattern = 2,
    /// Patterns uploaded over USB.
    PatternOnTheFly = 3,
}

/// Split one command into the reports that carry it.
pub fn build_reports(
    direction: Direction,
    sequence: u8,
    command: DmdCommand,
    payload: &[u8],
) -> Vec<[u8; REPORT_LEN]> {
    let code = command.code().to_le_bytes();
    let length = u16::try_from(payload.len() + 2).unwrap_or(u16::MAX).to_le_bytes();

    let mut first = [0u8; REPORT_LEN];
    first[0] = direction.flags();
    first[1] = sequence;
    first[2..4].copy_from_slice(&length);
    first[4] = code[0];
    first[5] = code[1];

    let split = payload.len().min(FIRST_REPORT_PAYLOAD);
    first[HEADER_LEN..HEADER_LEN + split].copy_from_slice(&payload[..split]);

    let mut reports = vec![first];
    for chunk in payload[split..].chunks(REPORT_LEN) {
        let mut report = [0u8; REPORT_LEN];
        report[..chunk.len()].copy_from_slice(chunk);
        reports.push(report);
    }
    reports
}

/// Text for a controller error code.
pub fn error_description(code: u8) -> &'static str {
    match code {
        0 => "no error",
        1 => "batch file checksum error",
        2 => "device failure",
        3 => "invalid command number",
        4 => "incompatible controller and DMD",
        5 => "command not allowed in current mode",
        6 => "invalid command parameter",
        7 => "item referred by the parameter is not present",
        8 => "out of resource (RAM or flash)",
        9 => "invalid BMP compression type",
        10 => "pixel count out of range",
        11 => "pixel format not supported",
        12 => "system is busy",
        13 => "sequence aborted",
        _ => "unknown error",
    }
}

/// Blocking access to the controller's report endpoints.
pub trait DmdUsb: Send + fmt::Debug {
    /// Write one report.
    fn write_report(&mut self, report: &[u8; REPORT_LEN]) -> LinkResult<()>;

    /// Read one reply report.
    fn read_report(&mut self) -> LinkResult<[u8; REPORT_LEN]>;

    /// Send a command and return the controller's reply.
    fn command(
        &mut self,
        direction: Direction,
        sequence: u8,
        command: DmdCommand,
        payload: &[u8],
    ) -> LinkResult<[u8; REPORT_LEN]> {
        let reports = build_reports(direction, sequence, command, payload);
        trace!(
            command = format_args!("{:#06x}", command.code()),
            reports = reports.len(),
            bytes = payload.len(),
            "dmd command"
        );
        for report in &reports {
            self.write_report(report)?;
        }
        self.read_report()
    }
}

#[derive(Debug, Default)]
struct MockDmdState {
    reports: Vec<[u8; REPORT_LEN]>,
    replies: usize,
    error_code: u8,
    fail_writes: bool,
}

/// In-memory controller recording every report.
#[derive(Debug, Clone, Default)]
pub struct MockDmdUsb {
    state: Arc<Mutex<MockDmdState>>,
}

impl MockDmdUsb {
    /// Controller with no errors.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockDmdState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Error code reported by the next `0x0100` queries.
    pub fn set_error_code(&self, code: u8) {
        self.lock().error_code = code;
    }

    /// Make every write fail.
    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Every report written so far.
    pub fn reports(&self) -> Vec<[u8; REPORT_LEN]> {
        self.lock().reports.clone()
    }

    /// Command codes of the first report of each command, in order.
    ///
    /// Continuation reports are skipped by tracking the announced length.
    pub fn commands(&self) -> Vec<u16> {
        let reports = self.reports();
        let mut codes = Vec::new();
        let mut i = 0;
        while i < reports.len() {
            let report = &reports[i];
            codes.push(u16::from_le_bytes([report[4], report[5]]));
            let payload = usize::from(u16::from_le_bytes([report[2], report[3]])).saturating_sub(2);
            let spill = payload.saturating_sub(FIRST_REPORT_PAYLOAD);
            i += 1 + spill.div_ceil(REPORT_LEN);
        }
        codes
    }

    /// Number of replies handed out.
    pub fn replies(&self) -> usize {
        self.lock().replies
    }
}

impl DmdUsb for MockDmdUsb {
    fn write_report(&mut self, report: &[u8; REPORT_LEN]) -> LinkResult<()> {
        let mut state = self.lock();
        if state.fail_writes {
            return Err(LinkError::Io {
                port: "mock-dmd".into(),
                source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "injected failure"),
            });
        }
        state.reports.push(*report);
        Ok(())
    }

    fn read_report(&mut self) -> LinkResult<[u8; REPORT_LEN]> {
        let mut state = self.lock();
        state.replies += 1;
        let mut reply = [0u8; REPORT_LEN];
        if let Some(last) = state.reports.iter().rev().find(|r| r[0] & 0x40 != 0) {
            reply[..HEADER_LEN].copy_from_slice(&last[..HEADER_LEN]);
        }
        reply[6] = state.error_code;
        Ok(reply)
    }
}

#[cfg(feature = "dmd_usb")]
pub use self::rusb_backend::RusbDmd;

#[cfg(feature = "dmd_usb")]
mod rusb_backend {
    use super::{DmdUsb, REPORT_LEN};
    use crate::error::{LinkError, LinkResult};
    use std::fmt;
    use std::time::Duration;

    const OUT_ENDPOINT: u8 = 0x01;
    const IN_ENDPOINT: u8 = 0x81;

    /// DLPC900 opened through libusb.
    pub struct RusbDmd {
        handle: rusb::DeviceHandle<rusb::GlobalContext>,
        label: String,
        timeout: Duration,
    }

    impl fmt::Debug for RusbDmd {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("RusbDmd")
                .field("device", &self.label)
                .field("timeout", &self.timeout)
                .finish()
        }
    }

    impl RusbDmd {
        /// Open the first device matching `vendor_id:product_id` and claim
        /// interface 0.
        pub fn open(vendor_id: u16, product_id: u16, timeout: Duration) -> LinkResult<Self> {
            let label = format!("usb:{vendor_id:04x}:{product_id:04x}");
            let mut handle = rusb::open_device_with_vid_pid(vendor_id, product_id).ok_or_else(|| {
                LinkError::Connect {
                    port: label.clone(),
                    reason: "no matching USB device".into(),
                }
            })?;
            // Not supported on every platform.
            let _ = handle.set_auto_detach_kernel_driver(true);
            handle.claim_interface(0).map_err(|e| LinkError::Connect {
                port: label.clone(),
                reason: format!("claim interface 0: {e}"),
            })?;
            tracing::info!(device = %label, "DMD opened");
            Ok(Self {
                handle,
                label,
                timeout,
            })
        }

        fn usb_error(&self, e: rusb::Error) -> LinkError {
            match e {
                rusb::Error::Timeout => LinkError::ExchangeTimeout {
                    command: "dmd report".into(),
                    waited: self.timeout,
                },
                other => LinkError::io(
                    &self.label,
                    std::io::Error::new(std::io::ErrorKind::Other, other),
                ),
            }
        }
    }

    impl DmdUsb for RusbDmd {
        fn write_report(&mut self, report: &[u8; REPORT_LEN]) -> LinkResult<()> {
            self.handle
                .write_interrupt(OUT_ENDPOINT, report, self.timeout)
                .map_err(|e| self.usb_error(e))?;
            Ok(())
        }

        fn read_report(&mut self) -> LinkResult<[u8; REPORT_LEN]> {
            let mut reply = [0u8; REPORT_LEN];
            self.handle
                .read_interrupt(IN_ENDPOINT, &mut reply, self.timeout)
                .map_err(|e| self.usb_error(e))?;
            Ok(reply)
        }
    }
}

/// Panel resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PanelSize {
    /// Columns.
    pub width: u16,
    /// Rows.
    pub height: u16,
}

impl PanelSize {
    /// DLP6500 panel, 1920x1080.
    pub const DLP6500: PanelSize = PanelSize {
        width: 1920,
        height: 1080,
    };

    fn pixels(self) -> usize {
        usize::from(self.width) * usize::from(self.height)
    }
}

impl Default for PanelSize {
    fn default() -> Self {
        Self::DLP6500
    }
}

/// 1-bit image, row-major, most significant bit first, no row padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    size: PanelSize,
    packed: Vec<u8>,
}

impl Bitmap {
    /// Wrap packed bits.
    ///
    /// # Errors
    /// [`LinkError::Range`] if `packed` is not `ceil(width*height/8)` bytes.
    pub fn from_packed(size: PanelSize, packed: Vec<u8>) -> LinkResult<Self> {
        let expected = size.pixels().div_ceil(8);
        if packed.len() != expected {
            return Err(LinkError::Range(format!(
                "{}x{} bitmap needs {expected} bytes, got {}",
                size.width,
                size.height,
                packed.len()
            )));
        }
        Ok(Self { size, packed })
    }

    /// Pack one bool per pixel.
    ///
    /// # Errors
    /// [`LinkError::Range`] if `pixels` is not `width*height` long.
    pub fn from_pixels(size: PanelSize, pixels: &[bool]) -> LinkResult<Self> {
        if pixels.len() != size.pixels() {
            return Err(LinkError::Range(format!(
                "{}x{} bitmap needs {} pixels, got {}",
                size.width,
                size.height,
                size.pixels(),
                pixels.len()
            )));
        }
        let mut packed = vec![0u8; size.pixels().div_ceil(8)];
        for (i, _) in pixels.iter().enumerate().filter(|(_, on)| **on) {
            packed[i / 8] |= 0x80 >> (i % 8);
        }
        Ok(Self { size, packed })
    }

    /// Resolution.
    pub fn size(&self) -> PanelSize {
        self.size
    }

    /// Whether pixel `index` (row-major) is on.
    pub fn pixel(&self, index: usize) -> bool {
        self.packed
            .get(index / 8)
            .map(|byte| byte & (0x80 >> (index % 8)) != 0)
            .unwrap_or(false)
    }
}

/// Validated pattern sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternSequence {
    images: Vec<Bitmap>,
    exposures_us: Vec<u32>,
    dark_times_us: Vec<u32>,
    trigger_in: Vec<bool>,
    trigger_out: Vec<u8>,
    repeat: u32,
}

impl PatternSequence {
    /// Check the per-image arrays line up.
    ///
    /// `repeat == 0` repeats forever.
    ///
    /// # Errors
    /// [`LinkError::Range`] if the arrays differ in length, the sequence is
    /// empty or too long, the images differ in size, or a time exceeds 24 bits.
    pub fn new(
        images: Vec<Bitmap>,
        exposures_us: Vec<u32>,
        dark_times_us: Vec<u32>,
        trigger_in: Vec<bool>,
        trigger_out: Vec<u8>,
        repeat: u32,
    ) -> LinkResult<Self> {
        let n = images.len();
        let lengths = [
            exposures_us.len(),
            dark_times_us.len(),
            trigger_in.len(),
            trigger_out.len(),
        ];
        if lengths.iter().any(|&len| len != n) {
            return Err(LinkError::Range(format!(
                "{n} images but exposures/dark times/trigger in/trigger out have lengths {lengths:?}"
            )));
        }
        if n == 0 || n > MAX_PATTERNS {
            return Err(LinkError::Range(format!(
                "sequence must hold 1..={MAX_PATTERNS} images, got {n}"
            )));
        }
        let size = images[0].size();
        if images.iter().any(|image| image.size() != size) {
            return Err(LinkError::Range("images differ in resolution".into()));
        }
        if let Some(t) = exposures_us
            .iter()
            .chain(&dark_times_us)
            .find(|&&t| t > MAX_24_BIT)
        {
            return Err(LinkError::Range(format!("time {t} µs exceeds 24 bits")));
        }
        Ok(Self {
            images,
            exposures_us,
            dark_times_us,
            trigger_in,
            trigger_out,
            repeat,
        })
    }

    /// Number of patterns.
    pub fn len(&self) -> usize {
        self.images.len()
    }

    /// Always false for a validated sequence.
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Image planes needed.
    pub fn planes(&self) -> usize {
        self.images.len().div_ceil(PATTERNS_PER_PLANE)
    }

    /// `0x1A34` payload for pattern `index`.
    fn pattern_definition(&self, index: usize) -> [u8; 12] {
        let plane = (index / PATTERNS_PER_PLANE) as u16;
        let bit = (index % PATTERNS_PER_PLANE) as u16;
        let options = (u8::from(self.trigger_in[index]) << 7) | (0b111 << 4) | 1;
        let position = (bit << 11) | plane;

        let mut out = [0u8; 12];
        out[0..2].copy_from_slice(&(index as u16).to_le_bytes());
        out[2..5].copy_from_slice(&self.exposures_us[index].to_le_bytes()[..3]);
        out[5] = options;
        out[6..9].copy_from_slice(&self.dark_times_us[index].to_le_bytes()[..3]);
        out[9] = self.trigger_out[index];
        out[10..12].copy_from_slice(&position.to_le_bytes());
        out
    }

    /// `0x1A31` payload.
    fn lut_config(&self) -> [u8; 6] {
        let packed = (u64::from(self.repeat) << 11) | self.images.len() as u64;
        let mut out = [0u8; 6];
        out.copy_from_slice(&packed.to_le_bytes()[..6]);
        out
    }

    /// Merge patterns of `plane` into one 24-bit image with its `Spld` header.
    pub fn encode_plane(&self, plane: usize) -> Vec<u8> {
        let start = plane * PATTERNS_PER_PLANE;
        let end = (start + PATTERNS_PER_PLANE).min(self.images.len());
        let size = self.images[0].size();
        let pixels = size.pixels();

        let mut data = vec![0u8; pixels * 3];
        for (bit, image) in self.images[start..end].iter().enumerate() {
            // Bits 0-7 land in pixel byte 2, 8-15 in byte 1, 16-23 in byte 0.
            let byte = 2 - bit / 8;
            let mask = 1u8 << (bit % 8);
            for p in (0..pixels).filter(|&p| image.pixel(p)) {
                data[p * 3 + byte] |= mask;
            }
        }

        let mut out = spld_header(size, SPLD_HEADER_LEN + data.len());
        out.extend_from_slice(&data);
        out
    }
}

fn spld_header(size: PanelSize, total: usize) -> Vec<u8> {
    let mut header = Vec::with_capacity(SPLD_HEADER_LEN);
    header.extend_from_slice(b"Spld");
    header.extend_from_slice(&size.width.to_le_bytes());
    header.extend_from_slice(&size.height.to_le_bytes());
    header.extend_from_slice(&u32::try_from(total).unwrap_or(u32::MAX).to_le_bytes());
    header.extend_from_slice(&[0xFF; 8]);
    header.extend_from_slice(&[0x00; 4]);
    header.push(0x00);
    header.push(0x00); // uncompressed
    header.push(0x01);
    header.extend_from_slice(&[0x00; 21]);
    header
}

/// No sequence loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Idle {
    mode: Option<DisplayMode>,
}

/// Sequence defined and images uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceLoaded {
    patterns: usize,
}

/// Sequence playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Running {
    patterns: usize,
    paused: bool,
}

/// A failed state transition, with the device in its previous state.
#[derive(Debug)]
pub struct TransitionError<D> {
    /// What went wrong.
    pub error: LinkError,
    /// The device, unchanged in state.
    pub device: D,
}

impl<D> fmt::Display for TransitionError<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

impl<D: fmt::Debug> std::error::Error for TransitionError<D> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl<D> From<TransitionError<D>> for LinkError {
    fn from(e: TransitionError<D>) -> Self {
        e.error
    }
}

/// DLPC900 controller in sequencing state `S`.
#[derive(Debug)]
pub struct Dmd<S, U: DmdUsb> {
    usb: U,
    state: S,
}

impl<S, U: DmdUsb> Dmd<S, U> {
    fn with_state<T>(self, state: T) -> Dmd<T, U> {
        Dmd {
            usb: self.usb,
            state,
        }
    }

    fn send(&mut self, command: DmdCommand, payload: &[u8]) -> LinkResult<[u8; REPORT_LEN]> {
        self.usb.command(Direction::Write, 0x00, command, payload)
    }

    /// Last controller error.
    ///
    /// # Errors
    /// [`LinkError::BoardRejected`] if the controller reports an error code.
    pub fn check_errors(&mut self) -> LinkResult<()> {
        let reply = self
            .usb
            .command(Direction::Read, ERROR_QUERY_SEQUENCE, DmdCommand::ReadError, &[])?;
        match reply[6] {
            0 => Ok(()),
            code => {
                warn!(code, error = error_description(code), "DMD reported an error");
                Err(LinkError::BoardRejected {
                    command: format!("{:#06x}", DmdCommand::ReadError.code()),
                    reply: format!("error {code}: {}", error_description(code)),
                })
            }
        }
    }

    /// Raw hardware status reply.
    pub fn read_status(&mut self) -> LinkResult<Vec<u8>> {
        let reply = self
            .usb
            .command(Direction::Read, 0x00, DmdCommand::Status, &[])?;
        Ok(reply[4..].to_vec())
    }

    /// Current state marker.
    pub fn state(&self) -> &S {
        &self.state
    }

    /// USB backend.
    pub fn usb(&self) -> &U {
        &self.usb
    }
}

impl<U: DmdUsb> Dmd<Idle, U> {
    /// Take over the controller and stop whatever it is playing.
    pub fn connect(usb: U) -> LinkResult<Self> {
        let mut dmd = Dmd {
            usb,
            state: Idle::default(),
        };
        dmd.send(DmdCommand::PatternStartStop, &[0])?;
        info!("DMD connected");
        Ok(dmd)
    }

    /// Reset the controller. The display mode must be set again afterwards.
    pub fn reset(&mut self) -> LinkResult<()> {
        self.send(DmdCommand::Reset, &[0x02])?;
        self.state.mode = None;
        Ok(())
    }

    /// Select the display mode.
    pub fn set_mode(&mut self, mode: DisplayMode) -> LinkResult<()> {
        self.send(DmdCommand::DisplayMode, &[mode as u8])?;
        self.state.mode = Some(mode);
        debug!(?mode, "DMD mode set");
        Ok(())
    }

    /// Mode last set, if any.
    pub fn mode(&self) -> Option<DisplayMode> {
        self.state.mode
    }

    /// Define the pattern LUT and upload the images.
    ///
    /// # Errors
    /// [`LinkError::InvalidState`] unless the mode is
    /// [`DisplayMode::PatternOnTheFly`]; transfer errors otherwise.
    pub fn load_sequence(
        mut self,
        sequence: &PatternSequence,
    ) -> Result<Dmd<SequenceLoaded, U>, TransitionError<Self>> {
        if self.state.mode != Some(DisplayMode::PatternOnTheFly) {
            return Err(TransitionError {
                error: LinkError::InvalidState(format!(
                    "load_sequence needs pattern-on-the-fly mode, current mode {:?}",
                    self.state.mode
                )),
                device: self,
            });
        }
        match self.define_and_upload(sequence) {
            Ok(()) => {
                info!(patterns = sequence.len(), planes = sequence.planes(), "DMD sequence loaded");
                Ok(self.with_state(SequenceLoaded {
                    patterns: sequence.len(),
                }))
            }
            Err(error) => Err(TransitionError { error, device: self }),
        }
    }

    fn define_and_upload(&mut self, sequence: &PatternSequence) -> LinkResult<()> {
        self.send(DmdCommand::PatternStartStop, &[0])?;
        for index in 0..sequence.len() {
            self.send(
                DmdCommand::PatternDefinition,
                &sequence.pattern_definition(index),
            )?;
        }
        self.send(DmdCommand::LutConfig, &sequence.lut_config())?;

        // Planes go up last first.
        for plane in (0..sequence.planes()).rev() {
            let image = sequence.encode_plane(plane);
            let mut setup = [0u8; 6];
            setup[0..2].copy_from_slice(&(plane as u16).to_le_bytes());
            setup[2..6].copy_from_slice(&u32::try_from(image.len()).unwrap_or(u32::MAX).to_le_bytes());
            self.send(DmdCommand::ImageUploadSetup, &setup)?;

            for chunk in image.chunks(IMAGE_CHUNK_LEN) {
                let mut payload = Vec::with_capacity(chunk.len() + 2);
                payload.extend_from_slice(&(chunk.len() as u16).to_le_bytes());
                payload.extend_from_slice(chunk);
                self.usb
                    .command(Direction::Write, IMAGE_DATA_SEQUENCE, DmdCommand::ImageData, &payload)?;
            }
            debug!(plane, bytes = image.len(), "DMD image plane uploaded");
        }
        Ok(())
    }
}

#[cfg(feature = "dmd_usb")]
impl Dmd<Idle, RusbDmd> {
    /// Open the controller named in the `[dmd]` section over libusb and take
    /// it over.
    ///
    /// # Errors
    /// [`LinkError::Connect`] if no device matches `vendor_id:product_id` or
    /// its interface cannot be claimed.
    pub fn connect_from(config: &DmdConfig) -> LinkResult<Self> {
        let usb = RusbDmd::open(config.vendor_id, config.product_id, config.usb_timeout())?;
        Self::connect(usb)
    }
}

impl<U: DmdUsb> Dmd<SequenceLoaded, U> {
    /// Patterns in the loaded sequence.
    pub fn patterns(&self) -> usize {
        self.state.patterns
    }

    /// Start playing.
    pub fn start_sequence(mut self) -> Result<Dmd<Running, U>, TransitionError<Self>> {
        match self.send(DmdCommand::PatternStartStop, &[2]) {
            Ok(_) => {
                let patterns = self.state.patterns;
                info!(patterns, "DMD sequence started");
                Ok(self.with_state(Running {
                    patterns,
                    paused: false,
                }))
            }
            Err(error) => Err(TransitionError { error, device: self }),
        }
    }

    /// Drop the loaded sequence.
    pub fn stop_sequence(mut self) -> Result<Dmd<Idle, U>, TransitionError<Self>> {
        match self.send(DmdCommand::PatternStartStop, &[0]) {
            Ok(_) => Ok(self.with_state(Idle {
                mode: Some(DisplayMode::PatternOnTheFly),
            })),
            Err(error) => Err(TransitionError { error, device: self }),
        }
    }
}

impl<U: DmdUsb> Dmd<Running, U> {
    /// Patterns in the playing sequence.
    pub fn patterns(&self) -> usize {
        self.state.patterns
    }

    /// Whether playback is paused.
    pub fn is_paused(&self) -> bool {
        self.state.paused
    }

    /// Pause playback.
    pub fn pause_sequence(&mut self) -> LinkResult<()> {
        self.send(DmdCommand::PatternStartStop, &[1])?;
        self.state.paused = true;
        Ok(())
    }

    /// Resume after a pause.
    pub fn resume_sequence(&mut self) -> LinkResult<()> {
        self.send(DmdCommand::PatternStartStop, &[2])?;
        self.state.paused = false;
        Ok(())
    }

    /// Stop playback.
    pub fn stop_sequence(mut self) -> Result<Dmd<Idle, U>, TransitionError<Self>> {
        match self.send(DmdCommand::PatternStartStop, &[0]) {
            Ok(_) => {
                info!("DMD sequence stopped");
                Ok(self.with_state(Idle {
                    mode: Some(DisplayMode::PatternOnTheFly),
                }))
            }
            Err(error) => Err(TransitionError { error, device: self }),
        }
    }
}
