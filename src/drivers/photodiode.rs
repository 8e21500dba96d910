//! Laser-PID photodiode board driver (Nucleo, `_`-separated ASCII dialect).
//!
//! The board reads a quadrant photodiode, steers two scan mirrors, and runs
//! either a PID loop or an open-loop step capture.
//!
//! Protocol Overview (requests end with `!\r\n`, replies with `!`):
//!
//! | request                            | reply                        |
//! |------------------------------------|------------------------------|
//! | `A_!`                              | `A_<x>_<y>_!`                |
//! | `M_<x>_<y>_!`                      | `M_<x>_<y>_<px>_<py>_!`      |
//! | `S_<xmin>_<xmax>_<ymin>_<ymax>_<fs>_<ns>_!` | `S_OK!` or `S_NK!`  |
//! | `F_!`                              | `F_<0/1>_!`                  |
//! | `T_<ch>_<k>_!`                     | `T_<ch>_<k>_<value>_!`       |
//! | `D_<Kx>_<Ky>_<Ix>_<Iy>_<Dx>_<Dy>_<fs>_!` | none                   |
//! | `R_!`, `O_!`                       | none                         |
//! | `C` (bare probe)                   | anything starting with `C`   |

use crate::acquisition::Sampler;
use crate::codec::{Command, DelimitedAscii, Frame};
use crate::config::SerialBoardConfig;
use crate::error::{LinkError, LinkResult};
use crate::exchange::{CommandClass, ExchangeTimeouts, Link};
use crate::session::{BoardSession, LinkLease, SessionStatus, StateHandle};
use crate::transport::Transport;
#[cfg(feature = "instrument_serial")]
use crate::transport::SerialTransport;
use async_trait::async_trait;
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Baud rate of the laser-PID board.
pub const PHOTODIODE_BAUD_RATE: u32 = 115_200;

const OWNER: &str = "photodiode";

/// Codec for the laser-PID board.
pub fn photodiode_dialect() -> DelimitedAscii {
    DelimitedAscii::new(b'!')
        .with_separator(b'_')
        .with_trailing_separator(true)
        .with_line_terminator(b"\r\n")
}

/// Open-loop capture channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpenLoopChannel {
    /// Photodiode X.
    X,
    /// Photodiode Y.
    Y,
    /// Photodiode sum.
    S,
}

impl OpenLoopChannel {
    /// All channels in readout order.
    pub const ALL: [OpenLoopChannel; 3] = [Self::X, Self::Y, Self::S];
}

impl fmt::Display for OpenLoopChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::X => "X",
            Self::Y => "Y",
            Self::S => "S",
        })
    }
}

/// Mirror excursion for an open-loop step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenLoopLimits {
    /// Start X.
    pub x_min: i32,
    /// End X.
    pub x_max: i32,
    /// Start Y.
    pub y_min: i32,
    /// End Y.
    pub y_max: i32,
}

/// PID gains plus loop rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidParams {
    /// Proportional X.
    pub kx: f64,
    /// Proportional Y.
    pub ky: f64,
    /// Integral X.
    pub ix: f64,
    /// Integral Y.
    pub iy: f64,
    /// Derivative X.
    pub dx: f64,
    /// Derivative Y.
    pub dy: f64,
    /// Loop sampling frequency in Hz.
    pub sampling_hz: u32,
}

impl Default for PidParams {
    fn default() -> Self {
        Self {
            kx: 0.0,
            ky: 0.0,
            ix: 0.0,
            iy: 0.0,
            dx: 0.0,
            dy: 0.0,
            sampling_hz: 10_000,
        }
    }
}

/// Samples of one open-loop capture.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OpenLoopData {
    /// X channel.
    pub x: Vec<f64>,
    /// Y channel.
    pub y: Vec<f64>,
    /// Sum channel.
    pub s: Vec<f64>,
}

/// Configuration and last readings of the board.
#[derive(Debug, Clone, PartialEq)]
pub struct PhotodiodeState {
    /// Last `(x, y)` from `A`.
    pub last_xy: Option<(f64, f64)>,
    /// Last mirror set-point sent with `M`.
    pub scan_xy: Option<(i32, i32)>,
    /// Limits used by the next open-loop step.
    pub limits: OpenLoopLimits,
    /// Open-loop sampling frequency in Hz.
    pub sampling_hz: u32,
    /// Open-loop sample count.
    pub samples: u32,
    /// Gains last written with `D`.
    pub pid: Option<PidParams>,
}

impl Default for PhotodiodeState {
    fn default() -> Self {
        Self {
            last_xy: None,
            scan_xy: None,
            limits: OpenLoopLimits::default(),
            sampling_hz: 10_000,
            samples: 100,
            pid: None,
        }
    }
}

/// Laser-PID board driver.
#[derive(Debug)]
pub struct PhotodiodeDriver {
    session: BoardSession<PhotodiodeState>,
}

impl PhotodiodeDriver {
    /// Drive a board over an already opened transport.
    pub fn new(transport: Box<dyn Transport>, timeouts: ExchangeTimeouts) -> Self {
        let link = Link::new(transport, Box::new(photodiode_dialect()), timeouts);
        Self {
            session: BoardSession::new(OWNER, link),
        }
    }

    /// Open `port` at [`PHOTODIODE_BAUD_RATE`] and probe the board.
    ///
    /// # Errors
    /// [`LinkError::Connect`] if the port cannot be opened or the probe fails.
    pub async fn connect(port: &str, timeouts: ExchangeTimeouts) -> LinkResult<Self> {
        let board = SerialBoardConfig {
            port: port.to_string(),
            baud_rate: PHOTODIODE_BAUD_RATE,
        };
        Self::connect_with(&board, timeouts).await
    }

    /// Open the board described in the `[photodiode]` section and probe it.
    ///
    /// # Errors
    /// Same as [`connect`](Self::connect).
    #[cfg(feature = "instrument_serial")]
    pub async fn connect_with(board: &SerialBoardConfig, timeouts: ExchangeTimeouts) -> LinkResult<Self> {
        let transport = SerialTransport::open_boxed(&board.port, board.baud_rate).await?;
        let driver = Self::new(transport, timeouts);
        driver.require_probe().await?;
        info!(port = %board.port, baud_rate = board.baud_rate, "laser-PID board ready");
        Ok(driver)
    }

    /// Serial support compiled out.
    #[cfg(not(feature = "instrument_serial"))]
    pub async fn connect_with(_board: &SerialBoardConfig, _timeouts: ExchangeTimeouts) -> LinkResult<Self> {
        Err(LinkError::FeatureNotEnabled("instrument_serial".into()))
    }

    /// Close the port, open it again and probe the board.
    ///
    /// # Errors
    /// Same as [`connect`](Self::connect); [`LinkError::Concurrency`] if the
    /// link is in use.
    #[cfg(feature = "instrument_serial")]
    pub async fn reconnect_with(&self, board: &SerialBoardConfig) -> LinkResult<()> {
        self.session
            .reopen(|| SerialTransport::open_boxed(&board.port, board.baud_rate))
            .await?;
        self.require_probe().await
    }

    async fn require_probe(&self) -> LinkResult<()> {
        if !self.check_connection().await? {
            return Err(LinkError::Connect {
                port: self.session.port_name().to_string(),
                reason: "laser-PID board did not answer the probe".into(),
            });
        }
        Ok(())
    }

    /// Bare `C` probe. A silent board is reported as `false`, not an error.
    pub async fn check_connection(&self) -> LinkResult<bool> {
        let mut lease = self.session.lease(OWNER)?;
        let deadline = lease.timeouts().quick;
        match lease.exchange_raw(b"C", deadline, None).await {
            Ok(reply) => Ok(reply.first() == Some(&b'C')),
            Err(e) if e.is_timeout() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// `A`: photodiode position, bounded by the readout deadline.
    pub async fn read_xy(&self) -> LinkResult<(f64, f64)> {
        let mut lease = self.session.lease(OWNER)?;
        let xy = read_xy_with(&mut lease, None).await?;
        self.session.update_state(|s| s.last_xy = Some(xy));
        Ok(xy)
    }

    /// `M`: move the scan mirrors and return the photodiode readback.
    pub async fn set_scan_xy(&self, x: i32, y: i32) -> LinkResult<(f64, f64)> {
        let mut lease = self.session.lease(OWNER)?;
        let frame = lease
            .exchange(&Command::new("M").arg(x).arg(y), CommandClass::Motion)
            .await?;
        frame.expect_len(4)?;
        let readback = (frame.parse::<f64>(2)?, frame.parse::<f64>(3)?);
        self.session.update_state(|s| {
            s.scan_xy = Some((x, y));
            s.last_xy = Some(readback);
        });
        Ok(readback)
    }

    /// Store limits, sampling frequency and sample count for the next step.
    ///
    /// # Errors
    /// [`LinkError::Range`] for a zero frequency or sample count.
    pub fn set_open_loop_limits(
        &self,
        limits: OpenLoopLimits,
        sampling_hz: u32,
        samples: u32,
    ) -> LinkResult<()> {
        if sampling_hz == 0 || samples == 0 {
            return Err(LinkError::Range(
                "open-loop sampling frequency and sample count must be positive".into(),
            ));
        }
        self.session.update_state(|s| {
            s.limits = limits;
            s.sampling_hz = sampling_hz;
            s.samples = samples;
        });
        Ok(())
    }

    /// `S`: start an open-loop step with the stored limits.
    ///
    /// On `S_NK!` the capture is reset with `R_!` and the refusal reported.
    pub async fn start_open_loop_step(&self) -> LinkResult<()> {
        let state = self.session.state();
        let limits = state.limits;
        let command = Command::new("S")
            .arg(limits.x_min)
            .arg(limits.x_max)
            .arg(limits.y_min)
            .arg(limits.y_max)
            .unsigned(u64::from(state.sampling_hz))
            .unsigned(u64::from(state.samples));

        let mut lease = self.session.lease(OWNER)?;
        let frame = lease.exchange(&command, CommandClass::Capture).await?;
        match frame.token(0)? {
            "OK" => {
                debug!(samples = state.samples, "open-loop step started");
                Ok(())
            }
            other => {
                warn!(reply = other, "open-loop step refused, resetting capture");
                lease.send_only(&Command::new("R")).await?;
                Err(LinkError::BoardRejected {
                    command: command.to_string(),
                    reply: String::from_utf8_lossy(frame.raw()).into_owned(),
                })
            }
        }
    }

    /// `F`: whether the open-loop capture has finished.
    pub async fn is_step_over(&self) -> LinkResult<bool> {
        let mut lease = self.session.lease(OWNER)?;
        let frame = lease.exchange(&Command::new("F"), CommandClass::Quick).await?;
        Ok(frame.parse::<u8>(0)? == 1)
    }

    /// `T`: one captured sample.
    pub async fn open_loop_sample(&self, channel: OpenLoopChannel, index: u32) -> LinkResult<f64> {
        let mut lease = self.session.lease(OWNER)?;
        sample_with(&mut lease, channel, index).await
    }

    /// Read every captured sample of all three channels under one lease.
    pub async fn open_loop_data(&self) -> LinkResult<OpenLoopData> {
        let samples = self.session.state().samples;
        let mut lease = self.session.lease(OWNER)?;
        let mut data = OpenLoopData::default();
        for index in 0..samples {
            data.x.push(sample_with(&mut lease, OpenLoopChannel::X, index).await?);
            data.y.push(sample_with(&mut lease, OpenLoopChannel::Y, index).await?);
            data.s.push(sample_with(&mut lease, OpenLoopChannel::S, index).await?);
        }
        Ok(data)
    }

    /// `D`: write PID gains if any of them changed. Returns whether a
    /// command was sent.
    pub async fn set_pid_params(&self, params: PidParams) -> LinkResult<bool> {
        if self.session.state().pid == Some(params) {
            return Ok(false);
        }
        let mut lease = self.session.lease(OWNER)?;
        let command = Command::new("D")
            .arg(params.kx)
            .arg(params.ky)
            .arg(params.ix)
            .arg(params.iy)
            .arg(params.dx)
            .arg(params.dy)
            .unsigned(u64::from(params.sampling_hz));
        lease.send_only(&command).await?;
        self.session.update_state(|s| s.pid = Some(params));
        Ok(true)
    }

    /// `O`: stop the loop.
    pub async fn send_stop(&self) -> LinkResult<()> {
        let mut lease = self.session.lease(OWNER)?;
        lease.send_only(&Command::new("O")).await
    }

    /// `R`: reset the open-loop capture.
    pub async fn reset_open_loop_step(&self) -> LinkResult<()> {
        let mut lease = self.session.lease(OWNER)?;
        lease.send_only(&Command::new("R")).await
    }

    /// Whether the session is usable.
    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Last cached state.
    pub fn state(&self) -> PhotodiodeState {
        self.session.state()
    }

    /// Read-only status for other consumers.
    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }

    /// Underlying session.
    pub fn session(&self) -> &BoardSession<PhotodiodeState> {
        &self.session
    }

    /// Close the port.
    pub async fn disconnect(&self) -> LinkResult<()> {
        self.session.disconnect().await
    }

    /// Sampler for [`crate::acquisition::start`].
    pub fn sampler(&self) -> PhotodiodeSampler {
        PhotodiodeSampler {
            state: self.session.state_handle(),
        }
    }
}

async fn read_xy_with(
    lease: &mut LinkLease,
    cancel: Option<&CancellationToken>,
) -> LinkResult<(f64, f64)> {
    let deadline = lease.timeouts().readout;
    let frame = lease
        .exchange_within(&Command::new("A"), deadline, cancel)
        .await?;
    parse_xy(&frame)
}

/// Polls `A` for a live position display.
#[derive(Debug, Clone)]
pub struct PhotodiodeSampler {
    state: StateHandle<PhotodiodeState>,
}

#[async_trait]
impl Sampler for PhotodiodeSampler {
    type Sample = (f64, f64);

    async fn sample(
        &mut self,
        lease: &mut LinkLease,
        cancel: &CancellationToken,
    ) -> LinkResult<(f64, f64)> {
        let xy = read_xy_with(lease, Some(cancel)).await?;
        self.state.update(|s| s.last_xy = Some(xy));
        Ok(xy)
    }
}

fn parse_xy(frame: &Frame) -> LinkResult<(f64, f64)> {
    frame.expect_len(2)?;
    Ok((frame.parse::<f64>(0)?, frame.parse::<f64>(1)?))
}

async fn sample_with(
    lease: &mut LinkLease,
    channel: OpenLoopChannel,
    index: u32,
) -> LinkResult<f64> {
    let command = Command::new("T").arg(channel).unsigned(u64::from(index));
    let frame = lease.exchange(&command, CommandClass::Readout).await?;
    frame.expect_len(3)?;
    let echoed_channel = frame.token(0)?;
    let echoed_index = frame.parse::<u32>(1)?;
    if echoed_channel != channel.to_string() || echoed_index != index {
        return Err(LinkError::frame(
            frame.dialect().name(),
            format!("asked for {channel}[{index}], got {echoed_channel}[{echoed_index}]"),
            frame.raw(),
        ));
    }
    frame.parse::<f64>(2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn driver(board: &MockTransport) -> PhotodiodeDriver {
        PhotodiodeDriver::new(Box::new(board.clone()), ExchangeTimeouts::default())
    }

    #[tokio::test]
    async fn read_xy_parses_two_floats() {
        let board = MockTransport::new("mock-pid").respond("A_!\r\n", "A_0.125_-0.5_!\r\n");
        let pid = driver(&board);
        assert_eq!(pid.read_xy().await.unwrap(), (0.125, -0.5));
        assert_eq!(pid.state().last_xy, Some((0.125, -0.5)));
    }

    #[tokio::test]
    async fn scan_move_returns_readback_fields() {
        let board =
            MockTransport::new("mock-pid").respond("M_120_-40_!\r\n", "M_120_-40_0.31_0.02_!\r\n");
        let pid = driver(&board);
        assert_eq!(pid.set_scan_xy(120, -40).await.unwrap(), (0.31, 0.02));
        assert_eq!(pid.state().scan_xy, Some((120, -40)));
    }

    #[tokio::test]
    async fn refused_step_resets_capture() {
        let board = MockTransport::new("mock-pid").respond("S_0_10_0_10_10000_100_!\r\n", "S_NK!\r\n");
        let pid = driver(&board);
        pid.set_open_loop_limits(
            OpenLoopLimits {
                x_min: 0,
                x_max: 10,
                y_min: 0,
                y_max: 10,
            },
            10_000,
            100,
        )
        .unwrap();

        let err = pid.start_open_loop_step().await.unwrap_err();
        assert!(matches!(err, LinkError::BoardRejected { .. }));
        assert_eq!(
            board.written_text(),
            vec!["S_0_10_0_10_10000_100_!\r\n", "R_!\r\n"]
        );
    }

    #[tokio::test]
    async fn accepted_step_then_capture_readout() {
        let board = MockTransport::new("mock-pid")
            .respond("S_-5_5_-5_5_1000_2_!\r\n", "S_OK!\r\n")
            .respond("F_!\r\n", "F_1_!")
            .respond("T_X_0_!\r\n", "T_X_0_0.1_!")
            .respond("T_Y_0_!\r\n", "T_Y_0_0.2_!")
            .respond("T_S_0_!\r\n", "T_S_0_0.3_!")
            .respond("T_X_1_!\r\n", "T_X_1_1.1_!")
            .respond("T_Y_1_!\r\n", "T_Y_1_1.2_!")
            .respond("T_S_1_!\r\n", "T_S_1_1.3_!");
        let pid = driver(&board);
        pid.set_open_loop_limits(
            OpenLoopLimits {
                x_min: -5,
                x_max: 5,
                y_min: -5,
                y_max: 5,
            },
            1000,
            2,
        )
        .unwrap();

        pid.start_open_loop_step().await.unwrap();
        assert!(pid.is_step_over().await.unwrap());
        let data = pid.open_loop_data().await.unwrap();
        assert_eq!(data.x, vec![0.1, 1.1]);
        assert_eq!(data.y, vec![0.2, 1.2]);
        assert_eq!(data.s, vec![0.3, 1.3]);
    }

    #[tokio::test]
    async fn sample_echo_mismatch_is_parse_error() {
        let board = MockTransport::new("mock-pid").respond("T_X_4_!\r\n", "T_Y_4_0.5_!");
        let pid = driver(&board);
        assert!(matches!(
            pid.open_loop_sample(OpenLoopChannel::X, 4).await,
            Err(LinkError::FrameParse { .. })
        ));
    }

    #[tokio::test]
    async fn pid_params_sent_only_when_changed() {
        let board = MockTransport::new("mock-pid");
        let pid = driver(&board);
        let gains = PidParams {
            kx: 0.5,
            ky: 0.5,
            ix: 0.01,
            iy: 0.01,
            dx: 0.0,
            dy: 0.0,
            sampling_hz: 10_000,
        };

        assert!(pid.set_pid_params(gains).await.unwrap());
        assert!(!pid.set_pid_params(gains).await.unwrap());
        assert!(pid
            .set_pid_params(PidParams { kx: 0.6, ..gains })
            .await
            .unwrap());
        assert_eq!(
            board.written_text(),
            vec![
                "D_0.5_0.5_0.01_0.01_0_0_10000_!\r\n",
                "D_0.6_0.5_0.01_0.01_0_0_10000_!\r\n",
            ]
        );
    }

    #[tokio::test]
    async fn probe_accepts_any_reply_starting_with_c() {
        let board = MockTransport::new("mock-pid").respond("C", "C_OK\r\n");
        let pid = driver(&board);
        assert!(pid.check_connection().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_probe_is_not_connected() {
        let board = MockTransport::new("mock-pid");
        let pid = driver(&board);
        assert!(!pid.check_connection().await.unwrap());
    }
}
