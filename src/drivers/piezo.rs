//! Piezo stage driver (Nucleo board, `_`-prefixed ASCII dialect).
//!
//! Protocol Overview:
//! - Request: `_<verb>[payload]!`, reply: `_<verb>[payload]!`
//! - `_C!` → `_C1!` when the board is alive
//! - `_V!` → `_V<version>!`
//! - `_G!` → `_G<uu>.<nnn>!` current position
//! - `_M<uu>.<nnn>!` → `_M1!` move accepted, `_M0!` refused
//!
//! Positions are fixed columns, space padded (see [`PiezoPosition`]).
//!
//! # Example Usage
//!
//! ```no_run
//! use instrument_link::drivers::PiezoDriver;
//! use instrument_link::exchange::ExchangeTimeouts;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let piezo = PiezoDriver::connect("/dev/ttyACM0", ExchangeTimeouts::default()).await?;
//!     let readback = piezo.move_to(5, 250).await?;
//!     println!("stage at {readback}");
//!     Ok(())
//! }
//! ```

use crate::codec::{Command, DelimitedAscii, PiezoPosition};
use crate::config::SerialBoardConfig;
use crate::error::{LinkError, LinkResult};
use crate::exchange::{CommandClass, ExchangeTimeouts, Link};
use crate::session::{BoardSession, SessionStatus};
use crate::transport::Transport;
#[cfg(feature = "instrument_serial")]
use crate::transport::SerialTransport;
use tracing::{debug, info};

/// Baud rate of the piezo board.
pub const PIEZO_BAUD_RATE: u32 = 115_200;

const OWNER: &str = "piezo";

/// Codec for the piezo board.
pub fn piezo_dialect() -> DelimitedAscii {
    DelimitedAscii::new(b'!').with_start(b'_').with_verb_prefix(1)
}

/// What the driver has learned from the board.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PiezoState {
    /// Firmware version from `_V!`.
    pub version: Option<String>,
    /// Last position read back from the board.
    pub last_position: Option<PiezoPosition>,
}

/// Piezo stage driver.
#[derive(Debug)]
pub struct PiezoDriver {
    session: BoardSession<PiezoState>,
}

impl PiezoDriver {
    /// Drive a board over an already opened transport.
    pub fn new(transport: Box<dyn Transport>, timeouts: ExchangeTimeouts) -> Self {
        let link = Link::new(transport, Box::new(piezo_dialect()), timeouts);
        Self {
            session: BoardSession::new(OWNER, link),
        }
    }

    /// Open `port` at [`PIEZO_BAUD_RATE`], then require the board to answer
    /// the connection probe.
    ///
    /// # Errors
    /// [`LinkError::Connect`] if the port cannot be opened or the board does
    /// not acknowledge.
    pub async fn connect(port: &str, timeouts: ExchangeTimeouts) -> LinkResult<Self> {
        let board = SerialBoardConfig {
            port: port.to_string(),
            baud_rate: PIEZO_BAUD_RATE,
        };
        Self::connect_with(&board, timeouts).await
    }

    /// Open the board described in the `[piezo]` section and handshake.
    ///
    /// # Errors
    /// Same as [`connect`](Self::connect).
    #[cfg(feature = "instrument_serial")]
    pub async fn connect_with(board: &SerialBoardConfig, timeouts: ExchangeTimeouts) -> LinkResult<Self> {
        let transport = SerialTransport::open_boxed(&board.port, board.baud_rate).await?;
        let driver = Self::new(transport, timeouts);
        driver.handshake().await?;
        Ok(driver)
    }

    /// Serial support compiled out.
    #[cfg(not(feature = "instrument_serial"))]
    pub async fn connect_with(_board: &SerialBoardConfig, _timeouts: ExchangeTimeouts) -> LinkResult<Self> {
        Err(LinkError::FeatureNotEnabled("instrument_serial".into()))
    }

    /// Close the port, open it again and handshake. Used after the session
    /// was marked disconnected.
    ///
    /// # Errors
    /// Same as [`connect`](Self::connect); [`LinkError::Concurrency`] if the
    /// link is in use.
    #[cfg(feature = "instrument_serial")]
    pub async fn reconnect_with(&self, board: &SerialBoardConfig) -> LinkResult<String> {
        self.session
            .reopen(|| SerialTransport::open_boxed(&board.port, board.baud_rate))
            .await?;
        self.handshake().await
    }

    /// Probe the board and fetch its version.
    ///
    /// # Errors
    /// [`LinkError::Connect`] if the board does not report itself connected.
    pub async fn handshake(&self) -> LinkResult<String> {
        if !self.check_connection().await? {
            return Err(LinkError::Connect {
                port: self.session.port_name().to_string(),
                reason: "piezo board did not acknowledge".into(),
            });
        }
        let version = self.get_version().await?;
        info!(port = %self.session.port_name(), version = %version, "piezo board ready");
        Ok(version)
    }

    /// `_C!`: whether the board reports itself connected.
    pub async fn check_connection(&self) -> LinkResult<bool> {
        let mut lease = self.session.lease(OWNER)?;
        let frame = lease.exchange(&Command::new("C"), CommandClass::Quick).await?;
        Ok(frame.token(0)? == "1")
    }

    /// `_V!`: firmware version.
    pub async fn get_version(&self) -> LinkResult<String> {
        let mut lease = self.session.lease(OWNER)?;
        let frame = lease.exchange(&Command::new("V"), CommandClass::Quick).await?;
        let version = frame.token(0)?.trim().to_string();
        self.session
            .update_state(|s| s.version = Some(version.clone()));
        Ok(version)
    }

    /// `_G!`: current position.
    pub async fn get_position(&self) -> LinkResult<PiezoPosition> {
        let mut lease = self.session.lease(OWNER)?;
        let frame = lease.exchange(&Command::new("G"), CommandClass::Readout).await?;
        let position = PiezoPosition::decode_field(frame.token(0)?)?;
        self.session
            .update_state(|s| s.last_position = Some(position));
        Ok(position)
    }

    /// Move to `um` µm + `nm` nm and return the position read back afterwards.
    ///
    /// The range is checked before anything is written. Move and readback run
    /// under one lease, so nothing else can slip in between.
    ///
    /// # Errors
    /// - [`LinkError::Range`] for `um > 10` or `nm > 999`.
    /// - [`LinkError::BoardRejected`] if the board refuses the move.
    pub async fn move_to(&self, um: u8, nm: u16) -> LinkResult<PiezoPosition> {
        let target = PiezoPosition::new(um, nm)?;
        let mut lease = self.session.lease(OWNER)?;

        let command = Command::new("M").arg(target.encode_field());
        let ack = lease.exchange(&command, CommandClass::Motion).await?;
        if ack.token(0)? != "1" {
            return Err(LinkError::BoardRejected {
                command: command.to_string(),
                reply: String::from_utf8_lossy(ack.raw()).into_owned(),
            });
        }

        let frame = lease.exchange(&Command::new("G"), CommandClass::Readout).await?;
        let readback = PiezoPosition::decode_field(frame.token(0)?)?;
        debug!(set_point = %target, readback = %readback, "piezo moved");
        self.session
            .update_state(|s| s.last_position = Some(readback));
        Ok(readback)
    }

    /// Whether the session is usable.
    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Last cached state.
    pub fn state(&self) -> PiezoState {
        self.session.state()
    }

    /// Read-only status for other consumers.
    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }

    /// Underlying session.
    pub fn session(&self) -> &BoardSession<PiezoState> {
        &self.session
    }

    /// Close the port.
    pub async fn disconnect(&self) -> LinkResult<()> {
        self.session.disconnect().await
    }
}
