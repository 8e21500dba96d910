//! Coincidence counter driver (Nucleo, `!`/`:`/`;` ASCII dialect).
//!
//! Protocol Overview:
//! - Request `!<verb>[:arg]?`, reply `!<verb>[:field...];`
//! - `!T:<ms>?` → `!T:<ms>;` set the integration period
//! - `!D?` → `!D:a:b:c:ab:ac:abc;` counts of the last period; the board
//!   answers after the period has elapsed
//! - `!V?` → `!V:<version>;`
//! - anything else → `!E;`
//!
//! The board has no real stop command: `!S?` falls through to the error case
//! and comes back as `!E;`, which is accepted as the stop acknowledgement.
//!
//! Older boards stream 18-byte binary records instead (six 3-byte big-endian
//! counters in the order A, AB, AC, ABC, B, C); see [`LegacyCounterReader`].

use crate::acquisition::{self, AcquisitionConfig, AcquisitionHandle, AcquisitionStream, Sampler};
use crate::codec::{binary, Command, DelimitedAscii, FixedBinary, Frame};
use crate::config::CoincidenceBoardConfig;
use crate::error::{LinkError, LinkResult};
use crate::exchange::{CommandClass, ExchangeTimeouts, Link};
use crate::session::{BoardSession, LinkLease, SessionStatus, StateHandle};
use crate::transport::Transport;
#[cfg(feature = "instrument_serial")]
use crate::transport::SerialTransport;
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Baud rate of the coincidence board.
pub const COINCIDENCE_BAUD_RATE: u32 = 115_200;

/// Largest value a 3-byte counter field can carry.
pub const COUNTER_MAX: u64 = (1 << 24) - 1;

/// Default coincidence window of the counting electronics.
pub const DEFAULT_TAU: Duration = Duration::from_nanos(26);

/// Integration period the firmware boots with.
pub const FIRMWARE_DEFAULT_PERIOD_MS: u32 = 10;

/// Longest integration period accepted.
pub const MAX_PERIOD_MS: u32 = 60_000;

const OWNER: &str = "coincidence";

/// Codec for the coincidence board.
pub fn coincidence_dialect() -> DelimitedAscii {
    DelimitedAscii::new(b';')
        .with_start(b'!')
        .with_separator(b':')
        .with_request_end(b'?')
        .with_verb_prefix(1)
        .with_error_verb("E")
}

/// g2 from raw counts; 0 when either pair count is 0.
pub fn g2(a: u64, ab: u64, ac: u64, abc: u64) -> f64 {
    if ab == 0 || ac == 0 {
        return 0.0;
    }
    (abc as f64 * a as f64) / (ab as f64 * ac as f64)
}

/// Six-channel counts of one integration period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Counts {
    /// Singles A.
    pub a: u64,
    /// Singles B.
    pub b: u64,
    /// Singles C.
    pub c: u64,
    /// Coincidences A·B.
    pub ab: u64,
    /// Coincidences A·C.
    pub ac: u64,
    /// Triple coincidences A·B·C.
    pub abc: u64,
}

/// Pair coincidences after subtracting accidentals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrectedCoincidences {
    /// `AB - A·B·τ`.
    pub ab: f64,
    /// `AC - A·C·τ`.
    pub ac: f64,
}

impl Counts {
    /// Counts in firmware order: a, b, c, ab, ac, abc.
    pub fn as_array(&self) -> [u64; 6] {
        [self.a, self.b, self.c, self.ab, self.ac, self.abc]
    }

    /// Build from firmware order.
    pub fn from_array(values: [u64; 6]) -> Self {
        let [a, b, c, ab, ac, abc] = values;
        Self { a, b, c, ab, ac, abc }
    }

    /// Decode a `!D:...;` frame.
    ///
    /// # Errors
    /// [`LinkError::FrameParse`] unless the frame holds six unsigned fields.
    pub fn from_frame(frame: &Frame) -> LinkResult<Self> {
        frame.expect_len(6)?;
        let mut values = [0u64; 6];
        for (i, slot) in values.iter_mut().enumerate() {
            *slot = frame.unsigned(i)?;
        }
        Ok(Self::from_array(values))
    }

    /// Decode a legacy record (A, AB, AC, ABC, B, C).
    ///
    /// # Errors
    /// [`LinkError::FrameParse`] unless the record holds six fields.
    pub fn from_legacy_record(frame: &Frame) -> LinkResult<Self> {
        frame.expect_len(6)?;
        Ok(Self {
            a: frame.unsigned(0)?,
            ab: frame.unsigned(1)?,
            ac: frame.unsigned(2)?,
            abc: frame.unsigned(3)?,
            b: frame.unsigned(4)?,
            c: frame.unsigned(5)?,
        })
    }

    /// Render the `!D:...;` reply the firmware would send for these counts.
    pub fn encode_frame(&self) -> Vec<u8> {
        let fields: Vec<String> = self.as_array().iter().map(u64::to_string).collect();
        format!("!D:{};", fields.join(":")).into_bytes()
    }

    /// Pack as a legacy 18-byte record.
    ///
    /// # Errors
    /// [`LinkError::Range`] if a channel exceeds [`COUNTER_MAX`].
    pub fn encode_legacy_record(&self) -> LinkResult<Vec<u8>> {
        FixedBinary::legacy_coincidence()
            .encode_values(&[self.a, self.ab, self.ac, self.abc, self.b, self.c])
    }

    /// True if any channel is beyond what a 3-byte field can carry.
    pub fn exceeds_legacy_ceiling(&self) -> bool {
        self.as_array().iter().any(|&v| v > binary::field_max(3))
    }

    /// `ABC·A / (AB·AC)`, 0 when a denominator term is 0.
    pub fn g2(&self) -> f64 {
        g2(self.a, self.ab, self.ac, self.abc)
    }

    /// Subtract accidental pair coincidences for window `tau`.
    pub fn corrected_coincidences(&self, tau: Duration) -> CorrectedCoincidences {
        let tau = tau.as_secs_f64();
        let (a, b, c) = (self.a as f64, self.b as f64, self.c as f64);
        CorrectedCoincidences {
            ab: self.ab as f64 - a * b * tau,
            ac: self.ac as f64 - a * c * tau,
        }
    }
}

/// What the driver knows about the board.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoincidenceState {
    /// Firmware version.
    pub version: Option<String>,
    /// Period confirmed by the board.
    pub sampling_period_ms: Option<u32>,
    /// Last counts read.
    pub last_counts: Option<Counts>,
}

impl CoincidenceState {
    fn period(&self) -> Duration {
        Duration::from_millis(u64::from(
            self.sampling_period_ms.unwrap_or(FIRMWARE_DEFAULT_PERIOD_MS),
        ))
    }
}

/// Coincidence counter driver.
#[derive(Debug)]
pub struct CoincidenceCounterDriver {
    session: BoardSession<CoincidenceState>,
}

impl CoincidenceCounterDriver {
    /// Drive a board over an already opened transport.
    pub fn new(transport: Box<dyn Transport>, timeouts: ExchangeTimeouts) -> Self {
        let link = Link::new(transport, Box::new(coincidence_dialect()), timeouts);
        Self {
            session: BoardSession::new(OWNER, link),
        }
    }

    /// Open `port` at [`COINCIDENCE_BAUD_RATE`] and read the firmware
    /// version. The integration period is left at the firmware default.
    ///
    /// # Errors
    /// [`LinkError::Connect`] if the port cannot be opened; exchange errors if
    /// the board does not answer `!V?`.
    #[cfg(feature = "instrument_serial")]
    pub async fn connect(port: &str, timeouts: ExchangeTimeouts) -> LinkResult<Self> {
        let transport = SerialTransport::open_boxed(port, COINCIDENCE_BAUD_RATE).await?;
        let driver = Self::new(transport, timeouts);
        let version = driver.get_version().await?;
        info!(port, version = %version, "coincidence board ready");
        Ok(driver)
    }

    /// Serial support compiled out.
    #[cfg(not(feature = "instrument_serial"))]
    pub async fn connect(_port: &str, _timeouts: ExchangeTimeouts) -> LinkResult<Self> {
        Err(LinkError::FeatureNotEnabled("instrument_serial".into()))
    }

    /// Read the version, then set the integration period from `board`.
    ///
    /// # Errors
    /// Exchange errors from `!V?` or `!T:<ms>?`; [`LinkError::Range`] for a
    /// period outside `1..=60000` ms.
    pub async fn configure(&self, board: &CoincidenceBoardConfig) -> LinkResult<()> {
        let version = self.get_version().await?;
        let period = self.set_sampling_period_ms(board.sampling_period_ms).await?;
        info!(port = %self.session.port_name(), version = %version, period_ms = period, "coincidence board ready");
        Ok(())
    }

    /// Close the port, open it again and reapply `board`.
    ///
    /// # Errors
    /// Same as [`configure`](Self::configure); [`LinkError::Connect`] if the
    /// port cannot be reopened.
    #[cfg(feature = "instrument_serial")]
    pub async fn reconnect_with(&self, board: &CoincidenceBoardConfig) -> LinkResult<()> {
        self.session
            .reopen(|| SerialTransport::open_boxed(&board.port, board.baud_rate))
            .await?;
        self.configure(board).await
    }

    /// `!V?`: firmware version.
    pub async fn get_version(&self) -> LinkResult<String> {
        let mut lease = self.session.lease(OWNER)?;
        let frame = lease.exchange(&Command::new("V"), CommandClass::Quick).await?;
        let version = frame.token(0)?.to_string();
        self.session
            .update_state(|s| s.version = Some(version.clone()));
        Ok(version)
    }

    /// `!T:<ms>?`: set the integration period; returns the board's echo.
    ///
    /// # Errors
    /// [`LinkError::Range`] outside `1..=60000` ms.
    pub async fn set_sampling_period_ms(&self, period_ms: u32) -> LinkResult<u32> {
        if period_ms == 0 || period_ms > MAX_PERIOD_MS {
            return Err(LinkError::Range(format!(
                "sampling period {period_ms} ms outside 1..={MAX_PERIOD_MS}"
            )));
        }
        let mut lease = self.session.lease(OWNER)?;
        let frame = lease
            .exchange(
                &Command::new("T").unsigned(u64::from(period_ms)),
                CommandClass::Quick,
            )
            .await?;
        let echoed = frame.parse::<u32>(0)?;
        debug!(requested = period_ms, echoed, "sampling period set");
        self.session
            .update_state(|s| s.sampling_period_ms = Some(echoed));
        Ok(echoed)
    }

    /// `!D?`: counts of the next integration period.
    pub async fn get_counts(&self) -> LinkResult<Counts> {
        let period = self.session.state().period();
        let mut lease = self.session.lease(OWNER)?;
        let counts = read_counts(&mut lease, period, None).await?;
        self.session.update_state(|s| s.last_counts = Some(counts));
        Ok(counts)
    }

    /// `!S?`: stop counting. The firmware acknowledges with `!E;`.
    pub async fn stop_acquisition(&self) -> LinkResult<()> {
        let mut lease = self.session.lease(OWNER)?;
        lease
            .exchange(&Command::new("S").expecting("E"), CommandClass::Quick)
            .await?;
        Ok(())
    }

    /// Sampler for [`crate::acquisition::start`].
    pub fn sampler(&self) -> CoincidenceSampler {
        CoincidenceSampler {
            period: self.session.state().period(),
            state: self.session.state_handle(),
        }
    }

    /// Whether the session is usable.
    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Last cached state.
    pub fn state(&self) -> CoincidenceState {
        self.session.state()
    }

    /// Read-only status for other consumers.
    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }

    /// Underlying session.
    pub fn session(&self) -> &BoardSession<CoincidenceState> {
        &self.session
    }

    /// Close the port.
    pub async fn disconnect(&self) -> LinkResult<()> {
        self.session.disconnect().await
    }
}

async fn read_counts(
    lease: &mut LinkLease,
    period: Duration,
    cancel: Option<&CancellationToken>,
) -> LinkResult<Counts> {
    // The board integrates for one period before it answers.
    let deadline = lease.timeouts().readout + period;
    let frame = lease
        .exchange_within(&Command::new("D"), deadline, cancel)
        .await?;
    Counts::from_frame(&frame)
}

/// Polls `!D?` for a live counter display.
#[derive(Debug, Clone)]
pub struct CoincidenceSampler {
    period: Duration,
    state: StateHandle<CoincidenceState>,
}

#[async_trait]
impl Sampler for CoincidenceSampler {
    type Sample = Counts;

    async fn sample(&mut self, lease: &mut LinkLease, cancel: &CancellationToken) -> LinkResult<Counts> {
        let counts = read_counts(lease, self.period, Some(cancel)).await?;
        self.state.update(|s| s.last_counts = Some(counts));
        Ok(counts)
    }
}

/// Reader for boards that stream 18-byte binary count records.
#[derive(Debug)]
pub struct LegacyCounterReader {
    session: BoardSession<Option<Counts>>,
}

impl LegacyCounterReader {
    /// Read records from an already opened transport.
    pub fn new(transport: Box<dyn Transport>, timeouts: ExchangeTimeouts) -> Self {
        let link = Link::new(
            transport,
            Box::new(FixedBinary::legacy_coincidence()),
            timeouts,
        );
        Self {
            session: BoardSession::new("legacy-coincidence", link),
        }
    }

    /// Wait for the next record.
    pub async fn read_counts(&self) -> LinkResult<Counts> {
        let mut lease = self.session.lease("legacy-coincidence")?;
        let deadline = lease.timeouts().readout;
        let frame = lease.read_frame(deadline, None).await?;
        let counts = Counts::from_legacy_record(&frame)?;
        self.session.update_state(|s| *s = Some(counts));
        Ok(counts)
    }

    /// Sampler streaming records into an acquisition loop.
    pub fn sampler(&self) -> LegacySampler {
        LegacySampler
    }

    /// Underlying session.
    pub fn session(&self) -> &BoardSession<Option<Counts>> {
        &self.session
    }
}

/// Streams legacy binary records.
#[derive(Debug, Clone, Copy)]
pub struct LegacySampler;

#[async_trait]
impl Sampler for LegacySampler {
    type Sample = Counts;

    async fn sample(&mut self, lease: &mut LinkLease, cancel: &CancellationToken) -> LinkResult<Counts> {
        let deadline = lease.timeouts().readout;
        let frame = lease.read_frame(deadline, Some(cancel)).await?;
        Counts::from_legacy_record(&frame)
    }
}

/// A coincidence board as described by the `[coincidence]` section: the
/// ASCII firmware, or an older board streaming binary records.
#[derive(Debug)]
pub enum CoincidenceBoard {
    /// `!`/`:`/`;` firmware.
    Firmware(CoincidenceCounterDriver),
    /// 18-byte record stream.
    Legacy(LegacyCounterReader),
}

impl CoincidenceBoard {
    /// Wrap an opened transport in the reader `board` asks for. Firmware
    /// boards get the configured integration period.
    ///
    /// # Errors
    /// Exchange errors from [`CoincidenceCounterDriver::configure`].
    pub async fn from_transport(
        transport: Box<dyn Transport>,
        board: &CoincidenceBoardConfig,
        timeouts: ExchangeTimeouts,
    ) -> LinkResult<Self> {
        if board.legacy_binary {
            info!(port = %board.port, "legacy coincidence board, reading binary records");
            return Ok(Self::Legacy(LegacyCounterReader::new(transport, timeouts)));
        }
        let driver = CoincidenceCounterDriver::new(transport, timeouts);
        driver.configure(board).await?;
        Ok(Self::Firmware(driver))
    }

    /// Open the port named in `board` at its baud rate.
    ///
    /// # Errors
    /// [`LinkError::Connect`] if the port cannot be opened; see
    /// [`from_transport`](Self::from_transport).
    #[cfg(feature = "instrument_serial")]
    pub async fn connect_with(board: &CoincidenceBoardConfig, timeouts: ExchangeTimeouts) -> LinkResult<Self> {
        let transport = SerialTransport::open_boxed(&board.port, board.baud_rate).await?;
        Self::from_transport(transport, board, timeouts).await
    }

    /// Serial support compiled out.
    #[cfg(not(feature = "instrument_serial"))]
    pub async fn connect_with(_board: &CoincidenceBoardConfig, _timeouts: ExchangeTimeouts) -> LinkResult<Self> {
        Err(LinkError::FeatureNotEnabled("instrument_serial".into()))
    }

    /// One set of counts.
    pub async fn read_counts(&self) -> LinkResult<Counts> {
        match self {
            Self::Firmware(driver) => driver.get_counts().await,
            Self::Legacy(reader) => reader.read_counts().await,
        }
    }

    /// Start a live counter loop with the sampler matching the board.
    ///
    /// # Errors
    /// See [`acquisition::start`].
    pub fn start_acquisition(
        &self,
        config: AcquisitionConfig,
    ) -> LinkResult<(AcquisitionHandle, AcquisitionStream<Counts>)> {
        match self {
            Self::Firmware(driver) => acquisition::start(driver.session(), driver.sampler(), config),
            Self::Legacy(reader) => acquisition::start(reader.session(), reader.sampler(), config),
        }
    }

    /// Read-only status for other consumers.
    pub fn status(&self) -> SessionStatus {
        match self {
            Self::Firmware(driver) => driver.status(),
            Self::Legacy(reader) => reader.session().status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn driver(board: &MockTransport) -> CoincidenceCounterDriver {
        CoincidenceCounterDriver::new(Box::new(board.clone()), ExchangeTimeouts::default())
    }

    #[test]
    fn g2_table() {
        let cases = [
            ((10, 0, 5, 2), 0.0),
            ((10, 5, 0, 2), 0.0),
            ((100, 50, 40, 20), 1.0),
            ((200, 50, 40, 20), 2.0),
            ((0, 3, 3, 0), 0.0),
        ];
        for ((a, ab, ac, abc), expected) in cases {
            assert_eq!(g2(a, ab, ac, abc), expected, "a={a} ab={ab} ac={ac} abc={abc}");
        }
    }

    #[test]
    fn accidental_correction() {
        let counts = Counts {
            a: 1_000_000,
            b: 500_000,
            c: 250_000,
            ab: 100,
            ac: 50,
            abc: 1,
        };
        let corrected = counts.corrected_coincidences(DEFAULT_TAU);
        assert!((corrected.ab - (100.0 - 1e6 * 5e5 * 26e-9)).abs() < 1e-9);
        assert!((corrected.ac - (50.0 - 1e6 * 2.5e5 * 26e-9)).abs() < 1e-9);
    }

    #[test]
    fn legacy_record_uses_wire_order() {
        let record = [
            0, 0, 1, // A
            0, 0, 4, // AB
            0, 0, 5, // AC
            0, 0, 6, // ABC
            0, 0, 2, // B
            0, 0, 3, // C
        ];
        let mut buf = bytes::BytesMut::from(&record[..]);
        let frame = crate::codec::FrameCodec::decode(&FixedBinary::legacy_coincidence(), &mut buf)
            .unwrap()
            .unwrap();
        let counts = Counts::from_legacy_record(&frame).unwrap();
        assert_eq!(counts.as_array(), [1, 2, 3, 4, 5, 6]);
        assert_eq!(counts.encode_legacy_record().unwrap(), record.to_vec());
    }

    #[tokio::test]
    async fn counts_follow_firmware_order() {
        let board = MockTransport::new("mock-coinc").respond("!D?", "!D:11:12:13:4:5:1;");
        let counter = driver(&board);
        let counts = counter.get_counts().await.unwrap();
        assert_eq!(counts.as_array(), [11, 12, 13, 4, 5, 1]);
        assert_eq!(counter.state().last_counts, Some(counts));
    }

    #[tokio::test]
    async fn period_is_range_checked_and_echoed() {
        let board = MockTransport::new("mock-coinc").respond("!T:400?", "!T:400;");
        let counter = driver(&board);

        assert!(matches!(
            counter.set_sampling_period_ms(0).await,
            Err(LinkError::Range(_))
        ));
        assert!(board.writes().is_empty());

        assert_eq!(counter.set_sampling_period_ms(400).await.unwrap(), 400);
        assert_eq!(counter.state().sampling_period_ms, Some(400));
    }

    #[tokio::test]
    async fn stop_accepts_error_reply() {
        let board = MockTransport::new("mock-coinc").respond("!S?", "!E;");
        let counter = driver(&board);
        counter.stop_acquisition().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_command_is_rejected() {
        let board = MockTransport::new("mock-coinc").respond("!V?", "!E;");
        let counter = driver(&board);
        assert!(matches!(
            counter.get_version().await,
            Err(LinkError::BoardRejected { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_period_extends_the_deadline() {
        let board = MockTransport::new("mock-coinc")
            .respond("!T:1500?", "!T:1500;")
            .respond_after("!D?", "!D:1:1:1:1:1:1;", Duration::from_millis(1500));
        let counter = driver(&board);
        counter.set_sampling_period_ms(1500).await.unwrap();
        assert_eq!(counter.get_counts().await.unwrap().a, 1);
    }
}
