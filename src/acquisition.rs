//! Live acquisition loops.
//!
//! An acquisition loop leases a board for its whole lifetime, calls a
//! [`Sampler`] at a fixed cadence, and publishes each sample to a single
//! consumer through a bounded ring:
//!
//! - **Exclusive**: starting a loop takes the board's lease. If a one-shot
//!   command is in flight the start fails with [`LinkError::Concurrency`];
//!   while the loop runs, one-shot commands fail the same way.
//! - **Drop-oldest**: the ring has a fixed capacity. A slow consumer loses
//!   the oldest samples and is told how many ([`AcquisitionStream::dropped`]);
//!   hardware polling never waits on the consumer.
//! - **Stoppable**: [`AcquisitionHandle::stop`] cancels the loop. The poll
//!   wait inside the exchange observes the token, so the loop exits within
//!   one poll interval.
//! - **Bounded failure**: a fatal link error ends the loop at once; timeouts
//!   are tolerated up to `max_consecutive_timeouts` in a row. The terminal
//!   error is both published on the stream and returned from `stop()`.

use crate::error::{LinkError, LinkResult};
use crate::session::{BoardSession, LinkLease};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One data read against a leased link.
#[async_trait]
pub trait Sampler: Send + 'static {
    /// Decoded sample type.
    type Sample: Clone + Send + Sync + fmt::Debug + 'static;

    /// Read one sample. Must pass `cancel` to its exchanges.
    async fn sample(
        &mut self,
        lease: &mut LinkLease,
        cancel: &CancellationToken,
    ) -> LinkResult<Self::Sample>;
}

/// Loop tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionConfig {
    /// Target time between samples.
    pub cadence: Duration,
    /// Samples kept for a lagging consumer.
    pub capacity: usize,
    /// Timeouts in a row tolerated before the loop gives up.
    pub max_consecutive_timeouts: u32,
    /// Lease owner name reported to contending callers.
    pub owner: String,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            cadence: Duration::from_millis(100),
            capacity: 64,
            max_consecutive_timeouts: 3,
            owner: "acquisition".to_string(),
        }
    }
}

/// A sample stamped with sequence number and wall-clock time.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample<T> {
    /// Monotonic sequence number, starting at 0.
    pub seq: u64,
    /// Time the read completed.
    pub timestamp: DateTime<Utc>,
    /// Decoded value.
    pub value: T,
}

/// Items delivered to the consumer.
#[derive(Debug, Clone)]
pub enum AcquisitionEvent<T> {
    /// A fresh sample.
    Sample(Sample<T>),
    /// The loop ended. `error` is set if it died on a failure.
    Stopped {
        /// Terminal error.
        error: Option<Arc<LinkError>>,
    },
}

/// Consumer side of a loop.
#[derive(Debug)]
pub struct AcquisitionStream<T> {
    rx: broadcast::Receiver<AcquisitionEvent<T>>,
    dropped: u64,
}

impl<T: Clone> AcquisitionStream<T> {
    /// Next event, or `None` once the loop is gone and the ring is drained.
    pub async fn next(&mut self) -> Option<AcquisitionEvent<T>> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                    debug!(dropped = n, total = self.dropped, "consumer lagged, oldest samples dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is ready now.
    pub fn try_next(&mut self) -> Option<AcquisitionEvent<T>> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => self.dropped += n,
                Err(_) => return None,
            }
        }
    }

    /// Samples overwritten before the consumer could read them.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Control side of a loop. Dropping it cancels the loop.
#[derive(Debug)]
#[must_use = "dropping the handle stops the acquisition loop"]
pub struct AcquisitionHandle {
    cancel: CancellationToken,
    task: JoinHandle<Option<Arc<LinkError>>>,
    owner: String,
}

impl AcquisitionHandle {
    /// Whether the loop task is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Token that stops the loop when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the loop and wait for it to release the board.
    ///
    /// # Errors
    /// The error that ended the loop, if it died before being stopped.
    pub async fn stop(mut self) -> Result<(), Arc<LinkError>> {
        self.cancel.cancel();
        match (&mut self.task).await {
            Ok(None) => {
                info!(owner = %self.owner, "acquisition stopped");
                Ok(())
            }
            Ok(Some(error)) => Err(error),
            Err(join) => Err(Arc::new(LinkError::Runtime(format!(
                "acquisition task failed: {join}"
            )))),
        }
    }
}

impl Drop for AcquisitionHandle {
    fn drop(&mut self) {
        if !self.cancel.is_cancelled() {
            debug!(owner = %self.owner, "acquisition handle dropped, cancelling loop");
            self.cancel.cancel();
        }
    }
}

/// Start a loop on the current Tokio runtime.
///
/// # Errors
/// [`LinkError::Concurrency`] if the board is leased, [`LinkError::NotConnected`]
/// if the session is down, [`LinkError::Range`] for a zero capacity.
pub fn start<S, St>(
    session: &BoardSession<St>,
    sampler: S,
    config: AcquisitionConfig,
) -> LinkResult<(AcquisitionHandle, AcquisitionStream<S::Sample>)>
where
    S: Sampler,
    St: Default + Clone + Send + fmt::Debug + 'static,
{
    start_on(&tokio::runtime::Handle::current(), session, sampler, config)
}

/// Start a loop on the given runtime.
///
/// # Errors
/// See [`start`].
pub fn start_on<S, St>(
    runtime: &tokio::runtime::Handle,
    session: &BoardSession<St>,
    sampler: S,
    config: AcquisitionConfig,
) -> LinkResult<(AcquisitionHandle, AcquisitionStream<S::Sample>)>
where
    S: Sampler,
    St: Default + Clone + Send + fmt::Debug + 'static,
{
    if config.capacity == 0 {
        return Err(LinkError::Range("acquisition buffer capacity must be positive".into()));
    }
    if config.cadence.is_zero() {
        return Err(LinkError::Range("acquisition cadence must be positive".into()));
    }
    let lease = session.lease(&config.owner)?;
    let (tx, rx) = broadcast::channel(config.capacity);
    let cancel = CancellationToken::new();
    let owner = config.owner.clone();

    info!(
        owner = %owner,
        port = %session.port_name(),
        cadence_ms = config.cadence.as_millis() as u64,
        "acquisition started"
    );
    let task = runtime.spawn(run_loop(lease, sampler, tx, cancel.clone(), config));

    Ok((
        AcquisitionHandle { cancel, task, owner },
        AcquisitionStream { rx, dropped: 0 },
    ))
}

async fn run_loop<S: Sampler>(
    mut lease: LinkLease,
    mut sampler: S,
    tx: broadcast::Sender<AcquisitionEvent<S::Sample>>,
    cancel: CancellationToken,
    config: AcquisitionConfig,
) -> Option<Arc<LinkError>> {
    let mut ticker = tokio::time::interval(config.cadence);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut seq = 0u64;
    let mut timeouts = 0u32;

    let failure = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break None,
            _ = ticker.tick() => {}
        }

        match sampler.sample(&mut lease, &cancel).await {
            Ok(value) => {
                timeouts = 0;
                let sample = Sample {
                    seq,
                    timestamp: Utc::now(),
                    value,
                };
                seq += 1;
                if tx.send(AcquisitionEvent::Sample(sample)).is_err() {
                    debug!(owner = %config.owner, "consumer gone, ending acquisition");
                    break None;
                }
            }
            Err(LinkError::Cancelled(_)) => break None,
            Err(e) if e.is_timeout() && timeouts < config.max_consecutive_timeouts => {
                timeouts += 1;
                warn!(owner = %config.owner, consecutive = timeouts, error = %e, "sample timed out");
            }
            Err(e) => {
                error!(owner = %config.owner, error = %e, "acquisition failed");
                break Some(Arc::new(e));
            }
        }
    };

    let _ = tx.send(AcquisitionEvent::Stopped {
        error: failure.clone(),
    });
    drop(lease);
    failure
}
