//! Hardware worker runtime for synchronous callers.
//!
//! Scripts and UI threads that are not async drive the boards through a
//! [`HardwareRuntime`]: a multi-thread Tokio runtime parked on its own named
//! thread. `call` blocks the caller until the future completes on the worker;
//! acquisition loops started with [`HardwareRuntime::spawn_acquisition`] keep
//! running there until stopped.
//!
//! # Example
//!
//! ```no_run
//! use instrument_link::drivers::PiezoDriver;
//! use instrument_link::exchange::ExchangeTimeouts;
//! use instrument_link::runtime::HardwareRuntime;
//! use std::sync::Arc;
//!
//! fn main() -> anyhow::Result<()> {
//!     let hw = HardwareRuntime::new("hardware", 2)?;
//!     let piezo = Arc::new(hw.call(PiezoDriver::connect("/dev/ttyACM0", ExchangeTimeouts::default()))?);
//!     let stage = Arc::clone(&piezo);
//!     let position = hw.call(async move { stage.move_to(2, 500).await })?;
//!     println!("at {position}");
//!     Ok(())
//! }
//! ```

use crate::acquisition::{self, AcquisitionConfig, AcquisitionHandle, AcquisitionStream, Sampler};
use crate::error::{LinkError, LinkResult};
use crate::session::BoardSession;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Tokio runtime on a dedicated thread.
pub struct HardwareRuntime {
    name: String,
    handle: Handle,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl fmt::Debug for HardwareRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HardwareRuntime")
            .field("name", &self.name)
            .field("running", &self.thread.is_some())
            .finish()
    }
}

impl HardwareRuntime {
    /// Start the worker thread with `worker_threads` Tokio workers.
    ///
    /// # Errors
    /// [`LinkError::Runtime`] if the runtime or thread cannot be created.
    pub fn new(name: &str, worker_threads: usize) -> LinkResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name(format!("{name}-worker"))
            .enable_all()
            .build()
            .map_err(|e| LinkError::Runtime(format!("failed to build runtime '{name}': {e}")))?;
        let handle = runtime.handle().clone();
        let (shutdown, signal) = oneshot::channel::<()>();

        let thread_name = name.to_string();
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                runtime.block_on(async {
                    let _ = signal.await;
                });
                runtime.shutdown_timeout(SHUTDOWN_GRACE);
                debug!(runtime = %thread_name, "hardware runtime thread exited");
            })
            .map_err(|e| LinkError::Runtime(format!("failed to spawn thread '{name}': {e}")))?;

        info!(runtime = name, worker_threads, "hardware runtime started");
        Ok(Self {
            name: name.to_string(),
            handle,
            shutdown: Some(shutdown),
            thread: Some(thread),
        })
    }

    /// Handle for spawning onto the worker.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Run `future` on the worker and block until it finishes.
    ///
    /// # Errors
    /// [`LinkError::Runtime`] if called from inside an async context, or if
    /// the worker drops the task.
    pub fn run<F>(&self, future: F) -> LinkResult<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if Handle::try_current().is_ok() {
            return Err(LinkError::Runtime(
                "HardwareRuntime::run called from async code; await the future instead".into(),
            ));
        }
        let (tx, rx) = oneshot::channel();
        self.handle.spawn(async move {
            let _ = tx.send(future.await);
        });
        rx.blocking_recv()
            .map_err(|_| LinkError::Runtime(format!("runtime '{}' dropped the call", self.name)))
    }

    /// Run a fallible future on the worker and block for its result.
    pub fn call<F, T>(&self, future: F) -> LinkResult<T>
    where
        F: Future<Output = LinkResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.run(future)?
    }

    /// Run blocking work (USB transfers) on the worker's blocking pool.
    pub fn call_blocking<F, T>(&self, work: F) -> LinkResult<T>
    where
        F: FnOnce() -> LinkResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.call(async move {
            tokio::task::spawn_blocking(work)
                .await
                .map_err(|e| LinkError::Runtime(format!("blocking task failed: {e}")))?
        })
    }

    /// Spawn a background task on the worker.
    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Start an acquisition loop on the worker.
    ///
    /// # Errors
    /// See [`acquisition::start`].
    pub fn spawn_acquisition<S, St>(
        &self,
        session: &BoardSession<St>,
        sampler: S,
        config: AcquisitionConfig,
    ) -> LinkResult<(AcquisitionHandle, AcquisitionStream<S::Sample>)>
    where
        S: Sampler,
        St: Default + Clone + Send + fmt::Debug + 'static,
    {
        acquisition::start_on(&self.handle, session, sampler, config)
    }

    /// Stop a loop started with [`spawn_acquisition`](Self::spawn_acquisition)
    /// and wait for it to release the board.
    pub fn stop_acquisition(&self, handle: AcquisitionHandle) -> Result<(), Arc<LinkError>> {
        self.run(handle.stop()).map_err(Arc::new)?
    }
}

impl Drop for HardwareRuntime {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(runtime = %self.name, "hardware runtime thread panicked");
            }
        }
        info!(runtime = %self.name, "hardware runtime stopped");
    }
}
