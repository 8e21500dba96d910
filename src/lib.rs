//! Serial instrument protocol engine.
//!
//! Drives the lab's microcontroller boards (piezo stage, laser-PID photodiode,
//! coincidence counter) over serial links and the DLPC900 DMD over USB.
//!
//! The layers, bottom up:
//!
//! - [`transport`]: byte pipes. Real serial ports, a scripted mock, and a
//!   registry that keeps each physical port open at most once.
//! - [`codec`]: frame codecs for the delimited ASCII and fixed binary
//!   dialects, plus the piezo fixed-point field encoding.
//! - [`exchange`]: one command, one reply, bounded by a deadline. Stale input
//!   is discarded before every write; partial frames are accumulated across
//!   reads.
//! - [`session`]: per-board ownership. Every exchange runs under a lease, so
//!   two callers can never interleave on one link.
//! - [`drivers`]: board command sets on top of sessions.
//! - [`acquisition`]: live sampling loops with a drop-oldest buffer.
//! - [`runtime`]: a worker runtime for synchronous callers.
//!
//! # Example
//!
//! ```no_run
//! use instrument_link::acquisition::{self, AcquisitionEvent};
//! use instrument_link::config::LinkConfig;
//! use instrument_link::drivers::CoincidenceCounterDriver;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = LinkConfig::load()?;
//!     instrument_link::logging::init_from_config(&config)?;
//!
//!     let timeouts = config.timeouts.to_exchange_timeouts();
//!     let counter = CoincidenceCounterDriver::connect("/dev/ttyACM1", timeouts).await?;
//!     counter.set_sampling_period_ms(400).await?;
//!
//!     let loop_config = config.acquisition.to_acquisition_config("counter-display");
//!     let (handle, mut stream) = acquisition::start(counter.session(), counter.sampler(), loop_config)?;
//!     while let Some(AcquisitionEvent::Sample(sample)) = stream.next().await {
//!         println!("#{} g2 = {:.3}", sample.seq, sample.value.g2());
//!         if sample.seq == 100 {
//!             break;
//!         }
//!     }
//!     handle.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod acquisition;
pub mod codec;
pub mod config;
pub mod drivers;
pub mod error;
pub mod exchange;
pub mod logging;
pub mod runtime;
pub mod session;
pub mod transport;

pub use error::{LinkError, LinkResult};
