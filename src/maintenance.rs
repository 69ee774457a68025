//! Maintenance Thread
//!
//! Background ticker that drives [`Engine::cron`] at the configured rate.
//!
//! ```text
//!   tick(interval) ──┐
//!                    ├── select! ──► engine.cron()
//!   shutdown ────────┘            └─► exit
//! ```

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Sender};

use crate::engine::Engine;
use crate::error::Result;
use crate::tiering::Adjustment;

/// Handle to a running maintenance thread
///
/// Dropping the handle stops the thread.
pub struct Maintenance {
    shutdown: Sender<()>,
    handle: Option<JoinHandle<u64>>,
}

impl Maintenance {
    /// Start ticking at the engine's configured `hz`
    pub fn start(engine: Arc<Engine>) -> Result<Self> {
        let interval = engine.config().tick_interval();
        Self::with_interval(engine, interval)
    }

    pub fn with_interval(engine: Arc<Engine>, interval: Duration) -> Result<Self> {
        let (shutdown, stop) = channel::bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("tierkv-cron".to_string())
            .spawn(move || {
                let ticker = channel::tick(interval);
                let mut ticks = 0u64;

                loop {
                    crossbeam::select! {
                        recv(ticker) -> _ => {
                            match engine.cron() {
                                Adjustment::Raised { .. } | Adjustment::Lowered { .. } => {
                                    tracing::debug!("Threshold now {}", engine.threshold());
                                }
                                _ => {}
                            }
                            ticks += 1;
                        }
                        recv(stop) -> _ => break,
                    }
                }

                tracing::debug!("Maintenance thread exiting after {} ticks", ticks);
                ticks
            })?;

        tracing::info!("Maintenance thread started ({:?} per tick)", interval);
        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    /// Stop the thread and return how many ticks it ran
    pub fn stop(mut self) -> u64 {
        self.shutdown_and_join()
    }

    fn shutdown_and_join(&mut self) -> u64 {
        let Some(handle) = self.handle.take() else {
            return 0;
        };
        // A send error means the thread already exited
        let _ = self.shutdown.send(());
        handle.join().unwrap_or_else(|_| {
            tracing::error!("Maintenance thread panicked");
            0
        })
    }
}

impl Drop for Maintenance {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}
