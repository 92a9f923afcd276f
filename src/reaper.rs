use std::{
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio::sync::broadcast;
use tracing::debug;

use crate::engine::Engine;

/// Background sweeper for the flow and TSval tables.
///
/// Ticks on real wall-clock time, converted to the capture timebase via
/// the clock baseline. For offline trace replay the sweeps lag packet
/// time; the input-driven final sweep at shutdown catches any residue.
pub struct Reaper {
    engine: Arc<Mutex<Engine>>,
    interval: Duration,
}

impl Reaper {
    pub fn new(engine: Arc<Mutex<Engine>>, tsval_max_age: f64) -> Self {
        Self {
            engine,
            interval: Duration::from_secs_f64(tsval_max_age),
        }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    let mut engine = self.engine.lock().unwrap();
                    // No baseline until the first usable packet.
                    if let Some(off) = engine.clock_offset() {
                        let wall = SystemTime::now()
                            .duration_since(UNIX_EPOCH)
                            .map(|d| d.as_secs() as i64)
                            .unwrap_or(0);
                        engine.sweep((wall - off) as f64);
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("reaper shutting down");
                    break;
                }
            }
        }
    }
}
