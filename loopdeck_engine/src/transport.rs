use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live loop duration shared between whoever owns the settings and the transport.
///
/// Stored as `f64` bits so a change is visible on the very next tick.
#[derive(Debug, Clone)]
pub struct LoopDurationHandle(Arc<AtomicU64>);

impl LoopDurationHandle {
    pub fn new(seconds: f64) -> Self {
        Self(Arc::new(AtomicU64::new(seconds.to_bits())))
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, seconds: f64) {
        self.0.store(seconds.to_bits(), Ordering::Relaxed);
    }
}

/// Emitted once per loop cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopBoundary {
    /// 0 for the cycle fired by `start`.
    pub cycle: u64,
    /// Exact boundary time, in the clock the transport is ticked with.
    pub at: f64,
}

/// Free-running loop clock. Knows nothing about audio.
///
/// The host polls [`Transport::tick`] with its own high-resolution time. The
/// boundary advances by exactly one loop duration per fired cycle, so the
/// residual past a boundary carries into the next cycle instead of piling up.
#[derive(Debug)]
pub struct Transport {
    duration: LoopDurationHandle,
    running: bool,
    last_boundary: f64,
    cycle: u64,
}

impl Transport {
    pub fn new(duration: LoopDurationHandle) -> Self {
        Self {
            duration,
            running: false,
            last_boundary: 0.0,
            cycle: 0,
        }
    }

    pub fn duration_handle(&self) -> &LoopDurationHandle {
        &self.duration
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn last_boundary(&self) -> f64 {
        self.last_boundary
    }

    /// Starts the clock and fires the first cycle. A second start is a no-op.
    pub fn start(&mut self, now: f64) -> Option<LoopBoundary> {
        if self.running {
            return None;
        }
        self.running = true;
        self.last_boundary = now;
        self.cycle = 0;
        Some(LoopBoundary { cycle: 0, at: now })
    }

    /// Fires at most one boundary per call.
    pub fn tick(&mut self, now: f64) -> Option<LoopBoundary> {
        if !self.running {
            return None;
        }
        let duration = self.duration.get();
        if duration.is_nan() || duration <= 0.0 {
            return None;
        }
        if now - self.last_boundary >= duration {
            self.last_boundary += duration;
            self.cycle += 1;
            return Some(LoopBoundary {
                cycle: self.cycle,
                at: self.last_boundary,
            });
        }
        None
    }

    /// Stops polling. Safe to call repeatedly or before any start.
    pub fn stop(&mut self) {
        self.running = false;
    }
}
