//! Wall-clock timer for host-side phases (compilation, dispatch, whole runs).
//!
//! Device-side durations come from backend event timestamps; this timer
//! measures what the host observes.
//!
//! # Example
//!
//! ```rust
//! use taskforge::profiling::KernelTimer;
//!
//! let mut timer = KernelTimer::for_phase("compile");
//! timer.start();
//! // ... work ...
//! timer.stop();
//! assert!(timer.elapsed_ns().is_some());
//! ```

use std::time::Instant;

#[derive(Debug, Clone)]
pub struct KernelTimer {
    name: String,
    start: Option<Instant>,
    elapsed_ns: Option<u64>,
}

impl KernelTimer {
    pub fn for_phase(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start: None,
            elapsed_ns: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start (or restart) timing
    pub fn start(&mut self) {
        self.start = Some(Instant::now());
        self.elapsed_ns = None;
    }

    /// Stop timing; a stop without a start is ignored
    pub fn stop(&mut self) {
        if let Some(start) = self.start.take() {
            self.elapsed_ns = Some(start.elapsed().as_nanos() as u64);
        }
    }

    pub fn elapsed_ns(&self) -> Option<u64> {
        self.elapsed_ns
    }

    pub fn elapsed_ms(&self) -> Option<f64> {
        self.elapsed_ns.map(|ns| ns as f64 / 1_000_000.0)
    }

    pub fn is_started(&self) -> bool {
        self.start.is_some()
    }

    pub fn is_stopped(&self) -> bool {
        self.elapsed_ns.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_timer_lifecycle() {
        let mut timer = KernelTimer::for_phase("compile");
        assert_eq!(timer.name(), "compile");
        assert!(!timer.is_started());

        timer.start();
        assert!(timer.is_started());
        std::thread::sleep(Duration::from_millis(2));
        timer.stop();

        assert!(timer.is_stopped());
        assert!(timer.elapsed_ns().unwrap() >= 2_000_000);
        assert!(timer.elapsed_ms().unwrap() >= 2.0);
    }

    #[test]
    fn test_stop_without_start() {
        let mut timer = KernelTimer::for_phase("idle");
        timer.stop();
        assert!(timer.elapsed_ns().is_none());
    }
}
