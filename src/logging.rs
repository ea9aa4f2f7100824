//! Logging setup and frame timing diagnostics
//!
//! Thin wrapper over `env_logger` plus a commit-time tracer the present
//! path can feed. `RUST_LOG` overrides everything; the `debug` flag only
//! changes the default filter.

use std::time::{Duration, Instant};

use log::info;

/// Initializes the process-wide logger. Safe to call more than once; later
/// calls are ignored.
pub fn init_logging(debug: bool) {
    let default_filter = if debug { "debug" } else { "info" };
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter),
    )
    .try_init();
}

/// Rolling commit-time statistics for one display.
///
/// Cheap enough to keep on the hot path; a summary line goes to the log
/// once per `report_interval` frames.
pub struct FrameTracer {
    label: String,
    report_interval: u64,
    frames: u64,
    accumulated: Duration,
    worst: Duration,
    in_flight: Option<Instant>,
}

impl FrameTracer {
    pub fn new(label: &str, report_interval: u64) -> Self {
        Self {
            label: label.to_string(),
            report_interval: report_interval.max(1),
            frames: 0,
            accumulated: Duration::ZERO,
            worst: Duration::ZERO,
            in_flight: None,
        }
    }

    pub fn begin_frame(&mut self) {
        self.in_flight = Some(Instant::now());
    }

    pub fn end_frame(&mut self) {
        let Some(started) = self.in_flight.take() else {
            return;
        };
        let elapsed = started.elapsed();
        self.frames += 1;
        self.accumulated += elapsed;
        self.worst = self.worst.max(elapsed);

        if self.frames % self.report_interval == 0 {
            let avg = self.accumulated / self.frames as u32;
            info!(
                "{}: {} frames, avg commit {:?}, worst {:?}",
                self.label, self.frames, avg, self.worst
            );
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn average(&self) -> Duration {
        if self.frames == 0 {
            Duration::ZERO
        } else {
            self.accumulated / self.frames as u32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracer_accumulates() {
        let mut tracer = FrameTracer::new("test", 100);
        assert_eq!(tracer.frames(), 0);
        for _ in 0..3 {
            tracer.begin_frame();
            tracer.end_frame();
        }
        assert_eq!(tracer.frames(), 3);
    }

    #[test]
    fn test_end_without_begin_is_ignored() {
        let mut tracer = FrameTracer::new("test", 10);
        tracer.end_frame();
        assert_eq!(tracer.frames(), 0);
        assert_eq!(tracer.average(), Duration::ZERO);
    }
}
