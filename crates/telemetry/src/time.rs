//! RAII helpers for timing spans of work and reporting them to the
//! installed metrics sink.

use std::time::Instant;

/// Records elapsed wall-clock time into the executor pipeline histogram
/// when dropped. Construct at the start of a unit of work and let it
/// fall out of scope at the end.
pub struct PipelineTimer {
    start: Instant,
}

impl PipelineTimer {
    pub fn start() -> Self {
        Self { start: Instant::now() }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Drop for PipelineTimer {
    fn drop(&mut self) {
        crate::sinks::executor_metrics().observe_pipeline_duration(self.elapsed_secs());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_secs_is_nonnegative() {
        let t = PipelineTimer::start();
        std::thread::sleep(std::time::Duration::from_millis(1));
        assert!(t.elapsed_secs() > 0.0);
    }
}
