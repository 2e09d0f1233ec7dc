//! Stage timing for multi-step pipelines.

use web_time::Instant;

/// Logs and records the elapsed time of one pipeline stage when dropped.
///
/// The histogram is `folio_stage_duration_ms` labelled with the stage name.
pub struct StageTimer {
    stage: &'static str,
    start: Instant,
}

impl StageTimer {
    pub fn start(stage: &'static str) -> Self {
        Self {
            stage,
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        let elapsed = self.elapsed_ms();
        metrics::histogram!("folio_stage_duration_ms", "stage" => self.stage).record(elapsed);
        tracing::debug!(stage = self.stage, elapsed_ms = elapsed, "stage finished");
    }
}
