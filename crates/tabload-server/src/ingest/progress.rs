//! Stage-banded progress for ingestion runs

use std::time::Instant;

use crate::queue::ProgressPayload;

/// Steps of one ingestion run, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IngestStage {
    Validating,
    AnalyzingStructure,
    CreatingDatasetRecord,
    StreamingBatchInsert,
    Finalizing,
    Completed,
}

impl IngestStage {
    pub fn step_name(&self) -> &'static str {
        match self {
            IngestStage::Validating => "validating",
            IngestStage::AnalyzingStructure => "analyzing_structure",
            IngestStage::CreatingDatasetRecord => "creating_dataset_record",
            IngestStage::StreamingBatchInsert => "streaming_batch_insert",
            IngestStage::Finalizing => "finalizing",
            IngestStage::Completed => "completed",
        }
    }

    /// Percentage range covered by the stage
    pub fn band(&self) -> (f64, f64) {
        match self {
            IngestStage::Validating => (0.0, 5.0),
            IngestStage::AnalyzingStructure => (5.0, 20.0),
            IngestStage::CreatingDatasetRecord => (20.0, 20.0),
            IngestStage::StreamingBatchInsert => (20.0, 85.0),
            IngestStage::Finalizing => (85.0, 100.0),
            IngestStage::Completed => (100.0, 100.0),
        }
    }
}

impl std::fmt::Display for IngestStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.step_name())
    }
}

/// Builds progress snapshots whose percentage never decreases
#[derive(Debug)]
pub struct ProgressTracker {
    stage: IngestStage,
    stage_started: Instant,
    last_percentage: f64,
    processed_rows: u64,
    total_rows: Option<u64>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            stage: IngestStage::Validating,
            stage_started: Instant::now(),
            last_percentage: 0.0,
            processed_rows: 0,
            total_rows: None,
        }
    }

    pub fn stage(&self) -> IngestStage {
        self.stage
    }

    pub fn set_total_rows(&mut self, total_rows: u64) {
        self.total_rows = Some(total_rows);
    }

    /// Snapshot at the start of `stage`
    pub fn enter(&mut self, stage: IngestStage) -> ProgressPayload {
        self.stage = stage;
        self.stage_started = Instant::now();
        self.snapshot(stage.band().0, None, None)
    }

    /// Snapshot after `processed_rows` rows of the current stage
    pub fn advance(&mut self, processed_rows: u64) -> ProgressPayload {
        self.processed_rows = processed_rows;
        let (start, end) = self.stage.band();
        let fraction = match self.total_rows {
            Some(0) => 1.0,
            Some(total) => (processed_rows as f64 / total as f64).min(1.0),
            None => 0.0,
        };

        let elapsed = self.stage_started.elapsed().as_secs_f64();
        let speed = (elapsed > 0.0).then(|| processed_rows as f64 / elapsed);
        let remaining = match (speed, self.total_rows) {
            (Some(speed), Some(total)) if speed > 0.0 => {
                Some(total.saturating_sub(processed_rows) as f64 / speed)
            }
            _ => None,
        };

        self.snapshot(start + (end - start) * fraction, speed, remaining)
    }

    fn snapshot(
        &mut self,
        percentage: f64,
        speed: Option<f64>,
        remaining: Option<f64>,
    ) -> ProgressPayload {
        let percentage = round2(percentage.clamp(0.0, 100.0)).max(self.last_percentage);
        self.last_percentage = percentage;

        ProgressPayload {
            percentage,
            current_step: self.stage.step_name().to_string(),
            processed_rows: self.processed_rows,
            total_rows: self.total_rows,
            processing_speed: speed.map(round2),
            estimated_time_remaining: remaining.map(round2),
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bands_are_contiguous() {
        let stages = [
            IngestStage::Validating,
            IngestStage::AnalyzingStructure,
            IngestStage::CreatingDatasetRecord,
            IngestStage::StreamingBatchInsert,
            IngestStage::Finalizing,
            IngestStage::Completed,
        ];
        for pair in stages.windows(2) {
            assert_eq!(pair[0].band().1, pair[1].band().0);
        }
    }

    #[test]
    fn test_batch_progress_stays_in_band() {
        let mut tracker = ProgressTracker::new();
        tracker.set_total_rows(1000);
        let start = tracker.enter(IngestStage::StreamingBatchInsert);
        assert_eq!(start.percentage, 20.0);
        assert_eq!(start.current_step, "streaming_batch_insert");

        let half = tracker.advance(500);
        assert_eq!(half.percentage, 52.5);
        assert_eq!(half.processed_rows, 500);
        assert_eq!(half.total_rows, Some(1000));

        let done = tracker.advance(1000);
        assert_eq!(done.percentage, 85.0);
        assert_eq!(done.estimated_time_remaining.unwrap_or(0.0), 0.0);
    }

    #[test]
    fn test_percentage_never_decreases() {
        let mut tracker = ProgressTracker::new();
        tracker.set_total_rows(10);
        tracker.enter(IngestStage::StreamingBatchInsert);
        let later = tracker.advance(8);
        let earlier = tracker.advance(2);
        assert!(earlier.percentage >= later.percentage);

        // re-entering an earlier band does not move backwards either
        let back = tracker.enter(IngestStage::Validating);
        assert_eq!(back.percentage, later.percentage);
    }

    #[test]
    fn test_empty_file_completes_band() {
        let mut tracker = ProgressTracker::new();
        tracker.set_total_rows(0);
        tracker.enter(IngestStage::StreamingBatchInsert);
        assert_eq!(tracker.advance(0).percentage, 85.0);
        assert_eq!(tracker.enter(IngestStage::Completed).percentage, 100.0);
    }
}
