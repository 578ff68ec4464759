use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
pub struct OptimizerStatus {
    inner: Arc<Mutex<OptimizerStatusData>>,
}

#[derive(Default)]
struct OptimizerStatusData {
    phase: String,
    total_cells: usize,
    completed_cells: usize,
    skipped_picks: usize,
    best_score: Option<f64>,
    debug_notes: Option<String>,
}

#[derive(Clone, Debug)]
pub struct OptimizerStatusSnapshot {
    pub phase: String,
    pub total_cells: usize,
    pub completed_cells: usize,
    pub skipped_picks: usize,
    pub best_score: Option<f64>,
    pub debug_notes: Option<String>,
}

impl OptimizerStatus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(OptimizerStatusData {
                phase: "Initializing".to_string(),
                ..Default::default()
            })),
        }
    }

    pub fn set_phase<S: Into<String>>(&self, phase: S) {
        if let Ok(mut data) = self.inner.lock() {
            data.phase = phase.into();
        }
    }

    pub fn set_progress(
        &self,
        total_cells: usize,
        completed_cells: usize,
        best_score: Option<f64>,
    ) {
        if let Ok(mut data) = self.inner.lock() {
            data.total_cells = total_cells;
            data.completed_cells = completed_cells;
            data.best_score = best_score;
        }
    }

    pub fn set_skipped_picks(&self, skipped_picks: usize) {
        if let Ok(mut data) = self.inner.lock() {
            data.skipped_picks = skipped_picks;
        }
    }

    pub fn snapshot(&self) -> OptimizerStatusSnapshot {
        if let Ok(data) = self.inner.lock() {
            OptimizerStatusSnapshot {
                phase: data.phase.clone(),
                total_cells: data.total_cells,
                completed_cells: data.completed_cells,
                skipped_picks: data.skipped_picks,
                best_score: data.best_score,
                debug_notes: data.debug_notes.clone(),
            }
        } else {
            OptimizerStatusSnapshot {
                phase: "Status unavailable".to_string(),
                total_cells: 0,
                completed_cells: 0,
                skipped_picks: 0,
                best_score: None,
                debug_notes: None,
            }
        }
    }

    pub fn set_debug_note<S: Into<String>>(&self, note: S) {
        if let Ok(mut data) = self.inner.lock() {
            data.debug_notes = Some(note.into());
        }
    }

    pub fn clear_debug_note(&self) {
        if let Ok(mut data) = self.inner.lock() {
            data.debug_notes = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_latest_progress() {
        let status = OptimizerStatus::new();
        assert_eq!(status.snapshot().phase, "Initializing");

        let shared = status.clone();
        shared.set_phase("Evaluating grid");
        shared.set_progress(12, 5, Some(1.5));
        shared.set_skipped_picks(2);
        shared.set_debug_note("slow ticker");

        let snapshot = status.snapshot();
        assert_eq!(snapshot.phase, "Evaluating grid");
        assert_eq!(snapshot.total_cells, 12);
        assert_eq!(snapshot.completed_cells, 5);
        assert_eq!(snapshot.skipped_picks, 2);
        assert_eq!(snapshot.best_score, Some(1.5));
        assert_eq!(snapshot.debug_notes.as_deref(), Some("slow ticker"));

        status.clear_debug_note();
        assert!(status.snapshot().debug_notes.is_none());
    }
}
