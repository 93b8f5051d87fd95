//! Progress bar driven by job events.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use manuscript_core::JobEvent;

/// Renders [`JobEvent`]s on stderr. Hidden when disabled.
pub(crate) struct JobProgress {
    bar: ProgressBar,
    retries: usize,
    failed: usize,
}

impl JobProgress {
    pub(crate) fn new(enabled: bool, total: usize, title: &str) -> Self {
        let bar = if enabled {
            let bar = ProgressBar::new(total as u64);
            bar.set_style(
                ProgressStyle::with_template("{spinner} [{bar:32}] {pos}/{len} pages {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            bar.enable_steady_tick(Duration::from_millis(120));
            bar
        } else {
            ProgressBar::hidden()
        };
        bar.set_message(title.to_string());
        Self {
            bar,
            retries: 0,
            failed: 0,
        }
    }

    pub(crate) fn apply(&mut self, event: &JobEvent) {
        match event {
            JobEvent::JobProgress { completed, total } => {
                self.bar.set_length(*total as u64);
                self.bar.set_position(*completed as u64);
            }
            JobEvent::PageRetrying { .. } => {
                self.retries += 1;
                self.refresh_message();
            }
            JobEvent::PageFailed { index, reason } => {
                self.failed += 1;
                self.bar
                    .println(format!("  page {} missing: {reason}", index + 1));
                self.refresh_message();
            }
            JobEvent::PageCompleted { .. } | JobEvent::JobCompleted { .. } => {}
        }
    }

    fn refresh_message(&self) {
        self.bar
            .set_message(format!("({} retries, {} failed)", self.retries, self.failed));
    }

    pub(crate) fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manuscript_core::PageFailure;

    #[test]
    fn test_hidden_progress_tracks_counts() {
        let mut progress = JobProgress::new(false, 4, "Codex");
        progress.apply(&JobEvent::PageRetrying { index: 1, attempt: 2 });
        progress.apply(&JobEvent::PageFailed {
            index: 2,
            reason: PageFailure::GeoBlocked { status: 403 },
        });
        progress.apply(&JobEvent::JobProgress {
            completed: 3,
            total: 4,
        });
        assert_eq!(progress.retries, 1);
        assert_eq!(progress.failed, 1);
        assert_eq!(progress.bar.position(), 3);
        progress.finish();
    }
}
