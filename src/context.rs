//! Explicitly scoped processing context for one stage run.

use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};

pub fn format_elapsed(elapsed: Duration) -> String {
    let total_secs = elapsed.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    let millis = elapsed.subsec_millis();
    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}.{:03}s", seconds, millis)
    }
}

/// Acquired when a stage starts and released when it is dropped. The
/// success path calls [`StageContext::finish`]; every other exit path
/// (early `?` return, panic unwinding) goes through `Drop`, which abandons
/// the progress bar and logs that the stage did not complete.
pub struct StageContext {
    name: String,
    started: Instant,
    progress: ProgressBar,
    finished: bool,
}

impl StageContext {
    pub fn acquire(name: impl Into<String>, total: u64, show_progress: bool) -> Self {
        let name = name.into();
        info!("Starting stage '{}'", name);
        let progress = if show_progress {
            let bar = ProgressBar::new(total);
            match ProgressStyle::default_bar()
                .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            {
                Ok(style) => bar.set_style(style.progress_chars("=> ")),
                Err(e) => warn!("Invalid progress bar template: {}", e),
            }
            bar
        } else {
            ProgressBar::hidden()
        };
        Self {
            name,
            started: Instant::now(),
            progress,
            finished: false,
        }
    }

    pub fn progress(&self) -> &ProgressBar {
        &self.progress
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn finish(mut self, message: impl Into<String>) {
        let message = message.into();
        self.progress.finish_with_message(message.clone());
        info!(
            "Stage '{}' finished in {}: {}",
            self.name,
            format_elapsed(self.elapsed()),
            message
        );
        self.finished = true;
    }
}

impl Drop for StageContext {
    fn drop(&mut self) {
        if !self.finished {
            self.progress.abandon_with_message("aborted");
            warn!(
                "Stage '{}' released after {} without completing",
                self.name,
                format_elapsed(self.elapsed())
            );
        }
    }
}
