use indicatif::{ProgressBar, ProgressStyle};

/// Capability for transfer progress reporting and cooperative cancellation.
/// Implementations must tolerate calls from whatever thread the transfer
/// runs on.
pub trait SyncProgressMonitor {
    /// Sent when the transfer starts. `total_work` may be 0 when the amount
    /// is unknown.
    fn start(&self, total_work: u64);
    /// Sent when the transfer is finished or interrupted.
    fn stop(&self);
    /// Queried at every loop boundary; `true` stops the transfer.
    fn is_cancelled(&self) -> bool;
    /// Sent when a sub task (one file of a recursive transfer) begins.
    fn start_sub_task(&self, name: &str);
    /// Sent when some amount of work is done.
    fn advance(&self, work: u64);
}

/// A progress monitor that does nothing. Lets background transfers pass a
/// valid monitor without any UI; reusable across threads.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgressMonitor;

impl SyncProgressMonitor for NullProgressMonitor {
    fn start(&self, _total_work: u64) {}

    fn stop(&self) {}

    fn is_cancelled(&self) -> bool {
        false
    }

    fn start_sub_task(&self, _name: &str) {}

    fn advance(&self, _work: u64) {}
}

/// Terminal progress bar monitor.
pub struct ConsoleProgressMonitor {
    bar: ProgressBar,
}

impl ConsoleProgressMonitor {
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({percent}%)")
            .unwrap()
            .progress_chars("=>-"));
        Self { bar }
    }
}

impl Default for ConsoleProgressMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncProgressMonitor for ConsoleProgressMonitor {
    fn start(&self, total_work: u64) {
        self.bar.set_length(total_work);
        self.bar.reset();
    }

    fn stop(&self) {
        self.bar.finish_and_clear();
    }

    fn is_cancelled(&self) -> bool {
        false
    }

    fn start_sub_task(&self, name: &str) {
        self.bar.println(name);
    }

    fn advance(&self, work: u64) {
        self.bar.inc(work);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_monitor_is_inert_and_shareable() {
        let monitor = NullProgressMonitor;
        let shared: &(dyn SyncProgressMonitor + Sync) = &monitor;
        std::thread::scope(|s| {
            for _ in 0..2 {
                s.spawn(move || {
                    shared.start(100);
                    shared.start_sub_task("/tmp/x");
                    shared.advance(50);
                    assert!(!shared.is_cancelled());
                    shared.stop();
                });
            }
        });
    }
}
