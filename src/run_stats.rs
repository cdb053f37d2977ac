/// Aggregate counters for a loader's lifetime of `run` calls, reported
/// through `tracing` when the loader is dropped.
#[derive(Debug, Default)]
pub(crate) struct RunStats {
    /// Number of `run` calls that had pending work.
    runs: u32,
    /// Total sources driven across all runs.
    sources_run: u32,
    /// Sources replaced by a failure sentinel.
    source_failures: u32,
    /// The max number of sources driven in a single run.
    max_sources_per_run: u32,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_run(&mut self, sources: usize) {
        let sources = sources as u32;
        self.runs += 1;
        self.sources_run += sources;
        if sources > self.max_sources_per_run {
            self.max_sources_per_run = sources;
        }
    }

    pub fn record_source_failure(&mut self) {
        self.source_failures += 1;
    }
}

impl Drop for RunStats {
    fn drop(&mut self) {
        tracing::debug!(run_stats = ?self);
    }
}
