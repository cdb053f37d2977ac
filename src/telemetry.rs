//! Span boundary events around orchestrator runs and per-batch
//! executions, emitted through `tracing`. Consumers are optional: with
//! no subscriber installed the events vanish without altering behavior.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

static NEXT_SPAN_ID: AtomicU64 = AtomicU64::new(1);

const TARGET: &str = "batchload::telemetry";

/// Handle pairing a start event with its stop event; carries the span
/// id and the monotonic start instant.
#[derive(Debug)]
pub(crate) struct SpanTimer {
    id: u64,
    started: Instant,
}

pub(crate) fn run_start(sources: usize) -> SpanTimer {
    let id = NEXT_SPAN_ID.fetch_add(1, Ordering::Relaxed);
    tracing::debug!(target: TARGET, id, system_time_ms = unix_time_ms(), sources, "source.run.start");
    SpanTimer { id, started: Instant::now() }
}

pub(crate) fn run_stop(timer: SpanTimer) {
    let duration_us = timer.started.elapsed().as_micros() as u64;
    tracing::debug!(target: TARGET, id = timer.id, duration_us, "source.run.stop");
}

pub(crate) fn batch_run_start(batch_key: &str, items: usize) -> SpanTimer {
    let id = NEXT_SPAN_ID.fetch_add(1, Ordering::Relaxed);
    tracing::debug!(
        target: TARGET,
        id,
        system_time_ms = unix_time_ms(),
        batch_key,
        items,
        "source.batch.run.start"
    );
    SpanTimer { id, started: Instant::now() }
}

pub(crate) fn batch_run_stop(timer: SpanTimer) {
    let duration_us = timer.started.elapsed().as_micros() as u64;
    tracing::debug!(target: TARGET, id = timer.id, duration_us, "source.batch.run.stop");
}

fn unix_time_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}
