//! Prometheus exposition-format rendering of [`MetricsSnapshot`].
//!
//! `quorate-core` only ever hands out a point-in-time snapshot
//! (`spec.md` §4.2 `setAggregator`); rendering it for scraping is this
//! crate's job. Mirrors the teacher's hand-rolled
//! `kimberlite_vsr::instrumentation::Metrics::export_prometheus` rather
//! than pulling in the `prometheus` registry crate — these are
//! snapshot counters, not live collectors, so there's nothing for a
//! registry to own.

use std::fmt::Write;

use quorate_core::MetricsSnapshot;

/// Renders a [`MetricsSnapshot`] as a Prometheus text-exposition-format
/// payload, suitable for an HTTP scrape endpoint's response body.
#[allow(clippy::cast_precision_loss)]
pub fn export_prometheus(snapshot: &MetricsSnapshot) -> String {
    let mut out = String::new();

    let _ = write!(
        out,
        "# HELP quorate_entries_in_flight Requests currently in the pre-processing table\n\
         # TYPE quorate_entries_in_flight gauge\n\
         quorate_entries_in_flight {}\n",
        snapshot.entries_in_flight
    );

    let _ = write!(
        out,
        "# HELP quorate_pre_processing_duration_ms_avg Average pre-processing duration\n\
         # TYPE quorate_pre_processing_duration_ms_avg gauge\n\
         quorate_pre_processing_duration_ms_avg {}\n",
        snapshot.pre_processing_duration_avg_ms
    );

    write_counter(
        &mut out,
        "quorate_client_requests_total",
        "Client requests admitted",
        snapshot.client_requests_total,
    );
    write_counter(
        &mut out,
        "quorate_pre_process_requests_sent_total",
        "PreProcessRequest messages sent to backup replicas",
        snapshot.pre_process_requests_sent_total,
    );
    write_counter(
        &mut out,
        "quorate_pre_process_replies_received_total",
        "PreProcessReply messages received",
        snapshot.pre_process_replies_received_total,
    );
    write_counter(
        &mut out,
        "quorate_completed_total",
        "Requests that reached COMPLETE",
        snapshot.completed_total,
    );
    write_counter(
        &mut out,
        "quorate_cancelled_total",
        "Requests that reached CANCEL or CANCELLED_BY_PRIMARY",
        snapshot.cancelled_total,
    );
    write_counter(
        &mut out,
        "quorate_expired_total",
        "Requests that reached EXPIRED",
        snapshot.expired_total,
    );
    write_counter(
        &mut out,
        "quorate_failed_total",
        "Requests that reached FAILED",
        snapshot.failed_total,
    );
    write_counter(
        &mut out,
        "quorate_malformed_messages_total",
        "Messages dropped for failing to parse or validate",
        snapshot.malformed_messages_total,
    );
    write_counter(
        &mut out,
        "quorate_signature_failures_total",
        "Messages dropped for failing signature verification",
        snapshot.signature_failures_total,
    );
    write_counter(
        &mut out,
        "quorate_overloaded_rejections_total",
        "Client requests rejected for exceeding the per-client cap",
        snapshot.overloaded_rejections_total,
    );
    write_counter(
        &mut out,
        "quorate_retries_issued_total",
        "Retry dispatches issued by onRetryDue",
        snapshot.retries_issued_total,
    );
    write_counter(
        &mut out,
        "quorate_incoming_buffers_allocated_total",
        "Arena slices allocated for incoming pre-process results",
        snapshot.incoming_buffers_allocated_total,
    );
    write_counter(
        &mut out,
        "quorate_incoming_buffers_freed_total",
        "Arena slices freed back to the pool",
        snapshot.incoming_buffers_freed_total,
    );

    out
}

fn write_counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = write!(
        out,
        "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"
    );
}
