//! Metric instruments for the scheduler.
//!
//! All instruments come from the `"poolsched"` meter of the globally
//! registered `MeterProvider` (a no-op until telemetry is initialized).

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("poolsched")
}

/// Counter: jobs claimed by this worker.
/// Labels: `kind`.
pub fn jobs_created() -> Counter<u64> {
    meter()
        .u64_counter("poolsched.jobs.created")
        .with_description("Number of jobs created")
        .build()
}

/// Counter: jobs archived.
/// Labels: `outcome` ("success" | "error").
pub fn jobs_archived() -> Counter<u64> {
    meter()
        .u64_counter("poolsched.jobs.archived")
        .with_description("Number of jobs archived")
        .build()
}

/// Counter: intentions archived.
/// Labels: `kind`, `outcome`.
pub fn intentions_archived() -> Counter<u64> {
    meter()
        .u64_counter("poolsched.intentions.archived")
        .with_description("Number of intentions archived")
        .build()
}

/// Counter: runs that returned incomplete.
/// Labels: `kind`.
pub fn intentions_incomplete() -> Counter<u64> {
    meter()
        .u64_counter("poolsched.intentions.incomplete")
        .with_description("Runs that made partial progress")
        .build()
}

/// Counter: intentions lost to another worker between selection and claim.
/// Labels: `kind`.
pub fn claim_conflicts() -> Counter<u64> {
    meter()
        .u64_counter("poolsched.claims.conflicts")
        .with_description("Intentions claimed by another worker first")
        .build()
}

/// Counter: jobs abandoned because stale recovery dissolved their claim.
/// Labels: `kind`.
pub fn claims_lost() -> Counter<u64> {
    meter()
        .u64_counter("poolsched.claims.lost")
        .with_description("Jobs that lost their claim while running")
        .build()
}

/// Counter: full priority passes that found no work.
pub fn worker_idle() -> Counter<u64> {
    meter()
        .u64_counter("poolsched.worker.idle")
        .with_description("Scans that found no ready work")
        .build()
}

/// Histogram: handler run duration in milliseconds.
/// Labels: `kind`.
pub fn run_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("poolsched.run.duration_ms")
        .with_description("Handler run duration in milliseconds")
        .with_unit("ms")
        .build()
}
