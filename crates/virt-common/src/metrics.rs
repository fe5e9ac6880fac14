//! Metrics registry for migration observability
//!
//! OpenTelemetry instruments for:
//! - VM migration attempts (started, finished, duration)
//! - Per-disk volume migrations
//! - Reconcile errors per controller

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("virt"));

// ============================================================================
// VM Migration Metrics
// ============================================================================

/// Counter of migration attempts fanned out by the orchestrator
///
/// Labels:
/// - `type`: migrate, evict
pub static MIGRATIONS_STARTED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("virt_migrations_started_total")
        .with_description("Total number of VM migration attempts started")
        .with_unit("{migrations}")
        .build()
});

/// Counter of migration attempts that reached a terminal state
///
/// Labels:
/// - `result`: succeeded, failed
pub static MIGRATIONS_FINISHED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("virt_migrations_finished_total")
        .with_description("Total number of VM migration attempts finished")
        .with_unit("{migrations}")
        .build()
});

/// Histogram of attempt duration from start to terminal state
///
/// Labels:
/// - `result`: succeeded, failed
pub static MIGRATION_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("virt_migration_duration_seconds")
        .with_description("Duration of VM migration attempts in seconds")
        .with_unit("s")
        .build()
});

// ============================================================================
// Disk Migration Metrics
// ============================================================================

/// Counter of disk migrations that reached a terminal state
///
/// Labels:
/// - `result`: succeeded, failed
pub static DISK_MIGRATIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("virt_disk_migrations_total")
        .with_description("Total number of disk volume migrations finished")
        .with_unit("{migrations}")
        .build()
});

// ============================================================================
// Controller Metrics
// ============================================================================

/// Counter of reconcile errors
///
/// Labels:
/// - `controller`: operation, migration, disk, volume-trigger
/// - `error_type`: transient, permanent
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("virt_reconcile_errors_total")
        .with_description("Total number of reconcile errors")
        .with_unit("{errors}")
        .build()
});

/// Label values for terminal outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Attempt landed on the target
    Succeeded,
    /// Attempt rolled back
    Failed,
}

impl Outcome {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

/// Record a fanned-out VM migration attempt
pub fn record_migration_started(operation_type: &'static str) {
    MIGRATIONS_STARTED.add(1, &[KeyValue::new("type", operation_type)]);
}

/// Record a finished VM migration attempt
pub fn record_migration_finished(outcome: Outcome, duration_secs: Option<f64>) {
    let labels = [KeyValue::new("result", outcome.as_str())];
    MIGRATIONS_FINISHED.add(1, &labels);
    if let Some(secs) = duration_secs {
        MIGRATION_DURATION.record(secs, &labels);
    }
}

/// Record a finished disk migration
pub fn record_disk_migration(outcome: Outcome) {
    DISK_MIGRATIONS.add(1, &[KeyValue::new("result", outcome.as_str())]);
}

/// Record a reconcile error for a controller
pub fn record_reconcile_error(controller: &'static str, retryable: bool) {
    let error_type = if retryable { "transient" } else { "permanent" };
    RECONCILE_ERRORS.add(
        1,
        &[
            KeyValue::new("controller", controller),
            KeyValue::new("error_type", error_type),
        ],
    );
}
