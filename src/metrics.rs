//! Channel and worker metrics.

use metriken::{metric, Counter, Gauge};

#[metric(
    name = "channels_open",
    description = "number of channels currently open"
)]
pub static CHANNELS_OPEN: Gauge = Gauge::new();

#[metric(
    name = "channels_closed",
    description = "total number of channels closed"
)]
pub static CHANNELS_CLOSED: Counter = Counter::new();

#[metric(
    name = "reads_completed",
    description = "read operations driven to completion"
)]
pub static READS_COMPLETED: Counter = Counter::new();

#[metric(
    name = "writes_completed",
    description = "write operations driven to completion"
)]
pub static WRITES_COMPLETED: Counter = Counter::new();

#[metric(name = "bytes_read", description = "bytes read from sockets")]
pub static BYTES_READ: Counter = Counter::new();

#[metric(name = "bytes_written", description = "bytes written to sockets")]
pub static BYTES_WRITTEN: Counter = Counter::new();

#[metric(
    name = "reads_deferred",
    description = "reads that armed readiness interest instead of completing inline"
)]
pub static DEFERRED_READS: Counter = Counter::new();

#[metric(
    name = "writes_deferred",
    description = "writes that armed readiness interest instead of completing inline"
)]
pub static DEFERRED_WRITES: Counter = Counter::new();

#[metric(
    name = "recursion_deferrals",
    description = "operations pushed to the deferred path by the invoker depth bound"
)]
pub static RECURSION_DEFERRALS: Counter = Counter::new();

#[metric(
    name = "registrations",
    description = "interest registrations applied on worker pollers"
)]
pub static REGISTRATIONS: Counter = Counter::new();
