//! `vigil-runtime` – Orchestration
//!
//! Assembles the kernel, memory and middleware services into one running
//! system and drives the threads that keep it alive.
//!
//! # Modules
//!
//! - [`supervisor`] – [`Supervisor`][supervisor::Supervisor]: constructs
//!   every service from a [`SupervisorConfig`][supervisor::SupervisorConfig],
//!   wires bus subscribers, and runs tiered operations through the
//!   [`KernelGate`] with pre-operation snapshots and trust scoring.
//! - [`pulse`] – [`Pulse`][pulse::Pulse]: the heartbeat writer thread of the
//!   supervised process, with pause/resume to simulate a hang.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: global
//!   `tracing` subscriber with optional OTLP span export.

pub mod pulse;
pub mod supervisor;
pub mod telemetry;

pub use pulse::Pulse;
pub use supervisor::{
    OperationOutcome, OperationReport, OperationRequest, Supervisor, SupervisorConfig,
};
pub use telemetry::{TracerProviderGuard, init_tracing};

// Re-exported so callers holding a supervisor can name the gate without a
// direct dependency on vigil-kernel.
pub use vigil_kernel::KernelGate;
