//! Nixie Core
//!
//! Core types for the nixie inter-service RPC layer: service identities and
//! channel naming, the wire envelope, configuration, error types, and the
//! I/O abstractions (clock and RNG) that keep timers and identifiers
//! injectable for tests.
//!
//! The RPC protocol itself lives in `nixie-rpc`; the transport seam lives in
//! `nixie-bus`. This crate holds everything both of them agree on.

pub mod config;
pub mod constants;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod io;
pub mod telemetry;

pub use config::RpcConfig;
pub use constants::*;
pub use envelope::{
    Body, Envelope, Fields, Incoming, LivenessMap, PingId, PlainMessage, RequestId, Response,
    WorkerReport,
};
pub use error::{Error, Result};
pub use identity::{ServiceIdentity, ServiceName, WorkerId, HEALTHCHECK_CHANNEL};
pub use io::{Clock, IoContext, Rng, SeededRng, WallClock};
pub use telemetry::{init_telemetry, TelemetryConfig};
