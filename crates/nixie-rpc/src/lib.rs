//! Nixie RPC
//!
//! Request/response semantics over a fire-and-forget pub/sub bus. A
//! [`Service`] owns one inbound channel per `(name, worker)` pair, correlates
//! responses to outstanding calls by request id, discovers peer workers
//! through the shared liveness protocol, and spreads outbound calls across a
//! target's workers round-robin, skipping the ones the latest liveness
//! snapshot reported dead.
//!
//! The liveness protocol doubles as a throughput counter: every round carries
//! each worker's success and error counts since its previous report, and the
//! consolidated result is published for anyone to adopt.

pub mod call;
pub mod error;
pub mod health;
pub mod inbound;
pub mod liveness;
pub mod registry;
pub mod service;

pub use call::{CallError, CallOptions, CallResult, Rejection, Reply, ReplyStream};
pub use error::{RpcError, RpcResult};
pub use health::{aggregate_report, merge_reports, ServiceReport};
pub use inbound::InboundRequest;
pub use liveness::LivenessTracker;
pub use registry::WorkerRegistry;
pub use service::{Service, ServiceBuilder};
