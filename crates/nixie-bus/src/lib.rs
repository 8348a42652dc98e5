//! Nixie Bus
//!
//! The transport seam of the RPC layer: a fire-and-forget pub/sub [`Bus`]
//! trait, and an in-process [`MemoryBus`] implementation used by tests and
//! single-process deployments. The protocol crate never talks to a broker
//! directly; it only sees this trait.

pub mod bus;
pub mod memory;

pub use bus::{Bus, BusError, BusMessage, BusResult};
pub use memory::MemoryBus;
