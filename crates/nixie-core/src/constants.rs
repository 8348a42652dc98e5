//! Protocol constants
//!
//! All limits are explicit, named most-significant-part first, and carry
//! their unit in the name.

/// Maximum length of a service name in bytes
pub const SERVICE_NAME_LENGTH_BYTES_MAX: usize = 128;

/// Default interval between liveness rounds (30 sec)
pub const PING_DELAY_MS_DEFAULT: u64 = 30 * 1000;

/// Minimum interval between liveness rounds
pub const PING_DELAY_MS_MIN: u64 = 100;

/// Maximum interval between liveness rounds (5 min)
pub const PING_DELAY_MS_MAX: u64 = 5 * 60 * 1000;

/// Default window an originator waits for pong replies (2 sec)
pub const PING_TIMEOUT_MS_DEFAULT: u64 = 2 * 1000;

/// Default timeout for a single request/response exchange (1 sec)
pub const REQUEST_TIMEOUT_MS_DEFAULT: u64 = 1000;

/// A liveness snapshot stays valid for this many ping delays
pub const LIVENESS_VALIDITY_ROUNDS: u64 = 2;

/// Maximum size of a published envelope in bytes (1 MB)
pub const ENVELOPE_SIZE_BYTES_MAX: usize = 1024 * 1024;

// Compile-time assertions for constant validity
const _: () = {
    assert!(PING_TIMEOUT_MS_DEFAULT < PING_DELAY_MS_DEFAULT);
    assert!(PING_DELAY_MS_MIN <= PING_DELAY_MS_DEFAULT);
    assert!(PING_DELAY_MS_DEFAULT <= PING_DELAY_MS_MAX);
    assert!(LIVENESS_VALIDITY_ROUNDS >= 1);
};
