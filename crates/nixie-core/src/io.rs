//! I/O abstraction layer
//!
//! All time and randomness used by the RPC layer goes through these traits,
//! so tests can drive timers and identifier generation deterministically.
//! The same protocol code runs against the wall clock in production and a
//! seeded source in tests; only the providers differ.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Time provider abstraction
///
/// All code that needs the current time or a sleep MUST use this trait.
/// Never call `std::time::SystemTime::now()` directly from protocol code.
#[async_trait]
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time in milliseconds since epoch
    fn now_ms(&self) -> u64;

    /// Sleep for the specified duration
    async fn sleep_ms(&self, ms: u64);
}

/// Production clock backed by the system clock and tokio timers
#[derive(Debug, Clone, Default)]
pub struct WallClock;

impl WallClock {
    /// Create a new wall clock
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Clock for WallClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    async fn sleep_ms(&self, ms: u64) {
        tokio::time::sleep(tokio::time::Duration::from_millis(ms)).await;
    }
}

/// Random number generator abstraction
///
/// Request and ping identifiers come from here. Never call a thread-local
/// RNG directly from protocol code.
pub trait Rng: Send + Sync + std::fmt::Debug {
    /// Generate a random u64
    fn next_u64(&self) -> u64;

    /// Generate a random UUID v4 string
    fn gen_uuid(&self) -> String {
        let high = self.next_u64();
        let low = self.next_u64();

        let bytes = [
            ((high >> 56) & 0xff) as u8,
            ((high >> 48) & 0xff) as u8,
            ((high >> 40) & 0xff) as u8,
            ((high >> 32) & 0xff) as u8,
            ((high >> 24) & 0xff) as u8,
            ((high >> 16) & 0xff) as u8,
            (((high >> 8) & 0x0f) | 0x40) as u8, // version 4
            (high & 0xff) as u8,
            (((low >> 56) & 0x3f) | 0x80) as u8, // variant 1
            ((low >> 48) & 0xff) as u8,
            ((low >> 40) & 0xff) as u8,
            ((low >> 32) & 0xff) as u8,
            ((low >> 24) & 0xff) as u8,
            ((low >> 16) & 0xff) as u8,
            ((low >> 8) & 0xff) as u8,
            (low & 0xff) as u8,
        ];

        format!(
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            bytes[0], bytes[1], bytes[2], bytes[3],
            bytes[4], bytes[5],
            bytes[6], bytes[7],
            bytes[8], bytes[9],
            bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15]
        )
    }
}

/// Lock-free xorshift64* generator
///
/// Not cryptographically secure; identifiers only need uniqueness, not
/// unpredictability.
#[derive(Debug)]
pub struct SeededRng {
    state: AtomicU64,
}

impl Default for SeededRng {
    fn default() -> Self {
        Self::new()
    }
}

impl SeededRng {
    /// Create a generator seeded from system time
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);

        Self {
            state: AtomicU64::new(seed | 1),
        }
    }

    /// Create with a specific seed (for testing)
    pub fn with_seed(seed: u64) -> Self {
        Self {
            state: AtomicU64::new(seed | 1),
        }
    }
}

impl Rng for SeededRng {
    fn next_u64(&self) -> u64 {
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            let mut x = state;
            x ^= x >> 12;
            x ^= x << 25;
            x ^= x >> 27;

            match self
                .state
                .compare_exchange_weak(state, x, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return x.wrapping_mul(0x2545F4914F6CDD1D),
                Err(s) => state = s,
            }
        }
    }
}

/// Bundle of all I/O providers
///
/// Pass this through the application instead of individual providers.
#[derive(Clone)]
pub struct IoContext {
    /// Time provider
    pub time: Arc<dyn Clock>,
    /// RNG provider
    pub rng: Arc<dyn Rng>,
}

impl std::fmt::Debug for IoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoContext")
            .field("time", &self.time)
            .field("rng", &self.rng)
            .finish()
    }
}

impl Default for IoContext {
    fn default() -> Self {
        Self::production()
    }
}

impl IoContext {
    /// Create production I/O context with the wall clock and a fresh RNG
    pub fn production() -> Self {
        Self {
            time: Arc::new(WallClock::new()),
            rng: Arc::new(SeededRng::new()),
        }
    }

    /// Create I/O context with custom providers
    pub fn new(time: Arc<dyn Clock>, rng: Arc<dyn Rng>) -> Self {
        Self { time, rng }
    }

    /// Current time in milliseconds
    pub fn now_ms(&self) -> u64 {
        self.time.now_ms()
    }

    /// Sleep for specified duration
    pub async fn sleep_ms(&self, ms: u64) {
        self.time.sleep_ms(ms).await;
    }

    /// Generate a UUID
    pub fn gen_uuid(&self) -> String {
        self.rng.gen_uuid()
    }
}
