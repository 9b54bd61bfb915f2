use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

/// Lifecycle of one external resource (broker or database). Written from the
/// task that owns the resource, read from the foreground task, so the backing
/// store is atomic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Failed = 3,
}

#[derive(Debug)]
pub struct ResourceState(AtomicU8);

impl ResourceState {
    pub fn new() -> Self {
        Self(AtomicU8::new(ConnectionState::Disconnected as u8))
    }

    pub fn set(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Relaxed);
    }

    pub fn get(&self) -> ConnectionState {
        match self.0.load(Ordering::Relaxed) {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Failed,
            _ => ConnectionState::Disconnected,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.get() == ConnectionState::Connected
    }
}

impl Default for ResourceState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct BridgeStats {
    pub broker: ResourceState,
    pub database: ResourceState,
    pub messages_received: AtomicU64,
    pub points_written: AtomicU64,
    pub decode_failures: AtomicU64,
    pub write_failures: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

impl BridgeStats {
    pub fn new() -> Self {
        Self {
            broker: ResourceState::new(),
            database: ResourceState::new(),
            messages_received: AtomicU64::new(0),
            points_written: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }
}

impl Default for BridgeStats {
    fn default() -> Self {
        Self::new()
    }
}
