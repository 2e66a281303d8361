use chrono::{DateTime, Utc};

/// Provides the current time.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// Generates unique, opaque identifiers.
pub trait IdGenerator: Send + Sync + 'static {
    fn next_id(&self) -> String;
}

#[derive(Copy, Clone, Debug, Default)]
pub struct SystemClock;

#[derive(Copy, Clone, Debug, Default)]
pub struct UuidGenerator;

// === impl SystemClock ===

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// === impl UuidGenerator ===

impl IdGenerator for UuidGenerator {
    fn next_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}
