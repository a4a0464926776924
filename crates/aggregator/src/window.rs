//! Tumbling event-time windows.

use chrono::{DateTime, TimeZone, Utc};
use churn_core::types::WindowId;

#[derive(Debug, Clone, Copy)]
pub struct WindowAssigner {
    size_secs: i64,
}

impl WindowAssigner {
    pub fn new(size_secs: i64) -> Self {
        Self {
            size_secs: size_secs.max(1),
        }
    }

    pub fn size_secs(&self) -> i64 {
        self.size_secs
    }

    pub fn window_for(&self, time: DateTime<Utc>) -> WindowId {
        WindowId(time.timestamp().div_euclid(self.size_secs))
    }

    /// Inclusive start of the window.
    pub fn start(&self, window: WindowId) -> DateTime<Utc> {
        self.at(window.0.saturating_mul(self.size_secs))
    }

    /// Exclusive end of the window.
    pub fn end(&self, window: WindowId) -> DateTime<Utc> {
        self.at(window.0.saturating_add(1).saturating_mul(self.size_secs))
    }

    fn at(&self, secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
