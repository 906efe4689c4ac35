//! Wall-clock time derived from the runtime's monotonic clock.
//!
//! Timestamps shared with other tabs (`lastActivity`, token expiry) are wall
//! clock, while timers run on tokio's clock. `SessionClock` anchors one to the
//! other at startup so both advance together, including under a paused test
//! runtime.

use chrono::{DateTime, Duration, Utc};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    anchor_utc: DateTime<Utc>,
    anchor: Instant,
}

impl SessionClock {
    pub fn start() -> Self {
        Self::anchored_at(Utc::now())
    }

    pub fn anchored_at(anchor_utc: DateTime<Utc>) -> Self {
        Self {
            anchor_utc,
            anchor: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = Instant::now().saturating_duration_since(self.anchor);
        self.anchor_utc + Duration::from_std(elapsed).unwrap_or_else(|_| Duration::zero())
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::start()
    }
}
