use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::debug;

/// Whole seconds left until `expires_at`, clamped at zero.
pub fn remaining_seconds(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    u64::try_from(expires_at.signed_duration_since(now).num_seconds()).unwrap_or(0)
}

/// Periodic task turning a vault-assigned expiry into a decrementing
/// seconds value.
///
/// The remainder is measured once against the wall clock and then anchored
/// to the runtime's monotonic clock, so successive values never increase.
/// `on_tick` receives every non-zero value (the first one immediately);
/// `on_expired` runs once when the remainder reaches zero, after which the
/// task ends. Dropping or cancelling the handle stops the task.
pub struct Countdown {
    handle: JoinHandle<()>,
}

impl Countdown {
    pub fn start<T, E>(expires_at: DateTime<Utc>, tick: Duration, mut on_tick: T, on_expired: E) -> Self
    where
        T: FnMut(u64) + Send + 'static,
        E: FnOnce() + Send + 'static,
    {
        let initial = remaining_seconds(expires_at, Utc::now());
        let deadline = Instant::now() + Duration::from_secs(initial);

        let handle = tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + tick, tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                let remaining = deadline.saturating_duration_since(Instant::now()).as_secs();
                if remaining == 0 {
                    debug!("Countdown elapsed");
                    on_expired();
                    return;
                }
                on_tick(remaining);
                interval.tick().await;
            }
        });

        Self { handle }
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for Countdown {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
