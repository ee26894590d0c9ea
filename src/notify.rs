//! User-visible notification contract.
//!
//! The core only depends on the [`Notifier`] trait; platform surfaces
//! (tray icons, shell commands) implement it elsewhere. Implementations
//! throttle themselves through [`NotificationThrottle`] so a burst of
//! errors does not spam the interactive user.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::StoreError;

/// Sink for user-visible notifications.
pub trait Notifier: Send + Sync {
    /// Show a custom notification to the interactive user.
    fn show_notification(&self, title: &str, body: &str, mount: &str);

    /// Show a network degradation notification.
    fn show_network_notification(&self, err: &StoreError);

    /// Tell the notifier how many checkout operations are live.
    fn signal_checkout(&self, active_count: usize);
}

/// Rate limiter shared by notifier implementations.
pub struct NotificationThrottle {
    interval: Duration,
    last_shown: Mutex<Option<Instant>>,
}

impl NotificationThrottle {
    /// A throttle allowing one notification per `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_shown: Mutex::new(None),
        }
    }

    /// Returns true when enough time has passed to show another
    /// notification, and stamps the attempt.
    pub fn update_last_shown(&self) -> bool {
        let mut last_shown = self.last_shown.lock();
        let now = Instant::now();
        match *last_shown {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                *last_shown = Some(now);
                true
            }
        }
    }
}

/// A notifier that swallows everything. Used headless and in tests.
#[derive(Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn show_notification(&self, _title: &str, _body: &str, _mount: &str) {}

    fn show_network_notification(&self, _err: &StoreError) {}

    fn signal_checkout(&self, _active_count: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_spaces_notifications() {
        let throttle = NotificationThrottle::new(Duration::from_secs(3600));
        assert!(throttle.update_last_shown());
        assert!(!throttle.update_last_shown());

        let instant = NotificationThrottle::new(Duration::ZERO);
        assert!(instant.update_last_shown());
        assert!(instant.update_last_shown());
    }
}
