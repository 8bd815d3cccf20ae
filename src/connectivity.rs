//! Connectivity signal.
//!
//! The host platform owns the real network signal; the engine only needs a
//! synchronous "is online" query plus a stream of transitions. Both come
//! from an injected [`Connectivity`] provider so tests can flip the state
//! deterministically.

use tokio::sync::watch;
use tracing::info;

/// A connectivity transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    BecameOnline,
    BecameOffline,
}

impl ConnectivityEvent {
    /// Event for a transition into `online`.
    #[must_use]
    pub fn from_online(online: bool) -> Self {
        if online {
            Self::BecameOnline
        } else {
            Self::BecameOffline
        }
    }
}

impl std::fmt::Display for ConnectivityEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BecameOnline => write!(f, "online"),
            Self::BecameOffline => write!(f, "offline"),
        }
    }
}

/// Source of the platform's network signal.
pub trait Connectivity: Send + Sync {
    /// Current state, re-read before every save/get decision.
    fn is_online(&self) -> bool;

    /// Receiver that observes every change of the online flag.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Connectivity provider driven by explicit calls.
///
/// Hosts forward their platform events into it; tests use it to simulate
/// going offline and coming back.
#[derive(Debug)]
pub struct ManualConnectivity {
    tx: watch::Sender<bool>,
}

impl ManualConnectivity {
    #[must_use]
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

    /// Set the online flag. Subscribers are only woken on an actual change.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(event = %ConnectivityEvent::from_online(online), "Connectivity changed");
        }
    }

    pub fn go_online(&self) {
        self.set_online(true);
    }

    pub fn go_offline(&self) {
        self.set_online(false);
    }
}

impl Connectivity for ManualConnectivity {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_connectivity_flag() {
        let conn = ManualConnectivity::new(false);
        assert!(!conn.is_online());

        conn.go_online();
        assert!(conn.is_online());

        conn.go_offline();
        assert!(!conn.is_online());
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions_only() {
        let conn = ManualConnectivity::new(false);
        let mut rx = conn.subscribe();

        conn.go_offline();
        assert!(!rx.has_changed().unwrap());

        conn.go_online();
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());
    }

    #[test]
    fn test_event_display() {
        assert_eq!(ConnectivityEvent::from_online(true).to_string(), "online");
        assert_eq!(ConnectivityEvent::BecameOffline.to_string(), "offline");
    }
}
