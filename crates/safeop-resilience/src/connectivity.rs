//! Shared online/offline flag
//!
//! The embedding environment reports connectivity changes through
//! [`Connectivity::set_online`]; everything else reads the flag or subscribes
//! to transitions.

use tokio::sync::watch;

/// Process-wide connectivity state backed by a watch channel
#[derive(Debug)]
pub struct Connectivity {
    tx: watch::Sender<bool>,
}

impl Connectivity {
    /// Create with an initial state
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

    /// Create in the online state
    pub fn online() -> Self {
        Self::new(true)
    }

    /// Current state
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Records a connectivity change.
    ///
    /// Subscribers are only woken when the state actually changes.
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
            if online {
                tracing::info!("Network connection restored");
            } else {
                tracing::warn!("Network connection lost");
            }
        }
    }

    /// Subscribes to connectivity transitions
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::online()
    }
}
