//! Address book mapping actor addresses to their mailboxes

use crate::{Mailbox, Result, TransportError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Routes messages of type `M` to actors addressed by `K`
pub struct Registry<K, M> {
    routes: Arc<Mutex<HashMap<K, mpsc::UnboundedSender<M>>>>,
}

impl<K, M> Clone for Registry<K, M> {
    fn clone(&self) -> Self {
        Self {
            routes: self.routes.clone(),
        }
    }
}

impl<K, M> Default for Registry<K, M> {
    fn default() -> Self {
        Self {
            routes: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, M> Registry<K, M>
where
    K: Eq + Hash + Debug,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an address and return its mailbox
    ///
    /// Registering an address twice replaces the previous route; the old
    /// mailbox stops receiving new messages.
    pub fn register(&self, address: K) -> Mailbox<M> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.routes.lock().insert(address, tx).is_some() {
            tracing::debug!("Replaced existing mailbox route");
        }
        Mailbox::new(rx)
    }

    pub fn deregister(&self, address: &K) {
        self.routes.lock().remove(address);
    }

    pub fn is_registered(&self, address: &K) -> bool {
        self.routes
            .lock()
            .get(address)
            .is_some_and(|tx| !tx.is_closed())
    }

    pub fn len(&self) -> usize {
        self.routes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.lock().is_empty()
    }

    /// Fire-and-forget delivery
    pub fn send(&self, address: &K, message: M) -> Result<()> {
        let routes = self.routes.lock();
        let Some(tx) = routes.get(address) else {
            return Err(TransportError::NotRegistered(format!("{:?}", address)));
        };
        tx.send(message)
            .map_err(|_| TransportError::ChannelClosed(format!("{:?}", address)))
    }

    /// Drop routes whose mailbox has gone away
    pub fn cleanup(&self) {
        self.routes.lock().retain(|_, tx| !tx.is_closed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_preserves_order() {
        let registry: Registry<u32, String> = Registry::new();
        let mut mailbox = registry.register(1);

        for i in 0..5 {
            registry.send(&1, format!("msg-{}", i)).unwrap();
        }

        for i in 0..5 {
            assert_eq!(mailbox.recv().await.unwrap(), format!("msg-{}", i));
        }
        assert_eq!(mailbox.received(), 5);
        assert!(mailbox.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_send_to_unknown_address() {
        let registry: Registry<u32, u32> = Registry::new();
        assert_eq!(
            registry.send(&7, 1),
            Err(TransportError::NotRegistered("7".to_string()))
        );
    }

    #[tokio::test]
    async fn test_closed_mailbox() {
        let registry: Registry<u32, u32> = Registry::new();
        let mailbox = registry.register(1);
        drop(mailbox);

        assert!(!registry.is_registered(&1));
        assert!(matches!(
            registry.send(&1, 5),
            Err(TransportError::ChannelClosed(_))
        ));

        registry.cleanup();
        assert!(registry.is_empty());
    }
}
