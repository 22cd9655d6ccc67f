use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::protocol;

/// The sending half of a participant's mailbox plus the immutable connection
/// address used when formatting lines about them.
///
/// The matching receiver is owned exclusively by that participant's delivery
/// task; the mailbox closes once every handle (registry entry and session)
/// has been dropped.
#[derive(Clone)]
pub struct ParticipantHandle {
    addr: SocketAddr,
    mailbox: mpsc::UnboundedSender<String>,
}

impl ParticipantHandle {
    pub fn new(addr: SocketAddr, mailbox: mpsc::UnboundedSender<String>) -> Self {
        Self { addr, mailbox }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queues one line for delivery. A closed mailbox means the participant
    /// is already being torn down, so the line is dropped silently.
    pub fn deliver(&self, line: String) {
        if self.mailbox.send(line).is_err() {
            debug!(addr = %self.addr, "mailbox closed, dropping line");
        }
    }
}

/// Rejected registration: the requested name is already online.
#[derive(Debug)]
pub enum RegisterError {
    NameTaken,
}

#[derive(Debug)]
pub enum RenameError {
    /// The requested name is already online; nothing was changed.
    NameTaken,
    /// The entry to rename has already been removed (the connection is being
    /// torn down); nothing was changed.
    Gone,
}

/// Shared hub: the participant registry plus the broadcast queue feeding the
/// fan-out dispatcher.
///
/// The registry is the only state shared across connection tasks. Every
/// operation takes the mutex for the duration of one map operation and never
/// across I/O; delivery ordering is carried by the queues themselves.
pub struct Hub {
    registry: Arc<Mutex<HashMap<String, ParticipantHandle>>>,
    broadcasts: mpsc::UnboundedSender<String>,
}

impl Hub {
    /// Creates the hub and spawns its broadcast dispatcher task. The
    /// dispatcher runs until the hub (and with it the queue's send side) is
    /// dropped.
    pub fn spawn() -> Arc<Self> {
        let registry = Arc::new(Mutex::new(HashMap::new()));
        let (broadcasts, queue) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(Arc::clone(&registry), queue));
        Arc::new(Self {
            registry,
            broadcasts,
        })
    }

    /// Formats a public line and enqueues it for fan-out. Never blocks the
    /// caller: the queue is unbounded and drained by the dispatcher.
    pub fn publish(&self, name: &str, addr: SocketAddr, text: &str) {
        let line = protocol::broadcast_line(name, addr, text);
        if self.broadcasts.send(line).is_err() {
            debug!("broadcast queue closed, dropping message");
        }
    }

    /// Inserts a participant under `name`, rejecting a name that is already
    /// online.
    pub async fn register(
        &self,
        name: &str,
        handle: ParticipantHandle,
    ) -> Result<(), RegisterError> {
        let mut registry = self.registry.lock().await;
        if registry.contains_key(name) {
            return Err(RegisterError::NameTaken);
        }
        registry.insert(name.to_string(), handle);
        Ok(())
    }

    /// Removes the entry if present. Idempotent, so the read path and the
    /// idle watchdog may both attempt it for the same connection.
    pub async fn unregister(&self, name: &str) -> Option<ParticipantHandle> {
        self.registry.lock().await.remove(name)
    }

    /// Atomically moves the entry from `current` to `new_name`. On any error
    /// the registry is left untouched.
    pub async fn rename(&self, current: &str, new_name: &str) -> Result<(), RenameError> {
        let mut registry = self.registry.lock().await;
        if registry.contains_key(new_name) {
            return Err(RenameError::NameTaken);
        }
        match registry.remove(current) {
            Some(handle) => {
                registry.insert(new_name.to_string(), handle);
                Ok(())
            }
            None => Err(RenameError::Gone),
        }
    }

    pub async fn lookup(&self, name: &str) -> Option<ParticipantHandle> {
        self.registry.lock().await.get(name).cloned()
    }

    /// Consistent point-in-time view of everyone online, used for broadcast
    /// fan-out and the `who` listing.
    pub async fn snapshot(&self) -> Vec<(String, ParticipantHandle)> {
        self.registry
            .lock()
            .await
            .iter()
            .map(|(name, handle)| (name.clone(), handle.clone()))
            .collect()
    }
}

/// Single consumer of the broadcast queue: delivers each line to every
/// mailbox in a fresh registry snapshot, so all recipients observe broadcasts
/// in the same global order.
async fn dispatch(
    registry: Arc<Mutex<HashMap<String, ParticipantHandle>>>,
    mut queue: mpsc::UnboundedReceiver<String>,
) {
    while let Some(line) = queue.recv().await {
        let recipients: Vec<ParticipantHandle> =
            registry.lock().await.values().cloned().collect();
        for handle in recipients {
            handle.deliver(line.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    fn test_addr(port: u16) -> SocketAddr {
        ([127, 0, 0, 1], port).into()
    }

    fn test_handle(port: u16) -> (ParticipantHandle, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ParticipantHandle::new(test_addr(port), tx), rx)
    }

    async fn recv_line(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for a mailbox line")
            .expect("mailbox closed unexpectedly")
    }

    #[tokio::test]
    async fn registry_rejects_duplicate_names() {
        let hub = Hub::spawn();
        let (alice, _alice_rx) = test_handle(1);
        let (imposter, _imposter_rx) = test_handle(2);

        hub.register("alice", alice)
            .await
            .expect("first registration should pass");
        let result = hub.register("alice", imposter).await;
        assert!(matches!(result, Err(RegisterError::NameTaken)));
    }

    #[tokio::test]
    async fn rename_collision_leaves_the_registry_unchanged() {
        let hub = Hub::spawn();
        let (alice, _alice_rx) = test_handle(1);
        let (bob, _bob_rx) = test_handle(2);
        hub.register("alice", alice).await.expect("register alice");
        hub.register("bob", bob).await.expect("register bob");

        let result = hub.rename("bob", "alice").await;
        assert!(matches!(result, Err(RenameError::NameTaken)));

        let bob = hub.lookup("bob").await.expect("bob keeps his old name");
        assert_eq!(bob.addr(), test_addr(2));
        let alice = hub.lookup("alice").await.expect("alice is untouched");
        assert_eq!(alice.addr(), test_addr(1));
    }

    #[tokio::test]
    async fn rename_moves_the_entry_atomically() {
        let hub = Hub::spawn();
        let (bob, _bob_rx) = test_handle(2);
        hub.register("bob", bob).await.expect("register bob");

        hub.rename("bob", "carol").await.expect("rename bob");

        assert!(hub.lookup("bob").await.is_none());
        let carol = hub.lookup("carol").await.expect("carol is registered");
        assert_eq!(carol.addr(), test_addr(2));
    }

    #[tokio::test]
    async fn rename_of_a_removed_entry_reports_gone() {
        let hub = Hub::spawn();
        let result = hub.rename("nobody", "somebody").await;
        assert!(matches!(result, Err(RenameError::Gone)));
        assert!(hub.lookup("somebody").await.is_none());
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let hub = Hub::spawn();
        let (alice, _alice_rx) = test_handle(1);
        hub.register("alice", alice).await.expect("register alice");

        assert!(hub.unregister("alice").await.is_some());
        assert!(hub.unregister("alice").await.is_none());
    }

    #[tokio::test]
    async fn broadcasts_fan_out_to_every_mailbox() {
        let hub = Hub::spawn();
        let (alice, mut alice_rx) = test_handle(1);
        let (bob, mut bob_rx) = test_handle(2);
        hub.register("alice", alice).await.expect("register alice");
        hub.register("bob", bob).await.expect("register bob");

        hub.publish("alice", test_addr(1), "hello");

        let expected = "[127.0.0.1:1]alice:hello";
        assert_eq!(recv_line(&mut alice_rx).await, expected);
        assert_eq!(recv_line(&mut bob_rx).await, expected);
    }

    #[tokio::test]
    async fn late_joiner_only_sees_later_broadcasts() {
        let hub = Hub::spawn();
        let (alice, mut alice_rx) = test_handle(1);
        hub.register("alice", alice).await.expect("register alice");

        hub.publish("alice", test_addr(1), "first");
        // Wait for the fan-out so the late joiner cannot be in the snapshot.
        assert_eq!(recv_line(&mut alice_rx).await, "[127.0.0.1:1]alice:first");

        let (carol, mut carol_rx) = test_handle(3);
        hub.register("carol", carol).await.expect("register carol");
        hub.publish("alice", test_addr(1), "second");

        assert_eq!(recv_line(&mut carol_rx).await, "[127.0.0.1:1]alice:second");
    }

    #[tokio::test]
    async fn closed_mailboxes_are_skipped_silently() {
        let hub = Hub::spawn();
        let (alice, mut alice_rx) = test_handle(1);
        let (bob, bob_rx) = test_handle(2);
        hub.register("alice", alice).await.expect("register alice");
        hub.register("bob", bob).await.expect("register bob");

        // Bob's delivery task is gone but his registry entry still lingers.
        drop(bob_rx);
        hub.publish("alice", test_addr(1), "still here");

        assert_eq!(
            recv_line(&mut alice_rx).await,
            "[127.0.0.1:1]alice:still here"
        );
    }

    #[tokio::test]
    async fn snapshot_reflects_everyone_online() {
        let hub = Hub::spawn();
        let (alice, _alice_rx) = test_handle(1);
        let (bob, _bob_rx) = test_handle(2);
        hub.register("alice", alice).await.expect("register alice");
        hub.register("bob", bob).await.expect("register bob");

        let mut names: Vec<String> = hub
            .snapshot()
            .await
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["alice".to_string(), "bob".to_string()]);
    }
}
