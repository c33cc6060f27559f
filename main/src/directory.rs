use kaiwa_protocol::PeerId;
use std::collections::BTreeSet;
use std::sync::Mutex;
use std::sync::MutexGuard;

/// This node's belief about who is currently present in the group.
///
/// Purely advisory and eventually consistent: entries change only when
/// announcements arrive over the wire, so a peer that crashes without sending
/// a leave lingers here indefinitely. Shared between the receiver task and
/// the application task.
#[derive(Default)]
pub struct Directory {
    peers: Mutex<BTreeSet<PeerId>>,
}

impl Directory {
    /// Returns whether the peer was newly inserted.
    pub fn add(&self, peer: PeerId) -> bool {
        self.lock().insert(peer)
    }

    /// Returns whether the peer was present.
    pub fn remove(&self, peer: &PeerId) -> bool {
        self.lock().remove(peer)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.lock().contains(peer)
    }

    /// An ordered copy safe to hand to observers and to iterate while the
    /// live set keeps changing.
    pub fn snapshot(&self) -> BTreeSet<PeerId> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<PeerId>> {
        self.peers.lock().expect("Directory mutex must not be poisoned")
    }
}
