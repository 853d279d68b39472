//! Session states and the bounded sets of hashes a peer already knows

use crate::crypto::Hash256;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::fmt;

/// Connection state, in strict forward order. `Shutdown` is reachable from
/// any other state and is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    PreInit,
    Init,
    Connect,
    Handshake,
    Verify,
    Run,
    Shutdown,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::PreInit => "pre_init",
            SessionState::Init => "init",
            SessionState::Connect => "connect",
            SessionState::Handshake => "handshake",
            SessionState::Verify => "verify",
            SessionState::Run => "run",
            SessionState::Shutdown => "shutdown",
        }
    }

    /// Whether `self -> next` is a legal transition. Inbound sessions go
    /// from handshake straight to run; outbound sessions must verify.
    pub fn can_advance_to(self, next: SessionState, inbound: bool) -> bool {
        use SessionState::*;
        match (self, next) {
            (Shutdown, _) => false,
            (_, Shutdown) => true,
            (PreInit, Init) | (Init, Connect) | (Connect, Handshake) => true,
            (Handshake, Verify) | (Verify, Run) => !inbound,
            (Handshake, Run) => inbound,
            _ => false,
        }
    }

    /// States in which the activity timer runs
    pub fn tracks_activity(self) -> bool {
        matches!(
            self,
            SessionState::Handshake | SessionState::Verify | SessionState::Run
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Insertion-ordered hash set that forgets its oldest entries
#[derive(Debug, Clone)]
pub struct KnownHashes {
    set: HashSet<Hash256>,
    order: VecDeque<Hash256>,
    capacity: usize,
}

impl KnownHashes {
    pub fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns false when the hash was already known
    pub fn insert(&mut self, hash: Hash256) -> bool {
        if !self.set.insert(hash) {
            return false;
        }
        self.order.push_back(hash);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.set.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    const ALL: [SessionState; 7] = [PreInit, Init, Connect, Handshake, Verify, Run, Shutdown];

    #[test]
    fn test_only_forward_or_shutdown() {
        for inbound in [false, true] {
            for from in ALL {
                for to in ALL {
                    if from.can_advance_to(to, inbound) {
                        assert!(to > from, "{} -> {} (inbound {})", from, to, inbound);
                        assert!(
                            to == Shutdown
                                || to as u8 == from as u8 + 1
                                || (inbound && from == Handshake && to == Run),
                            "{} -> {}",
                            from,
                            to
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_shutdown_reachable_and_terminal() {
        for from in &ALL[..6] {
            assert!(from.can_advance_to(Shutdown, false));
        }
        for to in ALL {
            assert!(!Shutdown.can_advance_to(to, false));
        }
    }

    #[test]
    fn test_verify_depends_on_direction() {
        assert!(Handshake.can_advance_to(Verify, false));
        assert!(!Handshake.can_advance_to(Run, false));
        assert!(Handshake.can_advance_to(Run, true));
        assert!(!Handshake.can_advance_to(Verify, true));
    }

    #[test]
    fn test_known_hashes_bounded() {
        let mut known = KnownHashes::new(2);
        let a = Hash256::digest(b"a");
        let b = Hash256::digest(b"b");
        let c = Hash256::digest(b"c");

        assert!(known.insert(a));
        assert!(!known.insert(a));
        known.insert(b);
        known.insert(c);

        assert_eq!(known.len(), 2);
        assert!(!known.contains(&a));
        assert!(known.contains(&c));
    }
}
