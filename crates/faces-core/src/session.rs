//! Per-session identification state.
//!
//! A long-running loop (live camera, batch identify) wants to act once per
//! person, not once per frame. `Session` owns that "already seen" set
//! explicitly instead of leaving it as ambient global state.

use std::collections::HashSet;

use crate::types::Identity;

/// Tracks which identities have been observed during one session.
#[derive(Debug)]
pub struct Session {
    restklasse: Identity,
    seen: HashSet<Identity>,
}

impl Session {
    pub fn new(restklasse: Identity) -> Self {
        Self {
            restklasse,
            seen: HashSet::new(),
        }
    }

    /// Record an observation. Returns `true` only the first time a
    /// non-restklasse identity shows up; the restklasse is never recorded.
    pub fn observe(&mut self, identity: &Identity) -> bool {
        if *identity == self.restklasse {
            return false;
        }
        self.seen.insert(identity.clone())
    }

    /// Identities observed so far, in no particular order.
    pub fn seen(&self) -> impl Iterator<Item = &Identity> {
        self.seen.iter()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
