//! Dual-keyed peer lookup: initiator token and remote SSRC both resolve to the
//! same session (§3 "Session registry", §4.4, §9 "Bidirectional registry without
//! cycles").
//!
//! Peers live in an arena (`Vec<Option<Peer>>`); both maps store the arena index
//! rather than a peer reference, so there is no ownership cycle and no interior
//! mutability needed to keep two maps pointing at one object.
use std::collections::HashMap;

use log::{error, warn};

use crate::error::RegistryError;
use crate::peer::Peer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(usize);

#[derive(Default)]
pub struct SessionRegistry {
    slots: Vec<Option<Peer>>,
    free: Vec<usize>,
    by_initiator: HashMap<u32, PeerId>,
    by_ssrc: HashMap<u32, PeerId>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a newly created peer under its initiator token. Called on
    /// outbound invite and on inbound `IN` alike (§3 "Lifecycles").
    pub fn insert_initiator(&mut self, peer: Peer) -> PeerId {
        let initiator_token = peer.initiator_token;
        let id = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(peer);
                PeerId(index)
            }
            None => {
                self.slots.push(Some(peer));
                PeerId(self.slots.len() - 1)
            }
        };
        self.by_initiator.insert(initiator_token, id);
        id
    }

    /// Records the peer's remote SSRC, learned from the `OK` reply. Idempotent
    /// for repeats of the same SSRC; a rebind attempt with a *different* SSRC for
    /// the same `initiator_token` is a protocol violation and is rejected without
    /// disturbing the existing binding (§4.4 invariant).
    ///
    /// A collision where a *different* peer already owns `ssrc` in `by_ssrc` is
    /// not an error: the new peer silently takes over that key (§9 Open Question:
    /// the reference implementation overwrites rather than rejecting).
    pub fn bind_ssrc(&mut self, initiator_token: u32, ssrc: u32) -> Result<(), RegistryError> {
        let Some(&id) = self.by_initiator.get(&initiator_token) else {
            warn!("bind_ssrc: no peer registered for initiator {initiator_token:#x}");
            return Ok(());
        };
        let peer = self.slots[id.0].as_mut().expect("by_initiator points at a live slot");

        if let Some(existing) = peer.remote_ssrc {
            if existing == ssrc {
                return Ok(());
            }
            error!("ssrc rebind rejected for initiator {initiator_token:#x}: existing={existing:#x} attempted={ssrc:#x}");
            return Err(RegistryError::SsrcMismatch { initiator_token, existing, attempted: ssrc });
        }

        peer.remote_ssrc = Some(ssrc);
        self.by_ssrc.insert(ssrc, id);
        Ok(())
    }

    pub fn lookup_by_initiator(&self, initiator_token: u32) -> Option<&Peer> {
        let id = self.by_initiator.get(&initiator_token)?;
        self.slots[id.0].as_ref()
    }

    pub fn lookup_by_initiator_mut(&mut self, initiator_token: u32) -> Option<&mut Peer> {
        let id = *self.by_initiator.get(&initiator_token)?;
        self.slots[id.0].as_mut()
    }

    pub fn lookup_by_ssrc(&self, ssrc: u32) -> Option<&Peer> {
        let id = self.by_ssrc.get(&ssrc)?;
        self.slots[id.0].as_ref()
    }

    pub fn lookup_by_ssrc_mut(&mut self, ssrc: u32) -> Option<&mut Peer> {
        let id = *self.by_ssrc.get(&ssrc)?;
        self.slots[id.0].as_mut()
    }

    /// Removes a peer from both maps atomically, by its initiator token (§4.3
    /// teardown, §8 scenario "Teardown").
    pub fn remove(&mut self, initiator_token: u32) -> Option<Peer> {
        let id = self.by_initiator.remove(&initiator_token)?;
        let peer = self.slots[id.0].take()?;
        if let Some(ssrc) = peer.remote_ssrc {
            // Only drop the by_ssrc entry if it still points at this peer: a
            // later collision (see bind_ssrc) may have handed that key to someone else.
            if self.by_ssrc.get(&ssrc) == Some(&id) {
                self.by_ssrc.remove(&ssrc);
            }
        }
        self.free.push(id.0);
        Some(peer)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.slots.iter().filter_map(|slot| slot.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.slots.iter_mut().filter_map(|slot| slot.as_mut())
    }
}
