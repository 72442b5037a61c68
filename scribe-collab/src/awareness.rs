//! Ephemeral presence state: who has a cursor where.
//!
//! Awareness is decoupled from the reliable update path — latest value
//! wins, nothing is retried, and losing a record only costs a stale
//! cursor on screen. The registry tracks the most recent state per client
//! and reports which entries actually changed, so relays rebroadcast only
//! deltas.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use scribe_proto::{AwarenessDatagram, CursorState};

/// One client's presence record as carried on the relay path. The
/// datagram path carries only the cursor fields; `user` is display
/// metadata that survives via relay snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessEntry {
    pub client_id: u16,
    pub cursor: u32,
    pub anchor: u32,
    pub head: u32,
    pub user: Option<String>,
}

impl AwarenessEntry {
    pub fn new(client_id: u16, state: CursorState, user: Option<String>) -> Self {
        Self {
            client_id,
            cursor: state.cursor,
            anchor: state.anchor,
            head: state.head,
            user,
        }
    }

    pub fn state(&self) -> CursorState {
        CursorState {
            cursor: self.cursor,
            anchor: self.anchor,
            head: self.head,
        }
    }
}

impl From<AwarenessDatagram> for AwarenessEntry {
    fn from(dg: AwarenessDatagram) -> Self {
        Self::new(dg.client_id, dg.state, None)
    }
}

/// Encode an awareness delta for the relay envelope.
pub fn encode_entries(entries: &[AwarenessEntry]) -> Vec<u8> {
    bincode::serde::encode_to_vec(entries, bincode::config::standard()).unwrap_or_default()
}

/// Decode an awareness delta from a relay envelope payload.
pub fn decode_entries(bytes: &[u8]) -> Result<Vec<AwarenessEntry>, String> {
    let (entries, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| e.to_string())?;
    Ok(entries)
}

/// Latest-wins map of presence states, keyed by compact client id.
#[derive(Debug, Default)]
pub struct AwarenessRegistry {
    states: HashMap<u16, AwarenessEntry>,
}

impl AwarenessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply incoming entries; returns the ones whose value actually
    /// changed. Unchanged entries are swallowed so relays do not amplify
    /// duplicate traffic.
    pub fn apply(&mut self, entries: &[AwarenessEntry]) -> Vec<AwarenessEntry> {
        let mut changed = Vec::new();
        for entry in entries {
            let known = self.states.get(&entry.client_id);
            if known != Some(entry) {
                self.states.insert(entry.client_id, entry.clone());
                changed.push(entry.clone());
            }
        }
        changed
    }

    /// Apply a single datagram-path record.
    pub fn apply_datagram(&mut self, dg: AwarenessDatagram) -> Option<AwarenessEntry> {
        // Keep previously learned display metadata when a bare datagram
        // refreshes the cursor fields.
        let user = self
            .states
            .get(&dg.client_id)
            .and_then(|e| e.user.clone());
        let entry = AwarenessEntry::new(dg.client_id, dg.state, user);
        self.apply(std::slice::from_ref(&entry)).pop()
    }

    /// Remove a departed client's record.
    pub fn remove(&mut self, client_id: u16) -> Option<AwarenessEntry> {
        self.states.remove(&client_id)
    }

    /// All known entries, for the snapshot sent to a joining client.
    pub fn snapshot(&self) -> Vec<AwarenessEntry> {
        self.states.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn get(&self, client_id: u16) -> Option<&AwarenessEntry> {
        self.states.get(&client_id)
    }
}
