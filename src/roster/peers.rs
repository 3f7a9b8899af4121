//! Roster
//!
//! Menge der aktuell bekannten Peers. Wird ausschließlich durch
//! login/logout/share-clients Benachrichtigungen des Relays verändert.

use crate::identity::Identity;
use std::collections::BTreeMap;

// ============================================================================
// PEER ENTRY
// ============================================================================

/// Metadaten zu einem Peer (derzeit nur Präsenz)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerEntry {}

// ============================================================================
// ROSTER
// ============================================================================

/// Bekannte Peers, ohne die eigene Identität
#[derive(Debug, Clone)]
pub struct Roster {
    local: Identity,
    peers: BTreeMap<Identity, PeerEntry>,
}

impl Roster {
    pub fn new(local: Identity) -> Self {
        Self {
            local,
            peers: BTreeMap::new(),
        }
    }

    /// Fügt einen Peer hinzu (idempotent)
    ///
    /// Gibt `true` zurück wenn sich der Roster geändert hat.
    pub fn on_login(&mut self, identity: &Identity) -> bool {
        if *identity == self.local || self.peers.contains_key(identity) {
            return false;
        }
        tracing::debug!("Peer logged in: {}", identity);
        self.peers.insert(identity.clone(), PeerEntry::default());
        true
    }

    /// Entfernt einen Peer (idempotent, fehlend ist kein Fehler)
    pub fn on_logout(&mut self, identity: &Identity) -> bool {
        let removed = self.peers.remove(identity).is_some();
        if removed {
            tracing::debug!("Peer logged out: {}", identity);
        }
        removed
    }

    /// Ersetzt den Roster durch die vom Relay geteilte Client-Liste
    ///
    /// Ungültige (leere) Einträge und die eigene Identität werden ignoriert.
    pub fn replace<I, S>(&mut self, clients: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let next: BTreeMap<Identity, PeerEntry> = clients
            .into_iter()
            .filter_map(|client| Identity::new(client).ok())
            .filter(|identity| *identity != self.local)
            .map(|identity| {
                let entry = self.peers.get(&identity).cloned().unwrap_or_default();
                (identity, entry)
            })
            .collect();

        let changed = next.keys().ne(self.peers.keys());
        self.peers = next;
        changed
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.peers.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Sortierter Snapshot für die Darstellung
    pub fn snapshot(&self) -> Vec<Identity> {
        self.peers.keys().cloned().collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> Identity {
        Identity::new(s).unwrap()
    }

    #[test]
    fn test_login_logout() {
        let mut roster = Roster::new(id("me"));

        assert!(roster.on_login(&id("x")));
        assert!(roster.contains(&id("x")));

        assert!(roster.on_logout(&id("x")));
        assert!(!roster.contains(&id("x")));
        assert!(roster.is_empty());
    }

    #[test]
    fn test_idempotent() {
        let mut roster = Roster::new(id("me"));

        assert!(roster.on_login(&id("x")));
        assert!(!roster.on_login(&id("x")));
        assert_eq!(roster.len(), 1);

        assert!(roster.on_logout(&id("x")));
        assert!(!roster.on_logout(&id("x")));
        assert!(!roster.on_logout(&id("never-seen")));
    }

    #[test]
    fn test_local_identity_never_added() {
        let mut roster = Roster::new(id("me"));

        assert!(!roster.on_login(&id("me")));
        roster.replace(vec!["me", "a"]);

        assert_eq!(roster.snapshot(), vec![id("a")]);
    }

    #[test]
    fn test_replace_with_shared_clients() {
        let mut roster = Roster::new(id("me"));
        roster.on_login(&id("old"));

        assert!(roster.replace(vec!["c", "", "b", "me"]));
        assert_eq!(roster.snapshot(), vec![id("b"), id("c")]);

        // Gleiche Liste nochmal -> keine Änderung
        assert!(!roster.replace(vec!["b", "c"]));
    }
}
