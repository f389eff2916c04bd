use std::time::{SystemTime, UNIX_EPOCH};

use {
    dashmap::DashSet,
    firstcontact_channels::PeerId,
    serde::{Deserialize, Serialize},
    tracing::{debug, warn},
};

use crate::credentials::StoreError;

const LEDGER_TREE: &str = "greeted";

#[derive(Debug, Serialize, Deserialize)]
struct GreetedRecord {
    greeted_at_ms: u64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Peers that already received the greeting.
///
/// In-memory by default, so a restart greets everyone again. With
/// [`ContactLedger::persistent`] entries are mirrored to a sled tree and
/// reloaded at startup.
#[derive(Default)]
pub struct ContactLedger {
    greeted: DashSet<PeerId>,
    tree: Option<sled::Tree>,
}

impl ContactLedger {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn persistent(db: &sled::Db) -> Result<Self, StoreError> {
        let tree = db.open_tree(LEDGER_TREE)?;
        let greeted = DashSet::new();
        for entry in tree.iter() {
            let (key, value) = entry?;
            let record: GreetedRecord = postcard::from_bytes(&value)?;
            let peer = PeerId::new(String::from_utf8_lossy(&key).into_owned());
            debug!(peer = %peer, greeted_at_ms = record.greeted_at_ms, "restored ledger entry");
            greeted.insert(peer);
        }
        Ok(Self {
            greeted,
            tree: Some(tree),
        })
    }

    pub fn has_been_greeted(&self, peer: &PeerId) -> bool {
        self.greeted.contains(peer)
    }

    /// Record `peer` as greeted. Returns `true` only for the call that
    /// inserted it; concurrent callers for the same peer get `false`.
    pub fn mark_greeted(&self, peer: &PeerId) -> bool {
        if !self.greeted.insert(peer.clone()) {
            return false;
        }
        if let Some(tree) = &self.tree {
            let record = GreetedRecord {
                greeted_at_ms: now_ms(),
            };
            let stored = postcard::to_allocvec(&record)
                .map_err(StoreError::from)
                .and_then(|raw| Ok(tree.insert(peer.as_str().as_bytes(), raw)?));
            if let Err(e) = stored {
                warn!(peer = %peer, error = %e, "failed to persist ledger entry");
            }
        }
        true
    }

    /// Forget every peer.
    pub fn reset(&self) {
        self.greeted.clear();
        if let Some(tree) = &self.tree
            && let Err(e) = tree.clear()
        {
            warn!(error = %e, "failed to clear persisted ledger");
        }
    }

    pub fn len(&self) -> usize {
        self.greeted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.greeted.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_is_check_and_set() {
        let ledger = ContactLedger::in_memory();
        let peer = PeerId::from("5511999999999@s.whatsapp.net");
        assert!(!ledger.has_been_greeted(&peer));
        assert!(ledger.mark_greeted(&peer));
        assert!(!ledger.mark_greeted(&peer));
        assert!(ledger.has_been_greeted(&peer));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn reset_forgets_everyone() {
        let ledger = ContactLedger::in_memory();
        ledger.mark_greeted(&PeerId::from("1@s.whatsapp.net"));
        ledger.mark_greeted(&PeerId::from("2@s.whatsapp.net"));
        ledger.reset();
        assert!(ledger.is_empty());
        assert!(ledger.mark_greeted(&PeerId::from("1@s.whatsapp.net")));
    }

    #[test]
    fn concurrent_marks_admit_one_winner() {
        let ledger = std::sync::Arc::new(ContactLedger::in_memory());
        let peer = PeerId::from("5511999999999@s.whatsapp.net");
        let winners: usize = (0..8)
            .map(|_| {
                let ledger = std::sync::Arc::clone(&ledger);
                let peer = peer.clone();
                std::thread::spawn(move || ledger.mark_greeted(&peer))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();
        assert_eq!(winners, 1);
    }

    #[test]
    fn persistent_ledger_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let peer = PeerId::from("5511999999999@s.whatsapp.net");
        {
            let db = sled::open(dir.path()).unwrap();
            let ledger = ContactLedger::persistent(&db).unwrap();
            assert!(ledger.mark_greeted(&peer));
            db.flush().unwrap();
        }
        let db = sled::open(dir.path()).unwrap();
        let ledger = ContactLedger::persistent(&db).unwrap();
        assert!(ledger.has_been_greeted(&peer));

        ledger.reset();
        drop(ledger);
        let ledger = ContactLedger::persistent(&db).unwrap();
        assert!(ledger.is_empty());
    }
}
