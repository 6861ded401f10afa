//! Known peer fingerprints and their trust flags.
//!
//! One store exists per local account. It is persisted as a tab-separated
//! text file, one fingerprint per line:
//!
//! ```text
//! peer<TAB>account<TAB>protocol<TAB>fingerprint-hex<TAB>trust
//! ```
//!
//! where `trust` is `verified` or empty. Lines belonging to other accounts
//! are skipped on load.

use crate::crypto::FingerprintValue;
use crate::utils::{Result, StorageError};
use std::collections::BTreeMap;

/// Trust marker written for verified fingerprints
pub const TRUST_VERIFIED: &str = "verified";

/// Snapshot of one known fingerprint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    /// Peer owning the key
    pub owner_peer: String,
    /// Fingerprint of the peer's long-term key
    pub value: FingerprintValue,
    /// Explicitly trusted by the user or through SMP
    pub trusted: bool,
    /// Referenced by a live encrypted session; computed, never stored
    pub in_use: bool,
}

#[derive(Debug, Clone)]
struct Entry {
    value: FingerprintValue,
    trusted: bool,
}

/// Fingerprints known to one local account
#[derive(Debug, Clone)]
pub struct FingerprintStore {
    account_name: String,
    protocol: String,
    entries: BTreeMap<String, Vec<Entry>>,
}

impl FingerprintStore {
    /// Create an empty store for an account
    pub fn new(account_name: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            account_name: account_name.into(),
            protocol: protocol.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Record a fingerprint seen for `peer`. Returns true if it was new.
    pub fn add(&mut self, peer: &str, value: FingerprintValue) -> bool {
        let entries = self.entries.entry(peer.to_string()).or_default();
        if entries.iter().any(|entry| entry.value == value) {
            return false;
        }
        entries.push(Entry {
            value,
            trusted: false,
        });
        true
    }

    /// Look up a fingerprint of `peer`
    pub fn find(&self, peer: &str, value: &FingerprintValue) -> Option<Fingerprint> {
        self.entries
            .get(peer)?
            .iter()
            .find(|entry| &entry.value == value)
            .map(|entry| snapshot(peer, entry))
    }

    /// Whether `peer`'s fingerprint is known and trusted
    pub fn is_trusted(&self, peer: &str, value: &FingerprintValue) -> bool {
        self.find(peer, value).is_some_and(|fp| fp.trusted)
    }

    /// Change the trust flag. Returns false if the fingerprint is unknown.
    pub fn set_trusted(&mut self, peer: &str, value: &FingerprintValue, trusted: bool) -> bool {
        match self
            .entries
            .get_mut(peer)
            .and_then(|entries| entries.iter_mut().find(|entry| &entry.value == value))
        {
            Some(entry) => {
                entry.trusted = trusted;
                true
            }
            None => false,
        }
    }

    /// Delete a fingerprint. Returns false if it was unknown.
    pub fn remove(&mut self, peer: &str, value: &FingerprintValue) -> bool {
        let Some(entries) = self.entries.get_mut(peer) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| &entry.value != value);
        let removed = entries.len() != before;
        if entries.is_empty() {
            self.entries.remove(peer);
        }
        removed
    }

    /// Every known fingerprint, ordered by peer
    pub fn all(&self) -> Vec<Fingerprint> {
        self.entries
            .iter()
            .flat_map(|(peer, entries)| entries.iter().map(move |entry| snapshot(peer, entry)))
            .collect()
    }

    /// Fingerprints known for one peer
    pub fn for_peer(&self, peer: &str) -> Vec<Fingerprint> {
        self.entries
            .get(peer)
            .map(|entries| entries.iter().map(|entry| snapshot(peer, entry)).collect())
            .unwrap_or_default()
    }

    /// Number of stored fingerprints
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// True when no fingerprint is stored
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse the fingerprint file content
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Corrupt` for a line with the wrong number of
    /// fields or an invalid fingerprint
    pub fn parse(
        content: &str,
        account_name: &str,
        protocol: &str,
        path: &str,
    ) -> Result<Self> {
        let mut store = Self::new(account_name, protocol);

        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let corrupt = || StorageError::Corrupt {
                path: path.to_string(),
                line: index + 1,
            };

            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 4 || fields.len() > 5 {
                return Err(corrupt().into());
            }
            if fields[1] != account_name || fields[2] != protocol {
                continue;
            }

            let value = FingerprintValue::from_hex(fields[3]).map_err(|_| corrupt())?;
            let trusted = fields.get(4).is_some_and(|trust| !trust.is_empty());
            store.add(fields[0], value);
            store.set_trusted(fields[0], &value, trusted);
        }

        Ok(store)
    }

    /// Render the store in file format
    pub fn render(&self) -> String {
        let mut out = String::new();
        for fingerprint in self.all() {
            out.push_str(&format!(
                "{}\t{}\t{}\t{}\t{}\n",
                fingerprint.owner_peer,
                self.account_name,
                self.protocol,
                fingerprint.value.to_hex(),
                if fingerprint.trusted { TRUST_VERIFIED } else { "" }
            ));
        }
        out
    }
}

fn snapshot(peer: &str, entry: &Entry) -> Fingerprint {
    Fingerprint {
        owner_peer: peer.to_string(),
        value: entry.value,
        trusted: entry.trusted,
        in_use: false,
    }
}
