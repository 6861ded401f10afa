//! Private key generation off the message path.
//!
//! Generation runs in three phases so that only the slow middle part leaves
//! the caller's thread:
//!
//! 1. [`KeyGenerationWorker::prepare`] records what is being generated
//! 2. [`KeyGenerationWorker::calculate`] produces the key; run it on the
//!    blocking pool
//! 3. [`KeyGenerationWorker::finalize`] writes the key file and hands the key
//!    back for installation

use crate::account::AccountIdentity;
use crate::crypto::PrivateKey;
use crate::engine::storage::{self, AccountPaths};
use crate::utils::{CryptoError, Result};
use serde::{Deserialize, Serialize};

/// Record of one in-flight generation; at most one exists per account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPrivateKeyGeneration {
    /// Account the key is for
    pub account_id: String,
    /// Account name written into the key file
    pub account_name: String,
    /// Protocol written into the key file
    pub protocol: String,
}

/// Task object carrying one generation through its phases
#[derive(Debug)]
pub struct KeyGenerationWorker {
    pending: PendingPrivateKeyGeneration,
    paths: AccountPaths,
    key: Option<PrivateKey>,
}

impl KeyGenerationWorker {
    /// Allocate the generation context
    pub fn prepare(account: &AccountIdentity, paths: AccountPaths) -> Self {
        log::debug!("Preparing key generation for {}", account);
        Self {
            pending: PendingPrivateKeyGeneration {
                account_id: account.account_id.clone(),
                account_name: account.account_name.clone(),
                protocol: account.protocol.clone(),
            },
            paths,
            key: None,
        }
    }

    /// The generation this worker performs
    pub fn pending(&self) -> &PendingPrivateKeyGeneration {
        &self.pending
    }

    /// Generate the key. Blocking; keep it off async worker threads.
    #[must_use]
    pub fn calculate(mut self) -> Self {
        let started = std::time::Instant::now();
        let key = PrivateKey::generate();
        log::debug!(
            "Generated key for {} in {:?}",
            self.pending.account_id,
            started.elapsed()
        );
        self.key = Some(key);
        self
    }

    /// Persist the key and return it
    ///
    /// # Errors
    ///
    /// Fails when `calculate` was skipped or the key file cannot be written
    pub fn finalize(self) -> Result<PrivateKey> {
        let key = self.key.ok_or_else(|| CryptoError::KeyGeneration {
            reason: "finalize called before calculate".to_string(),
        })?;

        let account = AccountIdentity::new(
            self.pending.account_id.clone(),
            self.pending.account_name.clone(),
            self.pending.protocol.clone(),
        );
        storage::write_private_key(&self.paths, &account, &key)?;
        log::info!(
            "Private key for {} written, fingerprint {}",
            account,
            key.fingerprint()
        );
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_phases_write_key_file() {
        let dir = TempDir::new().unwrap();
        let account = AccountIdentity::new("acct", "alice@example.org", "jabber");
        let paths = AccountPaths::new(dir.path(), &account.account_id);

        let worker = KeyGenerationWorker::prepare(&account, paths.clone());
        assert_eq!(worker.pending().account_name, "alice@example.org");

        let key = worker.calculate().finalize().unwrap();
        let stored = storage::read_private_key(&paths).unwrap().unwrap();
        assert_eq!(stored.fingerprint(), key.fingerprint());
    }

    #[test]
    fn test_finalize_without_calculate_fails() {
        let dir = TempDir::new().unwrap();
        let account = AccountIdentity::new("acct", "alice", "jabber");
        let worker = KeyGenerationWorker::prepare(&account, AccountPaths::new(dir.path(), "acct"));
        assert!(worker.finalize().is_err());
    }
}
