//! Durable per-account storage.
//!
//! Every account owns a directory `<data_dir>/<account_id>/` holding:
//!
//! - `otr.private_key`: JSON with the account name, protocol and the base64
//!   encoded secret key
//! - `otr.fingerprints`: the fingerprint table, see [`FingerprintStore`]
//! - `otr.instance_tags`: `account<TAB>protocol<TAB>tag-hex`
//!
//! Files are replaced atomically: content goes to a uniquely named temporary
//! file next to the target which is then renamed over the old one. The
//! temporary file is created readable by the owner only, so the private key
//! never exists on disk with wider permissions.

use crate::account::AccountIdentity;
use crate::crypto::PrivateKey;
use crate::engine::{FingerprintStore, InstanceTag};
use crate::utils::{Result, StorageError};
use base64::{engine::general_purpose, Engine};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Private key file name
pub const PRIVATE_KEY_FILE: &str = "otr.private_key";

/// Fingerprint file name
pub const FINGERPRINTS_FILE: &str = "otr.fingerprints";

/// Instance tag file name
pub const INSTANCE_TAGS_FILE: &str = "otr.instance_tags";

/// Storage locations of one account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountPaths {
    dir: PathBuf,
}

impl AccountPaths {
    /// Paths for `account_id` below `data_dir`
    pub fn new(data_dir: &Path, account_id: &str) -> Self {
        Self {
            dir: data_dir.join(sanitize(account_id)),
        }
    }

    /// The account directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The private key file
    pub fn private_key(&self) -> PathBuf {
        self.dir.join(PRIVATE_KEY_FILE)
    }

    /// The fingerprint file
    pub fn fingerprints(&self) -> PathBuf {
        self.dir.join(FINGERPRINTS_FILE)
    }

    /// The instance tag file
    pub fn instance_tags(&self) -> PathBuf {
        self.dir.join(INSTANCE_TAGS_FILE)
    }
}

/// Keep account ids from escaping the data directory
fn sanitize(account_id: &str) -> String {
    let cleaned: String = account_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '@' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    match cleaned.as_str() {
        "" | "." | ".." => format!("_{cleaned}"),
        _ => cleaned,
    }
}

#[derive(Serialize, Deserialize)]
struct StoredPrivateKey {
    account_name: String,
    protocol: String,
    secret_key: String,
}

/// Read the account's private key, if one was generated
pub fn read_private_key(paths: &AccountPaths) -> Result<Option<PrivateKey>> {
    let path = paths.private_key();
    let Some(content) = read_optional(&path)? else {
        return Ok(None);
    };

    let stored: StoredPrivateKey = serde_json::from_str(&content)?;
    let secret = general_purpose::STANDARD.decode(stored.secret_key)?;
    PrivateKey::from_secret_bytes(&secret).map(Some)
}

/// Persist the account's private key
pub fn write_private_key(
    paths: &AccountPaths,
    account: &AccountIdentity,
    key: &PrivateKey,
) -> Result<()> {
    let stored = StoredPrivateKey {
        account_name: account.account_name.clone(),
        protocol: account.protocol.clone(),
        secret_key: general_purpose::STANDARD.encode(key.secret_key_bytes()),
    };
    let content = serde_json::to_string_pretty(&stored)?;
    write_atomic(&paths.private_key(), &content)
}

/// Read the fingerprint table; a missing file yields an empty store
pub fn read_fingerprints(paths: &AccountPaths, account: &AccountIdentity) -> Result<FingerprintStore> {
    let path = paths.fingerprints();
    match read_optional(&path)? {
        Some(content) => FingerprintStore::parse(
            &content,
            &account.account_name,
            &account.protocol,
            &path.display().to_string(),
        ),
        None => Ok(FingerprintStore::new(
            account.account_name.clone(),
            account.protocol.clone(),
        )),
    }
}

/// Persist the fingerprint table
pub fn write_fingerprints(paths: &AccountPaths, store: &FingerprintStore) -> Result<()> {
    write_atomic(&paths.fingerprints(), &store.render())
}

/// Read the account's instance tag, if one was assigned
pub fn read_instance_tag(paths: &AccountPaths, account: &AccountIdentity) -> Result<Option<InstanceTag>> {
    let path = paths.instance_tags();
    let Some(content) = read_optional(&path)? else {
        return Ok(None);
    };

    for (index, line) in content.lines().enumerate() {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 3 || fields[0] != account.account_name || fields[1] != account.protocol {
            continue;
        }

        let tag = u32::from_str_radix(fields[2].trim(), 16)
            .ok()
            .and_then(InstanceTag::from_u32)
            .ok_or_else(|| StorageError::Corrupt {
                path: path.display().to_string(),
                line: index + 1,
            })?;
        return Ok(Some(tag));
    }

    Ok(None)
}

/// Persist the account's instance tag
pub fn write_instance_tag(
    paths: &AccountPaths,
    account: &AccountIdentity,
    tag: InstanceTag,
) -> Result<()> {
    let content = format!("{}\t{}\t{}\n", account.account_name, account.protocol, tag);
    write_atomic(&paths.instance_tags(), &content)
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StorageError::Read {
            path: path.display().to_string(),
            reason: err.to_string(),
        }
        .into()),
    }
}

fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let write_error = |err: std::io::Error| StorageError::Write {
        path: path.display().to_string(),
        reason: err.to_string(),
    };

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent).map_err(write_error)?;

    // Each writer gets its own temporary file, so concurrent writes of
    // different files in one account directory never share a path
    let prefix = path
        .file_name()
        .map_or_else(|| "otr".into(), |name| name.to_string_lossy().into_owned());
    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{}.", prefix))
        .suffix(".tmp")
        .tempfile_in(parent)
        .map_err(write_error)?;
    tmp.write_all(content.as_bytes()).map_err(write_error)?;
    tmp.as_file().sync_all().map_err(write_error)?;
    tmp.persist(path).map_err(|err| write_error(err.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::FingerprintValue;
    use tempfile::TempDir;

    fn account() -> AccountIdentity {
        AccountIdentity::new("acct", "alice@example.org", "jabber")
    }

    #[test]
    fn test_private_key_persistence() {
        let dir = TempDir::new().unwrap();
        let paths = AccountPaths::new(dir.path(), "acct");
        assert!(read_private_key(&paths).unwrap().is_none());

        let key = PrivateKey::generate();
        write_private_key(&paths, &account(), &key).unwrap();

        let loaded = read_private_key(&paths).unwrap().unwrap();
        assert_eq!(loaded.fingerprint(), key.fingerprint());

        let content = std::fs::read_to_string(paths.private_key()).unwrap();
        assert!(content.contains("alice@example.org"));
    }

    #[test]
    fn test_fingerprint_persistence() {
        let dir = TempDir::new().unwrap();
        let paths = AccountPaths::new(dir.path(), "acct");
        let mut store = read_fingerprints(&paths, &account()).unwrap();
        assert!(store.is_empty());

        let value = FingerprintValue::from_bytes([4u8; 20]);
        store.add("bob@example.org", value);
        store.set_trusted("bob@example.org", &value, true);
        write_fingerprints(&paths, &store).unwrap();

        let loaded = read_fingerprints(&paths, &account()).unwrap();
        assert!(loaded.is_trusted("bob@example.org", &value));
    }

    #[test]
    fn test_instance_tag_persistence() {
        let dir = TempDir::new().unwrap();
        let paths = AccountPaths::new(dir.path(), "acct");
        assert!(read_instance_tag(&paths, &account()).unwrap().is_none());

        let tag = InstanceTag::generate();
        write_instance_tag(&paths, &account(), tag).unwrap();
        assert_eq!(read_instance_tag(&paths, &account()).unwrap(), Some(tag));

        std::fs::write(paths.instance_tags(), "alice@example.org\tjabber\t00000001\n").unwrap();
        assert!(read_instance_tag(&paths, &account()).is_err());
    }

    #[test]
    fn test_account_dir_is_sanitized() {
        let base = Path::new("/data");
        assert_eq!(AccountPaths::new(base, "../etc").dir(), Path::new("/data/.._etc"));
        assert_eq!(AccountPaths::new(base, "..").dir(), Path::new("/data/_.."));
        assert_eq!(
            AccountPaths::new(base, "alice@example.org").dir(),
            Path::new("/data/alice@example.org")
        );
    }

    #[test]
    fn test_concurrent_key_and_fingerprint_writes() {
        let dir = TempDir::new().unwrap();
        let paths = AccountPaths::new(dir.path(), "acct");
        let key = PrivateKey::generate();
        let value = FingerprintValue::from_bytes([7u8; 20]);
        let mut store = read_fingerprints(&paths, &account()).unwrap();
        store.add("bob@example.org", value);

        std::thread::scope(|scope| {
            let keys = scope.spawn(|| {
                for _ in 0..100 {
                    write_private_key(&paths, &account(), &key).unwrap();
                }
            });
            let fingerprints = scope.spawn(|| {
                for _ in 0..100 {
                    write_fingerprints(&paths, &store).unwrap();
                }
            });
            keys.join().unwrap();
            fingerprints.join().unwrap();
        });

        let loaded = read_private_key(&paths).unwrap().unwrap();
        assert_eq!(loaded.fingerprint(), key.fingerprint());
        let table = read_fingerprints(&paths, &account()).unwrap();
        assert!(table.find("bob@example.org", &value).is_some());

        // No temporary files are left behind
        let leftovers = std::fs::read_dir(paths.dir())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_private_key_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let paths = AccountPaths::new(dir.path(), "acct");
        write_private_key(&paths, &account(), &PrivateKey::generate()).unwrap();

        let mode = std::fs::metadata(paths.private_key()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
