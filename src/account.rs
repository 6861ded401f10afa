//! Local account and conversation identities.
//!
//! An [`AccountIdentity`] names one local messaging account. A
//! [`SessionContext`] names one conversation of that account with a peer and
//! is the key under which sessions, deferred messages and engine contexts are
//! stored.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One local messaging account known to the overlay
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountIdentity {
    /// Stable account identifier, also the name of the storage subdirectory
    pub account_id: String,
    /// Account name as seen by peers (e.g. `alice@example.org`)
    pub account_name: String,
    /// Messaging protocol of the account (e.g. `jabber`)
    pub protocol: String,
}

impl AccountIdentity {
    /// Create a new account identity
    ///
    /// # Arguments
    ///
    /// * `account_id` - Stable identifier
    /// * `account_name` - Name used on the wire
    /// * `protocol` - Messaging protocol name
    pub fn new(
        account_id: impl Into<String>,
        account_name: impl Into<String>,
        protocol: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            account_name: account_name.into(),
            protocol: protocol.into(),
        }
    }
}

impl fmt::Display for AccountIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.account_name, self.protocol)
    }
}

/// The identity tuple a session is bound to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionContext {
    /// Local account identifier
    pub account_id: String,
    /// Local account name
    pub account_name: String,
    /// Remote peer name
    pub peer_name: String,
    /// Messaging protocol
    pub protocol: String,
}

impl SessionContext {
    /// Build the context for a conversation of `account` with `peer_name`
    pub fn new(account: &AccountIdentity, peer_name: impl Into<String>) -> Self {
        Self {
            account_id: account.account_id.clone(),
            account_name: account.account_name.clone(),
            peer_name: peer_name.into(),
            protocol: account.protocol.clone(),
        }
    }
}

impl fmt::Display for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} ({})",
            self.account_name, self.peer_name, self.protocol
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_from_account() {
        let account = AccountIdentity::new("acct-1", "alice@example.org", "jabber");
        let context = SessionContext::new(&account, "bob@example.org");

        assert_eq!(context.account_id, "acct-1");
        assert_eq!(context.protocol, "jabber");
        assert_eq!(
            context.to_string(),
            "alice@example.org -> bob@example.org (jabber)"
        );
        assert_ne!(context, SessionContext::new(&account, "john@example.org"));
    }
}
