//! Encryption policy.

use crate::utils::{ConfigError, OverlayError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// When encryption is started or required
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    /// Refuse to send or accept plaintext; start encryption on every conversation
    Always,
    /// Advertise support and start encryption whenever the peer offers it
    #[default]
    Opportunistic,
    /// Only encrypt when explicitly asked to
    Manual,
    /// Never encrypt; protocol messages pass through as plaintext
    Never,
}

impl Policy {
    /// All policies, in order of decreasing strictness
    pub const ALL: [Policy; 4] = [
        Policy::Always,
        Policy::Opportunistic,
        Policy::Manual,
        Policy::Never,
    ];

    /// Whether the protocol is enabled at all
    pub fn allows_encryption(self) -> bool {
        self != Policy::Never
    }

    /// Plaintext must not be sent or accepted
    pub fn requires_encryption(self) -> bool {
        self == Policy::Always
    }

    /// Append the whitespace tag to outgoing plaintext
    pub fn sends_whitespace_tag(self) -> bool {
        matches!(self, Policy::Always | Policy::Opportunistic)
    }

    /// Start the key exchange when a whitespace tag is received
    pub fn starts_on_whitespace(self) -> bool {
        matches!(self, Policy::Always | Policy::Opportunistic)
    }

    /// Start the key exchange when the peer reports a protocol error
    pub fn starts_on_error(self) -> bool {
        self == Policy::Always
    }

    /// Lowercase name, as used in configuration files
    pub fn as_str(self) -> &'static str {
        match self {
            Policy::Always => "always",
            Policy::Opportunistic => "opportunistic",
            Policy::Manual => "manual",
            Policy::Never => "never",
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Policy {
    type Err = OverlayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Policy::ALL
            .into_iter()
            .find(|policy| policy.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                ConfigError::InvalidValue {
                    field: "policy".to_string(),
                    value: s.to_string(),
                }
                .into()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_policy() {
        assert_eq!("always".parse::<Policy>().unwrap(), Policy::Always);
        assert_eq!(" Manual ".parse::<Policy>().unwrap(), Policy::Manual);
        assert!("sometimes".parse::<Policy>().is_err());
        assert_eq!(Policy::default(), Policy::Opportunistic);
    }

    #[test]
    fn test_policy_flags() {
        assert!(!Policy::Never.allows_encryption());
        assert!(Policy::Always.requires_encryption());
        assert!(!Policy::Manual.sends_whitespace_tag());
        assert!(!Policy::Manual.starts_on_whitespace());
        assert!(Policy::Opportunistic.starts_on_whitespace());
        assert!(!Policy::Opportunistic.starts_on_error());
    }
}
