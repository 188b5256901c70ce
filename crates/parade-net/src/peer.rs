//! Participant identity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Fallback display name when neither config nor environment provide one.
pub const DEFAULT_PEER_NAME: &str = "parade-peer";

/// Stable identifier for a session participant (the device display name).
///
/// Equality is by value; two transports announcing the same name are the same
/// peer as far as the protocol is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

/// Errors raised when constructing a [`PeerId`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerIdError {
    /// The name was empty or whitespace-only.
    #[error("peer id cannot be empty")]
    Empty,
}

impl PeerId {
    /// Build a peer id from a display name.
    pub fn new(name: impl Into<String>) -> Result<Self, PeerIdError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(PeerIdError::Empty);
        }
        Ok(Self(name))
    }

    /// Resolve the identity of the local participant.
    ///
    /// Uses `display_name` when it is set and non-empty, then the host name
    /// from the environment, then [`DEFAULT_PEER_NAME`].
    pub fn local(display_name: Option<&str>) -> Self {
        display_name
            .and_then(|name| Self::new(name).ok())
            .or_else(|| {
                ["HOSTNAME", "COMPUTERNAME"]
                    .iter()
                    .filter_map(|var| std::env::var(var).ok())
                    .find_map(|name| Self::new(name).ok())
            })
            .unwrap_or_else(|| Self(DEFAULT_PEER_NAME.to_string()))
    }

    /// The display name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PeerId {
    type Error = PeerIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for PeerId {
    type Error = PeerIdError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_is_by_value() {
        let a = PeerId::new("iPad-7").unwrap();
        let b = PeerId::new(String::from("iPad-7")).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, PeerId::new("iPad-8").unwrap());
    }

    #[test]
    fn test_empty_name_rejected() {
        assert_eq!(PeerId::new(""), Err(PeerIdError::Empty));
        assert_eq!(PeerId::new("   "), Err(PeerIdError::Empty));
    }

    #[test]
    fn test_local_prefers_display_name() {
        let id = PeerId::local(Some("Commander"));
        assert_eq!(id.as_str(), "Commander");
    }

    #[test]
    fn test_local_never_empty() {
        let id = PeerId::local(Some(""));
        assert!(!id.as_str().is_empty());
    }

    #[test]
    fn test_display_matches_name() {
        let id = PeerId::new("Observer").unwrap();
        assert_eq!(id.to_string(), "Observer");
    }
}
