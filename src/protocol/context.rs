//! Execution context and role tags.
//!
//! A browser extension runs the same relay code in three isolated
//! environments. The [`Context`] tag identifies which environment a
//! coordinator (or a message sender) lives in; the [`Role`] derived from it
//! decides whether the coordinator dials out or accepts connections.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// Context
// ============================================================================

/// The execution environment a coordinator instance runs in.
///
/// Exactly one per process. [`Context::Background`] is the hub that every
/// other context connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Context {
    /// Page-embedded content script.
    Content,
    /// Long-lived background/service worker. The hub.
    Background,
    /// Detachable side panel UI.
    Panel,
}

impl Context {
    /// Returns the wire tag for this context.
    #[inline]
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Content => "content",
            Self::Background => "background",
            Self::Panel => "panel",
        }
    }

    /// Returns the connection role this context plays.
    #[inline]
    #[must_use]
    pub const fn role(&self) -> Role {
        match self {
            Self::Background => Role::Hub,
            Self::Content | Self::Panel => Role::Client,
        }
    }

    /// Returns `true` if this context is the hub.
    #[inline]
    #[must_use]
    pub const fn is_hub(&self) -> bool {
        matches!(self.role(), Role::Hub)
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Role
// ============================================================================

/// Connection role derived from a [`Context`].
///
/// Clients dial out and own reconnect state; the hub accepts connections,
/// fans messages in and out, and never enters reconnect logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dials the hub; at most one outbound connection at a time.
    Client,
    /// Accepts connections from all clients and rebroadcasts between them.
    Hub,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_mapping() {
        assert_eq!(Context::Background.role(), Role::Hub);
        assert_eq!(Context::Content.role(), Role::Client);
        assert_eq!(Context::Panel.role(), Role::Client);

        assert!(Context::Background.is_hub());
        assert!(!Context::Panel.is_hub());
    }

    #[test]
    fn test_wire_tags() {
        assert_eq!(Context::Content.as_str(), "content");
        assert_eq!(Context::Background.as_str(), "background");
        assert_eq!(Context::Panel.as_str(), "panel");
    }

    #[test]
    fn test_serde_lowercase() {
        let json = serde_json::to_string(&Context::Panel).expect("serialize");
        assert_eq!(json, "\"panel\"");

        let back: Context = serde_json::from_str("\"content\"").expect("deserialize");
        assert_eq!(back, Context::Content);
    }

    #[test]
    fn test_display_matches_wire_tag() {
        for context in [Context::Content, Context::Background, Context::Panel] {
            assert_eq!(context.to_string(), context.as_str());
        }
    }
}
