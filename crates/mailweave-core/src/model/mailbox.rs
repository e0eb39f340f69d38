//! Mailbox model.

use serde::{Deserialize, Serialize};

/// A mailbox (folder) of an account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mailbox {
    /// Full hierarchical name as reported by the server.
    pub name: String,
    /// Full name of the parent mailbox, absent for top-level mailboxes.
    pub parent: Option<String>,
    /// Last component of the hierarchical name.
    pub short_name: String,
    /// Highest UID stored locally. Never decreases.
    pub last_seen_uid: u32,
    /// Whether the mailbox was selected read-only.
    pub read_only: bool,
    /// Next UID the server announced on the last SELECT.
    pub uid_next: Option<u32>,
    /// Number of messages.
    pub count: u32,
    /// Number of unseen messages.
    pub unseen: u32,
    /// Nesting depth in the hierarchy, 0 for roots.
    pub depth: u32,
}

impl Mailbox {
    /// Builds a mailbox from its full name, splitting on the server's
    /// hierarchy delimiter.
    ///
    /// Without a delimiter the mailbox is flat.
    #[must_use]
    pub fn from_path(name: &str, delimiter: Option<char>) -> Self {
        let (parent, short_name) = match delimiter.and_then(|d| name.rsplit_once(d)) {
            Some((parent, short)) if !parent.is_empty() => (Some(parent.to_string()), short),
            _ => (None, name),
        };

        Self {
            name: name.to_string(),
            parent,
            short_name: short_name.to_string(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_level() {
        let mailbox = Mailbox::from_path("INBOX", Some('/'));
        assert_eq!(mailbox.parent, None);
        assert_eq!(mailbox.short_name, "INBOX");
    }

    #[test]
    fn test_nested() {
        let mailbox = Mailbox::from_path("Archive/2024/March", Some('/'));
        assert_eq!(mailbox.parent.as_deref(), Some("Archive/2024"));
        assert_eq!(mailbox.short_name, "March");
    }

    #[test]
    fn test_dot_delimiter() {
        let mailbox = Mailbox::from_path("INBOX.Lists.rust", Some('.'));
        assert_eq!(mailbox.parent.as_deref(), Some("INBOX.Lists"));
        assert_eq!(mailbox.short_name, "rust");
    }

    #[test]
    fn test_no_delimiter() {
        let mailbox = Mailbox::from_path("Work/Old", None);
        assert_eq!(mailbox.parent, None);
        assert_eq!(mailbox.short_name, "Work/Old");
    }
}
