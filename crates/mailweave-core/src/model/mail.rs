//! Mail, flag and body-part models.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The system flag marking a message as read.
pub const SEEN: &str = "\\Seen";

/// An order-insensitive set of IMAP flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlagSet(BTreeSet<String>);

impl FlagSet {
    /// Creates an empty flag set.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Adds a flag.
    pub fn insert(&mut self, flag: impl Into<String>) {
        self.0.insert(flag.into());
    }

    /// Returns true if the flag is present.
    #[must_use]
    pub fn contains(&self, flag: &str) -> bool {
        self.0.contains(flag)
    }

    /// Returns true if the message has been read.
    #[must_use]
    pub fn is_seen(&self) -> bool {
        self.contains(SEEN)
    }

    /// Iterates over the flags in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Number of flags.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if no flag is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Encodes the set as the comma separated column value.
    #[must_use]
    pub fn to_db(&self) -> String {
        self.iter().collect::<Vec<_>>().join(",")
    }

    /// Decodes the comma separated column value.
    #[must_use]
    pub fn from_db(value: &str) -> Self {
        value
            .split(',')
            .map(str::trim)
            .filter(|flag| !flag.is_empty())
            .collect()
    }
}

impl<S: Into<String>> FromIterator<S> for FlagSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Position of a part inside a message's MIME tree.
///
/// Each entry is a child index; the empty path is the message itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BodyPath(Vec<usize>);

impl BodyPath {
    /// The root of the tree.
    #[must_use]
    pub const fn root() -> Self {
        Self(Vec::new())
    }

    /// Path of the `index`-th child of this part.
    #[must_use]
    pub fn child(&self, index: usize) -> Self {
        let mut path = self.0.clone();
        path.push(index);
        Self(path)
    }

    /// Nesting depth, 0 for the root.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// The child indexes.
    #[must_use]
    pub fn indexes(&self) -> &[usize] {
        &self.0
    }
}

impl From<Vec<usize>> for BodyPath {
    fn from(indexes: Vec<usize>) -> Self {
        Self(indexes)
    }
}

impl fmt::Display for BodyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for index in &self.0 {
            write!(f, "/{index}")?;
        }
        Ok(())
    }
}

/// Viewer commands keyed by `type/subtype` or `type/*`.
pub type Filters = BTreeMap<String, String>;

/// One node of a message's MIME structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyPart {
    /// Location in the tree.
    pub path: BodyPath,
    /// Top-level media type, e.g. `text`.
    pub mime_type: String,
    /// Media subtype, e.g. `plain`.
    pub mime_subtype: String,
}

impl BodyPart {
    /// Full `type/subtype` string, lowercased.
    #[must_use]
    pub fn content_type(&self) -> String {
        format!("{}/{}", self.mime_type, self.mime_subtype).to_ascii_lowercase()
    }

    /// Command of the filter matching this part. An exact `type/subtype`
    /// entry wins over a `type/*` one. Media types compare ignoring case.
    #[must_use]
    pub fn find_match<'a>(&self, filters: &'a Filters) -> Option<&'a str> {
        let exact = self.content_type();
        let wildcard = format!("{}/*", self.mime_type.to_ascii_lowercase());
        let lookup = |wanted: &str| {
            filters
                .iter()
                .find(|(mime, _)| mime.eq_ignore_ascii_case(wanted))
                .map(|(_, command)| command.as_str())
        };
        lookup(&exact).or_else(|| lookup(&wildcard))
    }
}

/// A message header record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mail {
    /// Store row id, absent before insertion.
    pub id: Option<i64>,
    /// Server UID within the mailbox.
    pub uid: u32,
    /// Message-ID without angle brackets.
    pub message_id: String,
    /// Message-ID of the parent message, if any.
    pub in_reply_to: Option<String>,
    /// Thread id, absent until assigned.
    pub thread_id: Option<i64>,
    /// Current flags.
    pub flags: FlagSet,
    /// Message date.
    pub date: DateTime<Utc>,
    /// Decoded subject.
    pub subject: String,
    /// Flattened MIME structure in pre-order.
    pub parts: Vec<BodyPart>,
    /// Full name of the mailbox holding the message.
    pub mailbox: String,
}

impl Mail {
    /// Returns true if the message has been read.
    #[must_use]
    pub fn is_seen(&self) -> bool {
        self.flags.is_seen()
    }

    /// First `text/plain` part, in document order.
    #[must_use]
    pub fn find_plaintext(&self) -> Option<&BodyPart> {
        self.parts
            .iter()
            .find(|part| part.content_type() == "text/plain")
    }

    /// First part that is not a multipart container.
    #[must_use]
    pub fn find_first_non_multipart(&self) -> Option<&BodyPart> {
        self.parts
            .iter()
            .find(|part| !part.mime_type.eq_ignore_ascii_case("multipart"))
    }
}

/// Server-side flags of a message, used for reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagUpdate {
    /// Server UID.
    pub uid: u32,
    /// Flags as reported by the server.
    pub flags: FlagSet,
}
