//! Strong type definitions for driftsync.
//!
//! All identifiers are newtypes to prevent misuse at compile time.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque unique identifier of a commit.
///
/// Refs are computed by the application from a commit's content and parents.
/// The engine never interprets them beyond equality and lexical ordering,
/// which fixes the pairing order of multi-head merges.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitRef(String);

impl CommitRef {
    /// Create a ref from any string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Get the string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume and return the inner string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Debug for CommitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommitRef({})", self.0)
    }
}

impl fmt::Display for CommitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CommitRef {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for CommitRef {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for CommitRef {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Monotonic batch token minted by a store, one per `add` call.
///
/// Displayed in base 36 so cursors stay short in logs and wire payloads.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncId(pub u64);

impl SyncId {
    /// The sync id of a store that has never accepted a batch.
    pub const ZERO: Self = Self(0);

    /// The id minted after this one.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Get the raw counter value.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Render in base 36.
    pub fn to_base36(self) -> String {
        const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
        let mut n = self.0;
        if n == 0 {
            return "0".to_owned();
        }
        let mut out = Vec::new();
        while n > 0 {
            out.push(DIGITS[(n % 36) as usize]);
            n /= 36;
        }
        out.reverse();
        String::from_utf8_lossy(&out).into_owned()
    }

    /// Parse from base 36.
    pub fn from_base36(s: &str) -> Result<Self, std::num::ParseIntError> {
        u64::from_str_radix(s, 36).map(Self)
    }
}

impl fmt::Debug for SyncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SyncId({})", self.to_base36())
    }
}

impl fmt::Display for SyncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base36())
    }
}

impl From<u64> for SyncId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Annotation attached by a store when a commit is durably ordered.
///
/// Set once. A commit that already carries one keeps it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerAnnotation {
    /// Sync id of the batch that ordered this commit.
    pub remote_sync_id: SyncId,
    /// 0-based position within that batch.
    pub remote_sync_index: u32,
    /// Whether the commit was a linear continuation of the sole head.
    pub main: bool,
}
