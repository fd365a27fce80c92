//! Ephemeral store contract.
//!
//! The ephemeral store is a fast key/value store with per-key TTLs and a handful of
//! collection types (sorted sets, hashes, lists). Host writes land here first and
//! collectors drain them into the durable store.
//!
//! The contract is a small command interpreter: [`EphemeralStore::execute`] runs one
//! [`Command`] and [`EphemeralStore::run_atomic`] runs a batch as one indivisible step.
//! Typed helpers live on [`EphemeralStoreExt`], which every store gets for free.
//!
//! Keys that must be touched together in one atomic batch share a `{...}` hash tag, so
//! a sharded backend can route them to the same slot.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Opaque position inside a scan.
///
/// Cursors survive removal of already-returned items, so a caller may delete what it
/// has processed before requesting the next page.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScanCursor(String);

impl ScanCursor {
    /// Wraps a backend-specific cursor value.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the backend-specific cursor value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One page of a cursor-paginated scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPage<T> {
    /// Items in this page.
    pub items: Vec<T>,
    /// Cursor for the next page, `None` once the scan is complete.
    pub next: Option<ScanCursor>,
}

impl<T> ScanPage<T> {
    /// Returns an empty final page.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            items: Vec::new(),
            next: None,
        }
    }

    /// Returns true when no further pages follow.
    #[must_use]
    pub const fn is_last(&self) -> bool {
        self.next.is_none()
    }
}

/// A single ephemeral store command.
///
/// Commands on a missing key behave as if the key held an empty value of the
/// expected type. Collections left empty by a command are removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Reads a string value. Replies `Str` or `Nil`.
    Get {
        /// Key to read.
        key: String,
    },
    /// Writes a string value, replacing any existing value and TTL. Replies `Ok`.
    Set {
        /// Key to write.
        key: String,
        /// New value.
        value: String,
        /// Optional expiry.
        ttl: Option<Duration>,
    },
    /// Writes a string value only when the key is absent. Replies `Bool`.
    SetIfAbsent {
        /// Key to write.
        key: String,
        /// New value.
        value: String,
        /// Expiry applied when the write happens.
        ttl: Duration,
    },
    /// Deletes a key of any type. Replies `Bool` (whether it existed).
    Del {
        /// Key to delete.
        key: String,
    },
    /// Deletes a string key only while it still holds `value`. Replies `Bool`.
    DelIfEquals {
        /// Key to delete.
        key: String,
        /// Value the key must hold.
        value: String,
    },
    /// Sets the TTL of an existing key. Replies `Bool` (whether the key exists).
    Expire {
        /// Key to expire.
        key: String,
        /// New TTL.
        ttl: Duration,
    },
    /// Adds or overwrites sorted-set members. Replies `Int` (members newly added).
    ZAdd {
        /// Sorted-set key.
        key: String,
        /// `(member, score)` pairs.
        members: Vec<(String, i64)>,
    },
    /// Adds sorted-set members that are not present yet; existing scores are kept.
    /// Replies `Int` (members added).
    ZAddIfAbsent {
        /// Sorted-set key.
        key: String,
        /// `(member, score)` pairs.
        members: Vec<(String, i64)>,
    },
    /// Sets a member score to `max(score, current + 1)`. Replies `Int` (the new score).
    ZBump {
        /// Sorted-set key.
        key: String,
        /// Member to bump.
        member: String,
        /// Proposed score.
        score: i64,
    },
    /// Reads a member score. Replies `Int` or `Nil`.
    ZScore {
        /// Sorted-set key.
        key: String,
        /// Member to read.
        member: String,
    },
    /// Counts sorted-set members. Replies `Int`.
    ZCard {
        /// Sorted-set key.
        key: String,
    },
    /// Scans sorted-set members. Replies `ScoredPage`.
    ZScan {
        /// Sorted-set key.
        key: String,
        /// Position to resume from; `None` starts a new scan.
        cursor: Option<ScanCursor>,
        /// Maximum members per page.
        count: usize,
    },
    /// Removes and returns the lowest-scored members. Replies `Scored`.
    ZPopMin {
        /// Sorted-set key.
        key: String,
        /// Maximum members to pop.
        count: usize,
    },
    /// Removes members whose score still equals the given score. Replies `Int`.
    ZRemIfScore {
        /// Sorted-set key.
        key: String,
        /// `(member, expected score)` pairs.
        members: Vec<(String, i64)>,
    },
    /// Removes members with `min <= score <= max`. Replies `Int`.
    ZRemRangeByScore {
        /// Sorted-set key.
        key: String,
        /// Inclusive lower bound.
        min: i64,
        /// Inclusive upper bound.
        max: i64,
    },
    /// Sets hash fields, overwriting existing ones. Replies `Int` (fields newly added).
    HSet {
        /// Hash key.
        key: String,
        /// `(field, value)` pairs.
        fields: Vec<(String, String)>,
    },
    /// Scans hash fields. Replies `FieldPage`.
    HScan {
        /// Hash key.
        key: String,
        /// Position to resume from; `None` starts a new scan.
        cursor: Option<ScanCursor>,
        /// Maximum fields per page.
        count: usize,
    },
    /// Counts hash fields. Replies `Int`.
    HLen {
        /// Hash key.
        key: String,
    },
    /// Pushes values to the head of a list, in order. Replies `Int` (new length).
    LPush {
        /// List key.
        key: String,
        /// Values to push; the last one ends up at the head.
        values: Vec<String>,
    },
    /// Appends values to the tail of a list, in order. Replies `Int` (new length).
    RPush {
        /// List key.
        key: String,
        /// Values to append; the last one ends up at the tail.
        values: Vec<String>,
    },
    /// Keeps only the inclusive range `start..=stop` of a list. Replies `Ok`.
    LTrim {
        /// List key.
        key: String,
        /// First index to keep.
        start: usize,
        /// Last index to keep (clamped to the list length).
        stop: usize,
    },
    /// Reads the inclusive range `start..=stop` of a list. Replies `List`.
    LRange {
        /// List key.
        key: String,
        /// First index to read.
        start: usize,
        /// Last index to read (clamped to the list length).
        stop: usize,
    },
}

impl Command {
    /// Returns the command name used in errors and logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Get { .. } => "GET",
            Self::Set { .. } => "SET",
            Self::SetIfAbsent { .. } => "SETNX",
            Self::Del { .. } => "DEL",
            Self::DelIfEquals { .. } => "DELIFEQ",
            Self::Expire { .. } => "EXPIRE",
            Self::ZAdd { .. } => "ZADD",
            Self::ZAddIfAbsent { .. } => "ZADDNX",
            Self::ZBump { .. } => "ZBUMP",
            Self::ZScore { .. } => "ZSCORE",
            Self::ZCard { .. } => "ZCARD",
            Self::ZScan { .. } => "ZSCAN",
            Self::ZPopMin { .. } => "ZPOPMIN",
            Self::ZRemIfScore { .. } => "ZREMIFSCORE",
            Self::ZRemRangeByScore { .. } => "ZREMRANGEBYSCORE",
            Self::HSet { .. } => "HSET",
            Self::HScan { .. } => "HSCAN",
            Self::HLen { .. } => "HLEN",
            Self::LPush { .. } => "LPUSH",
            Self::RPush { .. } => "RPUSH",
            Self::LTrim { .. } => "LTRIM",
            Self::LRange { .. } => "LRANGE",
        }
    }

    /// Returns the key the command operates on.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Get { key }
            | Self::Set { key, .. }
            | Self::SetIfAbsent { key, .. }
            | Self::Del { key }
            | Self::DelIfEquals { key, .. }
            | Self::Expire { key, .. }
            | Self::ZAdd { key, .. }
            | Self::ZAddIfAbsent { key, .. }
            | Self::ZBump { key, .. }
            | Self::ZScore { key, .. }
            | Self::ZCard { key }
            | Self::ZScan { key, .. }
            | Self::ZPopMin { key, .. }
            | Self::ZRemIfScore { key, .. }
            | Self::ZRemRangeByScore { key, .. }
            | Self::HSet { key, .. }
            | Self::HScan { key, .. }
            | Self::HLen { key }
            | Self::LPush { key, .. }
            | Self::RPush { key, .. }
            | Self::LTrim { key, .. }
            | Self::LRange { key, .. } => key,
        }
    }
}

/// Reply to a [`Command`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// No value.
    Nil,
    /// Command succeeded without a value.
    Ok,
    /// Boolean outcome.
    Bool(bool),
    /// Integer value (counts, lengths, scores).
    Int(i64),
    /// String value.
    Str(String),
    /// List of strings.
    List(Vec<String>),
    /// `(member, score)` pairs.
    Scored(Vec<(String, i64)>),
    /// One page of a sorted-set scan.
    ScoredPage(ScanPage<(String, i64)>),
    /// One page of a hash scan.
    FieldPage(ScanPage<(String, String)>),
}

impl Reply {
    /// Interprets the reply as a boolean.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnexpectedReply` for any other shape.
    pub fn into_bool(self, command: &'static str) -> Result<bool> {
        match self {
            Self::Bool(value) => Ok(value),
            other => Err(unexpected(command, &other)),
        }
    }

    /// Interprets the reply as an integer.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnexpectedReply` for any other shape.
    pub fn into_int(self, command: &'static str) -> Result<i64> {
        match self {
            Self::Int(value) => Ok(value),
            other => Err(unexpected(command, &other)),
        }
    }

    /// Interprets the reply as a count.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnexpectedReply` for non-integers and negative integers.
    pub fn into_count(self, command: &'static str) -> Result<u64> {
        let value = self.into_int(command)?;
        u64::try_from(value).map_err(|_| Error::UnexpectedReply {
            command,
            reply: format!("negative count {value}"),
        })
    }

    /// Interprets the reply as an optional integer.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnexpectedReply` for any other shape.
    pub fn into_opt_int(self, command: &'static str) -> Result<Option<i64>> {
        match self {
            Self::Nil => Ok(None),
            Self::Int(value) => Ok(Some(value)),
            other => Err(unexpected(command, &other)),
        }
    }

    /// Interprets the reply as an optional string.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnexpectedReply` for any other shape.
    pub fn into_opt_str(self, command: &'static str) -> Result<Option<String>> {
        match self {
            Self::Nil => Ok(None),
            Self::Str(value) => Ok(Some(value)),
            other => Err(unexpected(command, &other)),
        }
    }

    /// Interprets the reply as a list of strings.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnexpectedReply` for any other shape.
    pub fn into_list(self, command: &'static str) -> Result<Vec<String>> {
        match self {
            Self::List(values) => Ok(values),
            other => Err(unexpected(command, &other)),
        }
    }

    /// Interprets the reply as scored members.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnexpectedReply` for any other shape.
    pub fn into_scored(self, command: &'static str) -> Result<Vec<(String, i64)>> {
        match self {
            Self::Scored(values) => Ok(values),
            other => Err(unexpected(command, &other)),
        }
    }

    /// Interprets the reply as a sorted-set scan page.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnexpectedReply` for any other shape.
    pub fn into_scored_page(self, command: &'static str) -> Result<ScanPage<(String, i64)>> {
        match self {
            Self::ScoredPage(page) => Ok(page),
            other => Err(unexpected(command, &other)),
        }
    }

    /// Interprets the reply as a hash scan page.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnexpectedReply` for any other shape.
    pub fn into_field_page(self, command: &'static str) -> Result<ScanPage<(String, String)>> {
        match self {
            Self::FieldPage(page) => Ok(page),
            other => Err(unexpected(command, &other)),
        }
    }

    /// Checks that the reply is `Ok`.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnexpectedReply` for any other shape.
    pub fn into_unit(self, command: &'static str) -> Result<()> {
        match self {
            Self::Ok => Ok(()),
            other => Err(unexpected(command, &other)),
        }
    }
}

fn unexpected(command: &'static str, reply: &Reply) -> Error {
    Error::UnexpectedReply {
        command,
        reply: format!("{reply:?}"),
    }
}

/// Ephemeral store backend.
///
/// All backends (memory, Redis-compatible) implement this trait.
#[async_trait]
pub trait EphemeralStore: Send + Sync + 'static {
    /// Executes a single command.
    async fn execute(&self, command: Command) -> Result<Reply>;

    /// Executes a batch of commands as one indivisible step.
    ///
    /// Replies are returned in command order. No other caller observes a state where
    /// only part of the batch has been applied. If any command fails, none of the
    /// batch takes effect.
    async fn run_atomic(&self, commands: Vec<Command>) -> Result<Vec<Reply>>;
}

/// Typed helpers over [`EphemeralStore::execute`].
#[async_trait]
pub trait EphemeralStoreExt: EphemeralStore {
    /// Reads a string value.
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.execute(Command::Get { key: key.into() })
            .await?
            .into_opt_str("GET")
    }

    /// Writes a string value only when absent. Returns whether the write happened.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.execute(Command::SetIfAbsent {
            key: key.into(),
            value: value.into(),
            ttl,
        })
        .await?
        .into_bool("SETNX")
    }

    /// Deletes a key. Returns whether it existed.
    async fn del(&self, key: &str) -> Result<bool> {
        self.execute(Command::Del { key: key.into() })
            .await?
            .into_bool("DEL")
    }

    /// Deletes a key only while it holds `value`. Returns whether it was deleted.
    async fn del_if_equals(&self, key: &str, value: &str) -> Result<bool> {
        self.execute(Command::DelIfEquals {
            key: key.into(),
            value: value.into(),
        })
        .await?
        .into_bool("DELIFEQ")
    }

    /// Reads a sorted-set member score.
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<i64>> {
        self.execute(Command::ZScore {
            key: key.into(),
            member: member.into(),
        })
        .await?
        .into_opt_int("ZSCORE")
    }

    /// Counts sorted-set members.
    async fn zcard(&self, key: &str) -> Result<u64> {
        self.execute(Command::ZCard { key: key.into() })
            .await?
            .into_count("ZCARD")
    }

    /// Scans one page of sorted-set members.
    async fn zscan(
        &self,
        key: &str,
        cursor: Option<ScanCursor>,
        count: usize,
    ) -> Result<ScanPage<(String, i64)>> {
        self.execute(Command::ZScan {
            key: key.into(),
            cursor,
            count,
        })
        .await?
        .into_scored_page("ZSCAN")
    }

    /// Pops up to `count` lowest-scored members.
    async fn zpopmin(&self, key: &str, count: usize) -> Result<Vec<(String, i64)>> {
        self.execute(Command::ZPopMin {
            key: key.into(),
            count,
        })
        .await?
        .into_scored("ZPOPMIN")
    }

    /// Removes members whose score is unchanged. Returns how many were removed.
    async fn zrem_if_score(&self, key: &str, members: Vec<(String, i64)>) -> Result<u64> {
        self.execute(Command::ZRemIfScore {
            key: key.into(),
            members,
        })
        .await?
        .into_count("ZREMIFSCORE")
    }

    /// Removes members scored within `min..=max`. Returns how many were removed.
    async fn zrem_range_by_score(&self, key: &str, min: i64, max: i64) -> Result<u64> {
        self.execute(Command::ZRemRangeByScore {
            key: key.into(),
            min,
            max,
        })
        .await?
        .into_count("ZREMRANGEBYSCORE")
    }

    /// Scans one page of hash fields.
    async fn hscan(
        &self,
        key: &str,
        cursor: Option<ScanCursor>,
        count: usize,
    ) -> Result<ScanPage<(String, String)>> {
        self.execute(Command::HScan {
            key: key.into(),
            cursor,
            count,
        })
        .await?
        .into_field_page("HSCAN")
    }

    /// Counts hash fields.
    async fn hlen(&self, key: &str) -> Result<u64> {
        self.execute(Command::HLen { key: key.into() })
            .await?
            .into_count("HLEN")
    }

    /// Reads the inclusive range `start..=stop` of a list.
    async fn lrange(&self, key: &str, start: usize, stop: usize) -> Result<Vec<String>> {
        self.execute(Command::LRange {
            key: key.into(),
            start,
            stop,
        })
        .await?
        .into_list("LRANGE")
    }
}

impl<S: EphemeralStore + ?Sized> EphemeralStoreExt for S {}
