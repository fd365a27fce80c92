//! In-memory ephemeral store for testing and single-process deployments.
//!
//! TTLs are tracked with `tokio::time::Instant`, so tests can pause and advance time.
//! Expired keys are evicted lazily when a command touches them.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Bound;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{Command, EphemeralStore, Reply, ScanCursor, ScanPage};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    ZSet(BTreeMap<String, i64>),
    Hash(BTreeMap<String, String>),
    List(VecDeque<String>),
}

impl Value {
    fn is_empty(&self) -> bool {
        match self {
            Self::Str(_) => false,
            Self::ZSet(set) => set.is_empty(),
            Self::Hash(hash) => hash.is_empty(),
            Self::List(list) => list.is_empty(),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    const fn persistent(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

type Entries = HashMap<String, Entry>;

/// In-memory ephemeral store.
///
/// Thread-safe via `RwLock`. Clones share the same underlying data.
#[derive(Debug, Default, Clone)]
pub struct MemoryEphemeralStore {
    entries: Arc<RwLock<Entries>>,
}

impl MemoryEphemeralStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the remaining TTL of a key, or `None` if it is missing or persistent.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the lock is poisoned.
    pub fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let entries = self.entries.read().map_err(|_| poison_err())?;
        let now = Instant::now();
        Ok(entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    /// Returns the live keys, sorted.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the lock is poisoned.
    pub fn keys(&self) -> Result<Vec<String>> {
        let entries = self.entries.read().map_err(|_| poison_err())?;
        let now = Instant::now();
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl EphemeralStore for MemoryEphemeralStore {
    async fn execute(&self, command: Command) -> Result<Reply> {
        let mut entries = self.entries.write().map_err(|_| poison_err())?;
        apply(&mut entries, command, Instant::now())
    }

    async fn run_atomic(&self, commands: Vec<Command>) -> Result<Vec<Reply>> {
        let mut entries = self.entries.write().map_err(|_| poison_err())?;
        let now = Instant::now();

        let mut snapshot: HashMap<String, Option<Entry>> = HashMap::new();
        for command in &commands {
            let key = command.key();
            if !snapshot.contains_key(key) {
                snapshot.insert(key.to_string(), entries.get(key).cloned());
            }
        }

        let mut replies = Vec::with_capacity(commands.len());
        for command in commands {
            match apply(&mut entries, command, now) {
                Ok(reply) => replies.push(reply),
                Err(err) => {
                    for (key, previous) in snapshot {
                        match previous {
                            Some(entry) => {
                                entries.insert(key, entry);
                            }
                            None => {
                                entries.remove(&key);
                            }
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(replies)
    }
}

fn poison_err() -> Error {
    Error::Internal {
        message: "lock poisoned".into(),
    }
}

fn wrong_type(key: &str, expected: &'static str) -> Error {
    Error::WrongType {
        key: key.to_string(),
        expected,
    }
}

fn count_reply(n: usize) -> Reply {
    Reply::Int(i64::try_from(n).unwrap_or(i64::MAX))
}

#[allow(clippy::too_many_lines)]
fn apply(entries: &mut Entries, command: Command, now: Instant) -> Result<Reply> {
    if entries
        .get(command.key())
        .is_some_and(|entry| entry.is_expired(now))
    {
        entries.remove(command.key());
    }

    let reply = match command {
        Command::Get { key } => match entries.get(&key).map(|entry| &entry.value) {
            None => Reply::Nil,
            Some(Value::Str(value)) => Reply::Str(value.clone()),
            Some(_) => return Err(wrong_type(&key, "string")),
        },
        Command::Set { key, value, ttl } => {
            entries.insert(
                key,
                Entry {
                    value: Value::Str(value),
                    expires_at: ttl.map(|ttl| now + ttl),
                },
            );
            Reply::Ok
        }
        Command::SetIfAbsent { key, value, ttl } => {
            if entries.contains_key(&key) {
                Reply::Bool(false)
            } else {
                entries.insert(
                    key,
                    Entry {
                        value: Value::Str(value),
                        expires_at: Some(now + ttl),
                    },
                );
                Reply::Bool(true)
            }
        }
        Command::Del { key } => Reply::Bool(entries.remove(&key).is_some()),
        Command::DelIfEquals { key, value } => {
            let holds = match entries.get(&key).map(|entry| &entry.value) {
                None => false,
                Some(Value::Str(current)) => *current == value,
                Some(_) => return Err(wrong_type(&key, "string")),
            };
            if holds {
                entries.remove(&key);
            }
            Reply::Bool(holds)
        }
        Command::Expire { key, ttl } => match entries.get_mut(&key) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                Reply::Bool(true)
            }
            None => Reply::Bool(false),
        },
        Command::ZAdd { key, members } => {
            let set = zset_mut(entries, &key)?;
            let added = members
                .into_iter()
                .filter(|(member, score)| set.insert(member.clone(), *score).is_none())
                .count();
            remove_if_empty(entries, &key);
            count_reply(added)
        }
        Command::ZAddIfAbsent { key, members } => {
            let set = zset_mut(entries, &key)?;
            let mut added = 0;
            for (member, score) in members {
                if !set.contains_key(&member) {
                    set.insert(member, score);
                    added += 1;
                }
            }
            remove_if_empty(entries, &key);
            count_reply(added)
        }
        Command::ZBump { key, member, score } => {
            let set = zset_mut(entries, &key)?;
            let bumped = set
                .get(&member)
                .map_or(score, |current| score.max(current.saturating_add(1)));
            set.insert(member, bumped);
            Reply::Int(bumped)
        }
        Command::ZScore { key, member } => match zset(entries, &key)? {
            Some(set) => set.get(&member).map_or(Reply::Nil, |score| Reply::Int(*score)),
            None => Reply::Nil,
        },
        Command::ZCard { key } => count_reply(zset(entries, &key)?.map_or(0, BTreeMap::len)),
        Command::ZScan { key, cursor, count } => match zset(entries, &key)? {
            Some(set) => Reply::ScoredPage(page_after(set, cursor.as_ref(), count)),
            None => Reply::ScoredPage(ScanPage::empty()),
        },
        Command::ZPopMin { key, count } => {
            let Some(set) = zset_mut_existing(entries, &key)? else {
                return Ok(Reply::Scored(Vec::new()));
            };
            let mut ordered: Vec<(String, i64)> = set
                .iter()
                .map(|(member, score)| (member.clone(), *score))
                .collect();
            ordered.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
            ordered.truncate(count);
            for (member, _) in &ordered {
                set.remove(member);
            }
            remove_if_empty(entries, &key);
            Reply::Scored(ordered)
        }
        Command::ZRemIfScore { key, members } => {
            let Some(set) = zset_mut_existing(entries, &key)? else {
                return Ok(Reply::Int(0));
            };
            let mut removed = 0;
            for (member, expected) in members {
                if set.get(&member) == Some(&expected) {
                    set.remove(&member);
                    removed += 1;
                }
            }
            remove_if_empty(entries, &key);
            count_reply(removed)
        }
        Command::ZRemRangeByScore { key, min, max } => {
            let Some(set) = zset_mut_existing(entries, &key)? else {
                return Ok(Reply::Int(0));
            };
            let before = set.len();
            set.retain(|_, score| *score < min || *score > max);
            let removed = before - set.len();
            remove_if_empty(entries, &key);
            count_reply(removed)
        }
        Command::HSet { key, fields } => {
            let entry = entries
                .entry(key.clone())
                .or_insert_with(|| Entry::persistent(Value::Hash(BTreeMap::new())));
            let Value::Hash(hash) = &mut entry.value else {
                return Err(wrong_type(&key, "hash"));
            };
            let added = fields
                .into_iter()
                .filter(|(field, value)| hash.insert(field.clone(), value.clone()).is_none())
                .count();
            remove_if_empty(entries, &key);
            count_reply(added)
        }
        Command::HScan { key, cursor, count } => match entries.get(&key).map(|e| &e.value) {
            None => Reply::FieldPage(ScanPage::empty()),
            Some(Value::Hash(hash)) => Reply::FieldPage(page_after(hash, cursor.as_ref(), count)),
            Some(_) => return Err(wrong_type(&key, "hash")),
        },
        Command::HLen { key } => match entries.get(&key).map(|e| &e.value) {
            None => Reply::Int(0),
            Some(Value::Hash(hash)) => count_reply(hash.len()),
            Some(_) => return Err(wrong_type(&key, "hash")),
        },
        Command::LPush { key, values } => {
            let entry = entries
                .entry(key.clone())
                .or_insert_with(|| Entry::persistent(Value::List(VecDeque::new())));
            let Value::List(list) = &mut entry.value else {
                return Err(wrong_type(&key, "list"));
            };
            for value in values {
                list.push_front(value);
            }
            let len = list.len();
            remove_if_empty(entries, &key);
            count_reply(len)
        }
        Command::RPush { key, values } => {
            let entry = entries
                .entry(key.clone())
                .or_insert_with(|| Entry::persistent(Value::List(VecDeque::new())));
            let Value::List(list) = &mut entry.value else {
                return Err(wrong_type(&key, "list"));
            };
            list.extend(values);
            let len = list.len();
            remove_if_empty(entries, &key);
            count_reply(len)
        }
        Command::LTrim { key, start, stop } => {
            match entries.get_mut(&key).map(|e| &mut e.value) {
                None => {}
                Some(Value::List(list)) => match inclusive_range(list.len(), start, stop) {
                    Some((first, last)) => {
                        list.truncate(last + 1);
                        list.drain(..first);
                    }
                    None => list.clear(),
                },
                Some(_) => return Err(wrong_type(&key, "list")),
            }
            remove_if_empty(entries, &key);
            Reply::Ok
        }
        Command::LRange { key, start, stop } => match entries.get(&key).map(|e| &e.value) {
            None => Reply::List(Vec::new()),
            Some(Value::List(list)) => match inclusive_range(list.len(), start, stop) {
                Some((first, last)) => Reply::List(
                    list.iter()
                        .skip(first)
                        .take(last - first + 1)
                        .cloned()
                        .collect(),
                ),
                None => Reply::List(Vec::new()),
            },
            Some(_) => return Err(wrong_type(&key, "list")),
        },
    };
    Ok(reply)
}

fn zset<'a>(entries: &'a Entries, key: &str) -> Result<Option<&'a BTreeMap<String, i64>>> {
    match entries.get(key).map(|entry| &entry.value) {
        None => Ok(None),
        Some(Value::ZSet(set)) => Ok(Some(set)),
        Some(_) => Err(wrong_type(key, "sorted set")),
    }
}

fn zset_mut<'a>(entries: &'a mut Entries, key: &str) -> Result<&'a mut BTreeMap<String, i64>> {
    let entry = entries
        .entry(key.to_string())
        .or_insert_with(|| Entry::persistent(Value::ZSet(BTreeMap::new())));
    match &mut entry.value {
        Value::ZSet(set) => Ok(set),
        _ => Err(wrong_type(key, "sorted set")),
    }
}

fn zset_mut_existing<'a>(
    entries: &'a mut Entries,
    key: &str,
) -> Result<Option<&'a mut BTreeMap<String, i64>>> {
    match entries.get_mut(key).map(|entry| &mut entry.value) {
        None => Ok(None),
        Some(Value::ZSet(set)) => Ok(Some(set)),
        Some(_) => Err(wrong_type(key, "sorted set")),
    }
}

fn remove_if_empty(entries: &mut Entries, key: &str) {
    if entries.get(key).is_some_and(|entry| entry.value.is_empty()) {
        entries.remove(key);
    }
}

/// Clamps an inclusive `start..=stop` range to a collection of length `len`.
fn inclusive_range(len: usize, start: usize, stop: usize) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let last = stop.min(len - 1);
    (start <= last).then_some((start, last))
}

/// Returns the page of `count` items following the cursor, in key order.
///
/// The cursor is the last key already returned, so removing returned keys between
/// pages never skips an unreturned one.
fn page_after<V: Clone>(
    map: &BTreeMap<String, V>,
    cursor: Option<&ScanCursor>,
    count: usize,
) -> ScanPage<(String, V)> {
    let count = count.max(1);
    let lower = cursor.map_or(Bound::Unbounded, |c| Bound::Excluded(c.as_str().to_string()));
    let mut items: Vec<(String, V)> = map
        .range::<String, _>((lower, Bound::Unbounded))
        .take(count + 1)
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    let next = if items.len() > count {
        items.truncate(count);
        items.last().map(|(key, _)| ScanCursor::new(key.clone()))
    } else {
        None
    };
    ScanPage { items, next }
}
