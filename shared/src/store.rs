//! key-value store seam.
//!
//! the handlers only ever talk to the store through [`KvStore`]. workers use
//! the rest client in `kv-rest`; tests use [`MemoryStore`].

use std::cell::RefCell;
use std::collections::HashMap;

use thiserror::Error;

/// failures surfaced by a key-value backend
#[derive(Debug, Error)]
pub enum StoreError {
    /// the backend could not be reached
    #[error("store transport error: {0}")]
    Transport(String),

    /// the backend answered with an error payload or a non-2xx status
    #[error("store rejected {command}: {message}")]
    Rejected { command: String, message: String },

    /// the reply did not have the expected shape
    #[error("unexpected store reply: {0}")]
    Decode(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Decode(e.to_string())
    }
}

/// the subset of redis-style commands the handlers rely on.
///
/// futures are not `Send`: workers run on a single-threaded isolate.
#[allow(async_fn_in_trait)]
pub trait KvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    /// increments and returns the new value; missing keys start at 0
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;
    async fn expire(&self, key: &str, seconds: u64) -> Result<(), StoreError>;
    /// prepends to a list
    async fn lpush(&self, key: &str, value: &str) -> Result<(), StoreError>;
    /// inclusive range, negative indices count from the end
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError>;
    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
enum Entry {
    Text(String),
    List(Vec<String>),
}

/// in-process store with redis list/counter semantics. ttls are recorded,
/// not enforced.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RefCell<HashMap<String, Entry>>,
    ttls: RefCell<HashMap<String, u64>>,
    offline: RefCell<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// makes every subsequent command fail with a transport error
    pub fn go_offline(&self) {
        *self.offline.borrow_mut() = true;
    }

    pub fn ttl(&self, key: &str) -> Option<u64> {
        self.ttls.borrow().get(key).copied()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.borrow().contains_key(key)
    }

    pub fn list_len(&self, key: &str) -> usize {
        match self.entries.borrow().get(key) {
            Some(Entry::List(items)) => items.len(),
            _ => 0,
        }
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if *self.offline.borrow() {
            return Err(StoreError::Transport("memory store offline".to_string()));
        }
        Ok(())
    }

    fn wrong_type(command: &str) -> StoreError {
        StoreError::Rejected {
            command: command.to_string(),
            message: "WRONGTYPE Operation against a key holding the wrong kind of value".to_string(),
        }
    }
}

/// resolves a redis-style inclusive range against a list length
fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_online()?;
        match self.entries.borrow().get(key) {
            None => Ok(None),
            Some(Entry::Text(value)) => Ok(Some(value.clone())),
            Some(Entry::List(_)) => Err(Self::wrong_type("get")),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check_online()?;
        self.entries
            .borrow_mut()
            .insert(key.to_string(), Entry::Text(value.to_string()));
        // SET clears any previous ttl
        self.ttls.borrow_mut().remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.check_online()?;
        let mut entries = self.entries.borrow_mut();
        let current = match entries.get(key) {
            None => 0,
            Some(Entry::Text(value)) => value.parse::<i64>().map_err(|_| StoreError::Rejected {
                command: "incr".to_string(),
                message: "ERR value is not an integer or out of range".to_string(),
            })?,
            Some(Entry::List(_)) => return Err(Self::wrong_type("incr")),
        };
        let next = current + 1;
        entries.insert(key.to_string(), Entry::Text(next.to_string()));
        Ok(next)
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<(), StoreError> {
        self.check_online()?;
        if self.entries.borrow().contains_key(key) {
            self.ttls.borrow_mut().insert(key.to_string(), seconds);
        }
        Ok(())
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check_online()?;
        let mut entries = self.entries.borrow_mut();
        match entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::List(Vec::new()))
        {
            Entry::List(items) => {
                items.insert(0, value.to_string());
                Ok(())
            }
            Entry::Text(_) => Err(Self::wrong_type("lpush")),
        }
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        self.check_online()?;
        match self.entries.borrow().get(key) {
            None => Ok(Vec::new()),
            Some(Entry::List(items)) => Ok(match resolve_range(items.len(), start, stop) {
                Some((from, to)) => items[from..=to].to_vec(),
                None => Vec::new(),
            }),
            Some(Entry::Text(_)) => Err(Self::wrong_type("lrange")),
        }
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<(), StoreError> {
        self.check_online()?;
        let mut entries = self.entries.borrow_mut();
        match entries.get_mut(key) {
            None => Ok(()),
            Some(Entry::List(items)) => {
                *items = match resolve_range(items.len(), start, stop) {
                    Some((from, to)) => items[from..=to].to_vec(),
                    None => Vec::new(),
                };
                Ok(())
            }
            Some(Entry::Text(_)) => Err(Self::wrong_type("ltrim")),
        }
    }
}
