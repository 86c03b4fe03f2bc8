//! In-process key/value store with per-key TTL, prefix scans, atomic batched
//! writes and one score-ordered set. Holds the short-lived records of the
//! upload path: chunk sessions, job mirrors, processing status, metadata and
//! small-content mirrors. Durability is explicitly not offered; losing the
//! contents aborts in-flight chunk sessions and nothing else.

use std::{
    collections::{
        BTreeMap,
        BTreeSet,
        HashMap,
    },
    sync::Arc,
    time::{
        Duration,
        Instant,
    },
};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{
    de::DeserializeOwned,
    Serialize,
};

/// Conventional key prefixes. Kept in one place so the sweeper and the
/// engine agree on them.
pub const FILE_PREFIX: &str = "file:";
pub const CONTENT_PREFIX: &str = "content:";
pub const CHUNK_UPLOAD_PREFIX: &str = "chunk_upload:";
pub const PROCESSING_JOB_PREFIX: &str = "processing_job:";
pub const PROCESSING_PREFIX: &str = "processing:";

#[derive(Clone)]
pub struct EphemeralCache {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    // Ordered map so `list(prefix)` is a range scan rather than a full sweep.
    entries: BTreeMap<String, Entry>,
    // The "files" ordered set: (expiry epoch second, file id member).
    by_score: BTreeSet<(i64, String)>,
    member_scores: HashMap<String, i64>,
}

struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(deadline) => deadline <= now,
            None => false,
        }
    }
}

/// One write in a pipelined batch. The whole batch is applied under a single
/// lock acquisition, so readers observe either none or all of it.
pub enum CacheOp {
    Set {
        key: String,
        value: Bytes,
        ttl: Option<Duration>,
    },
    Del {
        key: String,
    },
    ZAdd {
        member: String,
        score: i64,
    },
    ZRem {
        member: String,
    },
}

impl EphemeralCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: BTreeMap::new(),
                by_score: BTreeSet::new(),
                member_scores: HashMap::new(),
            })),
        }
    }

    pub fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) {
        let mut inner = self.inner.lock();
        inner.set(key, value, ttl);
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        if inner.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            inner.entries.remove(key);
            return None;
        }
        inner.entries.get(key).map(|e| e.value.clone())
    }

    pub fn del(&self, key: &str) -> bool {
        self.inner.lock().entries.remove(key).is_some()
    }

    /// Live keys beginning with `prefix`, in lexicographic order.
    pub fn list(&self, prefix: &str) -> Vec<String> {
        let inner = self.inner.lock();
        let now = Instant::now();
        inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> anyhow::Result<()> {
        let buf = serde_json::to_vec(value)?;
        self.set(key, buf.into(), ttl);
        Ok(())
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        match self.get(key) {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Apply a batch atomically. Replaces the wire pipeline of a networked
    /// cache: one lock acquisition, all ops, in order.
    pub fn batch(&self, ops: Vec<CacheOp>) {
        let mut inner = self.inner.lock();
        for op in ops {
            match op {
                CacheOp::Set { key, value, ttl } => inner.set(&key, value, ttl),
                CacheOp::Del { key } => {
                    inner.entries.remove(&key);
                },
                CacheOp::ZAdd { member, score } => inner.zadd(member, score),
                CacheOp::ZRem { member } => inner.zrem(&member),
            }
        }
    }

    pub fn zadd(&self, member: String, score: i64) {
        self.inner.lock().zadd(member, score);
    }

    pub fn zrem(&self, member: &str) {
        self.inner.lock().zrem(member);
    }

    /// Members with score <= max, ascending. Does not remove them.
    pub fn zrange_by_score(&self, max: i64) -> Vec<(i64, String)> {
        let inner = self.inner.lock();
        inner
            .by_score
            .iter()
            .take_while(|(score, _)| *score <= max)
            .cloned()
            .collect()
    }

    /// Drop expired entries eagerly. Returns how many were removed. The cache
    /// also drops expired entries lazily on read; this exists so memory is
    /// reclaimed for keys nobody polls again.
    pub fn purge_expired(&self) -> usize {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let dead: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &dead {
            inner.entries.remove(key);
        }
        dead.len()
    }

}

impl Default for EphemeralCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn set(&mut self, key: &str, value: Bytes, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .insert(key.to_string(), Entry { value, expires_at });
    }

    fn zadd(&mut self, member: String, score: i64) {
        if let Some(old) = self.member_scores.insert(member.clone(), score) {
            self.by_score.remove(&(old, member.clone()));
        }
        self.by_score.insert((score, member));
    }

    fn zrem(&mut self, member: &str) {
        if let Some(score) = self.member_scores.remove(member) {
            self.by_score.remove(&(score, member.to_string()));
        }
    }
}
