//! # Math snapshot cache
//!
//! The clustering engine deposits one result per conversation and tick. Results arrive in a
//! mixed shape: some per-group fields are objects keyed by group id, others are arrays. They are
//! normalized once, here, into arrays of `{ "id": n, "val": ... }` and the internal conversation
//! id is stripped before anything is cached or returned.
//!
//! The cache is a bounded LRU with a short TTL. Ticks only move forward: a snapshot older than
//! the newest tick seen for its conversation is never cached, although it may still be handed to
//! the caller that fetched it.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use domains::{ConversationId, DomainError, MathRepo, MathSnapshot, RawSnapshot, StoreError, Tid};
use lru::LruCache;
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::worker::{Progress, Worker};

type Result<T> = std::result::Result<T, DomainError>;

/// Pass as `min_tick` to accept whatever snapshot is available.
pub const ANY_TICK: i64 = -1;

/// Per-group fields: `{gid: val}` or `[{id, ...}]` upstream, `[{id, val}]` after normalization.
const GROUP_FIELDS: &[&str] = &["group-clusters", "repness", "group-votes", "comment-priorities"];
/// Per-group fields whose values are themselves keyed by subgroup.
const SUBGROUP_FIELDS: &[&str] = &["subgroup-repness", "subgroup-votes", "subgroup-clusters"];

#[derive(Debug, Clone)]
pub struct MathCacheOptions {
    pub capacity: usize,
    pub ttl: Duration,
}

impl Default for MathCacheOptions {
    fn default() -> Self {
        Self {
            capacity: 300,
            ttl: Duration::from_secs(5),
        }
    }
}

struct Entry {
    snapshot: Arc<MathSnapshot>,
    expires_at: Instant,
}

struct CacheState {
    entries: LruCache<ConversationId, Entry>,
    /// Newest tick ever accepted per conversation; outlives expired entries.
    newest: LruCache<ConversationId, i64>,
}

pub struct MathCache {
    store: Arc<dyn MathRepo>,
    state: Mutex<CacheState>,
    ttl: Duration,
}

impl MathCache {
    pub fn new(store: Arc<dyn MathRepo>, options: MathCacheOptions) -> Self {
        let capacity = NonZeroUsize::new(options.capacity).unwrap_or(NonZeroUsize::MIN);
        let newest_capacity = capacity.saturating_mul(NonZeroUsize::new(4).unwrap_or(NonZeroUsize::MIN));
        Self {
            store,
            state: Mutex::new(CacheState {
                entries: LruCache::new(capacity),
                newest: LruCache::new(newest_capacity),
            }),
            ttl: options.ttl,
        }
    }

    /// The newest snapshot with a tick strictly greater than `min_tick`, or `None` when there is
    /// nothing newer than what the caller already has.
    pub async fn get(&self, conversation: ConversationId, min_tick: i64) -> Result<Option<Arc<MathSnapshot>>> {
        if let Some(cached) = self.live(conversation) {
            if cached.tick > min_tick {
                return Ok(Some(cached));
            }
        }

        let Some(raw) = self.store.latest(conversation).await? else {
            return Ok(None);
        };
        if raw.math_tick <= min_tick {
            return Ok(None);
        }

        let snapshot = Arc::new(normalize(raw)?);
        self.offer(Arc::clone(&snapshot));
        Ok(Some(snapshot))
    }

    /// Cache `snapshot` unless a newer (or equally new, still live) one is already known.
    /// Returns whether the cache changed.
    pub fn offer(&self, snapshot: Arc<MathSnapshot>) -> bool {
        let conversation = snapshot.conversation;
        let tick = snapshot.tick;
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let newest = state.newest.get(&conversation).copied();
        if newest.is_some_and(|newest| tick < newest) {
            debug!(conversation = %conversation, tick, ?newest, "ignoring stale math snapshot");
            return false;
        }
        if let Some(entry) = state.entries.peek(&conversation) {
            if entry.expires_at > now && entry.snapshot.tick >= tick {
                return false;
            }
        }

        state.entries.put(
            conversation,
            Entry {
                snapshot,
                expires_at: now + self.ttl,
            },
        );
        state.newest.put(conversation, newest.map_or(tick, |n| n.max(tick)));
        true
    }

    /// Tick of the live cached snapshot, if any.
    pub fn cached_tick(&self, conversation: ConversationId) -> Option<i64> {
        self.live(conversation).map(|s| s.tick)
    }

    fn live(&self, conversation: ConversationId) -> Option<Arc<MathSnapshot>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let expired = match state.entries.get(&conversation) {
            None => return None,
            Some(entry) if entry.expires_at > Instant::now() => return Some(Arc::clone(&entry.snapshot)),
            Some(_) => true,
        };
        if expired {
            state.entries.pop(&conversation);
        }
        None
    }
}

/// Canonicalize a raw snapshot. Fails only when the payload is not a JSON object.
pub fn normalize(raw: RawSnapshot) -> std::result::Result<MathSnapshot, StoreError> {
    let Value::Object(mut payload) = raw.data else {
        return Err(StoreError::Corrupt(format!(
            "math payload for conversation {} is not an object",
            raw.conversation
        )));
    };
    payload.remove("zid");

    for &field in GROUP_FIELDS {
        if let Some(value) = payload.remove(field) {
            payload.insert(field.to_string(), Value::Array(group_entries(value)));
        }
    }
    for &field in SUBGROUP_FIELDS {
        if let Some(value) = payload.remove(field) {
            let nested = group_entries(value)
                .into_iter()
                .map(|mut entry| {
                    if let Some(val) = entry.get_mut("val") {
                        *val = Value::Array(group_entries(val.take()));
                    }
                    entry
                })
                .collect();
            payload.insert(field.to_string(), Value::Array(nested));
        }
    }

    let comment_priorities = priorities(payload.get("comment-priorities"));
    payload.insert("math_tick".to_string(), json!(raw.math_tick));

    Ok(MathSnapshot {
        conversation: raw.conversation,
        tick: raw.math_tick,
        payload,
        comment_priorities,
    })
}

/// Turn either shape into `[{id, val}]`, ordered by numeric id.
fn group_entries(value: Value) -> Vec<Value> {
    let mut entries: Vec<(i64, Value)> = match value {
        Value::Object(map) => map
            .into_iter()
            .filter_map(|(key, val)| key.parse::<i64>().ok().map(|id| (id, val)))
            .collect(),
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(index, item)| array_entry(index, item))
            .collect(),
        _ => Vec::new(),
    };
    entries.sort_by_key(|(id, _)| *id);
    entries
        .into_iter()
        .map(|(id, val)| json!({ "id": id, "val": val }))
        .collect()
}

/// Array items are either already `{id, val}` pairs or whole group objects carrying an `id`.
fn array_entry(index: usize, item: Value) -> (i64, Value) {
    match item {
        Value::Object(mut object) => {
            let id = object.get("id").and_then(parse_id).unwrap_or(index as i64);
            let is_pair = object.len() == 2 && object.contains_key("id") && object.contains_key("val");
            if is_pair {
                let val = object.remove("val").unwrap_or(Value::Null);
                (id, val)
            } else {
                object.remove("id");
                (id, Value::Object(object))
            }
        }
        other => (index as i64, other),
    }
}

fn parse_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn priorities(value: Option<&Value>) -> HashMap<Tid, f64> {
    let Some(Value::Array(entries)) = value else {
        return HashMap::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            let id = entry.get("id").and_then(parse_id)?;
            let weight = entry.get("val").and_then(Value::as_f64)?;
            Some((Tid(i32::try_from(id).ok()?), weight))
        })
        .collect()
}

/// Pulls newly deposited snapshots for every conversation into the cache.
pub struct MathPoller {
    cache: Arc<MathCache>,
    store: Arc<dyn MathRepo>,
    batch_size: i64,
    /// Highest caching tick processed so far.
    cursor: AtomicI64,
}

impl MathPoller {
    pub fn new(cache: Arc<MathCache>, store: Arc<dyn MathRepo>, batch_size: i64) -> Self {
        Self {
            cache,
            store,
            batch_size: batch_size.max(1),
            cursor: AtomicI64::new(0),
        }
    }

    pub fn cursor(&self) -> i64 {
        self.cursor.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for MathPoller {
    fn name(&self) -> &'static str {
        "math-poller"
    }

    async fn poll(&self) -> Result<Progress> {
        let after = self.cursor.load(Ordering::SeqCst);
        let batch = self.store.since(after, self.batch_size).await?;
        if batch.is_empty() {
            return Ok(Progress::Idle);
        }

        let full = batch.len() as i64 >= self.batch_size;
        let mut cursor = after;
        for raw in batch {
            cursor = cursor.max(raw.caching_tick);
            let conversation = raw.conversation;
            match normalize(raw) {
                Ok(snapshot) => {
                    let tick = snapshot.tick;
                    if self.cache.offer(Arc::new(snapshot)) {
                        debug!(conversation = %conversation, tick, "math snapshot refreshed");
                    }
                }
                Err(err) => warn!(conversation = %conversation, error = %err, "skipping malformed math snapshot"),
            }
        }
        self.cursor.store(cursor, Ordering::SeqCst);

        Ok(if full { Progress::Busy } else { Progress::Idle })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domains::MockMathRepo;
    use mockall::predicate::eq;

    const ZID: ConversationId = ConversationId(4);

    fn raw(tick: i64) -> RawSnapshot {
        RawSnapshot {
            conversation: ZID,
            math_tick: tick,
            caching_tick: tick,
            data: json!({
                "zid": 4,
                "n": 12,
                "group-clusters": [
                    {"id": 1, "center": [0.1, 0.2], "members": [3]},
                    {"id": 0, "center": [0.0, 0.0], "members": [1, 2]}
                ],
                "repness": {"0": [{"tid": 3, "repness": 1.2}], "1": []},
                "group-votes": [{"id": 0, "val": {"n-members": 2}}],
                "subgroup-repness": {"0": {"0": [], "1": [{"tid": 2}]}},
                "comment-priorities": {"3": 2.5, "5": 0.25}
            }),
        }
    }

    fn snapshot(tick: i64) -> Arc<MathSnapshot> {
        Arc::new(normalize(raw(tick)).unwrap())
    }

    fn cache(store: MockMathRepo) -> MathCache {
        MathCache::new(Arc::new(store), MathCacheOptions::default())
    }

    #[test]
    fn every_group_field_becomes_an_id_val_array() {
        let snap = normalize(raw(9)).unwrap();
        assert!(!snap.payload.contains_key("zid"));
        assert_eq!(snap.payload["math_tick"], json!(9));

        let clusters = snap.payload["group-clusters"].as_array().unwrap();
        assert_eq!(clusters[0]["id"], json!(0));
        assert_eq!(clusters[0]["val"]["members"], json!([1, 2]));
        assert!(clusters[0]["val"].get("id").is_none());

        let repness = snap.payload["repness"].as_array().unwrap();
        assert_eq!(repness[0], json!({"id": 0, "val": [{"tid": 3, "repness": 1.2}]}));

        assert_eq!(snap.payload["group-votes"], json!([{"id": 0, "val": {"n-members": 2}}]));
        assert_eq!(
            snap.payload["subgroup-repness"],
            json!([{"id": 0, "val": [{"id": 0, "val": []}, {"id": 1, "val": [{"tid": 2}]}]}])
        );
        assert_eq!(snap.comment_priorities.get(&Tid(3)), Some(&2.5));
        assert_eq!(snap.comment_priorities.get(&Tid(5)), Some(&0.25));
    }

    #[test]
    fn serialized_snapshot_never_carries_the_internal_id() {
        let serialized = serde_json::to_value(normalize(raw(2)).unwrap()).unwrap();
        let text = serialized.to_string();
        assert!(!text.contains("\"zid\""));
        assert!(!text.contains("\"conversation\""));
        assert_eq!(serialized["math_tick"], json!(2));
    }

    #[test]
    fn non_object_payload_is_corrupt() {
        let bad = RawSnapshot {
            data: json!([1, 2, 3]),
            ..raw(1)
        };
        assert!(matches!(normalize(bad), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn ticks_only_move_forward() {
        let cache = cache(MockMathRepo::new());
        assert!(cache.offer(snapshot(5)));
        assert!(!cache.offer(snapshot(3)));
        assert_eq!(cache.cached_tick(ZID), Some(5));
        assert!(cache.offer(snapshot(7)));
        assert_eq!(cache.cached_tick(ZID), Some(7));
    }

    #[tokio::test]
    async fn fresh_cache_hit_skips_the_store() {
        let mut store = MockMathRepo::new();
        store.expect_latest().never();
        let cache = cache(store);
        cache.offer(snapshot(5));

        let hit = cache.get(ZID, 4).await.unwrap().unwrap();
        assert_eq!(hit.tick, 5);
    }

    #[tokio::test]
    async fn nothing_newer_than_min_tick_is_none() {
        let mut store = MockMathRepo::new();
        store
            .expect_latest()
            .with(eq(ZID))
            .times(1)
            .returning(|_| Ok(Some(raw(5))));
        let cache = cache(store);
        cache.offer(snapshot(5));

        assert!(cache.get(ZID, 5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn store_miss_is_none() {
        let mut store = MockMathRepo::new();
        store.expect_latest().returning(|_| Ok(None));
        assert!(cache(store).get(ZID, ANY_TICK).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_refetched() {
        let mut store = MockMathRepo::new();
        store.expect_latest().times(2).returning(|_| Ok(Some(raw(6))));
        let cache = cache(store);

        assert_eq!(cache.get(ZID, ANY_TICK).await.unwrap().unwrap().tick, 6);
        assert_eq!(cache.get(ZID, ANY_TICK).await.unwrap().unwrap().tick, 6);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.cached_tick(ZID), None);
        assert_eq!(cache.get(ZID, ANY_TICK).await.unwrap().unwrap().tick, 6);
    }

    #[tokio::test]
    async fn poller_pages_by_caching_tick() {
        let mut store = MockMathRepo::new();
        store
            .expect_since()
            .with(eq(0), eq(2))
            .times(1)
            .returning(|_, _| Ok(vec![raw(3), raw(4)]));
        store
            .expect_since()
            .with(eq(4), eq(2))
            .times(1)
            .returning(|_, _| Ok(vec![]));
        let store: Arc<dyn MathRepo> = Arc::new(store);
        let cache = Arc::new(MathCache::new(Arc::clone(&store), MathCacheOptions::default()));
        let poller = MathPoller::new(Arc::clone(&cache), store, 2);

        assert_eq!(poller.poll().await.unwrap(), Progress::Busy);
        assert_eq!(poller.cursor(), 4);
        assert_eq!(cache.cached_tick(ZID), Some(4));
        assert_eq!(poller.poll().await.unwrap(), Progress::Idle);
    }
}
