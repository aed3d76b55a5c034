//! # In-memory store
//!
//! Implements every persistence port on `DashMap`s keyed by conversation. A conversation's
//! participants, comments and votes each sit behind one map entry, so the entry's write guard
//! plays the part of a transaction and unique constraints are checked under it, the same way the
//! database checks them.
//!
//! Used by the integration tests and by `cmd/agora` when no database is configured.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use domains::{
    CandidateQuery, Comment, CommentCounts, CommentRepo, Conversation, ConversationId,
    ConversationRepo, ConversationToken, IdentityRepo, JoinMetadata, MathRepo, ModerationStatus,
    NewComment, NewVote, NotificationRepo, Participant, ParticipantRepo, Pid, RawSnapshot,
    StoreError, StoreResult, SubscriberStatus, Tid, Translation, UserId, VoteFilter, VoteRecord,
    VoteRepo,
};
use tracing::debug;

#[derive(Default)]
struct ParticipantTable {
    by_uid: HashMap<UserId, Pid>,
    rows: BTreeMap<Pid, Participant>,
    metadata: HashMap<Pid, JoinMetadata>,
}

#[derive(Default)]
struct CommentTable {
    rows: BTreeMap<Tid, Comment>,
    translations: Vec<Translation>,
}

pub struct MemoryStore {
    next_conversation: AtomicI32,
    caching_seq: AtomicI64,
    conversations: DashMap<ConversationId, Conversation>,
    moderators: DashMap<ConversationId, HashSet<UserId>>,
    social: DashSet<UserId>,
    emails: DashMap<UserId, String>,
    participants: DashMap<ConversationId, ParticipantTable>,
    comments: DashMap<ConversationId, CommentTable>,
    /// Append-only ledger per conversation, in insertion order.
    votes: DashMap<ConversationId, Vec<VoteRecord>>,
    math: DashMap<ConversationId, RawSnapshot>,
    /// Pending notification markers and their due time.
    markers: DashMap<ConversationId, DateTime<Utc>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            next_conversation: AtomicI32::new(1),
            caching_seq: AtomicI64::new(0),
            conversations: DashMap::new(),
            moderators: DashMap::new(),
            social: DashSet::new(),
            emails: DashMap::new(),
            participants: DashMap::new(),
            comments: DashMap::new(),
            votes: DashMap::new(),
            math: DashMap::new(),
            markers: DashMap::new(),
        }
    }

    // ── Seeding ──────────────────────────────────────────────────────────────

    /// Create an open conversation with both filters on, then let `configure` adjust it.
    pub fn create_conversation(
        &self,
        token: &str,
        owner: UserId,
        configure: impl FnOnce(&mut Conversation),
    ) -> Conversation {
        let id = ConversationId(self.next_conversation.fetch_add(1, Ordering::SeqCst));
        let now = Utc::now();
        let mut conversation = Conversation {
            id,
            token: ConversationToken(token.to_string()),
            owner,
            topic: None,
            is_active: true,
            is_archived: false,
            strict_moderation: false,
            profanity_filter: true,
            spam_filter: true,
            auth_needed_to_vote: false,
            created: now,
            modified: now,
        };
        configure(&mut conversation);
        conversation.id = id;
        self.insert_conversation(conversation.clone());
        conversation
    }

    /// Store a conversation under the id it carries.
    pub fn insert_conversation(&self, conversation: Conversation) {
        self.next_conversation
            .fetch_max(conversation.id.0.saturating_add(1), Ordering::SeqCst);
        self.conversations.insert(conversation.id, conversation);
    }

    pub fn add_moderator(&self, conversation: ConversationId, uid: UserId) {
        self.moderators.entry(conversation).or_default().insert(uid);
    }

    pub fn link_social_identity(&self, uid: UserId) {
        self.social.insert(uid);
    }

    pub fn set_email(&self, uid: UserId, email: &str) {
        self.emails.insert(uid, email.to_string());
    }

    pub fn set_muted(&self, conversation: ConversationId, pid: Pid, muted: bool) {
        if let Some(mut table) = self.participants.get_mut(&conversation) {
            if let Some(row) = table.rows.get_mut(&pid) {
                row.muted = muted;
            }
        }
    }

    /// Deposit a clustering result the way the math engine would.
    pub fn put_snapshot(&self, conversation: ConversationId, math_tick: i64, data: serde_json::Value) -> RawSnapshot {
        let snapshot = RawSnapshot {
            conversation,
            math_tick,
            caching_tick: self.caching_seq.fetch_add(1, Ordering::SeqCst) + 1,
            data,
        };
        self.math.insert(conversation, snapshot.clone());
        snapshot
    }

    // ── Inspection ───────────────────────────────────────────────────────────

    pub fn participant_rows(&self, conversation: ConversationId) -> Vec<Participant> {
        self.participants
            .get(&conversation)
            .map(|table| table.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn join_metadata(&self, conversation: ConversationId, pid: Pid) -> Option<JoinMetadata> {
        self.participants
            .get(&conversation)
            .and_then(|table| table.metadata.get(&pid).cloned())
    }

    pub fn comment_rows(&self, conversation: ConversationId) -> Vec<Comment> {
        self.comments
            .get(&conversation)
            .map(|table| table.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn conversation(&self, conversation: ConversationId) -> Option<Conversation> {
        self.conversations.get(&conversation).map(|c| c.value().clone())
    }

    pub fn pending_marker(&self, conversation: ConversationId) -> Option<DateTime<Utc>> {
        self.markers.get(&conversation).map(|due| *due)
    }

    // ── Shared queries ───────────────────────────────────────────────────────

    fn strict(&self, conversation: ConversationId) -> bool {
        self.conversations
            .get(&conversation)
            .is_some_and(|c| c.strict_moderation)
    }

    fn voted_tids(&self, conversation: ConversationId, pid: Pid) -> HashSet<Tid> {
        self.votes
            .get(&conversation)
            .map(|ledger| ledger.iter().filter(|v| v.pid == pid).map(|v| v.tid).collect())
            .unwrap_or_default()
    }

    fn visible_tids(&self, conversation: ConversationId, strict: bool) -> Vec<Tid> {
        self.comments
            .get(&conversation)
            .map(|table| {
                table
                    .rows
                    .values()
                    .filter(|c| c.active && c.moderation.is_visible(strict))
                    .map(|c| c.tid)
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn next_id(len: usize, what: &str) -> StoreResult<i32> {
    i32::try_from(len).map_err(|_| StoreError::Corrupt(format!("{what} sequence exhausted")))
}

#[async_trait]
impl ConversationRepo for MemoryStore {
    async fn find_by_id(&self, id: ConversationId) -> StoreResult<Option<Conversation>> {
        Ok(self.conversation(id))
    }

    async fn find_by_token(&self, token: &ConversationToken) -> StoreResult<Option<Conversation>> {
        Ok(self
            .conversations
            .iter()
            .find(|c| &c.token == token)
            .map(|c| c.value().clone()))
    }

    async fn is_moderator(&self, id: ConversationId, uid: UserId) -> StoreResult<bool> {
        let owner = self.conversations.get(&id).is_some_and(|c| c.owner == uid);
        Ok(owner || self.moderators.get(&id).is_some_and(|m| m.contains(&uid)))
    }

    async fn moderator_emails(&self, id: ConversationId) -> StoreResult<Vec<String>> {
        let mut uids: Vec<UserId> = self
            .moderators
            .get(&id)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default();
        if let Some(conversation) = self.conversations.get(&id) {
            uids.push(conversation.owner);
        }
        let mut emails: Vec<String> = uids
            .into_iter()
            .filter_map(|uid| self.emails.get(&uid).map(|e| e.value().clone()))
            .collect();
        emails.sort();
        emails.dedup();
        Ok(emails)
    }

    async fn touch_modified(&self, id: ConversationId, at: DateTime<Utc>) -> StoreResult<()> {
        if let Some(mut conversation) = self.conversations.get_mut(&id) {
            if conversation.modified < at {
                conversation.modified = at;
            }
        }
        Ok(())
    }

    async fn set_active(&self, id: ConversationId, active: bool) -> StoreResult<()> {
        if let Some(mut conversation) = self.conversations.get_mut(&id) {
            conversation.is_active = active;
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityRepo for MemoryStore {
    async fn has_social_identity(&self, uid: UserId) -> StoreResult<bool> {
        Ok(self.social.contains(&uid))
    }
}

#[async_trait]
impl ParticipantRepo for MemoryStore {
    async fn find(&self, conversation: ConversationId, uid: UserId) -> StoreResult<Option<Participant>> {
        Ok(self.participants.get(&conversation).and_then(|table| {
            let pid = table.by_uid.get(&uid)?;
            table.rows.get(pid).cloned()
        }))
    }

    async fn find_by_pid(&self, conversation: ConversationId, pid: Pid) -> StoreResult<Option<Participant>> {
        Ok(self
            .participants
            .get(&conversation)
            .and_then(|table| table.rows.get(&pid).cloned()))
    }

    async fn insert(&self, conversation: ConversationId, uid: UserId, at: DateTime<Utc>) -> StoreResult<Participant> {
        let mut table = self.participants.entry(conversation).or_default();
        if table.by_uid.contains_key(&uid) {
            return Err(StoreError::UniqueViolation("participants_zid_uid_key".into()));
        }
        let pid = Pid(next_id(table.rows.len(), "pid")?);
        let participant = Participant {
            conversation,
            pid,
            uid,
            created: at,
            last_interaction: at,
            muted: false,
            subscribed: false,
            vote_count: 0,
            last_notified: None,
            notifications_since_interaction: 0,
        };
        table.by_uid.insert(uid, pid);
        table.rows.insert(pid, participant.clone());
        debug!(conversation = %conversation, pid = %pid, "participant inserted");
        Ok(participant)
    }

    async fn record_join_metadata(&self, conversation: ConversationId, pid: Pid, metadata: JoinMetadata) -> StoreResult<()> {
        self.participants
            .entry(conversation)
            .or_default()
            .metadata
            .insert(pid, metadata);
        Ok(())
    }

    async fn record_vote_activity(&self, conversation: ConversationId, pid: Pid, at: DateTime<Utc>) -> StoreResult<()> {
        let vote_count = next_id(self.voted_tids(conversation, pid).len(), "vote count")?;
        if let Some(mut table) = self.participants.get_mut(&conversation) {
            if let Some(row) = table.rows.get_mut(&pid) {
                row.vote_count = vote_count;
                row.last_interaction = row.last_interaction.max(at);
                row.notifications_since_interaction = 0;
            }
        }
        Ok(())
    }

    async fn set_subscription(&self, conversation: ConversationId, pid: Pid, subscribed: bool) -> StoreResult<()> {
        if let Some(mut table) = self.participants.get_mut(&conversation) {
            if let Some(row) = table.rows.get_mut(&pid) {
                row.subscribed = subscribed;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl VoteRepo for MemoryStore {
    async fn insert(&self, vote: NewVote) -> StoreResult<VoteRecord> {
        let mut ledger = self.votes.entry(vote.conversation).or_default();
        let clash = ledger
            .iter()
            .any(|v| v.pid == vote.pid && v.tid == vote.tid && v.created == vote.created);
        if clash {
            return Err(StoreError::UniqueViolation("votes_zid_pid_tid_created_key".into()));
        }
        let record = VoteRecord {
            conversation: vote.conversation,
            pid: vote.pid,
            tid: vote.tid,
            value: vote.value,
            weight: vote.weight,
            high_priority: vote.high_priority,
            created: vote.created,
        };
        ledger.push(record.clone());
        Ok(record)
    }

    async fn latest(&self, conversation: ConversationId, filter: VoteFilter) -> StoreResult<Vec<VoteRecord>> {
        let mut latest: BTreeMap<(Pid, Tid), VoteRecord> = BTreeMap::new();
        for vote in self.history(conversation, filter).await? {
            latest.insert((vote.pid, vote.tid), vote);
        }
        Ok(latest.into_values().collect())
    }

    async fn history(&self, conversation: ConversationId, filter: VoteFilter) -> StoreResult<Vec<VoteRecord>> {
        Ok(self
            .votes
            .get(&conversation)
            .map(|ledger| {
                ledger
                    .iter()
                    .filter(|v| filter.pid.map_or(true, |pid| v.pid == pid))
                    .filter(|v| filter.tid.map_or(true, |tid| v.tid == tid))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl CommentRepo for MemoryStore {
    async fn text_exists(&self, conversation: ConversationId, text: &str) -> StoreResult<bool> {
        Ok(self
            .comments
            .get(&conversation)
            .is_some_and(|table| table.rows.values().any(|c| c.text == text)))
    }

    async fn insert(&self, comment: NewComment) -> StoreResult<Comment> {
        let mut table = self.comments.entry(comment.conversation).or_default();
        if table.rows.values().any(|c| c.text == comment.text) {
            return Err(StoreError::UniqueViolation("comments_zid_txt_key".into()));
        }
        let tid = Tid(next_id(table.rows.len(), "tid")?);
        let stored = Comment {
            conversation: comment.conversation,
            tid,
            author: comment.author,
            pid: comment.pid,
            text: comment.text,
            moderation: comment.moderation,
            active: comment.active,
            is_meta: false,
            is_seed: comment.is_seed,
            anon: comment.anon,
            velocity: 1.0,
            lang: comment.lang,
            lang_confidence: comment.lang_confidence,
            quote: comment.quote,
            created: comment.created,
        };
        table.rows.insert(tid, stored.clone());
        Ok(stored)
    }

    async fn find(&self, conversation: ConversationId, tid: Tid) -> StoreResult<Option<Comment>> {
        Ok(self
            .comments
            .get(&conversation)
            .and_then(|table| table.rows.get(&tid).cloned()))
    }

    async fn candidates(&self, query: &CandidateQuery) -> StoreResult<Vec<Comment>> {
        let voted = query
            .unvoted_by
            .map(|pid| self.voted_tids(query.conversation, pid))
            .unwrap_or_default();
        let rows: Vec<Comment> = self
            .comments
            .get(&query.conversation)
            .map(|table| table.rows.values().cloned().collect())
            .unwrap_or_default();
        Ok(rows
            .into_iter()
            .filter(|c| c.active && c.moderation.is_visible(query.strict_moderation))
            .filter(|c| !voted.contains(&c.tid) && !query.exclude.contains(&c.tid))
            .filter(|c| !query.social_authors_only || self.social.contains(&c.author))
            .collect())
    }

    async fn counts(&self, conversation: ConversationId, pid: Option<Pid>, strict_moderation: bool) -> StoreResult<Option<CommentCounts>> {
        let has_comments = self
            .comments
            .get(&conversation)
            .is_some_and(|table| !table.rows.is_empty());
        if !has_comments {
            return Ok(None);
        }
        let visible = self.visible_tids(conversation, strict_moderation);
        let voted = pid
            .map(|pid| self.voted_tids(conversation, pid))
            .unwrap_or_default();
        let remaining = visible.iter().filter(|tid| !voted.contains(tid)).count();
        Ok(Some(CommentCounts {
            remaining: remaining as u64,
            total: visible.len() as u64,
        }))
    }

    async fn count_pending_moderation(&self, conversation: ConversationId) -> StoreResult<u64> {
        Ok(self
            .comments
            .get(&conversation)
            .map(|table| {
                table
                    .rows
                    .values()
                    .filter(|c| c.moderation == ModerationStatus::Unmoderated && !c.active)
                    .count() as u64
            })
            .unwrap_or(0))
    }

    async fn set_moderation(&self, conversation: ConversationId, tid: Tid, status: ModerationStatus, active: bool) -> StoreResult<Option<Comment>> {
        Ok(self.comments.get_mut(&conversation).and_then(|mut table| {
            let row = table.rows.get_mut(&tid)?;
            row.moderation = status;
            row.active = active;
            Some(row.clone())
        }))
    }

    async fn translations(&self, conversation: ConversationId, tid: Tid) -> StoreResult<Vec<Translation>> {
        Ok(self
            .comments
            .get(&conversation)
            .map(|table| table.translations.iter().filter(|t| t.tid == tid).cloned().collect())
            .unwrap_or_default())
    }

    async fn store_translation(&self, translation: Translation) -> StoreResult<()> {
        let mut table = self.comments.entry(translation.conversation).or_default();
        table
            .translations
            .retain(|t| !(t.tid == translation.tid && t.lang == translation.lang));
        table.translations.push(translation);
        Ok(())
    }
}

#[async_trait]
impl MathRepo for MemoryStore {
    async fn latest(&self, conversation: ConversationId) -> StoreResult<Option<RawSnapshot>> {
        Ok(self.math.get(&conversation).map(|s| s.value().clone()))
    }

    async fn since(&self, after: i64, limit: i64) -> StoreResult<Vec<RawSnapshot>> {
        let mut fresh: Vec<RawSnapshot> = self
            .math
            .iter()
            .filter(|s| s.caching_tick > after)
            .map(|s| s.value().clone())
            .collect();
        fresh.sort_by_key(|s| s.caching_tick);
        fresh.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(fresh)
    }
}

#[async_trait]
impl NotificationRepo for MemoryStore {
    async fn enqueue(&self, conversation: ConversationId, due: DateTime<Utc>) -> StoreResult<()> {
        self.markers
            .entry(conversation)
            .and_modify(|existing| *existing = (*existing).min(due))
            .or_insert(due);
        Ok(())
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> StoreResult<Option<ConversationId>> {
        loop {
            let oldest = self
                .markers
                .iter()
                .filter(|m| *m.value() <= now)
                .min_by_key(|m| (*m.value(), *m.key()))
                .map(|m| *m.key());
            let Some(conversation) = oldest else {
                return Ok(None);
            };
            // Another worker may have claimed it in between.
            if self.markers.remove_if(&conversation, |_, due| *due <= now).is_some() {
                return Ok(Some(conversation));
            }
        }
    }

    async fn subscribers(&self, conversation: ConversationId) -> StoreResult<Vec<SubscriberStatus>> {
        let subscribed: Vec<Participant> = self
            .participants
            .get(&conversation)
            .map(|table| table.rows.values().filter(|p| p.subscribed).cloned().collect())
            .unwrap_or_default();
        let visible = self.visible_tids(conversation, self.strict(conversation));

        Ok(subscribed
            .into_iter()
            .map(|p| {
                let voted = self.voted_tids(conversation, p.pid);
                SubscriberStatus {
                    pid: p.pid,
                    uid: p.uid,
                    email: self.emails.get(&p.uid).map(|e| e.value().clone()),
                    remaining: visible.iter().filter(|tid| !voted.contains(tid)).count() as u64,
                    last_interaction: p.last_interaction,
                    last_notified: p.last_notified,
                    notifications_since_interaction: p.notifications_since_interaction,
                }
            })
            .collect())
    }

    async fn mark_notified(&self, conversation: ConversationId, pid: Pid, at: DateTime<Utc>) -> StoreResult<()> {
        if let Some(mut table) = self.participants.get_mut(&conversation) {
            if let Some(row) = table.rows.get_mut(&pid) {
                row.last_notified = Some(at);
                row.notifications_since_interaction += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use domains::{VoteValue, VoteWeight};

    fn vote(conversation: ConversationId, pid: i32, tid: i32, value: VoteValue, created: DateTime<Utc>) -> NewVote {
        NewVote {
            conversation,
            pid: Pid(pid),
            tid: Tid(tid),
            value,
            weight: VoteWeight::default(),
            high_priority: false,
            created,
        }
    }

    fn comment(conversation: ConversationId, text: &str, active: bool) -> NewComment {
        NewComment {
            conversation,
            author: UserId(1),
            pid: Pid(0),
            text: text.to_string(),
            moderation: ModerationStatus::Unmoderated,
            active,
            is_seed: false,
            anon: false,
            lang: None,
            lang_confidence: None,
            quote: None,
            created: Utc::now(),
        }
    }

    #[tokio::test]
    async fn second_participant_insert_for_same_user_is_a_unique_violation() {
        let store = MemoryStore::new();
        let zid = store.create_conversation("a1", UserId(1), |_| {}).id;
        let first = ParticipantRepo::insert(&store, zid, UserId(5), Utc::now()).await.unwrap();
        let other = ParticipantRepo::insert(&store, zid, UserId(6), Utc::now()).await.unwrap();
        assert_eq!((first.pid, other.pid), (Pid(0), Pid(1)));

        let err = ParticipantRepo::insert(&store, zid, UserId(5), Utc::now()).await.unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(_)));
    }

    #[tokio::test]
    async fn latest_view_keeps_the_newest_vote_per_comment() {
        let store = MemoryStore::new();
        let zid = store.create_conversation("a2", UserId(1), |_| {}).id;
        let t0 = Utc::now();
        VoteRepo::insert(&store, vote(zid, 0, 0, VoteValue::Agree, t0)).await.unwrap();
        VoteRepo::insert(&store, vote(zid, 0, 0, VoteValue::Disagree, t0 + Duration::seconds(1)))
            .await
            .unwrap();
        VoteRepo::insert(&store, vote(zid, 1, 0, VoteValue::Pass, t0)).await.unwrap();

        let latest = VoteRepo::latest(&store, zid, VoteFilter::default()).await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].value, VoteValue::Disagree);
        assert_eq!(store.history(zid, VoteFilter::default()).await.unwrap().len(), 3);

        let err = VoteRepo::insert(&store, vote(zid, 1, 0, VoteValue::Pass, t0)).await.unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(_)));
    }

    #[tokio::test]
    async fn counts_distinguish_empty_from_exhausted() {
        let store = MemoryStore::new();
        let zid = store.create_conversation("a3", UserId(1), |_| {}).id;
        assert_eq!(store.counts(zid, Some(Pid(0)), false).await.unwrap(), None);

        CommentRepo::insert(&store, comment(zid, "first", true)).await.unwrap();
        CommentRepo::insert(&store, comment(zid, "held", false)).await.unwrap();
        VoteRepo::insert(&store, vote(zid, 0, 0, VoteValue::Agree, Utc::now())).await.unwrap();

        let counts = store.counts(zid, Some(Pid(0)), false).await.unwrap().unwrap();
        assert_eq!(counts, CommentCounts { remaining: 0, total: 1 });
        assert_eq!(store.count_pending_moderation(zid).await.unwrap(), 1);

        let dup = CommentRepo::insert(&store, comment(zid, "first", true)).await.unwrap_err();
        assert!(matches!(dup, StoreError::UniqueViolation(_)));
    }

    #[tokio::test]
    async fn markers_dedupe_and_claim_only_when_due() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.enqueue(ConversationId(1), now + Duration::hours(1)).await.unwrap();
        store.enqueue(ConversationId(1), now).await.unwrap();
        store.enqueue(ConversationId(2), now + Duration::hours(2)).await.unwrap();

        assert_eq!(store.claim_next(now).await.unwrap(), Some(ConversationId(1)));
        assert_eq!(store.claim_next(now).await.unwrap(), None);
        assert_eq!(
            store.claim_next(now + Duration::hours(3)).await.unwrap(),
            Some(ConversationId(2))
        );
    }

    #[tokio::test]
    async fn modified_never_moves_backwards() {
        let store = MemoryStore::new();
        let conversation = store.create_conversation("a4", UserId(1), |_| {});
        let later = conversation.modified + Duration::seconds(10);
        store.touch_modified(conversation.id, later).await.unwrap();
        store
            .touch_modified(conversation.id, later - Duration::seconds(5))
            .await
            .unwrap();
        assert_eq!(store.conversation(conversation.id).unwrap().modified, later);
    }

    #[tokio::test]
    async fn snapshots_page_by_caching_tick() {
        let store = MemoryStore::new();
        store.put_snapshot(ConversationId(1), 4, serde_json::json!({}));
        store.put_snapshot(ConversationId(2), 9, serde_json::json!({}));
        store.put_snapshot(ConversationId(1), 5, serde_json::json!({}));

        let page = store.since(0, 10).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].conversation, ConversationId(2));
        assert_eq!(store.since(page[1].caching_tick, 10).await.unwrap(), vec![]);
    }
}
