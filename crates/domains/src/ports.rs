//! # Ports
//!
//! Every adapter (in-memory, Postgres, external services) implements these traits. Services only
//! ever see `Arc<dyn Port>`.
//!
//! Store ports report [`StoreError`](crate::errors::StoreError); in particular a rejected unique
//! constraint must surface as `StoreError::UniqueViolation`, because services build their
//! exactly-once guarantees on top of it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::StoreResult;
use crate::models::{
    CandidateQuery, Comment, CommentCounts, Conversation, ConversationId, ConversationToken,
    DetectedLanguage, GeoInfo, JoinMetadata, ModerationStatus, NewComment, NewVote, OutgoingMail,
    Participant, Pid, RawSnapshot, SpamCheckRequest, SubscriberStatus, Tid, Translation, UserId,
    VoteFilter, VoteRecord,
};

/// Boxed error returned by best-effort external services.
pub type ServiceFailure = Box<dyn std::error::Error + Send + Sync + 'static>;

// ── Persistence ──────────────────────────────────────────────────────────────

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ConversationRepo: Send + Sync {
    async fn find_by_id(&self, id: ConversationId) -> StoreResult<Option<Conversation>>;
    async fn find_by_token(&self, token: &ConversationToken) -> StoreResult<Option<Conversation>>;
    /// Owners count as moderators.
    async fn is_moderator(&self, id: ConversationId, uid: UserId) -> StoreResult<bool>;
    async fn moderator_emails(&self, id: ConversationId) -> StoreResult<Vec<String>>;
    /// Set `modified = at` unless the stored value is already later.
    async fn touch_modified(&self, id: ConversationId, at: DateTime<Utc>) -> StoreResult<()>;
    async fn set_active(&self, id: ConversationId, active: bool) -> StoreResult<()>;
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait IdentityRepo: Send + Sync {
    /// Whether the user linked an external (social) identity.
    async fn has_social_identity(&self, uid: UserId) -> StoreResult<bool>;
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ParticipantRepo: Send + Sync {
    async fn find(&self, conversation: ConversationId, uid: UserId) -> StoreResult<Option<Participant>>;
    async fn find_by_pid(&self, conversation: ConversationId, pid: Pid) -> StoreResult<Option<Participant>>;
    /// Insert with the next free pid. A concurrent joiner winning the race surfaces as
    /// `UniqueViolation`; a contended first-join lock as `Contention`.
    async fn insert(&self, conversation: ConversationId, uid: UserId, at: DateTime<Utc>) -> StoreResult<Participant>;
    async fn record_join_metadata(&self, conversation: ConversationId, pid: Pid, metadata: JoinMetadata) -> StoreResult<()>;
    /// Recount votes from the ledger, set `last_interaction` and reset the notification counter.
    async fn record_vote_activity(&self, conversation: ConversationId, pid: Pid, at: DateTime<Utc>) -> StoreResult<()>;
    async fn set_subscription(&self, conversation: ConversationId, pid: Pid, subscribed: bool) -> StoreResult<()>;
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait VoteRepo: Send + Sync {
    async fn insert(&self, vote: NewVote) -> StoreResult<VoteRecord>;
    /// Rows of the latest-unique view: one per (pid, tid), the most recent.
    async fn latest(&self, conversation: ConversationId, filter: VoteFilter) -> StoreResult<Vec<VoteRecord>>;
    /// The raw append-only ledger in insertion order.
    async fn history(&self, conversation: ConversationId, filter: VoteFilter) -> StoreResult<Vec<VoteRecord>>;
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait CommentRepo: Send + Sync {
    async fn text_exists(&self, conversation: ConversationId, text: &str) -> StoreResult<bool>;
    /// Assigns the next tid. Duplicate text surfaces as `UniqueViolation`.
    async fn insert(&self, comment: NewComment) -> StoreResult<Comment>;
    async fn find(&self, conversation: ConversationId, tid: Tid) -> StoreResult<Option<Comment>>;
    /// Active, visible comments matching the query, ordered by tid.
    async fn candidates(&self, query: &CandidateQuery) -> StoreResult<Vec<Comment>>;
    /// `None` when the conversation has no comments at all.
    async fn counts(&self, conversation: ConversationId, pid: Option<Pid>, strict_moderation: bool) -> StoreResult<Option<CommentCounts>>;
    /// Comments still waiting for a moderator: unmoderated and inactive.
    async fn count_pending_moderation(&self, conversation: ConversationId) -> StoreResult<u64>;
    async fn set_moderation(&self, conversation: ConversationId, tid: Tid, status: ModerationStatus, active: bool) -> StoreResult<Option<Comment>>;
    async fn translations(&self, conversation: ConversationId, tid: Tid) -> StoreResult<Vec<Translation>>;
    async fn store_translation(&self, translation: Translation) -> StoreResult<()>;
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait MathRepo: Send + Sync {
    async fn latest(&self, conversation: ConversationId) -> StoreResult<Option<RawSnapshot>>;
    /// Snapshots with `caching_tick > after`, ordered by caching tick.
    async fn since(&self, after: i64, limit: i64) -> StoreResult<Vec<RawSnapshot>>;
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait NotificationRepo: Send + Sync {
    /// Upsert the conversation's pending marker, due at `due`. A conversation has at most one
    /// marker; enqueueing again only ever moves its due time earlier.
    async fn enqueue(&self, conversation: ConversationId, due: DateTime<Utc>) -> StoreResult<()>;
    /// Atomically claim and delete the oldest marker due at or before `now`.
    async fn claim_next(&self, now: DateTime<Utc>) -> StoreResult<Option<ConversationId>>;
    async fn subscribers(&self, conversation: ConversationId) -> StoreResult<Vec<SubscriberStatus>>;
    async fn mark_notified(&self, conversation: ConversationId, pid: Pid, at: DateTime<Utc>) -> StoreResult<()>;
}

// ── External services ────────────────────────────────────────────────────────

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait SpamChecker: Send + Sync {
    async fn is_spam(&self, request: &SpamCheckRequest) -> Result<bool, ServiceFailure>;
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), ServiceFailure>;
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait LanguageDetector: Send + Sync {
    async fn detect(&self, text: &str) -> Result<Option<DetectedLanguage>, ServiceFailure>;
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, text: &str, target_lang: &str) -> Result<String, ServiceFailure>;
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait GeoLocator: Send + Sync {
    async fn locate(&self, ip: &str) -> Result<Option<GeoInfo>, ServiceFailure>;
}

/// Source of "now"; injected so tests can pin timestamps.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
