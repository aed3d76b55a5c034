//! # Postgres store
//!
//! Every persistence port on one `PgPool`. All SQL is runtime-checked (`sqlx::query`, not the
//! macros) so the crate builds without a database.
//!
//! Sequence numbers (pid, tid) are `MAX + 1` inside a transaction that first takes a
//! transaction-scoped advisory lock on the conversation, which serializes concurrent first-joins
//! and comment inserts per conversation. Unique constraints still have the last word.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domains::{
    CandidateQuery, Comment, CommentCounts, CommentRepo, Conversation, ConversationId,
    ConversationRepo, ConversationToken, GeoInfo, IdentityRepo, JoinMetadata, MathRepo,
    ModerationStatus, NewComment, NewVote, NotificationRepo, Participant, ParticipantRepo, Pid,
    Quote, RawSnapshot, StoreError, StoreResult, SubscriberStatus, Tid, Translation, UserId,
    VoteFilter, VoteRecord, VoteRepo, VoteValue, VoteWeight,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{debug, info};

/// Advisory lock namespaces; the second key is the conversation id.
const JOIN_LOCK: i32 = 1;
const COMMENT_LOCK: i32 = 2;

const CONVERSATION_COLUMNS: &str = "zid, token, owner, topic, is_active, is_archived, strict_moderation, \
     profanity_filter, spam_filter, auth_needed_to_vote, created, modified";

const PARTICIPANT_COLUMNS: &str =
    "zid, pid, uid, created, last_interaction, muted, subscribed, vote_count, last_notified, nsli";

const COMMENT_COLUMNS: &str = "zid, tid, pid, uid, txt, mod, active, is_meta, is_seed, anon, velocity, \
     lang, lang_confidence, quote_txt, quote_src_url, created";

const VOTE_COLUMNS: &str = "zid, pid, tid, vote, weight_x_32767, high_priority, created";

/// Visible in the conversation's moderation mode; `$mode` is the strict flag.
fn visible(alias: &str, mode: &str) -> String {
    format!("{alias}.active AND (CASE WHEN {mode} THEN {alias}.mod = 1 ELSE {alias}.mod <> -1 END)")
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(db_err)?;
        info!(max_connections, "connected to postgres");
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|err| StoreError::Unavailable(format!("migration failed: {err}")))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Classify driver errors; the services rely on unique violations being recognizable.
fn db_err(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return StoreError::UniqueViolation(db.constraint().unwrap_or("unique").to_string());
        }
        // serialization_failure, deadlock_detected, lock_not_available
        if matches!(db.code().as_deref(), Some("40001" | "40P01" | "55P03")) {
            return StoreError::Contention(db.message().to_string());
        }
    }
    match err {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            StoreError::Corrupt(err.to_string())
        }
        other => StoreError::Unavailable(other.to_string()),
    }
}

fn col<'r, T>(row: &'r PgRow, name: &str) -> StoreResult<T>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(name).map_err(db_err)
}

fn conversation_from_row(row: &PgRow) -> StoreResult<Conversation> {
    Ok(Conversation {
        id: ConversationId(col(row, "zid")?),
        token: ConversationToken(col(row, "token")?),
        owner: UserId(col(row, "owner")?),
        topic: col(row, "topic")?,
        is_active: col(row, "is_active")?,
        is_archived: col(row, "is_archived")?,
        strict_moderation: col(row, "strict_moderation")?,
        profanity_filter: col(row, "profanity_filter")?,
        spam_filter: col(row, "spam_filter")?,
        auth_needed_to_vote: col(row, "auth_needed_to_vote")?,
        created: col(row, "created")?,
        modified: col(row, "modified")?,
    })
}

fn participant_from_row(row: &PgRow) -> StoreResult<Participant> {
    Ok(Participant {
        conversation: ConversationId(col(row, "zid")?),
        pid: Pid(col(row, "pid")?),
        uid: UserId(col(row, "uid")?),
        created: col(row, "created")?,
        last_interaction: col(row, "last_interaction")?,
        muted: col(row, "muted")?,
        subscribed: col(row, "subscribed")?,
        vote_count: col(row, "vote_count")?,
        last_notified: col(row, "last_notified")?,
        notifications_since_interaction: col(row, "nsli")?,
    })
}

fn comment_from_row(row: &PgRow) -> StoreResult<Comment> {
    let raw_mod: i16 = col(row, "mod")?;
    let moderation = ModerationStatus::from_i16(raw_mod)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown moderation status {raw_mod}")))?;
    let quote = match (col::<Option<String>>(row, "quote_txt")?, col::<Option<String>>(row, "quote_src_url")?) {
        (Some(text), Some(source_url)) => Some(Quote { text, source_url }),
        _ => None,
    };
    Ok(Comment {
        conversation: ConversationId(col(row, "zid")?),
        tid: Tid(col(row, "tid")?),
        author: UserId(col(row, "uid")?),
        pid: Pid(col(row, "pid")?),
        text: col(row, "txt")?,
        moderation,
        active: col(row, "active")?,
        is_meta: col(row, "is_meta")?,
        is_seed: col(row, "is_seed")?,
        anon: col(row, "anon")?,
        velocity: col(row, "velocity")?,
        lang: col(row, "lang")?,
        lang_confidence: col(row, "lang_confidence")?,
        quote,
        created: col(row, "created")?,
    })
}

fn vote_from_row(row: &PgRow) -> StoreResult<VoteRecord> {
    let raw_vote: i16 = col(row, "vote")?;
    let value = VoteValue::from_i16(raw_vote)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown vote value {raw_vote}")))?;
    Ok(VoteRecord {
        conversation: ConversationId(col(row, "zid")?),
        pid: Pid(col(row, "pid")?),
        tid: Tid(col(row, "tid")?),
        value,
        weight: VoteWeight::from_raw(col(row, "weight_x_32767")?),
        high_priority: col(row, "high_priority")?,
        created: col(row, "created")?,
    })
}

fn snapshot_from_row(row: &PgRow) -> StoreResult<RawSnapshot> {
    Ok(RawSnapshot {
        conversation: ConversationId(col(row, "zid")?),
        math_tick: col(row, "math_tick")?,
        caching_tick: col(row, "caching_tick")?,
        data: col(row, "data")?,
    })
}

#[async_trait]
impl ConversationRepo for PgStore {
    async fn find_by_id(&self, id: ConversationId) -> StoreResult<Option<Conversation>> {
        let sql = format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE zid = $1");
        sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(conversation_from_row)
            .transpose()
    }

    async fn find_by_token(&self, token: &ConversationToken) -> StoreResult<Option<Conversation>> {
        let sql = format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE token = $1");
        sqlx::query(&sql)
            .bind(&token.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(conversation_from_row)
            .transpose()
    }

    async fn is_moderator(&self, id: ConversationId, uid: UserId) -> StoreResult<bool> {
        sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM conversations WHERE zid = $1 AND owner = $2)
                 OR EXISTS (SELECT 1 FROM moderators WHERE zid = $1 AND uid = $2)",
        )
        .bind(id.0)
        .bind(uid.0)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn moderator_emails(&self, id: ConversationId) -> StoreResult<Vec<String>> {
        sqlx::query_scalar(
            "SELECT DISTINCT u.email
               FROM users u
              WHERE u.email IS NOT NULL
                AND (u.uid IN (SELECT uid FROM moderators WHERE zid = $1)
                     OR u.uid = (SELECT owner FROM conversations WHERE zid = $1))
              ORDER BY u.email",
        )
        .bind(id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn touch_modified(&self, id: ConversationId, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE conversations SET modified = $2 WHERE zid = $1 AND modified < $2")
            .bind(id.0)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_active(&self, id: ConversationId, active: bool) -> StoreResult<()> {
        sqlx::query("UPDATE conversations SET is_active = $2 WHERE zid = $1")
            .bind(id.0)
            .bind(active)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl IdentityRepo for PgStore {
    async fn has_social_identity(&self, uid: UserId) -> StoreResult<bool> {
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM social_identities WHERE uid = $1)")
            .bind(uid.0)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)
    }
}

#[async_trait]
impl ParticipantRepo for PgStore {
    async fn find(&self, conversation: ConversationId, uid: UserId) -> StoreResult<Option<Participant>> {
        let sql = format!("SELECT {PARTICIPANT_COLUMNS} FROM participants WHERE zid = $1 AND uid = $2");
        sqlx::query(&sql)
            .bind(conversation.0)
            .bind(uid.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(participant_from_row)
            .transpose()
    }

    async fn find_by_pid(&self, conversation: ConversationId, pid: Pid) -> StoreResult<Option<Participant>> {
        let sql = format!("SELECT {PARTICIPANT_COLUMNS} FROM participants WHERE zid = $1 AND pid = $2");
        sqlx::query(&sql)
            .bind(conversation.0)
            .bind(pid.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(participant_from_row)
            .transpose()
    }

    async fn insert(&self, conversation: ConversationId, uid: UserId, at: DateTime<Utc>) -> StoreResult<Participant> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query("SELECT pg_advisory_xact_lock($1, $2)")
            .bind(JOIN_LOCK)
            .bind(conversation.0)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let sql = format!(
            "INSERT INTO participants (zid, pid, uid, created, last_interaction)
             SELECT $1, COALESCE(MAX(pid) + 1, 0), $2, $3, $3 FROM participants WHERE zid = $1
             RETURNING {PARTICIPANT_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(conversation.0)
            .bind(uid.0)
            .bind(at)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
        let participant = participant_from_row(&row)?;

        tx.commit().await.map_err(db_err)?;
        debug!(conversation = %conversation, pid = %participant.pid, "participant inserted");
        Ok(participant)
    }

    async fn record_join_metadata(&self, conversation: ConversationId, pid: Pid, metadata: JoinMetadata) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO participant_metadata (zid, pid, referrer, parent_url, geo)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (zid, pid) DO NOTHING",
        )
        .bind(conversation.0)
        .bind(pid.0)
        .bind(metadata.referrer)
        .bind(metadata.parent_url)
        .bind(metadata.geo.map(Json::<GeoInfo>))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn record_vote_activity(&self, conversation: ConversationId, pid: Pid, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            "UPDATE participants
                SET vote_count = (SELECT COUNT(DISTINCT tid) FROM votes WHERE zid = $1 AND pid = $2),
                    last_interaction = GREATEST(last_interaction, $3),
                    nsli = 0
              WHERE zid = $1 AND pid = $2",
        )
        .bind(conversation.0)
        .bind(pid.0)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn set_subscription(&self, conversation: ConversationId, pid: Pid, subscribed: bool) -> StoreResult<()> {
        sqlx::query("UPDATE participants SET subscribed = $3 WHERE zid = $1 AND pid = $2")
            .bind(conversation.0)
            .bind(pid.0)
            .bind(subscribed)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl VoteRepo for PgStore {
    async fn insert(&self, vote: NewVote) -> StoreResult<VoteRecord> {
        let sql = format!(
            "INSERT INTO votes (zid, pid, tid, vote, weight_x_32767, high_priority, created)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING {VOTE_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(vote.conversation.0)
            .bind(vote.pid.0)
            .bind(vote.tid.0)
            .bind(vote.value.as_i16())
            .bind(vote.weight.raw())
            .bind(vote.high_priority)
            .bind(vote.created)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        vote_from_row(&row)
    }

    async fn latest(&self, conversation: ConversationId, filter: VoteFilter) -> StoreResult<Vec<VoteRecord>> {
        let sql = format!(
            "SELECT {VOTE_COLUMNS} FROM votes_latest_unique
              WHERE zid = $1
                AND ($2::integer IS NULL OR pid = $2)
                AND ($3::integer IS NULL OR tid = $3)
              ORDER BY pid, tid"
        );
        sqlx::query(&sql)
            .bind(conversation.0)
            .bind(filter.pid.map(|p| p.0))
            .bind(filter.tid.map(|t| t.0))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?
            .iter()
            .map(vote_from_row)
            .collect()
    }

    async fn history(&self, conversation: ConversationId, filter: VoteFilter) -> StoreResult<Vec<VoteRecord>> {
        let sql = format!(
            "SELECT {VOTE_COLUMNS} FROM votes
              WHERE zid = $1
                AND ($2::integer IS NULL OR pid = $2)
                AND ($3::integer IS NULL OR tid = $3)
              ORDER BY id"
        );
        sqlx::query(&sql)
            .bind(conversation.0)
            .bind(filter.pid.map(|p| p.0))
            .bind(filter.tid.map(|t| t.0))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?
            .iter()
            .map(vote_from_row)
            .collect()
    }
}

#[async_trait]
impl CommentRepo for PgStore {
    async fn text_exists(&self, conversation: ConversationId, text: &str) -> StoreResult<bool> {
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM comments WHERE zid = $1 AND txt = $2)")
            .bind(conversation.0)
            .bind(text)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn insert(&self, comment: NewComment) -> StoreResult<Comment> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query("SELECT pg_advisory_xact_lock($1, $2)")
            .bind(COMMENT_LOCK)
            .bind(comment.conversation.0)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let (quote_txt, quote_src_url) = match comment.quote {
            Some(quote) => (Some(quote.text), Some(quote.source_url)),
            None => (None, None),
        };
        let sql = format!(
            "INSERT INTO comments (zid, tid, pid, uid, txt, mod, active, is_seed, anon,
                                   lang, lang_confidence, quote_txt, quote_src_url, created)
             SELECT $1, COALESCE(MAX(tid) + 1, 0), $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13
               FROM comments WHERE zid = $1
             RETURNING {COMMENT_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(comment.conversation.0)
            .bind(comment.pid.0)
            .bind(comment.author.0)
            .bind(comment.text)
            .bind(comment.moderation.as_i16())
            .bind(comment.active)
            .bind(comment.is_seed)
            .bind(comment.anon)
            .bind(comment.lang)
            .bind(comment.lang_confidence)
            .bind(quote_txt)
            .bind(quote_src_url)
            .bind(comment.created)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
        let stored = comment_from_row(&row)?;

        tx.commit().await.map_err(db_err)?;
        Ok(stored)
    }

    async fn find(&self, conversation: ConversationId, tid: Tid) -> StoreResult<Option<Comment>> {
        let sql = format!("SELECT {COMMENT_COLUMNS} FROM comments WHERE zid = $1 AND tid = $2");
        sqlx::query(&sql)
            .bind(conversation.0)
            .bind(tid.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(comment_from_row)
            .transpose()
    }

    async fn candidates(&self, query: &CandidateQuery) -> StoreResult<Vec<Comment>> {
        let sql = format!(
            "SELECT {COMMENT_COLUMNS} FROM comments c
              WHERE c.zid = $1
                AND {visible}
                AND NOT (c.tid = ANY($3))
                AND ($4::integer IS NULL
                     OR NOT EXISTS (SELECT 1 FROM votes v WHERE v.zid = c.zid AND v.tid = c.tid AND v.pid = $4))
                AND (NOT $5 OR EXISTS (SELECT 1 FROM social_identities s WHERE s.uid = c.uid))
              ORDER BY c.tid",
            visible = visible("c", "$2"),
        );
        let exclude: Vec<i32> = query.exclude.iter().map(|t| t.0).collect();
        sqlx::query(&sql)
            .bind(query.conversation.0)
            .bind(query.strict_moderation)
            .bind(exclude)
            .bind(query.unvoted_by.map(|p| p.0))
            .bind(query.social_authors_only)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?
            .iter()
            .map(comment_from_row)
            .collect()
    }

    async fn counts(&self, conversation: ConversationId, pid: Option<Pid>, strict_moderation: bool) -> StoreResult<Option<CommentCounts>> {
        let sql = format!(
            "SELECT COUNT(*) AS all_comments,
                    COUNT(*) FILTER (WHERE {visible}) AS total,
                    COUNT(*) FILTER (WHERE {visible}
                        AND NOT EXISTS (SELECT 1 FROM votes v
                                         WHERE v.zid = c.zid AND v.tid = c.tid AND v.pid = $2)) AS remaining
               FROM comments c
              WHERE c.zid = $1",
            visible = visible("c", "$3"),
        );
        let row = sqlx::query(&sql)
            .bind(conversation.0)
            .bind(pid.map(|p| p.0))
            .bind(strict_moderation)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        let all: i64 = col(&row, "all_comments")?;
        if all == 0 {
            return Ok(None);
        }
        let total: i64 = col(&row, "total")?;
        let remaining: i64 = col(&row, "remaining")?;
        Ok(Some(CommentCounts {
            remaining: remaining.max(0) as u64,
            total: total.max(0) as u64,
        }))
    }

    async fn count_pending_moderation(&self, conversation: ConversationId) -> StoreResult<u64> {
        let pending: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM comments WHERE zid = $1 AND mod = 0 AND NOT active",
        )
        .bind(conversation.0)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(pending.max(0) as u64)
    }

    async fn set_moderation(&self, conversation: ConversationId, tid: Tid, status: ModerationStatus, active: bool) -> StoreResult<Option<Comment>> {
        let sql = format!(
            "UPDATE comments SET mod = $3, active = $4 WHERE zid = $1 AND tid = $2 RETURNING {COMMENT_COLUMNS}"
        );
        sqlx::query(&sql)
            .bind(conversation.0)
            .bind(tid.0)
            .bind(status.as_i16())
            .bind(active)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(comment_from_row)
            .transpose()
    }

    async fn translations(&self, conversation: ConversationId, tid: Tid) -> StoreResult<Vec<Translation>> {
        let rows = sqlx::query(
            "SELECT zid, tid, lang, txt, src FROM comment_translations WHERE zid = $1 AND tid = $2 ORDER BY lang",
        )
        .bind(conversation.0)
        .bind(tid.0)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter()
            .map(|row| {
                Ok(Translation {
                    conversation: ConversationId(col(row, "zid")?),
                    tid: Tid(col(row, "tid")?),
                    lang: col(row, "lang")?,
                    text: col(row, "txt")?,
                    source: col(row, "src")?,
                })
            })
            .collect()
    }

    async fn store_translation(&self, translation: Translation) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO comment_translations (zid, tid, lang, txt, src)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (zid, tid, lang) DO UPDATE SET txt = EXCLUDED.txt, src = EXCLUDED.src",
        )
        .bind(translation.conversation.0)
        .bind(translation.tid.0)
        .bind(translation.lang)
        .bind(translation.text)
        .bind(translation.source)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl MathRepo for PgStore {
    async fn latest(&self, conversation: ConversationId) -> StoreResult<Option<RawSnapshot>> {
        sqlx::query("SELECT zid, math_tick, caching_tick, data FROM math_main WHERE zid = $1")
            .bind(conversation.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(snapshot_from_row)
            .transpose()
    }

    async fn since(&self, after: i64, limit: i64) -> StoreResult<Vec<RawSnapshot>> {
        sqlx::query(
            "SELECT zid, math_tick, caching_tick, data FROM math_main
              WHERE caching_tick > $1 ORDER BY caching_tick LIMIT $2",
        )
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?
        .iter()
        .map(snapshot_from_row)
        .collect()
    }
}

#[async_trait]
impl NotificationRepo for PgStore {
    async fn enqueue(&self, conversation: ConversationId, due: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO notification_tasks (zid, due) VALUES ($1, $2)
             ON CONFLICT (zid) DO UPDATE SET due = LEAST(notification_tasks.due, EXCLUDED.due)",
        )
        .bind(conversation.0)
        .bind(due)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> StoreResult<Option<ConversationId>> {
        let claimed: Option<i32> = sqlx::query_scalar(
            "DELETE FROM notification_tasks
              WHERE zid = (SELECT zid FROM notification_tasks
                            WHERE due <= $1
                            ORDER BY due, zid
                            LIMIT 1
                            FOR UPDATE SKIP LOCKED)
             RETURNING zid",
        )
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(claimed.map(ConversationId))
    }

    async fn subscribers(&self, conversation: ConversationId) -> StoreResult<Vec<SubscriberStatus>> {
        let sql = format!(
            "SELECT p.pid, p.uid, u.email, p.last_interaction, p.last_notified, p.nsli,
                    (SELECT COUNT(*) FROM comments c
                      WHERE c.zid = p.zid
                        AND {visible}
                        AND NOT EXISTS (SELECT 1 FROM votes v
                                         WHERE v.zid = c.zid AND v.tid = c.tid AND v.pid = p.pid)) AS remaining
               FROM participants p
               JOIN conversations conv ON conv.zid = p.zid
               LEFT JOIN users u ON u.uid = p.uid
              WHERE p.zid = $1 AND p.subscribed
              ORDER BY p.pid",
            visible = visible("c", "conv.strict_moderation"),
        );
        let rows = sqlx::query(&sql)
            .bind(conversation.0)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter()
            .map(|row| {
                let remaining: i64 = col(row, "remaining")?;
                Ok(SubscriberStatus {
                    pid: Pid(col(row, "pid")?),
                    uid: UserId(col(row, "uid")?),
                    email: col(row, "email")?,
                    remaining: remaining.max(0) as u64,
                    last_interaction: col(row, "last_interaction")?,
                    last_notified: col(row, "last_notified")?,
                    notifications_since_interaction: col(row, "nsli")?,
                })
            })
            .collect()
    }

    async fn mark_notified(&self, conversation: ConversationId, pid: Pid, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            "UPDATE participants SET last_notified = $3, nsli = nsli + 1 WHERE zid = $1 AND pid = $2",
        )
        .bind(conversation.0)
        .bind(pid.0)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}
