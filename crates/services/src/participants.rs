//! # Participants
//!
//! Maps a user to their stable per-conversation pid and creates the participant row on first
//! contact. First-join is racy by nature (two tabs, a vote and a comment fired together); the
//! store's unique constraint on (conversation, uid) decides the winner and the loser re-reads.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

use domains::{
    Clock, ConversationId, DomainError, GeoLocator, JoinContext, JoinMetadata, Participant,
    ParticipantRepo, Pid, StoreError, UserId,
};
use lru::LruCache;
use tracing::{debug, error, info, warn};

type Result<T> = std::result::Result<T, DomainError>;

#[derive(Debug, Clone)]
pub struct ParticipantOptions {
    /// Upper bound on cached (conversation, uid) → pid entries.
    pub cache_capacity: usize,
    /// Extra insert-then-reread rounds after the first one.
    pub join_retries: u32,
}

impl Default for ParticipantOptions {
    fn default() -> Self {
        Self {
            cache_capacity: 5000,
            join_retries: 9,
        }
    }
}

pub struct ParticipantService {
    participants: Arc<dyn ParticipantRepo>,
    geo: Arc<dyn GeoLocator>,
    clock: Arc<dyn Clock>,
    pid_cache: Mutex<LruCache<(ConversationId, UserId), Pid>>,
    join_retries: u32,
}

impl ParticipantService {
    pub fn new(
        participants: Arc<dyn ParticipantRepo>,
        geo: Arc<dyn GeoLocator>,
        clock: Arc<dyn Clock>,
        options: ParticipantOptions,
    ) -> Self {
        let capacity = NonZeroUsize::new(options.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            participants,
            geo,
            clock,
            pid_cache: Mutex::new(LruCache::new(capacity)),
            join_retries: options.join_retries,
        }
    }

    /// Look up the pid of `uid` in `conversation` without creating anything.
    pub async fn resolve_pid(&self, conversation: ConversationId, uid: UserId) -> Result<Option<Pid>> {
        if let Some(pid) = self.cached(conversation, uid) {
            return Ok(Some(pid));
        }
        let found = self.participants.find(conversation, uid).await?;
        if let Some(participant) = &found {
            self.remember(participant);
        }
        Ok(found.map(|p| p.pid))
    }

    /// Like [`resolve_pid`](Self::resolve_pid) but a miss is an error.
    pub async fn require_pid(&self, conversation: ConversationId, uid: UserId) -> Result<Pid> {
        self.resolve_pid(conversation, uid)
            .await?
            .ok_or_else(|| DomainError::not_found("participant", format!("{conversation}/{uid}")))
    }

    /// Idempotent join: return the existing participant or create one.
    ///
    /// Losing the insert race (unique violation) or hitting the first-join lock (contention)
    /// triggers an immediate re-read and another attempt, up to `join_retries` extra rounds.
    pub async fn ensure_participant(
        &self,
        conversation: ConversationId,
        uid: UserId,
        context: JoinContext,
    ) -> Result<Participant> {
        let attempts = self.join_retries + 1;
        for attempt in 1..=attempts {
            if let Some(existing) = self.participants.find(conversation, uid).await? {
                self.remember(&existing);
                return Ok(existing);
            }

            match self.participants.insert(conversation, uid, self.clock.now()).await {
                Ok(created) => {
                    info!(conversation = %conversation, uid = %uid, pid = %created.pid, "participant joined");
                    self.remember(&created);
                    self.record_join_metadata(conversation, created.pid, context);
                    return Ok(created);
                }
                Err(StoreError::UniqueViolation(detail)) | Err(StoreError::Contention(detail)) => {
                    debug!(conversation = %conversation, uid = %uid, attempt, %detail, "join raced; retrying");
                }
                Err(other) => return Err(other.into()),
            }
        }

        error!(conversation = %conversation, uid = %uid, attempts, "join retries exhausted");
        Err(DomainError::JoinExhausted { attempts })
    }

    pub async fn participant(&self, conversation: ConversationId, pid: Pid) -> Result<Option<Participant>> {
        Ok(self.participants.find_by_pid(conversation, pid).await?)
    }

    pub async fn set_subscription(
        &self,
        conversation: ConversationId,
        pid: Pid,
        subscribed: bool,
    ) -> Result<()> {
        if self.participants.find_by_pid(conversation, pid).await?.is_none() {
            return Err(DomainError::not_found("participant", format!("{conversation}/{pid}")));
        }
        self.participants
            .set_subscription(conversation, pid, subscribed)
            .await?;
        Ok(())
    }

    fn cached(&self, conversation: ConversationId, uid: UserId) -> Option<Pid> {
        self.pid_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(conversation, uid))
            .copied()
    }

    fn remember(&self, participant: &Participant) {
        self.pid_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put((participant.conversation, participant.uid), participant.pid);
    }

    /// Referrer, parent page and geo lookup are recorded off the request path.
    fn record_join_metadata(&self, conversation: ConversationId, pid: Pid, context: JoinContext) {
        let participants = Arc::clone(&self.participants);
        let geo = Arc::clone(&self.geo);
        tokio::spawn(async move {
            let location = match context.ip.as_deref() {
                Some(ip) => match geo.locate(ip).await {
                    Ok(location) => location,
                    Err(err) => {
                        warn!(conversation = %conversation, pid = %pid, error = %err, "geo lookup failed");
                        None
                    }
                },
                None => None,
            };
            let metadata = JoinMetadata {
                referrer: context.referrer,
                parent_url: context.parent_url,
                geo: location,
            };
            if let Err(err) = participants
                .record_join_metadata(conversation, pid, metadata)
                .await
            {
                warn!(conversation = %conversation, pid = %pid, error = %err, "failed to record join metadata");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use domains::{MockGeoLocator, MockParticipantRepo, SystemClock};
    use mockall::predicate::eq;

    const ZID: ConversationId = ConversationId(7);
    const UID: UserId = UserId(42);

    fn participant(pid: i32) -> Participant {
        Participant {
            conversation: ZID,
            pid: Pid(pid),
            uid: UID,
            created: Utc::now(),
            last_interaction: Utc::now(),
            muted: false,
            subscribed: false,
            vote_count: 0,
            last_notified: None,
            notifications_since_interaction: 0,
        }
    }

    fn service(repo: MockParticipantRepo) -> ParticipantService {
        let mut geo = MockGeoLocator::new();
        geo.expect_locate().returning(|_| Ok(None));
        ParticipantService::new(
            Arc::new(repo),
            Arc::new(geo),
            Arc::new(SystemClock),
            ParticipantOptions::default(),
        )
    }

    #[tokio::test]
    async fn lost_race_rereads_the_winner() {
        let mut repo = MockParticipantRepo::new();
        let mut seq = mockall::Sequence::new();
        repo.expect_find()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(None));
        repo.expect_insert()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Err(StoreError::UniqueViolation("participants_zid_uid_key".into())));
        repo.expect_find()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(Some(participant(3))));

        let svc = service(repo);
        let joined = svc.ensure_participant(ZID, UID, JoinContext::default()).await.unwrap();
        assert_eq!(joined.pid, Pid(3));
        // Served from the cache, the mock would panic on a further find().
        assert_eq!(svc.resolve_pid(ZID, UID).await.unwrap(), Some(Pid(3)));
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let mut repo = MockParticipantRepo::new();
        repo.expect_find().times(10).returning(|_, _| Ok(None));
        repo.expect_insert()
            .times(10)
            .returning(|_, _, _| Err(StoreError::Contention("advisory lock".into())));

        let err = service(repo)
            .ensure_participant(ZID, UID, JoinContext::default())
            .await
            .unwrap_err();
        assert_eq!(err, DomainError::JoinExhausted { attempts: 10 });
    }

    #[tokio::test]
    async fn store_outage_is_not_retried() {
        let mut repo = MockParticipantRepo::new();
        repo.expect_find().times(1).returning(|_, _| Ok(None));
        repo.expect_insert()
            .times(1)
            .returning(|_, _, _| Err(StoreError::Unavailable("pool timed out".into())));

        let err = service(repo)
            .ensure_participant(ZID, UID, JoinContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Store(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn resolve_never_creates() {
        let mut repo = MockParticipantRepo::new();
        repo.expect_find()
            .with(eq(ZID), eq(UID))
            .times(1)
            .returning(|_, _| Ok(None));
        repo.expect_insert().never();

        let svc = service(repo);
        assert_eq!(svc.resolve_pid(ZID, UID).await.unwrap(), None);
    }

    #[tokio::test]
    async fn metadata_failure_does_not_fail_the_join() {
        let mut repo = MockParticipantRepo::new();
        repo.expect_find().returning(|_, _| Ok(None));
        repo.expect_insert().returning(|_, _, _| Ok(participant(0)));
        repo.expect_record_join_metadata()
            .returning(|_, _, _| Err(StoreError::Unavailable("down".into())));

        let context = JoinContext {
            ip: Some("203.0.113.9".into()),
            ..JoinContext::default()
        };
        let joined = service(repo).ensure_participant(ZID, UID, context).await.unwrap();
        assert_eq!(joined.pid, Pid(0));
    }
}
