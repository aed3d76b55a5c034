//! # Vote ledger
//!
//! Votes are append-only. Re-voting on a comment adds a new row and the latest one wins in the
//! store's latest-unique view; only a byte-identical row hitting the unique key inside the same
//! millisecond is reported as [`DomainError::DuplicateVote`].

use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use domains::{
    Clock, ConversationId, ConversationRepo, DomainError, IdentityRepo, NewVote, ParticipantRepo,
    Pid, StoreError, Tid, UserId, VoteFilter, VoteRecord, VoteRepo, VoteValue, VoteWeight,
};
use tracing::{debug, warn};

type Result<T> = std::result::Result<T, DomainError>;

#[derive(Debug, Clone, PartialEq)]
pub struct CastVote {
    pub conversation: ConversationId,
    pub uid: UserId,
    pub pid: Pid,
    pub tid: Tid,
    pub value: VoteValue,
    /// In [-1, 1]; 0 for an ordinary vote.
    pub weight: f32,
    pub high_priority: bool,
}

pub struct VoteService {
    conversations: Arc<dyn ConversationRepo>,
    identities: Arc<dyn IdentityRepo>,
    participants: Arc<dyn ParticipantRepo>,
    votes: Arc<dyn VoteRepo>,
    clock: Arc<dyn Clock>,
}

impl VoteService {
    pub fn new(
        conversations: Arc<dyn ConversationRepo>,
        identities: Arc<dyn IdentityRepo>,
        participants: Arc<dyn ParticipantRepo>,
        votes: Arc<dyn VoteRepo>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            conversations,
            identities,
            participants,
            votes,
            clock,
        }
    }

    pub async fn cast_vote(&self, request: CastVote) -> Result<VoteRecord> {
        let conversation = self
            .conversations
            .find_by_id(request.conversation)
            .await?
            .ok_or_else(|| DomainError::not_found("conversation", request.conversation))?;

        if !conversation.is_active {
            return Err(DomainError::ConversationClosed);
        }

        if conversation.auth_needed_to_vote
            && !self
                .conversations
                .is_moderator(conversation.id, request.uid)
                .await?
            && !self.identities.has_social_identity(request.uid).await?
        {
            return Err(DomainError::SocialIdentityRequired);
        }

        let weight = VoteWeight::from_f32(request.weight)?;
        let vote = NewVote {
            conversation: conversation.id,
            pid: request.pid,
            tid: request.tid,
            value: request.value,
            weight,
            high_priority: request.high_priority,
            created: to_millis(self.clock.now()),
        };

        let record = match self.votes.insert(vote).await {
            Ok(record) => record,
            Err(StoreError::UniqueViolation(detail)) => {
                debug!(conversation = %conversation.id, pid = %request.pid, tid = %request.tid, %detail, "duplicate vote");
                return Err(DomainError::DuplicateVote);
            }
            Err(err) => return Err(err.into()),
        };

        self.after_vote(&record);
        Ok(record)
    }

    /// Rows of the store's latest-unique view, optionally narrowed to one participant or comment.
    pub async fn latest_votes_for(
        &self,
        conversation: ConversationId,
        filter: VoteFilter,
    ) -> Result<Vec<VoteRecord>> {
        Ok(self.votes.latest(conversation, filter).await?)
    }

    /// Every vote row ever written, superseded ones included.
    pub async fn vote_history(
        &self,
        conversation: ConversationId,
        filter: VoteFilter,
    ) -> Result<Vec<VoteRecord>> {
        Ok(self.votes.history(conversation, filter).await?)
    }

    /// Bump the conversation's modified time and the participant's counters without holding up
    /// the response.
    fn after_vote(&self, record: &VoteRecord) {
        let conversations = Arc::clone(&self.conversations);
        let participants = Arc::clone(&self.participants);
        let (conversation, pid, at) = (record.conversation, record.pid, record.created);
        tokio::spawn(async move {
            if let Err(err) = conversations.touch_modified(conversation, at).await {
                warn!(conversation = %conversation, error = %err, "failed to bump conversation modified time");
            }
            if let Err(err) = participants.record_vote_activity(conversation, pid, at).await {
                warn!(conversation = %conversation, pid = %pid, error = %err, "failed to update participant vote count");
            }
        });
    }
}

/// The ledger's unique key uses millisecond resolution.
pub(crate) fn to_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_nanosecond(at.nanosecond() / 1_000_000 * 1_000_000)
        .unwrap_or(at)
}
