//! Wire shapes of the HTTP API. Every response that acts on behalf of a caller carries the
//! caller's `pid` so clients never have to look it up separately.

use chrono::{DateTime, Utc};
use domains::{
    Comment, ModerationStatus, Participant, Pid, Tid, Translation, VoteRecord, VoteValue,
};
use serde::{Deserialize, Serialize};
use services::{ImplicitVote, NextComment, SubmittedComment};

use crate::error::ApiError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinRequest {
    pub referrer: Option<String>,
    pub parent_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantResponse {
    pub pid: Pid,
    pub subscribed: bool,
    pub vote_count: i32,
    pub created: DateTime<Utc>,
}

impl From<Participant> for ParticipantResponse {
    fn from(participant: Participant) -> Self {
        Self {
            pid: participant.pid,
            subscribed: participant.subscribed,
            vote_count: participant.vote_count,
            created: participant.created,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub subscribed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub tid: Tid,
    pub vote: VoteValue,
    #[serde(default)]
    pub weight: f32,
    #[serde(default)]
    pub high_priority: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub pid: Pid,
    pub vote: VoteRecord,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VotesQuery {
    pub pid: Option<i32>,
    pub tid: Option<i32>,
    /// Include superseded rows.
    pub history: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VotesResponse {
    pub pid: Option<Pid>,
    pub votes: Vec<VoteRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommentRequest {
    pub text: String,
    pub quote_text: Option<String>,
    pub quote_source_url: Option<String>,
    pub is_seed: bool,
    pub anon: bool,
    /// The author's own vote on the new comment.
    pub vote: Option<VoteValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImplicitVoteOutcome {
    NotRequested,
    Recorded,
    Duplicate,
    Failed,
}

impl From<&ImplicitVote> for ImplicitVoteOutcome {
    fn from(vote: &ImplicitVote) -> Self {
        match vote {
            ImplicitVote::NotRequested => ImplicitVoteOutcome::NotRequested,
            ImplicitVote::Recorded(_) => ImplicitVoteOutcome::Recorded,
            ImplicitVote::Duplicate => ImplicitVoteOutcome::Duplicate,
            ImplicitVote::Failed(_) => ImplicitVoteOutcome::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentResponse {
    pub pid: Pid,
    pub tid: Tid,
    pub moderation: ModerationStatus,
    pub active: bool,
    pub implicit_vote: ImplicitVoteOutcome,
}

impl From<SubmittedComment> for CommentResponse {
    fn from(submitted: SubmittedComment) -> Self {
        Self {
            pid: submitted.pid,
            tid: submitted.comment.tid,
            moderation: submitted.comment.moderation,
            active: submitted.comment.active,
            implicit_vote: ImplicitVoteOutcome::from(&submitted.implicit_vote),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationRequest {
    pub status: ModerationStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationResponse {
    pub tid: Tid,
    pub moderation: ModerationStatus,
    pub active: bool,
}

impl From<Comment> for ModerationResponse {
    fn from(comment: Comment) -> Self {
        Self {
            tid: comment.tid,
            moderation: comment.moderation,
            active: comment.active,
        }
    }
}

/// A comment as shown to voters. The author is omitted for anonymous comments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentView {
    pub tid: Tid,
    pub text: String,
    pub pid: Option<Pid>,
    pub lang: Option<String>,
    pub quote_text: Option<String>,
    pub quote_source_url: Option<String>,
    pub is_seed: bool,
    pub created: DateTime<Utc>,
}

impl From<Comment> for CommentView {
    fn from(comment: Comment) -> Self {
        let (quote_text, quote_source_url) = match comment.quote {
            Some(quote) => (Some(quote.text), Some(quote.source_url)),
            None => (None, None),
        };
        Self {
            tid: comment.tid,
            text: comment.text,
            pid: (!comment.anon).then_some(comment.pid),
            lang: comment.lang,
            quote_text,
            quote_source_url,
            is_seed: comment.is_seed,
            created: comment.created,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NextCommentQuery {
    /// Comma separated tids to skip.
    pub without: Option<String>,
    pub social_only: bool,
    pub lang: Option<String>,
}

impl NextCommentQuery {
    pub fn excluded(&self) -> Result<Vec<Tid>, ApiError> {
        let Some(raw) = self.without.as_deref() else {
            return Ok(Vec::new());
        };
        raw.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<i32>()
                    .map(Tid)
                    .map_err(|_| ApiError::BadRequest(format!("invalid tid in `without`: {part}")))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextCommentResponse {
    pub pid: Option<Pid>,
    pub comment: Option<CommentView>,
    pub translations: Vec<TranslationView>,
    pub remaining: u64,
    pub total: u64,
}

impl NextCommentResponse {
    pub fn new(pid: Option<Pid>, next: NextComment) -> Self {
        Self {
            pid,
            comment: next.comment.map(CommentView::from),
            translations: next.translations.into_iter().map(TranslationView::from).collect(),
            remaining: next.remaining,
            total: next.total,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationView {
    pub lang: String,
    pub text: String,
    pub source: String,
}

impl From<Translation> for TranslationView {
    fn from(translation: Translation) -> Self {
        Self {
            lang: translation.lang,
            text: translation.text,
            source: translation.source,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MathQuery {
    /// Tick the client already has; only newer results are returned.
    pub math_tick: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveRequest {
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationStatus {
    pub token: String,
    pub is_active: bool,
}
