//! # Comment intake
//!
//! Validates, moderates and persists new comments, then runs the follow-ups: moderator mail for
//! comments held back, the participant notification marker for visible ones, and the author's
//! implicit vote.
//!
//! The implicit vote is a second step with its own outcome. Whatever happens to it, a comment
//! that was inserted is reported as created.

use std::sync::Arc;

use domains::{
    Clock, Comment, CommentRepo, Conversation, ConversationId, ConversationRepo, DomainError,
    JoinContext, LanguageDetector, Mailer, ModerationStatus, NewComment, NotificationRepo,
    OutgoingMail, Participant, Pid, Quote, SpamCheckRequest, SpamChecker, StoreError, Tid, UserId,
    VoteRecord, VoteValue,
};
use tracing::{debug, info, warn};

use crate::moderation::BannedWords;
use crate::participants::ParticipantService;
use crate::votes::{CastVote, VoteService};

type Result<T> = std::result::Result<T, DomainError>;

#[derive(Debug, Clone)]
pub struct CommentOptions {
    /// Moderators are mailed once at least this many *other* comments await a decision.
    pub moderator_notify_min_backlog: u64,
    /// Seed comments in conversations up to this id get an implicit "agree" by default.
    pub legacy_seed_vote_cutoff: ConversationId,
    pub mail_from: String,
    /// Public base url used to build conversation links.
    pub base_url: String,
}

impl Default for CommentOptions {
    fn default() -> Self {
        Self {
            moderator_notify_min_backlog: 1,
            legacy_seed_vote_cutoff: ConversationId(17037),
            mail_from: "notifications@localhost".to_string(),
            base_url: "http://localhost:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmitComment {
    pub conversation: ConversationId,
    pub author: UserId,
    /// Known pid of the author, if the client already has one.
    pub pid: Option<Pid>,
    pub text: String,
    pub quote_text: Option<String>,
    pub quote_source_url: Option<String>,
    pub is_seed: bool,
    pub anon: bool,
    /// Author's own vote on the new comment.
    pub vote: Option<VoteValue>,
    pub client: JoinContext,
}

/// What happened to the author's implicit vote.
#[derive(Debug, Clone, PartialEq)]
pub enum ImplicitVote {
    NotRequested,
    Recorded(VoteRecord),
    /// The identical vote already existed.
    Duplicate,
    Failed(DomainError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedComment {
    pub comment: Comment,
    pub pid: Pid,
    pub implicit_vote: ImplicitVote,
}

impl SubmittedComment {
    pub fn tid(&self) -> Tid {
        self.comment.tid
    }
}

pub struct CommentService {
    conversations: Arc<dyn ConversationRepo>,
    comments: Arc<dyn CommentRepo>,
    notifications: Arc<dyn NotificationRepo>,
    participants: Arc<ParticipantService>,
    votes: Arc<VoteService>,
    spam: Arc<dyn SpamChecker>,
    languages: Arc<dyn LanguageDetector>,
    mailer: Arc<dyn Mailer>,
    clock: Arc<dyn Clock>,
    banned: BannedWords,
    options: CommentOptions,
}

impl CommentService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conversations: Arc<dyn ConversationRepo>,
        comments: Arc<dyn CommentRepo>,
        notifications: Arc<dyn NotificationRepo>,
        participants: Arc<ParticipantService>,
        votes: Arc<VoteService>,
        spam: Arc<dyn SpamChecker>,
        languages: Arc<dyn LanguageDetector>,
        mailer: Arc<dyn Mailer>,
        clock: Arc<dyn Clock>,
        banned: BannedWords,
        options: CommentOptions,
    ) -> Self {
        Self {
            conversations,
            comments,
            notifications,
            participants,
            votes,
            spam,
            languages,
            mailer,
            clock,
            banned,
            options,
        }
    }

    pub async fn submit_comment(&self, request: SubmitComment) -> Result<SubmittedComment> {
        let (text, quote) = validate_text(&request)?;

        let conversation = self.load_conversation(request.conversation).await?;
        if self.comments.text_exists(conversation.id, &text).await? {
            return Err(DomainError::DuplicateComment);
        }
        if !conversation.is_active {
            return Err(DomainError::ConversationClosed);
        }

        let is_moderator = self
            .conversations
            .is_moderator(conversation.id, request.author)
            .await?;
        if (quote.is_some() || request.anon) && !is_moderator {
            return Err(DomainError::Forbidden(
                "only moderators may post quotes or anonymous comments".into(),
            ));
        }

        let participant = self.author_participant(&conversation, &request).await?;
        if participant.muted && !is_moderator {
            return Err(DomainError::Forbidden("participant is muted".into()));
        }

        let (moderation, active) = if request.is_seed && is_moderator {
            (ModerationStatus::Accepted, true)
        } else {
            let bad = self.banned.contains_banned_word(&text);
            let spammy = conversation.spam_filter && self.looks_like_spam(&conversation, &request, &text).await;
            let held = (bad && conversation.profanity_filter)
                || (spammy && conversation.spam_filter)
                || conversation.strict_moderation;
            (ModerationStatus::Unmoderated, !held)
        };

        let language = match self.languages.detect(&text).await {
            Ok(detected) => detected,
            Err(err) => {
                warn!(conversation = %conversation.id, error = %err, "language detection failed");
                None
            }
        };

        let now = self.clock.now();
        let comment = match self
            .comments
            .insert(NewComment {
                conversation: conversation.id,
                author: request.author,
                pid: participant.pid,
                text,
                moderation,
                active,
                is_seed: request.is_seed,
                anon: request.anon,
                lang: language.as_ref().map(|l| l.lang.clone()),
                lang_confidence: language.as_ref().map(|l| l.confidence),
                quote,
                created: now,
            })
            .await
        {
            Ok(comment) => comment,
            Err(StoreError::UniqueViolation(detail)) => {
                debug!(conversation = %conversation.id, %detail, "duplicate comment lost the insert race");
                return Err(DomainError::DuplicateComment);
            }
            Err(err) => return Err(err.into()),
        };
        info!(conversation = %conversation.id, tid = %comment.tid, pid = %participant.pid, active, "comment created");

        self.after_comment(&conversation, &comment).await;

        let implicit_vote = match implicit_vote_value(&request, self.options.legacy_seed_vote_cutoff) {
            None => ImplicitVote::NotRequested,
            Some(value) => self.cast_implicit_vote(&conversation, &participant, comment.tid, request.author, value).await,
        };

        Ok(SubmittedComment {
            comment,
            pid: participant.pid,
            implicit_vote,
        })
    }

    /// Moderator decision on an existing comment. Accepting activates it, rejecting hides it.
    pub async fn moderate(
        &self,
        conversation: ConversationId,
        moderator: UserId,
        tid: Tid,
        status: ModerationStatus,
    ) -> Result<Comment> {
        let conversation = self.load_conversation(conversation).await?;
        if !self.conversations.is_moderator(conversation.id, moderator).await? {
            return Err(DomainError::Forbidden("moderator rights required".into()));
        }
        let active = match status {
            ModerationStatus::Accepted => true,
            ModerationStatus::Rejected => false,
            ModerationStatus::Unmoderated => !conversation.strict_moderation,
        };
        let comment = self
            .comments
            .set_moderation(conversation.id, tid, status, active)
            .await?
            .ok_or_else(|| DomainError::not_found("comment", format!("{}/{tid}", conversation.id)))?;
        info!(conversation = %conversation.id, tid = %tid, ?status, "comment moderated");

        if active {
            self.enqueue_notifications(conversation.id).await;
        }
        Ok(comment)
    }

    async fn load_conversation(&self, id: ConversationId) -> Result<Conversation> {
        self.conversations
            .find_by_id(id)
            .await?
            .ok_or_else(|| DomainError::not_found("conversation", id))
    }

    async fn author_participant(&self, conversation: &Conversation, request: &SubmitComment) -> Result<Participant> {
        match request.pid {
            Some(pid) => self
                .participants
                .participant(conversation.id, pid)
                .await?
                .ok_or_else(|| DomainError::not_found("participant", format!("{}/{pid}", conversation.id))),
            None => {
                self.participants
                    .ensure_participant(conversation.id, request.author, request.client.clone())
                    .await
            }
        }
    }

    /// A failing spam service counts as "not spam".
    async fn looks_like_spam(&self, conversation: &Conversation, request: &SubmitComment, text: &str) -> bool {
        let check = SpamCheckRequest {
            text: text.to_string(),
            author: request.author.to_string(),
            permalink: self.conversation_url(conversation),
            ip: request.client.ip.clone(),
            user_agent: request.client.user_agent.clone(),
            referrer: request.client.referrer.clone(),
        };
        match self.spam.is_spam(&check).await {
            Ok(spammy) => spammy,
            Err(err) => {
                warn!(conversation = %conversation.id, error = %err, "spam check failed");
                false
            }
        }
    }

    async fn after_comment(&self, conversation: &Conversation, comment: &Comment) {
        if let Err(err) = self
            .conversations
            .touch_modified(conversation.id, comment.created)
            .await
        {
            warn!(conversation = %conversation.id, error = %err, "failed to bump conversation modified time");
        }

        if comment.active {
            self.enqueue_notifications(conversation.id).await;
        } else {
            self.notify_moderators(conversation.clone(), comment.tid);
        }
    }

    async fn enqueue_notifications(&self, conversation: ConversationId) {
        if let Err(err) = self.notifications.enqueue(conversation, self.clock.now()).await {
            warn!(conversation = %conversation, error = %err, "failed to enqueue participant notifications");
        }
    }

    /// Mail the moderators about held-back comments once a backlog has built up.
    fn notify_moderators(&self, conversation: Conversation, tid: Tid) {
        let comments = Arc::clone(&self.comments);
        let conversations = Arc::clone(&self.conversations);
        let mailer = Arc::clone(&self.mailer);
        let min_backlog = self.options.moderator_notify_min_backlog;
        let from = self.options.mail_from.clone();
        let url = self.conversation_url(&conversation);
        tokio::spawn(async move {
            let pending = match comments.count_pending_moderation(conversation.id).await {
                Ok(pending) => pending,
                Err(err) => {
                    warn!(conversation = %conversation.id, error = %err, "failed to count pending comments");
                    return;
                }
            };
            let others = pending.saturating_sub(1);
            if others < min_backlog {
                debug!(conversation = %conversation.id, tid = %tid, pending, "moderation backlog below threshold");
                return;
            }
            let recipients = match conversations.moderator_emails(conversation.id).await {
                Ok(recipients) => recipients,
                Err(err) => {
                    warn!(conversation = %conversation.id, error = %err, "failed to load moderator emails");
                    return;
                }
            };
            for to in recipients {
                let mail = OutgoingMail {
                    from: from.clone(),
                    to,
                    subject: format!("{pending} statements are waiting for moderation"),
                    body: format!(
                        "New statements were submitted and need a moderation decision.\n\nReview them at {url}/moderate\n"
                    ),
                };
                if let Err(err) = mailer.send(&mail).await {
                    warn!(conversation = %conversation.id, to = %mail.to, error = %err, "moderator mail failed");
                }
            }
        });
    }

    async fn cast_implicit_vote(
        &self,
        conversation: &Conversation,
        participant: &Participant,
        tid: Tid,
        author: UserId,
        value: VoteValue,
    ) -> ImplicitVote {
        let outcome = self
            .votes
            .cast_vote(CastVote {
                conversation: conversation.id,
                uid: author,
                pid: participant.pid,
                tid,
                value,
                weight: 0.0,
                high_priority: false,
            })
            .await;
        match outcome {
            Ok(record) => ImplicitVote::Recorded(record),
            Err(DomainError::DuplicateVote) => ImplicitVote::Duplicate,
            Err(err) => {
                warn!(conversation = %conversation.id, tid = %tid, error = %err, "implicit vote failed");
                ImplicitVote::Failed(err)
            }
        }
    }

    fn conversation_url(&self, conversation: &Conversation) -> String {
        format!("{}/{}", self.options.base_url.trim_end_matches('/'), conversation.token)
    }
}

/// Returns the text to store and the quote, if any. Checks run in a fixed order and the first
/// failure wins.
fn validate_text(request: &SubmitComment) -> Result<(String, Option<Quote>)> {
    let text = request.text.trim();
    let quote_text = request
        .quote_text
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty());

    if text.is_empty() && quote_text.is_none() {
        return Err(DomainError::MissingText);
    }

    let quote = match quote_text {
        None => None,
        Some(quote_text) => {
            let source_url = request
                .quote_source_url
                .as_deref()
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .ok_or(DomainError::MissingQuoteSource)?;
            Some(Quote {
                text: quote_text.to_string(),
                source_url: source_url.to_string(),
            })
        }
    };

    let stored = if text.is_empty() {
        quote.as_ref().map(|q| q.text.clone()).unwrap_or_default()
    } else {
        text.to_string()
    };
    Ok((stored, quote))
}

/// The explicit vote if one was sent; otherwise "agree" for seed comments in conversations at or
/// below the historical cutoff.
fn implicit_vote_value(request: &SubmitComment, legacy_cutoff: ConversationId) -> Option<VoteValue> {
    request
        .vote
        .or_else(|| (request.is_seed && request.conversation <= legacy_cutoff).then_some(VoteValue::Agree))
}
