//! # Next comment
//!
//! Picks the next comment a participant should vote on. Candidates are drawn at random with
//! probability proportional to the priority the clustering engine assigned them; comments it has
//! no opinion on, or a zero priority for, weigh 1.

use std::sync::Arc;
use std::time::Duration;

use domains::{
    CandidateQuery, Comment, CommentRepo, Conversation, ConversationId, ConversationRepo,
    DomainError, MathSnapshot, Pid, Tid, Translation, Translator,
};
use tracing::{debug, warn};

use crate::math::{MathCache, ANY_TICK};

type Result<T> = std::result::Result<T, DomainError>;

/// Uniform draw in `[0, 1)`.
pub type DrawFn = Arc<dyn Fn() -> f64 + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SelectionOptions {
    pub timeout: Duration,
}

impl Default for SelectionOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectNext {
    pub conversation: ConversationId,
    /// Anonymous pollers have no pid and see every candidate.
    pub pid: Option<Pid>,
    pub exclude: Vec<Tid>,
    pub social_only: bool,
    /// Preferred language for translations.
    pub lang: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NextComment {
    /// `None` once the participant has seen everything currently available.
    pub comment: Option<Comment>,
    pub translations: Vec<Translation>,
    pub remaining: u64,
    pub total: u64,
}

pub struct SelectionService {
    conversations: Arc<dyn ConversationRepo>,
    comments: Arc<dyn CommentRepo>,
    math: Arc<MathCache>,
    translator: Arc<dyn Translator>,
    timeout: Duration,
    draw: DrawFn,
}

impl SelectionService {
    pub fn new(
        conversations: Arc<dyn ConversationRepo>,
        comments: Arc<dyn CommentRepo>,
        math: Arc<MathCache>,
        translator: Arc<dyn Translator>,
        options: SelectionOptions,
    ) -> Self {
        Self {
            conversations,
            comments,
            math,
            translator,
            timeout: options.timeout,
            draw: Arc::new(rand::random::<f64>),
        }
    }

    /// Replace the random source, mostly for tests.
    pub fn with_draw(mut self, draw: DrawFn) -> Self {
        self.draw = draw;
        self
    }

    /// Bounded by the configured timeout. A poll that times out is dropped where it stands and
    /// performs no further writes.
    pub async fn select_next(&self, request: SelectNext) -> Result<NextComment> {
        let conversation = request.conversation;
        match tokio::time::timeout(self.timeout, self.select(request)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(conversation = %conversation, timeout = ?self.timeout, "next comment timed out");
                Err(DomainError::Timeout(self.timeout))
            }
        }
    }

    async fn select(&self, request: SelectNext) -> Result<NextComment> {
        let conversation = self.load_conversation(request.conversation).await?;

        let counts = self
            .comments
            .counts(conversation.id, request.pid, conversation.strict_moderation)
            .await?
            .ok_or(DomainError::NoComments)?;

        let mut candidates = self
            .comments
            .candidates(&CandidateQuery {
                conversation: conversation.id,
                unvoted_by: request.pid,
                exclude: request.exclude,
                social_authors_only: request.social_only,
                strict_moderation: conversation.strict_moderation,
            })
            .await?;

        let priorities = self.priorities(conversation.id).await;
        let picked = weighted_pick(
            &candidates,
            |c| priorities.as_ref().map_or(1.0, |s| priority(s, c.tid)),
            (self.draw)(),
        );
        let Some(index) = picked else {
            debug!(conversation = %conversation.id, pid = ?request.pid, "no comments left to show");
            return Ok(NextComment {
                comment: None,
                translations: Vec::new(),
                remaining: counts.remaining,
                total: counts.total,
            });
        };
        let comment = candidates.swap_remove(index);

        let translations = match request.lang.as_deref() {
            Some(lang) if !lang.trim().is_empty() => self.translations_for(&comment, lang.trim()).await,
            _ => Vec::new(),
        };

        Ok(NextComment {
            comment: Some(comment),
            translations,
            remaining: counts.remaining,
            total: counts.total,
        })
    }

    async fn load_conversation(&self, id: ConversationId) -> Result<Conversation> {
        self.conversations
            .find_by_id(id)
            .await?
            .ok_or_else(|| DomainError::not_found("conversation", id))
    }

    /// Missing or unreadable math means uniform weights.
    async fn priorities(&self, conversation: ConversationId) -> Option<Arc<MathSnapshot>> {
        match self.math.get(conversation, ANY_TICK).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(conversation = %conversation, error = %err, "math snapshot unavailable, using uniform weights");
                None
            }
        }
    }

    /// Stored translations in `lang`, or a fresh machine translation. Never fails.
    async fn translations_for(&self, comment: &Comment, lang: &str) -> Vec<Translation> {
        let stored = match self.comments.translations(comment.conversation, comment.tid).await {
            Ok(stored) => stored,
            Err(err) => {
                warn!(conversation = %comment.conversation, tid = %comment.tid, error = %err, "failed to load translations");
                return Vec::new();
            }
        };
        let matching: Vec<Translation> = stored
            .into_iter()
            .filter(|t| t.lang.eq_ignore_ascii_case(lang))
            .collect();
        if !matching.is_empty() {
            return matching;
        }

        let text = match self.translator.translate(&comment.text, lang).await {
            Ok(text) => text,
            Err(err) => {
                warn!(conversation = %comment.conversation, tid = %comment.tid, lang, error = %err, "translation failed");
                return Vec::new();
            }
        };
        let translation = Translation {
            conversation: comment.conversation,
            tid: comment.tid,
            lang: lang.to_string(),
            text,
            source: "machine".to_string(),
        };
        if let Err(err) = self.comments.store_translation(translation.clone()).await {
            warn!(conversation = %comment.conversation, tid = %comment.tid, error = %err, "failed to store translation");
        }
        vec![translation]
    }
}

/// Missing, zero and NaN priorities weigh 1.
fn priority(snapshot: &MathSnapshot, tid: Tid) -> f64 {
    snapshot
        .comment_priorities
        .get(&tid)
        .copied()
        .filter(|p| *p != 0.0 && !p.is_nan())
        .unwrap_or(1.0)
}

/// Index of the item whose cumulative weight first exceeds `draw * total`.
///
/// Weights that are negative or not finite count as zero. If nothing has positive weight the
/// pick is uniform.
pub fn weighted_pick<T>(items: &[T], weight: impl Fn(&T) -> f64, draw: f64) -> Option<usize> {
    if items.is_empty() {
        return None;
    }
    let draw = if draw.is_finite() { draw.clamp(0.0, 1.0) } else { 0.0 };
    let weights: Vec<f64> = items
        .iter()
        .map(|item| weight(item))
        .map(|w| if w.is_finite() && w > 0.0 { w } else { 0.0 })
        .collect();
    let total: f64 = weights.iter().sum();
    if total <= 0.0 || !total.is_finite() {
        return Some(((draw * items.len() as f64) as usize).min(items.len() - 1));
    }

    let target = draw * total;
    let mut cumulative = 0.0;
    for (index, w) in weights.iter().enumerate() {
        cumulative += w;
        if cumulative > target {
            return Some(index);
        }
    }
    // draw == 1.0 or rounding at the top end
    weights.iter().rposition(|w| *w > 0.0)
}
