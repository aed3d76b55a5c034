//! # Domain Models
//!
//! These structs represent the core entities of a deliberation: conversations, the participants
//! who join them, the comments they write and the votes they cast on those comments.
//!
//! Participant ids (`Pid`) and comment ids (`Tid`) are sequence numbers scoped to a single
//! conversation; they are only meaningful together with a `ConversationId`.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

/// Internal numeric conversation id. Never exposed to clients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub i32);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Public invite token identifying a conversation in URLs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationToken(pub String);

impl fmt::Display for ConversationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Global user identity, authenticated or anonymous.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Participant id, unique only within a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pid(pub i32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Comment id, unique only within a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tid(pub i32);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Conversation ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub token: ConversationToken,
    pub owner: UserId,
    pub topic: Option<String>,
    pub is_active: bool,
    /// Archived conversations are kept forever but hidden from listings.
    pub is_archived: bool,
    /// Every new comment starts inactive until a moderator accepts it.
    pub strict_moderation: bool,
    pub profanity_filter: bool,
    pub spam_filter: bool,
    /// Voting requires a linked social identity (or moderator rights).
    pub auth_needed_to_vote: bool,
    pub created: DateTime<Utc>,
    /// Bumped on every vote and comment; never moves backwards.
    pub modified: DateTime<Utc>,
}

// ── Participant ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub conversation: ConversationId,
    pub pid: Pid,
    pub uid: UserId,
    pub created: DateTime<Utc>,
    pub last_interaction: DateTime<Utc>,
    /// Muted participants may still vote but may not write comments.
    pub muted: bool,
    pub subscribed: bool,
    /// Denormalized from the vote ledger.
    pub vote_count: i32,
    pub last_notified: Option<DateTime<Utc>>,
    /// Consecutive "new comments" mails since the participant last interacted.
    pub notifications_since_interaction: i32,
}

/// Request-scoped information recorded the first time a user joins a conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinContext {
    pub referrer: Option<String>,
    pub parent_url: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

/// Coarse location derived from the joining client's address.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoInfo {
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
}

/// Auxiliary data stored alongside a freshly created participant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinMetadata {
    pub referrer: Option<String>,
    pub parent_url: Option<String>,
    pub geo: Option<GeoInfo>,
}

// ── Comment ──────────────────────────────────────────────────────────────────

/// Moderation state of a comment; the integer encoding matches the `comments.mod` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationStatus {
    Rejected,
    Unmoderated,
    Accepted,
}

impl ModerationStatus {
    pub fn as_i16(self) -> i16 {
        match self {
            ModerationStatus::Rejected => -1,
            ModerationStatus::Unmoderated => 0,
            ModerationStatus::Accepted => 1,
        }
    }

    pub fn from_i16(raw: i16) -> Option<Self> {
        match raw {
            -1 => Some(ModerationStatus::Rejected),
            0 => Some(ModerationStatus::Unmoderated),
            1 => Some(ModerationStatus::Accepted),
            _ => None,
        }
    }

    /// Whether a comment in this state may be shown to voters.
    ///
    /// Strict conversations only show accepted comments; open conversations show anything that
    /// was not explicitly rejected.
    pub fn is_visible(self, strict_moderation: bool) -> bool {
        if strict_moderation {
            self == ModerationStatus::Accepted
        } else {
            self != ModerationStatus::Rejected
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub text: String,
    pub source_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub conversation: ConversationId,
    pub tid: Tid,
    pub author: UserId,
    pub pid: Pid,
    pub text: String,
    pub moderation: ModerationStatus,
    pub active: bool,
    pub is_meta: bool,
    pub is_seed: bool,
    pub anon: bool,
    /// Decaying popularity score maintained by the store.
    pub velocity: f32,
    pub lang: Option<String>,
    pub lang_confidence: Option<f32>,
    pub quote: Option<Quote>,
    pub created: DateTime<Utc>,
}

/// A comment as handed to the store for insertion; the store assigns the `tid`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewComment {
    pub conversation: ConversationId,
    pub author: UserId,
    pub pid: Pid,
    pub text: String,
    pub moderation: ModerationStatus,
    pub active: bool,
    pub is_seed: bool,
    pub anon: bool,
    pub lang: Option<String>,
    pub lang_confidence: Option<f32>,
    pub quote: Option<Quote>,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Translation {
    pub conversation: ConversationId,
    pub tid: Tid,
    pub lang: String,
    pub text: String,
    /// Provenance of the translation (e.g. "machine").
    pub source: String,
}

/// Filter for the candidate query behind "next comment".
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CandidateQuery {
    pub conversation: ConversationId,
    /// Drop every comment this participant already voted on.
    pub unvoted_by: Option<Pid>,
    pub exclude: Vec<Tid>,
    /// Only comments whose author linked a social identity.
    pub social_authors_only: bool,
    pub strict_moderation: bool,
}

/// Outstanding vs. total visible comments for one participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentCounts {
    pub remaining: u64,
    pub total: u64,
}

// ── Vote ─────────────────────────────────────────────────────────────────────

/// The three reactions a participant can have to a comment.
///
/// Integer encoding, fixed once for the whole system: agree = -1, disagree = 1, pass = 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteValue {
    Agree,
    Disagree,
    Pass,
}

impl VoteValue {
    pub fn as_i16(self) -> i16 {
        match self {
            VoteValue::Agree => -1,
            VoteValue::Disagree => 1,
            VoteValue::Pass => 0,
        }
    }

    pub fn from_i16(raw: i16) -> Option<Self> {
        match raw {
            -1 => Some(VoteValue::Agree),
            1 => Some(VoteValue::Disagree),
            0 => Some(VoteValue::Pass),
            _ => None,
        }
    }
}

/// Vote weight in [-1, 1], stored as a fixed-point i16 scaled by 32767.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VoteWeight(i16);

impl VoteWeight {
    pub const SCALE: f32 = 32767.0;

    pub fn from_f32(weight: f32) -> Result<Self, DomainError> {
        if !weight.is_finite() || !(-1.0..=1.0).contains(&weight) {
            return Err(DomainError::InvalidWeight(weight));
        }
        Ok(VoteWeight((weight * Self::SCALE).round() as i16))
    }

    pub fn from_raw(raw: i16) -> Self {
        VoteWeight(raw)
    }

    pub fn raw(self) -> i16 {
        self.0
    }

    pub fn to_f32(self) -> f32 {
        f32::from(self.0) / Self::SCALE
    }
}

/// A vote as handed to the store. `created` is truncated to the millisecond; together with
/// (conversation, pid, tid) it forms the ledger's unique key.
#[derive(Debug, Clone, PartialEq)]
pub struct NewVote {
    pub conversation: ConversationId,
    pub pid: Pid,
    pub tid: Tid,
    pub value: VoteValue,
    pub weight: VoteWeight,
    pub high_priority: bool,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteRecord {
    #[serde(skip)]
    pub conversation: ConversationId,
    pub pid: Pid,
    pub tid: Tid,
    pub value: VoteValue,
    pub weight: VoteWeight,
    pub high_priority: bool,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VoteFilter {
    pub pid: Option<Pid>,
    pub tid: Option<Tid>,
}

// ── Math snapshots ───────────────────────────────────────────────────────────

/// A clustering result exactly as deposited by the external math engine.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSnapshot {
    pub conversation: ConversationId,
    pub math_tick: i64,
    /// Store-wide sequence used by pollers to page through new results.
    pub caching_tick: i64,
    pub data: serde_json::Value,
}

/// A normalized clustering result safe to hand to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MathSnapshot {
    #[serde(skip)]
    pub conversation: ConversationId,
    #[serde(rename = "math_tick")]
    pub tick: i64,
    /// Canonical payload; every per-group field is an array of `{id, val}` objects.
    pub payload: serde_json::Map<String, serde_json::Value>,
    #[serde(skip)]
    pub comment_priorities: HashMap<Tid, f64>,
}

// ── Notifications ────────────────────────────────────────────────────────────

/// What the scheduler needs to know about one subscribed participant.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriberStatus {
    pub pid: Pid,
    pub uid: UserId,
    pub email: Option<String>,
    /// Visible comments the participant has not voted on yet.
    pub remaining: u64,
    pub last_interaction: DateTime<Utc>,
    pub last_notified: Option<DateTime<Utc>>,
    pub notifications_since_interaction: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectedLanguage {
    pub lang: String,
    pub confidence: f32,
}

/// Inputs for the external spam check.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpamCheckRequest {
    pub text: String,
    pub author: String,
    pub permalink: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vote_weight_uses_fixed_point_scale() {
        let w = VoteWeight::from_f32(1.0).unwrap();
        assert_eq!(w.raw(), 32767);
        assert_eq!(VoteWeight::from_f32(-1.0).unwrap().raw(), -32767);
        assert_eq!(VoteWeight::from_f32(0.5).unwrap().raw(), 16384);
        assert!((VoteWeight::from_raw(16384).to_f32() - 0.5).abs() < 1e-4);
    }

    #[test]
    fn vote_weight_rejects_out_of_range() {
        assert!(matches!(VoteWeight::from_f32(1.5), Err(DomainError::InvalidWeight(_))));
        assert!(VoteWeight::from_f32(f32::NAN).is_err());
    }

    #[test]
    fn vote_value_encoding_is_stable() {
        for v in [VoteValue::Agree, VoteValue::Disagree, VoteValue::Pass] {
            assert_eq!(VoteValue::from_i16(v.as_i16()), Some(v));
        }
        assert_eq!(VoteValue::Agree.as_i16(), -1);
        assert_eq!(VoteValue::from_i16(7), None);
    }

    #[test]
    fn moderation_visibility_depends_on_mode() {
        assert!(ModerationStatus::Unmoderated.is_visible(false));
        assert!(!ModerationStatus::Unmoderated.is_visible(true));
        assert!(!ModerationStatus::Rejected.is_visible(false));
        assert!(ModerationStatus::Accepted.is_visible(true));
    }
}
