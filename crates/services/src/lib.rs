//! # services
//!
//! Business logic for joining conversations, voting, submitting comments, picking the next
//! comment and delivering notifications. Everything here talks to the outside world through the
//! ports in `domains`; adapters are injected by the binary.

pub mod comments;
pub mod conversations;
pub mod math;
pub mod moderation;
pub mod notifications;
pub mod participants;
pub mod selection;
pub mod votes;
pub mod worker;

// Re-exporting for easier access in the adapters and the binary
pub use comments::{CommentOptions, CommentService, ImplicitVote, SubmitComment, SubmittedComment};
pub use conversations::ConversationService;
pub use math::{normalize, MathCache, MathCacheOptions, MathPoller, ANY_TICK};
pub use moderation::BannedWords;
pub use notifications::{Dispatch, NotificationOptions, NotificationScheduler};
pub use participants::{ParticipantOptions, ParticipantService};
pub use selection::{weighted_pick, NextComment, SelectNext, SelectionOptions, SelectionService};
pub use votes::{CastVote, VoteService};
pub use worker::{Progress, Schedule, Worker, WorkerHandle};
