//! Services wired over one in-memory store, with a hand-driven clock and a mail outbox.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, TimeZone, Utc};
use domains::{Clock, ConversationId, JoinContext, UserId};
use services::{
    BannedWords, CommentOptions, CommentService, ConversationService, MathCache, MathCacheOptions,
    NotificationOptions, NotificationScheduler, ParticipantOptions, ParticipantService,
    SelectionOptions, SelectionService, SubmitComment, SubmittedComment, VoteService,
};
use storage_adapters::{MemoryStore, NoopGeoLocator, NoopLanguageDetector, NoopSpamChecker, NoopTranslator, OutboxMailer};

pub struct ManualClock(Mutex<DateTime<Utc>>);

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self(Mutex::new(start))
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub mailer: Arc<OutboxMailer>,
    pub conversations: ConversationService,
    pub participants: Arc<ParticipantService>,
    pub votes: Arc<VoteService>,
    pub comments: CommentService,
    pub math: Arc<MathCache>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_comment_options(CommentOptions::default())
    }

    pub fn with_comment_options(options: CommentOptions) -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start_time()));
        let mailer = Arc::new(OutboxMailer::default());
        let participants = Arc::new(ParticipantService::new(
            store.clone(),
            Arc::new(NoopGeoLocator),
            clock.clone(),
            ParticipantOptions::default(),
        ));
        let votes = Arc::new(VoteService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            clock.clone(),
        ));
        let comments = CommentService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            participants.clone(),
            votes.clone(),
            Arc::new(NoopSpamChecker),
            Arc::new(NoopLanguageDetector),
            mailer.clone(),
            clock.clone(),
            BannedWords::default(),
            options,
        );
        let math = Arc::new(MathCache::new(store.clone(), MathCacheOptions::default()));
        Self {
            conversations: ConversationService::new(store.clone()),
            store,
            clock,
            mailer,
            participants,
            votes,
            comments,
            math,
        }
    }

    pub fn selection(&self) -> SelectionService {
        SelectionService::new(
            self.store.clone(),
            self.store.clone(),
            self.math.clone(),
            Arc::new(NoopTranslator),
            SelectionOptions::default(),
        )
    }

    pub fn scheduler(&self) -> NotificationScheduler {
        NotificationScheduler::new(
            self.store.clone(),
            self.store.clone(),
            self.mailer.clone(),
            self.clock.clone(),
            NotificationOptions::default(),
        )
    }

    pub async fn comment(&self, conversation: ConversationId, author: UserId, text: &str) -> SubmittedComment {
        self.comments
            .submit_comment(SubmitComment {
                conversation,
                author,
                text: text.to_string(),
                client: JoinContext::default(),
                ..SubmitComment::default()
            })
            .await
            .unwrap()
    }
}

/// Evenly spaced draws over [0, 1), one per call, wrapping after `steps`.
pub fn grid_draw(steps: usize) -> services::selection::DrawFn {
    let next = Arc::new(AtomicUsize::new(0));
    Arc::new(move || {
        let i = next.fetch_add(1, Ordering::Relaxed) % steps;
        (i as f64 + 0.5) / steps as f64
    })
}
