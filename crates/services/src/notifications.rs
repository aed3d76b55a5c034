//! # "New comments" notifications
//!
//! A conversation gets a pending marker whenever a visible comment appears. The scheduler claims
//! one marker at a time and mails every subscribed participant who has something new to vote on,
//! backing off per participant the longer they ignore the mails.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domains::{
    Clock, Conversation, ConversationId, ConversationRepo, DomainError, Mailer, NotificationRepo,
    OutgoingMail, SubscriberStatus,
};
use tracing::{debug, info, warn};

use crate::worker::{Progress, Worker};

type Result<T> = std::result::Result<T, DomainError>;

const HOUR: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub struct NotificationOptions {
    /// Minimum wait after the n-th unanswered mail; past the end of the list nobody is mailed
    /// again until they interact.
    pub backoff: Vec<Duration>,
    pub mail_from: String,
    pub base_url: String,
}

impl Default for NotificationOptions {
    fn default() -> Self {
        Self {
            backoff: vec![HOUR, 4 * HOUR, 24 * HOUR, 48 * HOUR],
            mail_from: "notifications@localhost".to_string(),
            base_url: "http://localhost:8080".to_string(),
        }
    }
}

/// Outcome of one claimed marker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dispatch {
    pub conversation: Option<ConversationId>,
    pub sent: usize,
    /// When the marker was put back because somebody was rate limited.
    pub requeued_for: Option<DateTime<Utc>>,
}

pub struct NotificationScheduler {
    conversations: Arc<dyn ConversationRepo>,
    notifications: Arc<dyn NotificationRepo>,
    mailer: Arc<dyn Mailer>,
    clock: Arc<dyn Clock>,
    options: NotificationOptions,
}

enum Eligibility {
    Send,
    NothingNew,
    GaveUp,
    RateLimited { until: DateTime<Utc> },
}

impl NotificationScheduler {
    pub fn new(
        conversations: Arc<dyn ConversationRepo>,
        notifications: Arc<dyn NotificationRepo>,
        mailer: Arc<dyn Mailer>,
        clock: Arc<dyn Clock>,
        options: NotificationOptions,
    ) -> Self {
        Self {
            conversations,
            notifications,
            mailer,
            clock,
            options,
        }
    }

    /// Claim and process a single due marker.
    ///
    /// The claim deletes the marker, so a failure while processing puts it back as due now.
    pub async fn run_once(&self) -> Result<Dispatch> {
        let now = self.clock.now();
        let Some(zid) = self.notifications.claim_next(now).await? else {
            return Ok(Dispatch::default());
        };
        match self.dispatch(zid, now).await {
            Ok(dispatch) => Ok(dispatch),
            Err(err) => {
                if let Err(rearm) = self.notifications.enqueue(zid, now).await {
                    warn!(conversation = %zid, error = %rearm, "failed to restore notification marker");
                }
                Err(err)
            }
        }
    }

    async fn dispatch(&self, zid: ConversationId, now: DateTime<Utc>) -> Result<Dispatch> {
        let mut dispatch = Dispatch {
            conversation: Some(zid),
            ..Dispatch::default()
        };

        let Some(conversation) = self.conversations.find_by_id(zid).await? else {
            debug!(conversation = %zid, "dropping notification marker for unknown conversation");
            return Ok(dispatch);
        };

        let mut retry_at: Option<DateTime<Utc>> = None;
        for subscriber in self.notifications.subscribers(zid).await? {
            match self.eligibility(&subscriber, now) {
                Eligibility::NothingNew | Eligibility::GaveUp => continue,
                Eligibility::RateLimited { until } => {
                    retry_at = Some(retry_at.map_or(until, |at| at.min(until)));
                    continue;
                }
                Eligibility::Send => {}
            }
            let Some(to) = subscriber.email.as_deref().filter(|e| !e.trim().is_empty()) else {
                continue;
            };

            let mail = self.compose(&conversation, &subscriber, to);
            match self.mailer.send(&mail).await {
                Ok(()) => {
                    dispatch.sent += 1;
                    if let Err(err) = self.notifications.mark_notified(zid, subscriber.pid, now).await {
                        warn!(conversation = %zid, pid = %subscriber.pid, error = %err, "failed to record notification");
                    }
                }
                Err(err) => {
                    warn!(conversation = %zid, pid = %subscriber.pid, error = %err, "notification mail failed");
                }
            }
        }

        if let Some(due) = retry_at {
            self.notifications.enqueue(zid, due).await?;
            dispatch.requeued_for = Some(due);
        }
        info!(conversation = %zid, sent = dispatch.sent, requeued = dispatch.requeued_for.is_some(), "notifications dispatched");
        Ok(dispatch)
    }

    fn eligibility(&self, subscriber: &SubscriberStatus, now: DateTime<Utc>) -> Eligibility {
        if subscriber.remaining == 0 {
            return Eligibility::NothingNew;
        }
        let Some(wait) = backoff(&self.options.backoff, subscriber.notifications_since_interaction) else {
            return Eligibility::GaveUp;
        };
        let since = subscriber
            .last_notified
            .map_or(subscriber.last_interaction, |notified| notified.max(subscriber.last_interaction));
        let Some(until) = chrono::Duration::from_std(wait)
            .ok()
            .and_then(|wait| since.checked_add_signed(wait))
        else {
            return Eligibility::GaveUp;
        };
        if now < until {
            Eligibility::RateLimited { until }
        } else {
            Eligibility::Send
        }
    }

    fn compose(&self, conversation: &Conversation, subscriber: &SubscriberStatus, to: &str) -> OutgoingMail {
        let url = format!("{}/{}", self.options.base_url.trim_end_matches('/'), conversation.token);
        let topic = conversation.topic.as_deref().unwrap_or("a conversation you joined");
        let noun = if subscriber.remaining == 1 { "statement" } else { "statements" };
        OutgoingMail {
            from: self.options.mail_from.clone(),
            to: to.to_string(),
            subject: format!("{} new {noun} to vote on", subscriber.remaining),
            body: format!(
                "There are {} new {noun} waiting for your vote in \"{topic}\".\n\nVote at {url}\n",
                subscriber.remaining
            ),
        }
    }
}

/// Wait before the next mail after `sent` unanswered ones; `None` once the list is exhausted.
pub fn backoff(schedule: &[Duration], sent: i32) -> Option<Duration> {
    usize::try_from(sent.max(0))
        .ok()
        .and_then(|n| schedule.get(n).copied())
}

#[async_trait]
impl Worker for NotificationScheduler {
    fn name(&self) -> &'static str {
        "notification-scheduler"
    }

    async fn poll(&self) -> Result<Progress> {
        let dispatch = self.run_once().await?;
        Ok(if dispatch.conversation.is_some() {
            Progress::Busy
        } else {
            Progress::Idle
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use domains::{
        ConversationToken, MockClock, MockConversationRepo, MockMailer, MockNotificationRepo, Pid, StoreError, UserId,
    };
    use mockall::predicate::eq;

    const ZID: ConversationId = ConversationId(31);

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn hours_ago(h: i64) -> DateTime<Utc> {
        now() - chrono::Duration::hours(h)
    }

    fn subscriber(pid: i32, remaining: u64, sent: i32, last_notified: Option<DateTime<Utc>>) -> SubscriberStatus {
        SubscriberStatus {
            pid: Pid(pid),
            uid: UserId(100 + i64::from(pid)),
            email: Some(format!("p{pid}@example.org")),
            remaining,
            last_interaction: hours_ago(100),
            last_notified,
            notifications_since_interaction: sent,
        }
    }

    fn conversations() -> MockConversationRepo {
        let mut repo = MockConversationRepo::new();
        repo.expect_find_by_id().returning(|_| {
            Ok(Some(Conversation {
                id: ZID,
                token: ConversationToken("7xyz".into()),
                owner: UserId(1),
                topic: Some("Transit".into()),
                is_active: true,
                is_archived: false,
                strict_moderation: false,
                profanity_filter: true,
                spam_filter: true,
                auth_needed_to_vote: false,
                created: now(),
                modified: now(),
            }))
        });
        repo
    }

    fn scheduler(notifications: MockNotificationRepo, mailer: MockMailer) -> NotificationScheduler {
        let mut clock = MockClock::new();
        clock.expect_now().returning(now);
        NotificationScheduler::new(
            Arc::new(conversations()),
            Arc::new(notifications),
            Arc::new(mailer),
            Arc::new(clock),
            NotificationOptions {
                base_url: "https://agora.example".into(),
                ..NotificationOptions::default()
            },
        )
    }

    fn claimed(subscribers: Vec<SubscriberStatus>) -> MockNotificationRepo {
        let mut repo = MockNotificationRepo::new();
        repo.expect_claim_next().times(1).returning(|_| Ok(Some(ZID)));
        repo.expect_subscribers()
            .with(eq(ZID))
            .returning(move |_| Ok(subscribers.clone()));
        repo
    }

    #[test]
    fn backoff_escalates_then_gives_up() {
        let schedule = NotificationOptions::default().backoff;
        assert_eq!(backoff(&schedule, 0), Some(HOUR));
        assert_eq!(backoff(&schedule, 1), Some(4 * HOUR));
        assert_eq!(backoff(&schedule, 2), Some(24 * HOUR));
        assert_eq!(backoff(&schedule, 3), Some(48 * HOUR));
        assert_eq!(backoff(&schedule, 4), None);
        assert_eq!(backoff(&schedule, 9), None);
    }

    #[tokio::test]
    async fn no_marker_is_idle() {
        let mut repo = MockNotificationRepo::new();
        repo.expect_claim_next().returning(|_| Ok(None));
        let scheduler = scheduler(repo, MockMailer::new());
        assert_eq!(scheduler.poll().await.unwrap(), Progress::Idle);
    }

    #[tokio::test]
    async fn eligible_subscribers_get_one_mail_each() {
        let mut repo = claimed(vec![subscriber(1, 3, 0, None), subscriber(2, 1, 2, Some(hours_ago(30)))]);
        repo.expect_mark_notified()
            .with(eq(ZID), eq(Pid(1)), eq(now()))
            .times(1)
            .returning(|_, _, _| Ok(()));
        repo.expect_mark_notified()
            .with(eq(ZID), eq(Pid(2)), eq(now()))
            .times(1)
            .returning(|_, _, _| Ok(()));
        repo.expect_enqueue().never();
        let mut mailer = MockMailer::new();
        mailer
            .expect_send()
            .withf(|m| m.body.contains("https://agora.example/7xyz"))
            .times(2)
            .returning(|_| Ok(()));

        let dispatch = scheduler(repo, mailer).run_once().await.unwrap();
        assert_eq!(dispatch.sent, 2);
        assert_eq!(dispatch.requeued_for, None);
    }

    #[tokio::test]
    async fn store_failure_after_claim_restores_the_marker() {
        let mut repo = MockNotificationRepo::new();
        repo.expect_claim_next().times(1).returning(|_| Ok(Some(ZID)));
        repo.expect_subscribers()
            .returning(|_| Err(StoreError::Unavailable("db down".into())));
        repo.expect_enqueue()
            .with(eq(ZID), eq(now()))
            .times(1)
            .returning(|_, _| Ok(()));
        let mut mailer = MockMailer::new();
        mailer.expect_send().never();

        let err = scheduler(repo, mailer).run_once().await.unwrap_err();
        assert!(matches!(err, DomainError::Store(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn rate_limited_subscriber_requeues_the_marker() {
        // second mail was sent two hours ago; the next one is due after four
        let due = hours_ago(2) + chrono::Duration::hours(4);
        let mut repo = claimed(vec![subscriber(1, 2, 1, Some(hours_ago(2)))]);
        repo.expect_enqueue()
            .with(eq(ZID), eq(due))
            .times(1)
            .returning(|_, _| Ok(()));
        let mut mailer = MockMailer::new();
        mailer.expect_send().never();

        let dispatch = scheduler(repo, mailer).run_once().await.unwrap();
        assert_eq!(dispatch.sent, 0);
        assert_eq!(dispatch.requeued_for, Some(due));
    }

    #[tokio::test]
    async fn nothing_new_or_given_up_does_not_requeue() {
        let repo = {
            let mut repo = claimed(vec![subscriber(1, 0, 0, None), subscriber(2, 5, 4, Some(hours_ago(500)))]);
            repo.expect_enqueue().never();
            repo
        };
        let mut mailer = MockMailer::new();
        mailer.expect_send().never();

        let dispatch = scheduler(repo, mailer).run_once().await.unwrap();
        assert_eq!(dispatch, Dispatch {
            conversation: Some(ZID),
            sent: 0,
            requeued_for: None,
        });
    }

    #[tokio::test]
    async fn mail_failure_is_not_recorded() {
        let mut repo = claimed(vec![subscriber(1, 3, 0, None)]);
        repo.expect_mark_notified().never();
        let mut mailer = MockMailer::new();
        mailer
            .expect_send()
            .returning(|_| Err("smtp unavailable".into()));

        let dispatch = scheduler(repo, mailer).run_once().await.unwrap();
        assert_eq!(dispatch.sent, 0);
    }
}
