mod common;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use common::{start_time, Harness};
use domains::{JoinContext, Mailer, OutgoingMail, ServiceFailure, UserId};
use services::{NotificationOptions, NotificationScheduler};

async fn subscribe(harness: &Harness, conversation: domains::ConversationId, uid: i64, email: Option<&str>) -> domains::Pid {
    let participant = harness
        .participants
        .ensure_participant(conversation, UserId(uid), JoinContext::default())
        .await
        .unwrap();
    harness
        .participants
        .set_subscription(conversation, participant.pid, true)
        .await
        .unwrap();
    if let Some(email) = email {
        harness.store.set_email(UserId(uid), email);
    }
    participant.pid
}

#[tokio::test]
async fn new_comments_reach_subscribers_on_the_backoff_schedule() -> anyhow::Result<()> {
    let harness = Harness::new();
    let conversation = harness.store.create_conversation("civic", UserId(1), |c| {
        c.topic = Some("Neighbourhood budget".into());
    });
    subscribe(&harness, conversation.id, 20, Some("resident@example.org")).await;
    let scheduler = harness.scheduler();

    harness.comment(conversation.id, UserId(10), "Fix the playground").await;
    assert_eq!(harness.store.pending_marker(conversation.id), Some(start_time()));

    // the subscriber joined just now, so the first mail waits an hour
    let dispatch = scheduler.run_once().await?;
    assert_eq!(dispatch.conversation, Some(conversation.id));
    assert_eq!(dispatch.sent, 0);
    assert_eq!(dispatch.requeued_for, Some(start_time() + Duration::hours(1)));
    assert_eq!(scheduler.run_once().await?.conversation, None);

    harness.clock.advance(Duration::hours(1));
    let dispatch = scheduler.run_once().await?;
    assert_eq!(dispatch.sent, 1);
    assert_eq!(dispatch.requeued_for, None);
    let sent = harness.mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "resident@example.org");
    assert!(sent[0].subject.starts_with("1 new statement"));
    assert!(sent[0].body.contains("Neighbourhood budget"));
    assert!(sent[0].body.contains("/civic"));

    // the second unanswered mail waits four hours after the first
    harness.comment(conversation.id, UserId(10), "Add benches by the river").await;
    let dispatch = scheduler.run_once().await?;
    assert_eq!(dispatch.sent, 0);
    assert_eq!(dispatch.requeued_for, Some(start_time() + Duration::hours(5)));

    harness.clock.advance(Duration::hours(4));
    assert_eq!(scheduler.run_once().await?.sent, 1);
    assert_eq!(harness.mailer.sent().len(), 2);
    Ok(())
}

#[tokio::test]
async fn caught_up_subscribers_are_left_alone() -> anyhow::Result<()> {
    let harness = Harness::new();
    let conversation = harness.store.create_conversation("civic", UserId(1), |_| {});
    let pid = subscribe(&harness, conversation.id, 20, Some("resident@example.org")).await;
    let comment = harness.comment(conversation.id, UserId(10), "Fix the playground").await;
    harness
        .votes
        .cast_vote(services::CastVote {
            conversation: conversation.id,
            uid: UserId(20),
            pid,
            tid: comment.tid(),
            value: domains::VoteValue::Agree,
            weight: 0.0,
            high_priority: false,
        })
        .await?;

    harness.clock.advance(Duration::hours(2));
    let dispatch = harness.scheduler().run_once().await?;
    assert_eq!(dispatch.sent, 0);
    assert_eq!(dispatch.requeued_for, None);
    assert!(harness.mailer.sent().is_empty());
    Ok(())
}

#[tokio::test]
async fn subscribers_without_email_are_skipped() -> anyhow::Result<()> {
    let harness = Harness::new();
    let conversation = harness.store.create_conversation("civic", UserId(1), |_| {});
    subscribe(&harness, conversation.id, 20, None).await;
    subscribe(&harness, conversation.id, 21, Some("second@example.org")).await;
    harness.comment(conversation.id, UserId(10), "Fix the playground").await;

    harness.clock.advance(Duration::hours(1));
    let dispatch = harness.scheduler().run_once().await?;
    assert_eq!(dispatch.sent, 1);
    assert_eq!(harness.mailer.sent()[0].to, "second@example.org");
    Ok(())
}

struct BrokenMailer;

#[async_trait]
impl Mailer for BrokenMailer {
    async fn send(&self, _mail: &OutgoingMail) -> Result<(), ServiceFailure> {
        Err("smtp relay refused the connection".into())
    }
}

#[tokio::test]
async fn failed_delivery_is_not_recorded() -> anyhow::Result<()> {
    let harness = Harness::new();
    let conversation = harness.store.create_conversation("civic", UserId(1), |_| {});
    let pid = subscribe(&harness, conversation.id, 20, Some("resident@example.org")).await;
    harness.comment(conversation.id, UserId(10), "Fix the playground").await;
    harness.clock.advance(Duration::hours(1));

    let scheduler = NotificationScheduler::new(
        harness.store.clone(),
        harness.store.clone(),
        Arc::new(BrokenMailer),
        harness.clock.clone(),
        NotificationOptions::default(),
    );
    let dispatch = scheduler.run_once().await?;
    assert_eq!(dispatch.sent, 0);
    assert_eq!(dispatch.requeued_for, None);

    let participant = harness
        .participants
        .participant(conversation.id, pid)
        .await?
        .ok_or_else(|| anyhow::anyhow!("participant missing"))?;
    assert_eq!(participant.last_notified, None);
    assert_eq!(participant.notifications_since_interaction, 0);
    Ok(())
}
