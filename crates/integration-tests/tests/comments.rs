mod common;

use std::sync::Arc;
use std::time::Duration;

use common::Harness;
use domains::{ConversationId, DomainError, JoinContext, ModerationStatus, UserId, VoteFilter, VoteValue};
use services::{CommentOptions, ImplicitVote, SelectNext, SubmitComment};

fn submission(conversation: ConversationId, author: i64, text: &str) -> SubmitComment {
    SubmitComment {
        conversation,
        author: UserId(author),
        text: text.to_string(),
        ..SubmitComment::default()
    }
}

#[tokio::test]
async fn identical_text_is_rejected_as_a_duplicate() {
    let harness = Harness::new();
    let conversation = harness.store.create_conversation("civic", UserId(1), |_| {});
    harness.comment(conversation.id, UserId(2), "Extend the tram line").await;

    let err = harness
        .comments
        .submit_comment(submission(conversation.id, 3, "Extend the tram line"))
        .await
        .unwrap_err();
    assert_eq!(err, DomainError::DuplicateComment);
    assert_eq!(err.code(), "duplicate_comment");
    assert_eq!(harness.store.comment_rows(conversation.id).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_duplicates_store_a_single_comment() -> anyhow::Result<()> {
    let harness = Arc::new(Harness::new());
    let conversation = harness.store.create_conversation("civic", UserId(1), |_| {});

    let mut racers = Vec::new();
    for author in 10..18 {
        let harness = Arc::clone(&harness);
        racers.push(tokio::spawn(async move {
            harness
                .comments
                .submit_comment(submission(conversation.id, author, "Car-free Sundays downtown"))
                .await
        }));
    }
    let mut created = 0;
    for racer in racers {
        match racer.await? {
            Ok(_) => created += 1,
            Err(DomainError::DuplicateComment) => {}
            Err(other) => return Err(other.into()),
        }
    }
    assert_eq!(created, 1);
    assert_eq!(harness.store.comment_rows(conversation.id).len(), 1);
    Ok(())
}

#[tokio::test]
async fn closed_conversation_refuses_comments() {
    let harness = Harness::new();
    let conversation = harness
        .store
        .create_conversation("closed", UserId(1), |c| c.is_active = false);
    let err = harness
        .comments
        .submit_comment(submission(conversation.id, 2, "Too late?"))
        .await
        .unwrap_err();
    assert_eq!(err, DomainError::ConversationClosed);
}

#[tokio::test]
async fn strict_moderation_hides_comments_until_accepted() -> anyhow::Result<()> {
    let harness = Harness::new();
    let conversation = harness
        .store
        .create_conversation("strict", UserId(1), |c| c.strict_moderation = true);
    harness.store.add_moderator(conversation.id, UserId(1));

    let submitted = harness.comment(conversation.id, UserId(2), "Plant fruit trees in parks").await;
    assert!(!submitted.comment.active);
    assert_eq!(submitted.comment.moderation, ModerationStatus::Unmoderated);

    let selection = harness.selection();
    let request = SelectNext {
        conversation: conversation.id,
        ..SelectNext::default()
    };
    let hidden = selection.select_next(request.clone()).await?;
    assert!(hidden.comment.is_none());
    assert_eq!((hidden.remaining, hidden.total), (0, 0));

    let err = harness
        .comments
        .moderate(conversation.id, UserId(2), submitted.tid(), ModerationStatus::Accepted)
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::Forbidden(_)));

    let accepted = harness
        .comments
        .moderate(conversation.id, UserId(1), submitted.tid(), ModerationStatus::Accepted)
        .await?;
    assert!(accepted.active);

    let next = selection.select_next(request.clone()).await?;
    assert_eq!(next.comment.map(|c| c.tid), Some(submitted.tid()));

    harness
        .comments
        .moderate(conversation.id, UserId(1), submitted.tid(), ModerationStatus::Rejected)
        .await?;
    let next = selection.select_next(request).await?;
    assert!(next.comment.is_none());
    assert_eq!(next.total, 0);
    Ok(())
}

#[tokio::test]
async fn moderators_are_mailed_once_a_backlog_builds() {
    let harness = Harness::new();
    let conversation = harness
        .store
        .create_conversation("strict", UserId(1), |c| c.strict_moderation = true);
    harness.store.set_email(UserId(1), "owner@example.org");

    harness.comment(conversation.id, UserId(2), "First held comment").await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(harness.mailer.sent().is_empty());

    harness.comment(conversation.id, UserId(3), "Second held comment").await;
    let mut sent = Vec::new();
    for _ in 0..50 {
        sent = harness.mailer.sent();
        if !sent.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "owner@example.org");
    assert!(sent[0].body.contains("/strict/moderate"));
}

#[tokio::test]
async fn muted_participants_cannot_comment() -> anyhow::Result<()> {
    let harness = Harness::new();
    let conversation = harness.store.create_conversation("civic", UserId(1), |_| {});
    let author = harness
        .participants
        .ensure_participant(conversation.id, UserId(4), JoinContext::default())
        .await?;
    harness.store.set_muted(conversation.id, author.pid, true);

    let err = harness
        .comments
        .submit_comment(submission(conversation.id, 4, "Let me speak"))
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::Forbidden(_)));
    Ok(())
}

#[tokio::test]
async fn legacy_seed_comments_carry_an_implicit_agree() -> anyhow::Result<()> {
    let harness = Harness::with_comment_options(CommentOptions {
        legacy_seed_vote_cutoff: ConversationId(1),
        ..CommentOptions::default()
    });
    let legacy = harness.store.create_conversation("legacy", UserId(1), |_| {});
    let current = harness.store.create_conversation("current", UserId(1), |_| {});
    assert!(legacy.id <= ConversationId(1) && current.id > ConversationId(1));
    harness.store.add_moderator(legacy.id, UserId(1));
    harness.store.add_moderator(current.id, UserId(1));

    let seed = |conversation| SubmitComment {
        is_seed: true,
        ..submission(conversation, 1, "Seed: what should the budget fund?")
    };

    let old = harness.comments.submit_comment(seed(legacy.id)).await?;
    assert!(matches!(old.implicit_vote, ImplicitVote::Recorded(ref v) if v.value == VoteValue::Agree));
    assert_eq!(old.comment.moderation, ModerationStatus::Accepted);

    let new = harness.comments.submit_comment(seed(current.id)).await?;
    assert_eq!(new.implicit_vote, ImplicitVote::NotRequested);
    let votes = harness
        .votes
        .latest_votes_for(current.id, VoteFilter::default())
        .await?;
    assert!(votes.is_empty());
    Ok(())
}

#[tokio::test]
async fn explicit_author_vote_is_recorded() -> anyhow::Result<()> {
    let harness = Harness::new();
    let conversation = harness.store.create_conversation("civic", UserId(1), |_| {});
    let submitted = harness
        .comments
        .submit_comment(SubmitComment {
            vote: Some(VoteValue::Disagree),
            ..submission(conversation.id, 5, "Raise parking fees")
        })
        .await?;

    let ImplicitVote::Recorded(ref vote) = submitted.implicit_vote else {
        panic!("expected a recorded vote, got {:?}", submitted.implicit_vote);
    };
    assert_eq!(vote.pid, submitted.pid);
    assert_eq!(vote.tid, submitted.tid());
    assert_eq!(vote.value, VoteValue::Disagree);
    Ok(())
}
