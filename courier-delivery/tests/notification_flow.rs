//! Application events through filtering, rules and digests.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use courier_common::model::{
    ActorCondition, Channel, DigestStatus, EventType, NotificationItem, NotificationRule,
    RuleAction,
};
use courier_delivery::{
    BatchConfig, BatchProcessor, InAppProvider, Inbox, MessageService, NotificationService,
    RateLimitConfig, RateLimiter, RuleEngine, ServiceConfig, SmartFilter, SubmitOutcome,
    TemplateRegistry,
    batch::digest::parse_digest_text,
    repository::{
        DigestRepository, MemoryAttemptRepository, MemoryDigestRepository,
        MemoryMessageRepository, MemoryNotificationRepository, MemoryPreferenceRepository,
        MemoryRuleSource,
    },
};
use courier_metrics::InMemoryTelemetry;
use pretty_assertions::assert_eq;

struct Pipeline {
    notifications: NotificationService,
    rules: Arc<MemoryRuleSource>,
    digests: Arc<MemoryDigestRepository>,
    inbox: Arc<Inbox>,
}

fn pipeline(batch: BatchConfig) -> Pipeline {
    let messages = Arc::new(MessageService::new(
        ServiceConfig::default(),
        Arc::new(MemoryMessageRepository::new()),
        Arc::new(MemoryAttemptRepository::new()),
        RateLimiter::in_memory(RateLimitConfig::default()),
        Arc::new(InMemoryTelemetry::default()),
    ));
    let inbox = Arc::new(Inbox::default());
    messages.register_provider(Arc::new(InAppProvider::new(inbox.clone())));

    let preferences = Arc::new(MemoryPreferenceRepository::new());
    let notifications = Arc::new(MemoryNotificationRepository::new());
    let digests = Arc::new(MemoryDigestRepository::new());
    let rules = Arc::new(MemoryRuleSource::new());

    let batch = Arc::new(BatchProcessor::new(
        batch,
        messages.clone(),
        digests.clone(),
        notifications.clone(),
        preferences.clone(),
        Arc::new(TemplateRegistry::new()),
    ));

    Pipeline {
        notifications: NotificationService::new(
            preferences,
            notifications,
            SmartFilter::default(),
            RuleEngine::new(rules.clone()),
            messages,
            batch,
        ),
        rules,
        digests,
        inbox,
    }
}

fn kudos(work: &str) -> NotificationItem {
    NotificationItem::new("writer", EventType::KudosReceived, "work", work, format!("Kudos on {work}"))
}

#[tokio::test]
async fn full_batch_becomes_a_digest() {
    let pipeline = pipeline(BatchConfig {
        max_batch_size: 3,
        ..BatchConfig::default()
    });

    for work in ["w1", "w2"] {
        assert_eq!(
            pipeline.notifications.submit(kudos(work)).await.unwrap(),
            SubmitOutcome::Batched(None)
        );
    }
    let SubmitOutcome::Batched(Some(flushed)) =
        pipeline.notifications.submit(kudos("w3")).await.unwrap()
    else {
        unreachable!("the third item fills the batch");
    };

    assert_eq!(flushed.items, 3);
    assert!(flushed.sent);

    let digest = pipeline.digests.get(flushed.digest_id).await.unwrap();
    assert_eq!(digest.status, DigestStatus::Sent);
    assert_eq!(digest.items.len(), 3);

    let entries = pipeline.inbox.entries("writer");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].subject, "[Courier] 3 new notifications");

    let parsed = parse_digest_text(&entries[0].text).unwrap();
    assert_eq!(parsed.total, 3);
    assert_eq!(parsed.groups.len(), 1);
    assert_eq!(parsed.groups[0].label, "❤️ Kudos");
    assert_eq!(parsed.groups[0].count, 3);

    let stored = pipeline
        .notifications
        .user_notifications("writer", 10, 0)
        .await
        .unwrap();
    assert!(stored.iter().all(|item| item.delivered && item.digest_id == Some(digest.id)));
}

#[tokio::test]
async fn first_matching_rule_wins() {
    let pipeline = pipeline(BatchConfig::default());

    let mut friends = NotificationRule::new(
        "reader",
        "always from friends",
        vec![EventType::CommentReceived],
        RuleAction::Allow,
    )
    .with_order(1);
    friends.actor = Some(ActorCondition {
        actors: vec!["friend".to_string()],
        excluded_actors: Vec::new(),
    });
    pipeline
        .rules
        .add(
            NotificationRule::new(
                "reader",
                "mute comments",
                vec![EventType::CommentReceived],
                RuleAction::Suppress,
            )
            .with_order(5),
        )
        .unwrap();
    pipeline.rules.add(friends).unwrap();

    let comment = |source: &str, actor: &str| {
        NotificationItem::new("reader", EventType::CommentReceived, "work", source, "New comment")
            .with_actor(actor, actor)
    };

    let from_friend = pipeline
        .notifications
        .submit(comment("w1", "friend"))
        .await
        .unwrap();
    let SubmitOutcome::Delivered(sent) = from_friend else {
        unreachable!("the allow rule comes first");
    };
    assert_eq!(sent.summary.by_channel[&Channel::InApp].delivered, 1);

    assert_eq!(
        pipeline
            .notifications
            .submit(comment("w2", "stranger"))
            .await
            .unwrap(),
        SubmitOutcome::Suppressed {
            reason: "matched rule: mute comments".to_string()
        }
    );
    assert_eq!(pipeline.inbox.entries("reader").len(), 1);
}
