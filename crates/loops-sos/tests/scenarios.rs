#![allow(clippy::expect_used, clippy::unwrap_used)]
//! Trigger and resolve flows as a caller sees them.

use std::sync::Arc;

use chrono::{Duration, Utc};

use loops_sos::orchestrator::OrchestratorConfig;
use loops_sos::prelude::*;
use loops_sos::testing::{FlakyQueue, Fixture, ScriptedChannel};

fn trigger_in(circle: &str) -> TriggerRequest {
    TriggerRequest {
        circle_id: Some(circle.to_string()),
        location: Some(Location::new(34.05, -118.25, 10.0).unwrap()),
        trigger_method: None,
    }
}

fn fixture() -> Fixture {
    Fixture::new(vec![Arc::new(ScriptedChannel::succeeding(ChannelKind::Email))])
}

#[tokio::test]
async fn first_trigger_succeeds_and_starts_window() -> Result<()> {
    let fixture = fixture();
    let user = fixture.seed_user("uid-1", "Dana", "c1", &[("k1", Some("k1@example.com"), None)])?;
    let now = Utc::now();

    let response = fixture.service.trigger(Some(&user), trigger_in("c1"), now).await?;

    assert_eq!(response.status, "success");
    let limit = fixture.store.account_limit(&user).await?.expect("limit written");
    assert_eq!(limit.trigger_count, 1);
    assert_eq!(limit.window_start, now);
    assert_eq!(limit.cooldown_until, None);

    let event = fixture.store.get_event(&response.event_id).await?.expect("event written");
    assert_eq!(event.status, EventStatus::Active);
    assert_eq!(event.trigger_method, TriggerMethod::Hold);
    assert_eq!(fixture.queue.depth().await?, 1);
    Ok(())
}

#[tokio::test]
async fn fourth_trigger_within_the_hour_is_rate_limited() -> Result<()> {
    let fixture = fixture();
    let user = fixture.seed_user("uid-1", "Dana", "c1", &[])?;
    let now = Utc::now();

    for minute in 0..3 {
        fixture
            .service
            .trigger(Some(&user), trigger_in("c1"), now + Duration::minutes(minute))
            .await?;
    }
    let fourth_at = now + Duration::minutes(10);
    let err = fixture
        .service
        .trigger(Some(&user), trigger_in("c1"), fourth_at)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::RateLimited);
    assert_eq!(err.retry_after(), Some(Duration::hours(1)));
    let limit = fixture.store.account_limit(&user).await?.expect("limit written");
    assert_eq!(limit.trigger_count, 3);
    assert_eq!(limit.cooldown_until, Some(fourth_at + Duration::hours(1)));

    // During the cooldown the wait shrinks, then the next trigger opens a new window.
    let later = fourth_at + Duration::minutes(30);
    let err = fixture
        .service
        .trigger(Some(&user), trigger_in("c1"), later)
        .await
        .unwrap_err();
    assert_eq!(err.retry_after(), Some(Duration::minutes(30)));

    let after = fourth_at + Duration::hours(1);
    fixture.service.trigger(Some(&user), trigger_in("c1"), after).await?;
    let limit = fixture.store.account_limit(&user).await?.expect("limit written");
    assert_eq!(limit.trigger_count, 1);
    assert_eq!(limit.window_start, after);
    assert_eq!(fixture.store.event_count()?, 4);
    Ok(())
}

#[tokio::test]
async fn locked_account_cannot_trigger() -> Result<()> {
    let fixture = fixture();
    let user = fixture.seed_user("uid-1", "Dana", "c1", &[])?;
    let now = Utc::now();
    fixture
        .store
        .set_account_lock(&user, Some(now + Duration::minutes(15)))
        .await?;

    let err = fixture
        .service
        .trigger(Some(&user), trigger_in("c1"), now)
        .await
        .unwrap_err();
    assert!(matches!(err, SosError::AccountLocked { .. }));
    assert!(!err.kind().is_retryable());
    assert_eq!(fixture.store.event_count()?, 0);
    assert_eq!(fixture.store.account_limit(&user).await?, None);
    Ok(())
}

#[tokio::test]
async fn malformed_requests_do_not_consume_quota() -> Result<()> {
    let fixture = fixture();
    let user = fixture.seed_user("uid-1", "Dana", "c1", &[])?;
    let now = Utc::now();

    let err = fixture
        .service
        .trigger(None, trigger_in("c1"), now)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthenticated);

    let bad_location = TriggerRequest {
        location: Some(Location { lat: 91.0, lon: 0.0, accuracy_meters: 5.0 }),
        ..trigger_in("c1")
    };
    let err = fixture.service.trigger(Some(&user), bad_location, now).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let no_circle = TriggerRequest { circle_id: None, ..trigger_in("c1") };
    let err = fixture.service.trigger(Some(&user), no_circle, now).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceMissing);

    let err = fixture
        .service
        .trigger(Some(&user), trigger_in("someone-elses-circle"), now)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceMissing);

    assert_eq!(fixture.store.account_limit(&user).await?, None);
    Ok(())
}

#[tokio::test]
async fn failed_publish_still_succeeds_and_sweep_republishes() -> Result<()> {
    let email = Arc::new(ScriptedChannel::succeeding(ChannelKind::Email));
    let fixture = Fixture::with_queue(
        vec![email.clone()],
        Arc::new(FlakyQueue::failing_first(1)),
        OrchestratorConfig::default(),
    );
    let user = fixture.seed_user("uid-1", "Dana", "c1", &[("k1", Some("k1@example.com"), None)])?;
    let now = Utc::now();

    let response = fixture.service.trigger(Some(&user), trigger_in("c1"), now).await?;
    assert_eq!(fixture.queue.depth().await?, 0);

    // Too young for the sweep.
    let swept = fixture
        .orchestrator
        .republish_unnotified(fixture.queue.as_ref(), now, Duration::minutes(1))
        .await?;
    assert!(swept.is_empty());

    let swept = fixture
        .orchestrator
        .republish_unnotified(fixture.queue.as_ref(), now + Duration::minutes(2), Duration::minutes(1))
        .await?;
    assert_eq!(swept.len(), 1);
    assert_eq!(swept[0].event_id, response.event_id);

    fixture.orchestrator.drain(fixture.queue.as_ref()).await?;
    assert_eq!(email.calls().len(), 1);

    // Notified events are not swept again.
    let swept = fixture
        .orchestrator
        .republish_unnotified(fixture.queue.as_ref(), now + Duration::minutes(5), Duration::minutes(1))
        .await?;
    assert!(swept.is_empty());
    Ok(())
}

#[tokio::test]
async fn only_the_owner_resolves_and_only_once() -> Result<()> {
    let fixture = fixture();
    let owner = fixture.seed_user("uid-1", "Dana", "c1", &[])?;
    let stranger = fixture.seed_user("uid-2", "Sam", "c1", &[])?;
    let now = Utc::now();
    let event_id = fixture.service.trigger(Some(&owner), trigger_in("c1"), now).await?.event_id;
    let request = ResolveRequest {
        status: EventStatus::Resolved,
        resolution_reason: Some(ResolutionReason::AllOk),
    };

    let err = fixture
        .service
        .resolve(Some(&stranger), &event_id, request, now)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceMissing);

    let reopen = ResolveRequest { status: EventStatus::Active, resolution_reason: None };
    let err = fixture
        .service
        .resolve(Some(&owner), &event_id, reopen, now)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let resolved = fixture.service.resolve(Some(&owner), &event_id, request, now).await?;
    assert_eq!(resolved.status, EventStatus::Resolved);
    assert_eq!(resolved.resolution_reason, Some(ResolutionReason::AllOk));
    assert_eq!(resolved.resolved_at, Some(now));

    let err = fixture
        .service
        .resolve(Some(&owner), &event_id, request, now)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    Ok(())
}

#[tokio::test]
async fn notification_history_is_owner_only() -> Result<()> {
    let fixture = fixture();
    let owner = fixture.seed_user("uid-1", "Dana", "c1", &[("k1", Some("k1@example.com"), None)])?;
    let stranger = fixture.seed_user("uid-2", "Sam", "c1", &[])?;
    let now = Utc::now();
    let event_id = fixture.service.trigger(Some(&owner), trigger_in("c1"), now).await?.event_id;
    fixture.orchestrator.drain(fixture.queue.as_ref()).await?;

    let history = fixture.service.notifications(Some(&owner), &event_id, Utc::now()).await?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].channel, ChannelKind::Email);

    let err = fixture
        .service
        .notifications(Some(&stranger), &event_id, Utc::now())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceMissing);
    Ok(())
}

#[tokio::test]
async fn correction_removes_events_written_around_admission() -> Result<()> {
    let fixture = fixture();
    let user = fixture.seed_user("uid-1", "Dana", "c1", &[])?;
    let now = Utc::now();
    for minute in 0..3 {
        fixture
            .service
            .trigger(Some(&user), trigger_in("c1"), now + Duration::minutes(minute))
            .await?;
    }
    let stray = SosEvent::new(
        user.clone(),
        CircleId::new("c1")?,
        None,
        TriggerMethod::Shake,
        now + Duration::minutes(5),
    );
    fixture.store.import_event(stray.clone())?;

    let removed = fixture
        .service
        .admission()
        .correct_window(&user, now + Duration::minutes(6))
        .await?;

    assert_eq!(removed, vec![stray.event_id]);
    assert_eq!(fixture.store.get_event(&stray.event_id).await?, None);
    assert_eq!(fixture.store.event_count()?, 3);
    Ok(())
}
