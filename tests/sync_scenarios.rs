//! End-to-end sync scenarios against a mocked Gmail API: full backfill,
//! checkpointed retry after a mid-backfill failure, incremental sync from a
//! push, and duplicate-push idempotence.

mod common;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::json;
use std::time::Duration;
use sync_worker::bus::payload::{JobPayload, MailSyncJob, SyncReason};
use sync_worker::bus::topics;
use sync_worker::models::{ProviderKind, SyncStatus, WebhookStatus};
use sync_worker::test_support::{TestDatabase, TestFixtures};
use wiremock::matchers::{method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn gmail_message(id: &str, subject: &str) -> serde_json::Value {
    json!({
        "id": id,
        "threadId": format!("thread-{id}"),
        "labelIds": ["INBOX", "UNREAD"],
        "snippet": format!("snippet for {subject}"),
        "internalDate": "1722470400000",
        "payload": {
            "mimeType": "text/plain",
            "headers": [
                {"name": "From", "value": "peer@example.com"},
                {"name": "To", "value": "user@example.com"},
                {"name": "Subject", "value": subject},
                {"name": "Message-ID", "value": format!("<{id}@mail.example.com>")}
            ],
            "body": {
                "size": 5,
                "data": URL_SAFE_NO_PAD.encode(format!("body of {subject}"))
            }
        }
    })
}

async fn mount_message(server: &MockServer, id: &str, subject: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/users/me/messages/{id}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(gmail_message(id, subject)))
        .mount(server)
        .await;
}

async fn mount_profile_and_watch(server: &MockServer, history_id: &str) {
    Mock::given(method("GET"))
        .and(path("/users/me/profile"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "emailAddress": "user@example.com",
            "messagesTotal": 6,
            "threadsTotal": 6,
            "historyId": history_id
        })))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/users/me/watch"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "historyId": history_id,
            "expiration": "1893456000000"
        })))
        .mount(server)
        .await;
}

fn sync_job(connection: &sync_worker::models::Connection, reason: SyncReason) -> MailSyncJob {
    MailSyncJob {
        user_id: connection.user_id,
        connection_id: connection.id,
        reason,
        cursor_hint: None,
    }
}

// S1: three pages, all succeed. Backfill completes with a cleared
// checkpoint, a stamped first sync, and an active watch channel.
#[tokio::test]
async fn backfill_completes_across_pages() {
    let db = TestDatabase::new().await.expect("test database");
    let fixtures = TestFixtures::new(db.pool());
    let connection = fixtures
        .create_connection(ProviderKind::Gmail, "user@example.com")
        .await
        .expect("connection");

    let server = MockServer::start().await;
    let app = common::build_app(db.pool_clone(), &server.uri());

    Mock::given(method("GET"))
        .and(path("/users/me/messages"))
        .and(query_param_is_missing("pageToken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "messages": [{"id": "m1", "threadId": "t1"}, {"id": "m2", "threadId": "t2"}],
            "nextPageToken": "page-2",
            "resultSizeEstimate": 6
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/users/me/messages"))
        .and(query_param("pageToken", "page-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "messages": [{"id": "m3", "threadId": "t3"}, {"id": "m4", "threadId": "t4"}],
            "nextPageToken": "page-3",
            "resultSizeEstimate": 6
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/users/me/messages"))
        .and(query_param("pageToken", "page-3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "messages": [{"id": "m5", "threadId": "t5"}, {"id": "m6", "threadId": "t6"}],
            "resultSizeEstimate": 6
        })))
        .mount(&server)
        .await;

    for n in 1..=6 {
        mount_message(&server, &format!("m{n}"), &format!("message {n}")).await;
    }
    mount_profile_and_watch(&server, "100").await;

    app.engine
        .run_sync(&sync_job(&connection, SyncReason::Manual))
        .await
        .expect("backfill");

    let state = app
        .states
        .get(connection.id)
        .await
        .expect("state query")
        .expect("state row");
    assert_eq!(state.status, SyncStatus::Idle);
    assert_eq!(state.total_synced, 6);
    assert!(state.first_sync_completed_at.is_some());
    assert!(state.checkpoint_page_token.is_none());
    assert_eq!(state.history_cursor.as_deref(), Some("100"));

    let (mails, total) = app
        .emails
        .list(&sync_worker::repo::MailListQuery {
            user_id: connection.user_id,
            limit: 50,
            ..Default::default()
        })
        .await
        .expect("list");
    assert_eq!(total, 6);
    assert_eq!(mails.len(), 6);

    let webhook = app
        .webhooks
        .get_by_connection(connection.id, "mail")
        .await
        .expect("webhook query")
        .expect("webhook row");
    assert_eq!(webhook.status, WebhookStatus::Active);

    // Two derived jobs per new mail.
    assert_eq!(app.bus.topic_len(topics::AI_CLASSIFY).await.expect("len"), 6);
    assert_eq!(app.bus.topic_len(topics::RAG_INDEX).await.expect("len"), 6);

    db.close().await.expect("drop test database");
}

// S2: page 2 fails with a 503 after page 1 is stored. The checkpoint holds
// page 2's token, a retry is scheduled, and the retry resumes from the
// checkpoint rather than the beginning.
#[tokio::test]
async fn backfill_resumes_from_checkpoint_after_transient_failure() {
    let db = TestDatabase::new().await.expect("test database");
    let fixtures = TestFixtures::new(db.pool());
    let connection = fixtures
        .create_connection(ProviderKind::Gmail, "user@example.com")
        .await
        .expect("connection");

    let server = MockServer::start().await;
    let app = common::build_app(db.pool_clone(), &server.uri());

    Mock::given(method("GET"))
        .and(path("/users/me/messages"))
        .and(query_param_is_missing("pageToken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "messages": [{"id": "m1", "threadId": "t1"}, {"id": "m2", "threadId": "t2"}],
            "nextPageToken": "page-2",
            "resultSizeEstimate": 4
        })))
        .mount(&server)
        .await;

    // First call to page 2 fails; the retry sees the real page.
    Mock::given(method("GET"))
        .and(path("/users/me/messages"))
        .and(query_param("pageToken", "page-2"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/users/me/messages"))
        .and(query_param("pageToken", "page-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "messages": [{"id": "m3", "threadId": "t3"}, {"id": "m4", "threadId": "t4"}],
            "resultSizeEstimate": 4
        })))
        .mount(&server)
        .await;

    for n in 1..=4 {
        mount_message(&server, &format!("m{n}"), &format!("message {n}")).await;
    }
    mount_profile_and_watch(&server, "200").await;

    // First attempt: page 1 lands, page 2 schedules a retry.
    app.engine
        .run_sync(&sync_job(&connection, SyncReason::Manual))
        .await
        .expect("first attempt converts 503 into a scheduled retry");

    let state = app
        .states
        .get(connection.id)
        .await
        .expect("state query")
        .expect("state row");
    assert_eq!(state.status, SyncStatus::RetryScheduled);
    assert_eq!(state.checkpoint_page_token.as_deref(), Some("page-2"));
    assert_eq!(state.checkpoint_synced_count, 2);
    assert_eq!(state.retry_count, 1);
    let next_retry = state.next_retry_at.expect("retry scheduled");
    let delta = next_retry - chrono::Utc::now();
    assert!(delta <= chrono::Duration::seconds(7), "≈5s backoff, got {delta}");

    // Page 1 is durable already.
    let (_, total) = app
        .emails
        .list(&sync_worker::repo::MailListQuery {
            user_id: connection.user_id,
            limit: 50,
            ..Default::default()
        })
        .await
        .expect("list");
    assert_eq!(total, 2);

    // The retry scheduler would republish; drive the step directly.
    app.engine
        .run_sync(&sync_job(&connection, SyncReason::Retry))
        .await
        .expect("retry resumes");

    let state = app
        .states
        .get(connection.id)
        .await
        .expect("state query")
        .expect("state row");
    assert_eq!(state.status, SyncStatus::Idle);
    assert_eq!(state.total_synced, 4);
    assert!(state.checkpoint_page_token.is_none());
    assert!(state.first_sync_completed_at.is_some());

    db.close().await.expect("drop test database");
}

// S3 and S4: a push advances the cursor and fans out derived jobs; a
// duplicate push for the same history position changes nothing.
#[tokio::test]
async fn incremental_sync_applies_history_and_absorbs_duplicates() {
    let db = TestDatabase::new().await.expect("test database");
    let fixtures = TestFixtures::new(db.pool());
    let connection = fixtures
        .create_connection(ProviderKind::Gmail, "user@example.com")
        .await
        .expect("connection");

    // Backfill already completed; cursor sits at 12300.
    sqlx::query(
        r#"UPDATE sync_states
           SET status = 'idle', phase = 'incremental', history_cursor = '12300',
               first_sync_completed_at = NOW(), last_sync_at = NOW()
           WHERE connection_id = $1"#,
    )
    .bind(connection.id)
    .execute(db.pool())
    .await
    .expect("seed state");

    let server = MockServer::start().await;
    let app = common::build_app(db.pool_clone(), &server.uri());

    Mock::given(method("GET"))
        .and(path("/users/me/history"))
        .and(query_param("startHistoryId", "12300"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "history": [{
                "messagesAdded": [
                    {"message": {"id": "n1"}},
                    {"message": {"id": "n2"}},
                    {"message": {"id": "n3"}}
                ]
            }],
            "historyId": "12345"
        })))
        .mount(&server)
        .await;
    for n in 1..=3 {
        mount_message(&server, &format!("n{n}"), &format!("new message {n}")).await;
    }

    app.engine
        .run_sync(&sync_job(&connection, SyncReason::Webhook))
        .await
        .expect("incremental step");

    let state = app
        .states
        .get(connection.id)
        .await
        .expect("state query")
        .expect("state row");
    assert_eq!(state.history_cursor.as_deref(), Some("12345"));
    assert_eq!(app.bus.topic_len(topics::AI_CLASSIFY).await.expect("len"), 3);
    assert_eq!(app.bus.topic_len(topics::RAG_INDEX).await.expect("len"), 3);

    // Duplicate push: history from 12345 reports nothing new.
    Mock::given(method("GET"))
        .and(path("/users/me/history"))
        .and(query_param("startHistoryId", "12345"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "history": [],
            "historyId": "12345"
        })))
        .mount(&server)
        .await;

    app.engine
        .run_sync(&sync_job(&connection, SyncReason::Webhook))
        .await
        .expect("duplicate push");

    let state = app
        .states
        .get(connection.id)
        .await
        .expect("state query")
        .expect("state row");
    assert_eq!(state.history_cursor.as_deref(), Some("12345"));
    // No new derived jobs: the classify queue length is unchanged.
    assert_eq!(app.bus.topic_len(topics::AI_CLASSIFY).await.expect("len"), 3);

    // Idempotence across redeliveries: the mail set is stable.
    let (_, total) = app
        .emails
        .list(&sync_worker::repo::MailListQuery {
            user_id: connection.user_id,
            limit: 50,
            ..Default::default()
        })
        .await
        .expect("list");
    assert_eq!(total, 3);

    db.close().await.expect("drop test database");
}

// The history cursor is monotonically non-decreasing: older and equal
// numeric cursors are no-ops; opaque (delta-link) cursors replace.
#[tokio::test]
async fn history_cursor_never_decreases() {
    let db = TestDatabase::new().await.expect("test database");
    let fixtures = TestFixtures::new(db.pool());
    let connection = fixtures
        .create_connection(ProviderKind::Gmail, "user@example.com")
        .await
        .expect("connection");

    let states = sync_worker::repo::SyncStateRepository::new(db.pool_clone());
    states.ensure(connection.id).await.expect("state");

    assert!(states
        .update_history_cursor_if_greater(connection.id, "100")
        .await
        .expect("update"));
    assert!(!states
        .update_history_cursor_if_greater(connection.id, "99")
        .await
        .expect("update"));
    assert!(!states
        .update_history_cursor_if_greater(connection.id, "100")
        .await
        .expect("update"));
    // Longer decimal strings are numerically larger.
    assert!(states
        .update_history_cursor_if_greater(connection.id, "12345")
        .await
        .expect("update"));

    let state = states
        .get(connection.id)
        .await
        .expect("query")
        .expect("row");
    assert_eq!(state.history_cursor.as_deref(), Some("12345"));

    db.close().await.expect("drop test database");
}

// Exhausting the retry budget flips to terminal error, never another
// retry: at retry_count == max_retries the transition is to error.
#[tokio::test]
async fn retry_budget_exhausts_to_terminal_error() {
    let db = TestDatabase::new().await.expect("test database");
    let fixtures = TestFixtures::new(db.pool());
    let connection = fixtures
        .create_connection(ProviderKind::Gmail, "user@example.com")
        .await
        .expect("connection");

    let states = sync_worker::repo::SyncStateRepository::new(db.pool_clone());
    let state = states.ensure(connection.id).await.expect("state");
    assert_eq!(state.max_retries, 5);

    for attempt in 1..=5 {
        let status = states
            .schedule_retry(connection.id, chrono::Utc::now(), "transient")
            .await
            .expect("schedule");
        assert_eq!(status, SyncStatus::RetryScheduled, "attempt {attempt}");
    }

    let status = states
        .schedule_retry(connection.id, chrono::Utc::now(), "transient")
        .await
        .expect("schedule");
    assert_eq!(status, SyncStatus::Error);

    let state = states
        .get(connection.id)
        .await
        .expect("query")
        .expect("row");
    assert_eq!(state.status, SyncStatus::Error);
    assert_eq!(state.retry_count, 5, "budget is not exceeded");
    assert!(state.failed_at.is_some());
    assert!(state.next_retry_at.is_none());

    db.close().await.expect("drop test database");
}

// A Gmail push notification routes through the webhook manager into a
// mail.sync job carrying the pushed history id.
#[tokio::test]
async fn provider_push_enqueues_a_sync_job() {
    let db = TestDatabase::new().await.expect("test database");
    let fixtures = TestFixtures::new(db.pool());
    let connection = fixtures
        .create_connection(ProviderKind::Gmail, "user@example.com")
        .await
        .expect("connection");

    let server = MockServer::start().await;
    let app = common::build_app(db.pool_clone(), &server.uri());

    let data = base64::engine::general_purpose::STANDARD.encode(
        json!({"emailAddress": "user@example.com", "historyId": 12345}).to_string(),
    );
    let envelope = json!({
        "message": {"data": data, "messageId": "pubsub-1"},
        "subscription": "projects/test/subscriptions/gmail-push"
    });

    app.webhook_manager
        .on_provider_push(ProviderKind::Gmail, &envelope, &Default::default())
        .await
        .expect("push accepted");

    let records = app
        .bus
        .subscribe(
            "test-group",
            "t1",
            &[topics::MAIL_SYNC],
            10,
            Duration::from_millis(100),
        )
        .await
        .expect("subscribe");
    // Group starts at tail; publish again to observe.
    assert!(records.is_empty());

    app.webhook_manager
        .on_provider_push(ProviderKind::Gmail, &envelope, &Default::default())
        .await
        .expect("push accepted");

    let records = app
        .bus
        .subscribe(
            "test-group",
            "t1",
            &[topics::MAIL_SYNC],
            10,
            Duration::from_millis(200),
        )
        .await
        .expect("subscribe");
    assert_eq!(records.len(), 1);

    let payload =
        JobPayload::decode(topics::MAIL_SYNC, &records[0].payload).expect("typed payload");
    match payload {
        JobPayload::MailSync(job) => {
            assert_eq!(job.connection_id, connection.id);
            assert_eq!(job.reason, SyncReason::Webhook);
            assert_eq!(job.cursor_hint.as_deref(), Some("12345"));
        }
        other => panic!("expected mail.sync payload, got {other:?}"),
    }

    db.close().await.expect("drop test database");
}
