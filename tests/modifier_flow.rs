//! Modifier engine flows: version-checked application, conflict detection
//! with no provider call, and conflict resolution re-entry.

mod common;

use serde_json::json;
use sync_worker::models::{
    ConflictResolution, ConflictType, ModifierStatus, ModifierType, ProviderKind,
};
use sync_worker::repo::NewModifier;
use sync_worker::test_support::{TestDatabase, TestFixtures};
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn seed_version(pool: &sqlx::PgPool, email_id: i64, version: i64) {
    sqlx::query(
        r#"INSERT INTO email_versions (email_id, version, mod_type, mod_source)
           VALUES ($1, $2, 'mark_read', 'provider')
           ON CONFLICT (email_id) DO UPDATE SET version = $2"#,
    )
    .bind(email_id)
    .bind(version)
    .execute(pool)
    .await
    .expect("seed version");
}

fn new_modifier(
    connection: &sync_worker::models::Connection,
    mod_type: ModifierType,
    email_id: i64,
    external_id: &str,
    client_version: i64,
    params: serde_json::Value,
) -> NewModifier {
    NewModifier {
        id: Uuid::new_v4(),
        user_id: connection.user_id,
        connection_id: connection.id,
        mod_type,
        email_id: Some(email_id),
        external_id: Some(external_id.to_string()),
        thread_id: None,
        params,
        client_version,
    }
}

// S5: markRead at a matching version applies at the provider and bumps the
// email version.
#[tokio::test]
async fn matching_version_applies_and_bumps() {
    let db = TestDatabase::new().await.expect("test database");
    let fixtures = TestFixtures::new(db.pool());
    let connection = fixtures
        .create_connection(ProviderKind::Gmail, "user@example.com")
        .await
        .expect("connection");
    let email_id = fixtures
        .insert_mail(&connection, "ext-1", "hello")
        .await
        .expect("mail");
    seed_version(db.pool(), email_id, 7).await;

    let server = MockServer::start().await;
    let app = common::build_app(db.pool_clone(), &server.uri());

    Mock::given(method("POST"))
        .and(path("/users/me/messages/ext-1/modify"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "ext-1"})))
        .expect(1)
        .mount(&server)
        .await;

    let modifier = app
        .modifier_engine
        .submit(new_modifier(
            &connection,
            ModifierType::MarkRead,
            email_id,
            "ext-1",
            7,
            json!({}),
        ))
        .await
        .expect("submit");
    assert_eq!(modifier.status, ModifierStatus::Pending);

    let applied = app
        .modifier_engine
        .apply_pending(connection.id)
        .await
        .expect("drain");
    assert_eq!(applied, 1);

    let modifier = app
        .modifiers
        .get(modifier.id)
        .await
        .expect("query")
        .expect("row");
    assert_eq!(modifier.status, ModifierStatus::Applied);
    assert_eq!(modifier.server_version, Some(8));
    assert!(modifier.applied_at.is_some());

    assert_eq!(app.modifiers.get_version(email_id).await.expect("version"), 8);

    let mail = app.emails.get(email_id).await.expect("query").expect("mail");
    assert!(mail.is_read);

    db.close().await.expect("drop test database");
}

// S6: a version-sensitive move against a stale client version records a
// conflict and never reaches the provider; resolution re-enters application.
#[tokio::test]
async fn stale_version_conflicts_then_resolves() {
    let db = TestDatabase::new().await.expect("test database");
    let fixtures = TestFixtures::new(db.pool());
    let connection = fixtures
        .create_connection(ProviderKind::Gmail, "user@example.com")
        .await
        .expect("connection");
    let email_id = fixtures
        .insert_mail(&connection, "ext-2", "contested")
        .await
        .expect("mail");
    // Two provider-side changes landed after the client read version 7.
    seed_version(db.pool(), email_id, 9).await;

    let server = MockServer::start().await;
    let app = common::build_app(db.pool_clone(), &server.uri());

    let modifier = app
        .modifier_engine
        .submit(new_modifier(
            &connection,
            ModifierType::Move,
            email_id,
            "ext-2",
            7,
            json!({"folder": "archive"}),
        ))
        .await
        .expect("submit");

    // A later mutation on the same email must wait behind the conflict.
    let follow_up = app
        .modifier_engine
        .submit(new_modifier(
            &connection,
            ModifierType::MarkRead,
            email_id,
            "ext-2",
            7,
            json!({}),
        ))
        .await
        .expect("submit follow-up");

    let applied = app
        .modifier_engine
        .apply_pending(connection.id)
        .await
        .expect("drain");
    assert_eq!(applied, 0, "nothing applies; no provider endpoint was called");

    let modifier_row = app
        .modifiers
        .get(modifier.id)
        .await
        .expect("query")
        .expect("row");
    assert_eq!(modifier_row.status, ModifierStatus::Conflict);
    assert_eq!(modifier_row.server_version, Some(9));

    let conflict = app
        .modifiers
        .get_conflict_by_modifier(modifier.id)
        .await
        .expect("query")
        .expect("conflict row");
    assert_eq!(conflict.conflict_type, ConflictType::Version);
    assert!(conflict.resolution.is_none());
    assert_eq!(conflict.client_state["version"], json!(7));
    assert_eq!(conflict.server_state["version"], json!(9));

    let follow_up_row = app
        .modifiers
        .get(follow_up.id)
        .await
        .expect("query")
        .expect("row");
    assert_eq!(
        follow_up_row.status,
        ModifierStatus::Pending,
        "ordering: held behind the conflict"
    );

    // User chooses to force the move. Mount the provider endpoint now; the
    // re-entry applies both modifiers in order.
    Mock::given(method("POST"))
        .and(path("/users/me/messages/ext-2/modify"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "ext-2"})))
        .expect(2)
        .mount(&server)
        .await;

    app.modifier_engine
        .resolve_conflict(modifier.id, ConflictResolution::ApplyLocal, None)
        .await
        .expect("resolve");

    let applied = app
        .modifier_engine
        .apply_pending(connection.id)
        .await
        .expect("re-drain");
    assert_eq!(applied, 2);

    let modifier_row = app
        .modifiers
        .get(modifier.id)
        .await
        .expect("query")
        .expect("row");
    assert_eq!(modifier_row.status, ModifierStatus::Applied);
    assert_eq!(modifier_row.server_version, Some(10));

    let mail = app.emails.get(email_id).await.expect("query").expect("mail");
    assert_eq!(mail.folder, "archive");
    assert!(mail.is_read, "follow-up applied after resolution");

    db.close().await.expect("drop test database");
}

// Discarding a conflicted modifier fails it without touching the provider.
#[tokio::test]
async fn discard_local_drops_the_modifier() {
    let db = TestDatabase::new().await.expect("test database");
    let fixtures = TestFixtures::new(db.pool());
    let connection = fixtures
        .create_connection(ProviderKind::Gmail, "user@example.com")
        .await
        .expect("connection");
    let email_id = fixtures
        .insert_mail(&connection, "ext-3", "stale")
        .await
        .expect("mail");
    seed_version(db.pool(), email_id, 5).await;

    let server = MockServer::start().await;
    let app = common::build_app(db.pool_clone(), &server.uri());

    let modifier = app
        .modifier_engine
        .submit(new_modifier(
            &connection,
            ModifierType::Trash,
            email_id,
            "ext-3",
            3,
            json!({}),
        ))
        .await
        .expect("submit");

    app.modifier_engine
        .apply_pending(connection.id)
        .await
        .expect("drain");

    app.modifier_engine
        .resolve_conflict(modifier.id, ConflictResolution::DiscardLocal, None)
        .await
        .expect("resolve");

    let row = app
        .modifiers
        .get(modifier.id)
        .await
        .expect("query")
        .expect("row");
    assert_eq!(row.status, ModifierStatus::Failed);

    // Version untouched; the provider never saw the mutation.
    assert_eq!(app.modifiers.get_version(email_id).await.expect("version"), 5);

    db.close().await.expect("drop test database");
}

// Transient provider failures retry; the budget exhausts to failed.
#[tokio::test]
async fn transient_provider_errors_consume_the_retry_budget() {
    let db = TestDatabase::new().await.expect("test database");
    let fixtures = TestFixtures::new(db.pool());
    let connection = fixtures
        .create_connection(ProviderKind::Gmail, "user@example.com")
        .await
        .expect("connection");
    let email_id = fixtures
        .insert_mail(&connection, "ext-4", "flaky")
        .await
        .expect("mail");

    let server = MockServer::start().await;
    let app = common::build_app(db.pool_clone(), &server.uri());

    Mock::given(method("POST"))
        .and(path("/users/me/messages/ext-4/modify"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let modifier = app
        .modifier_engine
        .submit(new_modifier(
            &connection,
            ModifierType::MarkRead,
            email_id,
            "ext-4",
            0,
            json!({}),
        ))
        .await
        .expect("submit");

    // The engine was built with a budget of 3 retries.
    for attempt in 1..=2 {
        let err = app
            .modifier_engine
            .apply_pending(connection.id)
            .await
            .expect_err("drain fails while retryable");
        assert!(err.is_retryable(), "attempt {attempt}: {err}");
    }
    // Third failure exhausts the budget and fails the modifier.
    app.modifier_engine
        .apply_pending(connection.id)
        .await
        .expect("exhaustion marks failed without surfacing an error");

    let row = app
        .modifiers
        .get(modifier.id)
        .await
        .expect("query")
        .expect("row");
    assert_eq!(row.status, ModifierStatus::Failed);
    assert_eq!(row.retry_count, 3);
    assert!(row.last_error.is_some());

    db.close().await.expect("drop test database");
}
