//! Body storage: compression threshold behavior, bit-identical round trips,
//! TTL cleanup and compression statistics.

mod common;

use serde_json::json;
use sync_worker::models::ProviderKind;
use sync_worker::repo::BodyDraft;
use sync_worker::test_support::{TestDatabase, TestFixtures};

#[tokio::test]
async fn large_bodies_compress_and_round_trip() {
    let db = TestDatabase::new().await.expect("test database");
    let fixtures = TestFixtures::new(db.pool());
    let connection = fixtures
        .create_connection(ProviderKind::Gmail, "user@example.com")
        .await
        .expect("connection");
    let email_id = fixtures
        .insert_mail(&connection, "b1", "big")
        .await
        .expect("mail");

    let app = common::build_app(db.pool_clone(), "http://localhost:1");

    let text = "lorem ipsum dolor sit amet ".repeat(100);
    app.bodies
        .save(&BodyDraft {
            email_id,
            html: None,
            text: Some(text.clone()),
            attachments_meta: json!([]),
        })
        .await
        .expect("save");

    let body = app.bodies.get(email_id).await.expect("get").expect("row");
    assert!(body.is_compressed);
    assert_eq!(body.text.as_deref(), Some(text.as_str()));
    assert_eq!(body.original_size, text.len() as i64);
    assert!(body.compressed_size < body.original_size);
    assert_eq!(body.ttl_days, 30);

    db.close().await.expect("drop test database");
}

#[tokio::test]
async fn threshold_is_exclusive() {
    let db = TestDatabase::new().await.expect("test database");
    let fixtures = TestFixtures::new(db.pool());
    let connection = fixtures
        .create_connection(ProviderKind::Gmail, "user@example.com")
        .await
        .expect("connection");

    let app = common::build_app(db.pool_clone(), "http://localhost:1");

    // Exactly 1024 bytes stays raw.
    let at_threshold = fixtures
        .insert_mail(&connection, "b-at", "at threshold")
        .await
        .expect("mail");
    app.bodies
        .save(&BodyDraft {
            email_id: at_threshold,
            html: None,
            text: Some("a".repeat(1024)),
            attachments_meta: json!([]),
        })
        .await
        .expect("save");
    let body = app
        .bodies
        .get(at_threshold)
        .await
        .expect("get")
        .expect("row");
    assert!(!body.is_compressed);
    assert_eq!(body.original_size, 1024);
    assert_eq!(body.compressed_size, 1024);

    // One byte more compresses.
    let over_threshold = fixtures
        .insert_mail(&connection, "b-over", "over threshold")
        .await
        .expect("mail");
    app.bodies
        .save(&BodyDraft {
            email_id: over_threshold,
            html: None,
            text: Some("a".repeat(1025)),
            attachments_meta: json!([]),
        })
        .await
        .expect("save");
    let body = app
        .bodies
        .get(over_threshold)
        .await
        .expect("get")
        .expect("row");
    assert!(body.is_compressed);
    assert_eq!(body.original_size, 1025);

    db.close().await.expect("drop test database");
}

#[tokio::test]
async fn saving_twice_replaces_the_cached_body() {
    let db = TestDatabase::new().await.expect("test database");
    let fixtures = TestFixtures::new(db.pool());
    let connection = fixtures
        .create_connection(ProviderKind::Gmail, "user@example.com")
        .await
        .expect("connection");
    let email_id = fixtures
        .insert_mail(&connection, "b2", "rewritten")
        .await
        .expect("mail");

    let app = common::build_app(db.pool_clone(), "http://localhost:1");

    for content in ["first version", "second version"] {
        app.bodies
            .save(&BodyDraft {
                email_id,
                html: Some(format!("<p>{content}</p>")),
                text: Some(content.to_string()),
                attachments_meta: json!([]),
            })
            .await
            .expect("save");
    }

    let body = app.bodies.get(email_id).await.expect("get").expect("row");
    assert_eq!(body.text.as_deref(), Some("second version"));
    assert_eq!(body.html.as_deref(), Some("<p>second version</p>"));

    db.close().await.expect("drop test database");
}

#[tokio::test]
async fn bulk_get_returns_decoded_bodies() {
    let db = TestDatabase::new().await.expect("test database");
    let fixtures = TestFixtures::new(db.pool());
    let connection = fixtures
        .create_connection(ProviderKind::Gmail, "user@example.com")
        .await
        .expect("connection");

    let app = common::build_app(db.pool_clone(), "http://localhost:1");

    let mut ids = Vec::new();
    for n in 0..3 {
        let email_id = fixtures
            .insert_mail(&connection, &format!("bulk-{n}"), "bulk")
            .await
            .expect("mail");
        ids.push(email_id);
        app.bodies
            .save(&BodyDraft {
                email_id,
                html: None,
                text: Some(format!("body {n}")),
                attachments_meta: json!([]),
            })
            .await
            .expect("save");
    }

    let bodies = app.bodies.bulk_get(&ids).await.expect("bulk get");
    assert_eq!(bodies.len(), 3);
    assert_eq!(bodies[0].text.as_deref(), Some("body 0"));
    assert_eq!(bodies[2].text.as_deref(), Some("body 2"));

    db.close().await.expect("drop test database");
}

#[tokio::test]
async fn expired_bodies_are_reaped_but_metadata_survives() {
    let db = TestDatabase::new().await.expect("test database");
    let fixtures = TestFixtures::new(db.pool());
    let connection = fixtures
        .create_connection(ProviderKind::Gmail, "user@example.com")
        .await
        .expect("connection");
    let email_id = fixtures
        .insert_mail(&connection, "b3", "expiring")
        .await
        .expect("mail");

    let app = common::build_app(db.pool_clone(), "http://localhost:1");

    app.bodies
        .save(&BodyDraft {
            email_id,
            html: None,
            text: Some("short lived".to_string()),
            attachments_meta: json!([]),
        })
        .await
        .expect("save");

    sqlx::query("UPDATE mail_bodies SET expires_at = NOW() - INTERVAL '1 day' WHERE email_id = $1")
        .bind(email_id)
        .execute(db.pool())
        .await
        .expect("age the row");

    let removed = app
        .bodies
        .cleanup_expired(chrono::Utc::now())
        .await
        .expect("cleanup");
    assert_eq!(removed, 1);

    assert!(app.bodies.get(email_id).await.expect("get").is_none());
    assert!(app.emails.get(email_id).await.expect("get").is_some());

    db.close().await.expect("drop test database");
}

#[tokio::test]
async fn compression_stats_aggregate() {
    let db = TestDatabase::new().await.expect("test database");
    let fixtures = TestFixtures::new(db.pool());
    let connection = fixtures
        .create_connection(ProviderKind::Gmail, "user@example.com")
        .await
        .expect("connection");

    let app = common::build_app(db.pool_clone(), "http://localhost:1");

    let small = fixtures
        .insert_mail(&connection, "s1", "small")
        .await
        .expect("mail");
    let large = fixtures
        .insert_mail(&connection, "l1", "large")
        .await
        .expect("mail");

    app.bodies
        .save(&BodyDraft {
            email_id: small,
            html: None,
            text: Some("tiny".to_string()),
            attachments_meta: json!([]),
        })
        .await
        .expect("save");
    app.bodies
        .save(&BodyDraft {
            email_id: large,
            html: None,
            text: Some("x".repeat(5000)),
            attachments_meta: json!([]),
        })
        .await
        .expect("save");

    let stats = app.bodies.compression_stats().await.expect("stats");
    assert_eq!(stats.bodies, 2);
    assert_eq!(stats.compressed, 1);
    assert_eq!(stats.total_original, 4 + 5000);
    assert!(stats.total_compressed < stats.total_original);

    db.close().await.expect("drop test database");
}
