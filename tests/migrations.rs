use sqlx::migrate::Migrator;
use sync_worker::test_support::{TestDatabase, TestDatabaseError};

static TEST_MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[tokio::test]
async fn migrations_apply_and_revert_cleanly() {
    let test_db = match TestDatabase::new_from_env().await {
        Ok(db) => db,
        Err(TestDatabaseError::MissingUrl) => {
            eprintln!("skipping migration revert test: TEST_DATABASE_URL not set");
            return;
        }
        Err(err) => panic!("failed to provision test database: {err:?}"),
    };

    let pool = test_db.pool_clone();

    TEST_MIGRATOR.run(&pool).await.expect("migrations run");

    TEST_MIGRATOR
        .undo(&pool, 0)
        .await
        .expect("migrations revert");

    let connection_tables: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = 'public' AND table_name = 'connections'",
    )
    .fetch_one(&pool)
    .await
    .expect("lookup succeeded");

    assert_eq!(
        connection_tables, 0,
        "connections should be dropped after revert"
    );

    TEST_MIGRATOR.run(&pool).await.expect("migrations rerun");

    let connection_tables_after: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = 'public' AND table_name = 'connections'",
    )
    .fetch_one(&pool)
    .await
    .expect("lookup succeeded");

    assert_eq!(connection_tables_after, 1);

    let bus_tables: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = 'public' AND table_name IN ('bus_records', 'bus_groups', 'bus_pending')",
    )
    .fetch_one(&pool)
    .await
    .expect("lookup succeeded");

    assert_eq!(bus_tables, 3);

    test_db.close().await.expect("failed to drop test database");
}
