pub mod bus;
pub mod config;
pub mod error;
pub mod models;
pub mod modifier;
pub mod oauth;
pub mod provider;
pub mod realtime;
pub mod repo;
pub mod scheduler;
pub mod sync;
pub mod webhook;
pub mod worker;

use sqlx::PgPool;
use sqlx::migrate::Migrator;

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    MIGRATOR.run(pool).await
}

#[cfg_attr(not(test), allow(dead_code))]
pub mod test_support {
    use crate::models::{Connection, ProviderKind};
    use crate::repo::{ConnectionRepository, NewConnection};
    use chrono::Utc;
    use sqlx::PgPool;
    use uuid::Uuid;

    pub use database::{TestDatabase, TestDatabaseError};

    /// Seeding helpers for integration tests.
    pub struct TestFixtures<'a> {
        pool: &'a PgPool,
    }

    impl<'a> TestFixtures<'a> {
        pub fn new(pool: &'a PgPool) -> Self {
            Self { pool }
        }

        /// Insert a connected account with non-expiring test tokens.
        pub async fn create_connection(
            &self,
            provider: ProviderKind,
            account_email: &str,
        ) -> Result<Connection, sqlx::Error> {
            let repo = ConnectionRepository::new(self.pool.clone());
            repo.create(NewConnection {
                user_id: Uuid::new_v4(),
                provider,
                account_email: account_email.to_string(),
                access_token: "test-access-token".to_string(),
                refresh_token: "test-refresh-token".to_string(),
                expires_at: Utc::now() + chrono::Duration::hours(1),
                is_default: true,
            })
            .await
        }

        /// Insert a minimal mirrored mail row and return its id.
        pub async fn insert_mail(
            &self,
            connection: &Connection,
            external_id: &str,
            subject: &str,
        ) -> Result<i64, sqlx::Error> {
            sqlx::query_scalar(
                r#"INSERT INTO mails (user_id, connection_id, external_id, subject, from_addr)
                   VALUES ($1, $2, $3, $4, 'peer@example.com')
                   RETURNING id"#,
            )
            .bind(connection.user_id)
            .bind(connection.id)
            .bind(external_id)
            .bind(subject)
            .fetch_one(self.pool)
            .await
        }
    }

    pub mod database {
        use log::LevelFilter;
        use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
        use sqlx::{ConnectOptions, PgPool};
        use testcontainers::{GenericImage, ImageExt, core::WaitFor};
        use testcontainers_modules::testcontainers::{
            ContainerAsync, core::error::TestcontainersError, runners::AsyncRunner,
        };
        use thiserror::Error;
        use tokio::runtime::Handle;
        use uuid::Uuid;

        #[derive(Debug, Error)]
        pub enum TestDatabaseError {
            #[error("TEST_DATABASE_URL not set")]
            MissingUrl,
            #[error("database error: {0}")]
            Sqlx(#[from] sqlx::Error),
            #[error("migration error: {0}")]
            Migration(#[from] sqlx::migrate::MigrateError),
            #[error("container error: {0}")]
            Container(#[from] TestcontainersError),
        }

        /// Ephemeral database factory for integration tests.
        pub struct TestDatabase {
            pool: Option<PgPool>,
            admin_options: PgConnectOptions,
            database_name: String,
            container: Option<ContainerAsync<GenericImage>>,
        }

        impl TestDatabase {
            pub async fn new_from_env() -> Result<Self, TestDatabaseError> {
                Self::new().await
            }

            /// Provision a fresh database in a disposable Postgres container.
            pub async fn new() -> Result<Self, TestDatabaseError> {
                let image = GenericImage::new("postgres", "16-alpine")
                    .with_wait_for(WaitFor::message_on_stdout(
                        "database system is ready to accept connections",
                    ))
                    .with_wait_for(WaitFor::message_on_stderr(
                        "database system is ready to accept connections",
                    ));

                let request = image
                    .with_env_var("POSTGRES_DB", "postgres")
                    .with_env_var("POSTGRES_USER", "postgres")
                    .with_env_var("POSTGRES_PASSWORD", "postgres");

                let container = request.start().await?;

                let host = container.get_host().await?.to_string();
                let port = container.get_host_port_ipv4(5432).await?;
                let admin_url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

                let base_options: PgConnectOptions =
                    admin_url.parse().map_err(TestDatabaseError::Sqlx)?;
                let base_options = base_options.log_statements(LevelFilter::Off);

                let admin_options = base_options.clone().database("postgres");
                let admin_pool = PgPoolOptions::new()
                    .max_connections(1)
                    .connect_with(admin_options.clone())
                    .await
                    .map_err(TestDatabaseError::Sqlx)?;

                let new_db_name = format!("sync_worker_{}", Uuid::new_v4().simple());
                let create_sql = format!("CREATE DATABASE \"{}\" TEMPLATE template0", new_db_name);
                sqlx::query(&create_sql)
                    .execute(&admin_pool)
                    .await
                    .map_err(TestDatabaseError::Sqlx)?;

                let pool = PgPoolOptions::new()
                    .max_connections(5)
                    .connect_with(base_options.clone().database(&new_db_name))
                    .await
                    .map_err(TestDatabaseError::Sqlx)?;

                crate::MIGRATOR.run(&pool).await?;

                Ok(Self {
                    pool: Some(pool),
                    admin_options,
                    database_name: new_db_name,
                    container: Some(container),
                })
            }

            pub fn pool(&self) -> &PgPool {
                self.pool.as_ref().expect("test database pool is available")
            }

            pub fn pool_clone(&self) -> PgPool {
                self.pool().clone()
            }

            /// Re-run migrations to ensure schema freshness (idempotent).
            pub async fn reset(&self) -> Result<(), TestDatabaseError> {
                crate::MIGRATOR.run(self.pool()).await?;
                Ok(())
            }

            /// Close pool connections and drop the ephemeral database.
            pub async fn close(mut self) -> Result<(), TestDatabaseError> {
                if let Some(pool) = self.pool.take() {
                    pool.close().await;
                }

                drop_database_with_fallback(self.admin_options.clone(), &self.database_name)
                    .await
                    .map_err(TestDatabaseError::Sqlx)?;

                if let Some(container) = self.container.take() {
                    drop(container);
                }

                Ok(())
            }
        }

        async fn drop_database_with_fallback(
            admin_options: PgConnectOptions,
            database_name: &str,
        ) -> Result<(), sqlx::Error> {
            let admin_pool = PgPoolOptions::new()
                .max_connections(1)
                .connect_with(admin_options)
                .await?;

            let drop_force = format!("DROP DATABASE \"{}\" WITH (FORCE)", database_name);
            match sqlx::query(&drop_force).execute(&admin_pool).await {
                Ok(_) => Ok(()),
                Err(err) if force_drop_unsupported(&err) => {
                    let drop_sql = format!("DROP DATABASE \"{}\"", database_name);
                    sqlx::query(&drop_sql).execute(&admin_pool).await?;
                    Ok(())
                }
                Err(err) => Err(err),
            }
        }

        fn force_drop_unsupported(err: &sqlx::Error) -> bool {
            matches!(
                err,
                sqlx::Error::Database(db_err)
                    if db_err
                        .code()
                        .map(|code| code == "42601" || code == "0A000")
                        .unwrap_or(false)
            )
        }

        impl Drop for TestDatabase {
            fn drop(&mut self) {
                if let Some(pool) = self.pool.take() {
                    let admin_options = self.admin_options.clone();
                    let db_name = self.database_name.clone();
                    if let Ok(handle) = Handle::try_current() {
                        handle.spawn(async move {
                            pool.close().await;
                            let _ =
                                drop_database_with_fallback(admin_options.clone(), &db_name).await;
                        });
                    } else {
                        std::thread::spawn(move || {
                            if let Ok(rt) = tokio::runtime::Runtime::new() {
                                rt.block_on(async move {
                                    pool.close().await;
                                    let _ = drop_database_with_fallback(
                                        admin_options.clone(),
                                        &db_name,
                                    )
                                    .await;
                                });
                            }
                        });
                    }
                }

                if let Some(container) = self.container.take() {
                    drop(container);
                }
            }
        }
    }
}
