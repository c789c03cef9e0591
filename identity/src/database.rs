use std::path::PathBuf;

use async_trait::async_trait;
use authz::DatabaseUserRecord;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{migrate::MigrateDatabase, FromRow, Pool, Sqlite};
use tracing::{info, warn};

use crate::error::{IdentityError, Result};
use crate::provider::UserDirectory;

/// Configuration for the user directory database
#[derive(Debug, Clone)]
pub struct UserDatabaseConfig {
    /// Path to the database file
    pub database_path: PathBuf,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
}

impl Default for UserDatabaseConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/identity/users.db"),
            max_connections: 5,
        }
    }
}

#[derive(Debug, FromRow)]
struct UserRow {
    id: String,
    external_id: String,
    org_id: Option<String>,
    manager_id: Option<String>,
    is_staff: bool,
}

impl From<UserRow> for DatabaseUserRecord {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            external_id: row.external_id,
            org_id: row.org_id,
            manager_id: row.manager_id,
            is_staff: row.is_staff,
        }
    }
}

/// SQLite-backed application user records.
pub struct UserDatabase {
    pool: Pool<Sqlite>,
}

impl UserDatabase {
    /// Open (creating if needed) the database and run migrations.
    pub async fn new(config: UserDatabaseConfig) -> Result<Self> {
        if let Some(parent) = config.database_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite:{}", config.database_path.display());
        if !Sqlite::database_exists(&db_url).await.unwrap_or(false) {
            info!(
                "Creating user database at: {}",
                config.database_path.display()
            );
            Sqlite::create_database(&db_url).await.map_err(|e| {
                IdentityError::Initialization(format!("Failed to create database: {}", e))
            })?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(&config.database_path)
                    .create_if_missing(true),
            )
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;
        info!("User database initialized successfully");
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        info!("Running user database migrations");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                external_id TEXT NOT NULL UNIQUE,
                org_id TEXT,
                manager_id TEXT,
                is_staff BOOLEAN NOT NULL DEFAULT 0,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_users_org ON users(org_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Insert a user, or update the mutable fields of an existing one with
    /// the same external id.
    pub async fn upsert_user(&self, record: &DatabaseUserRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, external_id, org_id, manager_id, is_staff)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(external_id) DO UPDATE SET
                org_id = excluded.org_id,
                manager_id = excluded.manager_id,
                is_staff = excluded.is_staff,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&record.id)
        .bind(&record.external_id)
        .bind(&record.org_id)
        .bind(&record.manager_id)
        .bind(record.is_staff)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Returns false if no such user existed.
    pub async fn remove_user(&self, external_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM users WHERE external_id = ?")
            .bind(external_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            warn!("No user with external id {} to remove", external_id);
            return Ok(false);
        }
        Ok(true)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn close(self) -> Result<()> {
        self.pool.close().await;
        info!("User database connection closed");
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for UserDatabase {
    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<DatabaseUserRecord>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, external_id, org_id, manager_id, is_staff FROM users WHERE external_id = ?",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn list_external_ids(&self) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>("SELECT external_id FROM users ORDER BY external_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }
}
