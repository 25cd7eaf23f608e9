use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgPoolOptions};
use tracing::info;

use crate::{
    error::{FlowError, Result},
    storage::FlowStorage,
};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS form_flow_storage (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// FlowStorage backed by a PostgreSQL key-value table.
#[derive(Clone)]
pub struct PostgresFlowStorage {
    pool: PgPool,
}

impl PostgresFlowStorage {
    /// Connects and creates the storage table if it does not exist yet.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(storage_error)?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: PgPool) -> Result<Self> {
        sqlx::query(CREATE_TABLE)
            .execute(&pool)
            .await
            .map_err(storage_error)?;
        info!("form_flow_storage table ready");
        Ok(Self { pool })
    }
}

fn storage_error(e: sqlx::Error) -> FlowError {
    FlowError::Storage(e.to_string())
}

#[async_trait]
impl FlowStorage for PostgresFlowStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM form_flow_storage WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;
        row.map(|row| row.try_get::<String, _>("value"))
            .transpose()
            .map_err(storage_error)
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO form_flow_storage (key, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM form_flow_storage WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;
        Ok(())
    }
}
