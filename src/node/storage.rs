/// Node-type persistence
///
/// The registry writes schemas through to a `NodeTypeStore` and reads them back on
/// cold start. `SqliteNodeTypeStore` keeps schemas as JSON in SQLite via sqlx.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqlitePool, Row};

use crate::node::types::NodeSchema;

/// Persisted form of a registered node type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTypeRecord {
    pub schema: NodeSchema,
    /// Script source for script-form nodes; host nodes cannot be persisted as code
    pub script: Option<String>,
    /// Externally tracked activation flag
    pub active: bool,
}

/// External store for node types (create/update/find)
#[async_trait]
pub trait NodeTypeStore: Send + Sync {
    async fn create(&self, record: &NodeTypeRecord) -> Result<()>;
    async fn update(&self, record: &NodeTypeRecord) -> Result<()>;
    async fn find(&self, identifier: &str) -> Result<Option<NodeTypeRecord>>;
}

/// SQLite-based node-type storage
#[derive(Debug, Clone)]
pub struct SqliteNodeTypeStore {
    /// SQLite connection pool for the node-type database
    pool: SqlitePool,
}

impl SqliteNodeTypeStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url`, creating the file when missing, and ensure the schema
    pub async fn connect(database_url: &str) -> Result<Self> {
        use sqlx::sqlite::SqliteConnectOptions;
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self::new(pool);
        store.init_schema().await?;
        Ok(store)
    }

    /// Create the node_types table. Safe to call multiple times.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS node_types (
                identifier TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                definition JSON NOT NULL,
                script TEXT,
                active BOOLEAN NOT NULL DEFAULT 1,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl NodeTypeStore for SqliteNodeTypeStore {
    async fn create(&self, record: &NodeTypeRecord) -> Result<()> {
        let definition_json = serde_json::to_string(&record.schema)?;

        sqlx::query(
            r#"
            INSERT INTO node_types (identifier, version, definition, script, active)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.schema.identifier)
        .bind(record.schema.version as i64)
        .bind(&definition_json)
        .bind(&record.script)
        .bind(record.active)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Overwrite every stored column of an existing row, including `active`
    async fn update(&self, record: &NodeTypeRecord) -> Result<()> {
        let definition_json = serde_json::to_string(&record.schema)?;

        let result = sqlx::query(
            r#"
            UPDATE node_types
            SET version = ?, definition = ?, script = ?, active = ?, updated_at = CURRENT_TIMESTAMP
            WHERE identifier = ?
            "#,
        )
        .bind(record.schema.version as i64)
        .bind(&definition_json)
        .bind(&record.script)
        .bind(record.active)
        .bind(&record.schema.identifier)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(anyhow::anyhow!("Node type not found: {}", record.schema.identifier));
        }

        Ok(())
    }

    async fn find(&self, identifier: &str) -> Result<Option<NodeTypeRecord>> {
        let row = sqlx::query("SELECT definition, script, active FROM node_types WHERE identifier = ?")
            .bind(identifier)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let definition_json: String = row.get("definition");
                let schema: NodeSchema = serde_json::from_str(&definition_json)?;
                Ok(Some(NodeTypeRecord {
                    schema,
                    script: row.get("script"),
                    active: row.get("active"),
                }))
            }
            None => Ok(None),
        }
    }
}
