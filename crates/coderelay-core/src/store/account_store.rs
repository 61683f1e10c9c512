use chrono::{TimeZone, Utc};
use rusqlite::OptionalExtension;
use uuid::Uuid;

use crate::db::Database;
use crate::error::EngineError;
use crate::models::account::{BackendAccount, BackendKind, CreateAccountInput};

/// Store for backend accounts referenced by trigger fallback chains.
#[derive(Clone)]
pub struct AccountStore {
    db: Database,
}

impl AccountStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, input: CreateAccountInput) -> Result<BackendAccount, EngineError> {
        let now = Utc::now();
        let a = BackendAccount {
            id: Uuid::new_v4().to_string(),
            name: input.name,
            backend: input.backend,
            api_key_env: input.api_key_env,
            model: input.model,
            base_url: input.base_url,
            created_at: now,
            updated_at: now,
        };
        let ac = a.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO accounts (id, name, backend, api_key_env, model, base_url, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        ac.id,
                        ac.name,
                        ac.backend.as_str(),
                        ac.api_key_env,
                        ac.model,
                        ac.base_url,
                        ac.created_at.timestamp_millis(),
                        ac.updated_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(a)
    }

    pub async fn get(&self, id: &str) -> Result<Option<BackendAccount>, EngineError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT id, name, backend, api_key_env, model, base_url, created_at, updated_at \
                     FROM accounts WHERE id = ?1",
                    rusqlite::params![id],
                    |row| Ok(row_to_account(row)),
                )
                .optional()
            })
            .await
    }

    pub async fn list(&self) -> Result<Vec<BackendAccount>, EngineError> {
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, backend, api_key_env, model, base_url, created_at, updated_at \
                     FROM accounts ORDER BY created_at ASC",
                )?;
                let rows = stmt
                    .query_map([], |row| Ok(row_to_account(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn delete(&self, id: &str) -> Result<bool, EngineError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute("DELETE FROM accounts WHERE id = ?1", rusqlite::params![id])?;
                Ok(n > 0)
            })
            .await
    }
}

fn row_to_account(row: &rusqlite::Row<'_>) -> BackendAccount {
    let to_dt = |ms: Option<i64>| ms.and_then(|v| Utc.timestamp_millis_opt(v).single());

    BackendAccount {
        id: row.get(0).unwrap_or_default(),
        name: row.get(1).unwrap_or_default(),
        backend: BackendKind::parse(&row.get::<_, String>(2).unwrap_or_default())
            .unwrap_or(BackendKind::ClaudeCode),
        api_key_env: row.get(3).unwrap_or(None),
        model: row.get(4).unwrap_or(None),
        base_url: row.get(5).unwrap_or(None),
        created_at: to_dt(row.get(6).ok()).unwrap_or_else(Utc::now),
        updated_at: to_dt(row.get(7).ok()).unwrap_or_else(Utc::now),
    }
}
