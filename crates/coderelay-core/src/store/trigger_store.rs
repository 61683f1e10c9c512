use chrono::{TimeZone, Utc};
use rusqlite::OptionalExtension;
use uuid::Uuid;

use crate::db::Database;
use crate::error::EngineError;
use crate::models::trigger::{CreateTriggerInput, TriggerDef, TriggerKind, UpdateTriggerInput};

/// Store for trigger definitions. Mutated only through these CRUD entry
/// points; read-only to the fallback router.
#[derive(Clone)]
pub struct TriggerStore {
    db: Database,
}

impl TriggerStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, input: CreateTriggerInput) -> Result<TriggerDef, EngineError> {
        let now = Utc::now();
        let t = TriggerDef {
            id: Uuid::new_v4().to_string(),
            name: input.name,
            kind: input.kind,
            prompt_template: input.prompt_template,
            working_dir: input.working_dir,
            fallback_chain: input.fallback_chain,
            budget_limit_microusd: input.budget_limit_microusd,
            grace_kill_secs: input.grace_kill_secs,
            enabled: input.enabled,
            created_at: now,
            updated_at: now,
        };
        let tc = t.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO triggers (id, name, kind, prompt_template, working_dir, \
                     fallback_chain, budget_limit_microusd, grace_kill_secs, enabled, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    rusqlite::params![
                        tc.id,
                        tc.name,
                        tc.kind.as_str(),
                        tc.prompt_template,
                        tc.working_dir,
                        serde_json::to_string(&tc.fallback_chain).unwrap_or_else(|_| "[]".into()),
                        tc.budget_limit_microusd,
                        tc.grace_kill_secs as i64,
                        tc.enabled as i64,
                        tc.created_at.timestamp_millis(),
                        tc.updated_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(t)
    }

    pub async fn get(&self, id: &str) -> Result<Option<TriggerDef>, EngineError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM triggers WHERE id = ?1", COLUMNS),
                    rusqlite::params![id],
                    |row| Ok(row_to_trigger(row)),
                )
                .optional()
            })
            .await
    }

    pub async fn list(&self) -> Result<Vec<TriggerDef>, EngineError> {
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM triggers ORDER BY created_at DESC",
                    COLUMNS
                ))?;
                let rows = stmt
                    .query_map([], |row| Ok(row_to_trigger(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn update(
        &self,
        id: &str,
        input: UpdateTriggerInput,
    ) -> Result<Option<TriggerDef>, EngineError> {
        let existing = self.get(id).await?;
        let Some(mut t) = existing else { return Ok(None) };
        if let Some(v) = input.name { t.name = v; }
        if let Some(v) = input.kind { t.kind = v; }
        if let Some(v) = input.prompt_template { t.prompt_template = v; }
        if let Some(v) = input.working_dir { t.working_dir = v; }
        if let Some(v) = input.fallback_chain { t.fallback_chain = v; }
        if let Some(v) = input.budget_limit_microusd { t.budget_limit_microusd = Some(v); }
        if let Some(v) = input.grace_kill_secs { t.grace_kill_secs = v; }
        if let Some(v) = input.enabled { t.enabled = v; }
        t.updated_at = Utc::now();
        let tc = t.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE triggers SET name=?2, kind=?3, prompt_template=?4, working_dir=?5, \
                     fallback_chain=?6, budget_limit_microusd=?7, grace_kill_secs=?8, enabled=?9, \
                     updated_at=?10 WHERE id=?1",
                    rusqlite::params![
                        tc.id,
                        tc.name,
                        tc.kind.as_str(),
                        tc.prompt_template,
                        tc.working_dir,
                        serde_json::to_string(&tc.fallback_chain).unwrap_or_else(|_| "[]".into()),
                        tc.budget_limit_microusd,
                        tc.grace_kill_secs as i64,
                        tc.enabled as i64,
                        tc.updated_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(Some(t))
    }

    pub async fn delete(&self, id: &str) -> Result<bool, EngineError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute("DELETE FROM triggers WHERE id = ?1", rusqlite::params![id])?;
                Ok(n > 0)
            })
            .await
    }
}

const COLUMNS: &str = "id, name, kind, prompt_template, working_dir, fallback_chain, \
                       budget_limit_microusd, grace_kill_secs, enabled, created_at, updated_at";

fn row_to_trigger(row: &rusqlite::Row<'_>) -> TriggerDef {
    let to_dt = |ms: Option<i64>| ms.and_then(|v| Utc.timestamp_millis_opt(v).single());

    TriggerDef {
        id: row.get(0).unwrap_or_default(),
        name: row.get(1).unwrap_or_default(),
        kind: TriggerKind::parse(&row.get::<_, String>(2).unwrap_or_default())
            .unwrap_or(TriggerKind::Webhook),
        prompt_template: row.get(3).unwrap_or_default(),
        working_dir: row.get(4).unwrap_or_else(|_| ".".to_string()),
        fallback_chain: serde_json::from_str(&row.get::<_, String>(5).unwrap_or_default())
            .unwrap_or_default(),
        budget_limit_microusd: row.get(6).unwrap_or(None),
        grace_kill_secs: row.get::<_, i64>(7).unwrap_or(5) as u64,
        enabled: row.get::<_, i64>(8).unwrap_or(0) != 0,
        created_at: to_dt(row.get(9).ok()).unwrap_or_else(Utc::now),
        updated_at: to_dt(row.get(10).ok()).unwrap_or_else(Utc::now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_preserves_fallback_chain_order() {
        let db = Database::open_in_memory().unwrap();
        let store = TriggerStore::new(db);

        let created = store
            .create(CreateTriggerInput {
                name: "on-issue".to_string(),
                kind: TriggerKind::Github,
                prompt_template: "Fix: ${payload.title}".to_string(),
                working_dir: "/tmp/repo".to_string(),
                fallback_chain: vec!["acc-a".into(), "acc-b".into(), "acc-c".into()],
                budget_limit_microusd: Some(10_000_000),
                grace_kill_secs: 5,
                enabled: true,
            })
            .await
            .unwrap();

        let loaded = store.get(&created.id).await.unwrap().unwrap();
        assert_eq!(loaded.fallback_chain, vec!["acc-a", "acc-b", "acc-c"]);
        assert_eq!(loaded.kind, TriggerKind::Github);
        assert_eq!(loaded.budget_limit_microusd, Some(10_000_000));
    }
}
