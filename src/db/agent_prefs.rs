//! Per-agent default-model preferences.

use sqlx::sqlite::SqlitePool;

use crate::models::AgentPreference;

use super::{now_ms, with_retry};

pub struct AgentPreferenceRepo<'a> {
    pool: &'a SqlitePool,
}

impl<'a> AgentPreferenceRepo<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn list(&self) -> Result<Vec<AgentPreference>, sqlx::Error> {
        sqlx::query_as::<_, AgentPreference>(
            "SELECT agent_id, model, updated_at FROM agent_preferences ORDER BY agent_id",
        )
        .fetch_all(self.pool)
        .await
    }

    pub async fn get(&self, agent_id: &str) -> Result<Option<AgentPreference>, sqlx::Error> {
        sqlx::query_as::<_, AgentPreference>(
            "SELECT agent_id, model, updated_at FROM agent_preferences WHERE agent_id = ?",
        )
        .bind(agent_id)
        .fetch_optional(self.pool)
        .await
    }

    pub async fn upsert(&self, agent_id: &str, model: &str) -> Result<(), sqlx::Error> {
        let now = now_ms();
        with_retry("agent_preferences.upsert", || async move {
            sqlx::query(
                "INSERT INTO agent_preferences (agent_id, model, updated_at) VALUES (?, ?, ?) \
                 ON CONFLICT(agent_id) DO UPDATE SET model = excluded.model, \
                 updated_at = excluded.updated_at",
            )
            .bind(agent_id)
            .bind(model)
            .bind(now)
            .execute(self.pool)
            .await
            .map(|_| ())
        })
        .await
    }

    pub async fn delete(&self, agent_id: &str) -> Result<bool, sqlx::Error> {
        let result = with_retry("agent_preferences.delete", || async move {
            sqlx::query("DELETE FROM agent_preferences WHERE agent_id = ?")
                .bind(agent_id)
                .execute(self.pool)
                .await
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
