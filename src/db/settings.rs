//! Runtime-tunable settings persisted as a key/value row.

use sqlx::sqlite::SqlitePool;

use crate::config::RuntimeSettings;

use super::with_retry;

const SETTINGS_KEY: &str = "runtime_settings";

pub struct SettingsRepo<'a> {
    pool: &'a SqlitePool,
}

impl<'a> SettingsRepo<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Stored settings, or defaults when absent or unreadable.
    pub async fn load(&self) -> Result<RuntimeSettings, sqlx::Error> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT value FROM app_config WHERE key = ?")
                .bind(SETTINGS_KEY)
                .fetch_optional(self.pool)
                .await?;
        Ok(raw
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default())
    }

    pub async fn save(&self, settings: &RuntimeSettings) -> Result<(), sqlx::Error> {
        let encoded = serde_json::to_string(settings)
            .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        let raw = encoded.as_str();
        with_retry("settings.save", || async move {
            sqlx::query(
                "INSERT INTO app_config (key, value) VALUES (?, ?) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )
            .bind(SETTINGS_KEY)
            .bind(raw)
            .execute(self.pool)
            .await
            .map(|_| ())
        })
        .await
    }
}
