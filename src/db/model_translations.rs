//! Global model-name translations, applied when an account carries no
//! per-account mapping.

use sqlx::sqlite::SqlitePool;

use crate::models::ModelTranslation;

use super::with_retry;

pub struct ModelTranslationRepo<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ModelTranslationRepo<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn list(&self) -> Result<Vec<ModelTranslation>, sqlx::Error> {
        sqlx::query_as::<_, ModelTranslation>(
            "SELECT source, target FROM model_translations ORDER BY source",
        )
        .fetch_all(self.pool)
        .await
    }

    pub async fn get(&self, source: &str) -> Result<Option<String>, sqlx::Error> {
        sqlx::query_scalar("SELECT target FROM model_translations WHERE source = ?")
            .bind(source)
            .fetch_optional(self.pool)
            .await
    }

    pub async fn upsert(&self, source: &str, target: &str) -> Result<(), sqlx::Error> {
        with_retry("model_translations.upsert", || async move {
            sqlx::query(
                "INSERT INTO model_translations (source, target) VALUES (?, ?) \
                 ON CONFLICT(source) DO UPDATE SET target = excluded.target",
            )
            .bind(source)
            .bind(target)
            .execute(self.pool)
            .await
            .map(|_| ())
        })
        .await
    }

    pub async fn delete(&self, source: &str) -> Result<bool, sqlx::Error> {
        let result = with_retry("model_translations.delete", || async move {
            sqlx::query("DELETE FROM model_translations WHERE source = ?")
                .bind(source)
                .execute(self.pool)
                .await
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
