use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::VaultConfig;

impl Database {
    pub fn get_vault_config(&self) -> Result<Option<VaultConfig>> {
        self.conn()
            .query_row(
                "SELECT api_key_ciphertext, base_url, model, max_tokens_per_request, updated_at
                 FROM vault_config WHERE id = 1",
                [],
                row_to_config,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(StoreError::Sqlite(other)),
            })
    }

    pub fn upsert_vault_config(&self, config: &VaultConfig) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO vault_config
                 (id, api_key_ciphertext, base_url, model, max_tokens_per_request, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5)",
            params![
                config.api_key_ciphertext,
                config.base_url,
                config.model,
                config.max_tokens_per_request,
                config.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

fn row_to_config(row: &rusqlite::Row<'_>) -> rusqlite::Result<VaultConfig> {
    let updated_str: String = row.get(4)?;
    let updated_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&updated_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(VaultConfig {
        api_key_ciphertext: row.get(0)?,
        base_url: row.get(1)?,
        model: row.get(2)?,
        max_tokens_per_request: row.get(3)?,
        updated_at,
    })
}
