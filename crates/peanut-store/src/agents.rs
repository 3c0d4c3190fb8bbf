use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Agent, AgentHealth, AgentType, HealthStatus};

impl Database {
    /// Insert an agent together with its initial health row.
    pub fn create_agent(&mut self, agent: &Agent, health: &AgentHealth) -> Result<()> {
        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "INSERT INTO agents (id, name, type, endpoint, model, max_tokens, temperature,
                                 priority, weight, tags, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                agent.id,
                agent.name,
                agent.agent_type.as_str(),
                agent.endpoint,
                agent.model,
                agent.max_tokens,
                agent.temperature,
                agent.priority,
                agent.weight,
                serde_json::to_string(&agent.tags)?,
                serde_json::to_string(&agent.metadata)?,
                agent.created_at.to_rfc3339(),
                agent.updated_at.to_rfc3339(),
            ],
        )?;
        tx.execute(
            "INSERT INTO agent_health (agent_id, status, latency_ms, success_rate,
                                       request_count, error_count, last_checked_at, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                health.agent_id,
                health.status.as_str(),
                health.latency_ms,
                health.success_rate,
                health.request_count,
                health.error_count,
                health.last_checked_at.to_rfc3339(),
                health.details,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_agent(&self, id: &str) -> Result<Agent> {
        self.conn()
            .query_row(
                &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1"),
                params![id],
                row_to_agent,
            )
            .map_err(not_found)
    }

    pub fn list_agents(&self) -> Result<Vec<Agent>> {
        let mut stmt = self
            .conn()
            .prepare(&format!("SELECT {AGENT_COLUMNS} FROM agents ORDER BY created_at ASC"))?;
        let rows = stmt.query_map([], row_to_agent)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    pub fn update_agent(&self, agent: &Agent) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE agents
             SET name = ?2, endpoint = ?3, model = ?4, max_tokens = ?5, temperature = ?6,
                 priority = ?7, weight = ?8, tags = ?9, metadata = ?10, updated_at = ?11
             WHERE id = ?1",
            params![
                agent.id,
                agent.name,
                agent.endpoint,
                agent.model,
                agent.max_tokens,
                agent.temperature,
                agent.priority,
                agent.weight,
                serde_json::to_string(&agent.tags)?,
                serde_json::to_string(&agent.metadata)?,
                agent.updated_at.to_rfc3339(),
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Delete an agent; the health row goes with it via cascade.
    pub fn delete_agent(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM agents WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    pub fn get_agent_health(&self, agent_id: &str) -> Result<AgentHealth> {
        self.conn()
            .query_row(
                &format!("SELECT {HEALTH_COLUMNS} FROM agent_health WHERE agent_id = ?1"),
                params![agent_id],
                row_to_health,
            )
            .map_err(not_found)
    }

    pub fn upsert_agent_health(&self, health: &AgentHealth) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO agent_health
                 (agent_id, status, latency_ms, success_rate, request_count,
                  error_count, last_checked_at, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                health.agent_id,
                health.status.as_str(),
                health.latency_ms,
                health.success_rate,
                health.request_count,
                health.error_count,
                health.last_checked_at.to_rfc3339(),
                health.details,
            ],
        )?;
        Ok(())
    }

    /// Agents whose current health row says `online`, in first-seen order.
    /// This is the weighted-selection candidate set.
    pub fn list_online_agents(&self) -> Result<Vec<Agent>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {AGENT_COLUMNS_QUALIFIED}
             FROM agents a
             JOIN agent_health h ON h.agent_id = a.id
             WHERE h.status = 'online'
             ORDER BY a.created_at ASC"
        ))?;
        let rows = stmt.query_map([], row_to_agent)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }
}

const AGENT_COLUMNS: &str = "id, name, type, endpoint, model, max_tokens, temperature, \
                             priority, weight, tags, metadata, created_at, updated_at";

const AGENT_COLUMNS_QUALIFIED: &str =
    "a.id, a.name, a.type, a.endpoint, a.model, a.max_tokens, a.temperature, \
     a.priority, a.weight, a.tags, a.metadata, a.created_at, a.updated_at";

const HEALTH_COLUMNS: &str = "agent_id, status, latency_ms, success_rate, request_count, \
                              error_count, last_checked_at, details";

fn not_found(e: rusqlite::Error) -> StoreError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
        other => StoreError::Sqlite(other),
    }
}

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<Agent> {
    let type_str: String = row.get(2)?;
    let tags_json: String = row.get(9)?;
    let metadata_json: String = row.get(10)?;
    let created_str: String = row.get(11)?;
    let updated_str: String = row.get(12)?;

    let agent_type = AgentType::parse(&type_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown agent type: {type_str}").into(),
        )
    })?;
    let tags: Vec<String> = serde_json::from_str(&tags_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let metadata: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(&metadata_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(10, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Agent {
        id: row.get(0)?,
        name: row.get(1)?,
        agent_type,
        endpoint: row.get(3)?,
        model: row.get(4)?,
        max_tokens: row.get(5)?,
        temperature: row.get(6)?,
        priority: row.get(7)?,
        weight: row.get(8)?,
        tags,
        metadata,
        created_at: parse_ts(11, &created_str)?,
        updated_at: parse_ts(12, &updated_str)?,
    })
}

fn row_to_health(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentHealth> {
    let status_str: String = row.get(1)?;
    let checked_str: String = row.get(6)?;

    let status = HealthStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown health status: {status_str}").into(),
        )
    })?;

    Ok(AgentHealth {
        agent_id: row.get(0)?,
        status,
        latency_ms: row.get(2)?,
        success_rate: row.get(3)?,
        request_count: row.get(4)?,
        error_count: row.get(5)?,
        last_checked_at: parse_ts(6, &checked_str)?,
        details: row.get(7)?,
    })
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}
