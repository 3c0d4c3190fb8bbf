//! v001 -- Initial schema creation.
//!
//! Creates the gateway tables: `users`, `sessions`, `agents`, `agent_health`,
//! `audit_log`, `rate_limit_windows`, `vault_config`, `dispatch_sessions`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id            TEXT PRIMARY KEY NOT NULL,  -- 128-bit random hex
    email         TEXT NOT NULL UNIQUE,       -- lowercased
    display_name  TEXT NOT NULL,
    password_hash TEXT NOT NULL,              -- salt_hex:derived_hex (scrypt)
    role          TEXT NOT NULL,              -- admin | operator | viewer
    totp_secret   TEXT,                       -- base32, null until enrolment
    totp_enabled  INTEGER NOT NULL DEFAULT 0, -- boolean 0/1
    backup_codes  TEXT NOT NULL DEFAULT '[]', -- JSON array of uppercase hex
    created_at    TEXT NOT NULL,              -- ISO-8601 / RFC-3339
    updated_at    TEXT NOT NULL,
    last_login_at TEXT
);

-- ----------------------------------------------------------------
-- Auth sessions (one row per minted session token)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS sessions (
    id         TEXT PRIMARY KEY NOT NULL,
    user_id    TEXT NOT NULL,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    revoked    INTEGER NOT NULL DEFAULT 0,

    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_sessions_user_id ON sessions(user_id);

-- ----------------------------------------------------------------
-- Agents (LLM backends)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS agents (
    id          TEXT PRIMARY KEY NOT NULL,
    name        TEXT NOT NULL,
    type        TEXT NOT NULL,                -- local_inference | code_assistant | hosted_a | hosted_b | custom
    endpoint    TEXT NOT NULL,                -- http/https URL
    model       TEXT NOT NULL,
    max_tokens  INTEGER NOT NULL,
    temperature REAL NOT NULL,
    priority    INTEGER NOT NULL,
    weight      INTEGER NOT NULL,
    tags        TEXT NOT NULL DEFAULT '[]',   -- JSON array
    metadata    TEXT NOT NULL DEFAULT '{}',   -- JSON object
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Agent health (one row per agent, destroyed on cascade)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS agent_health (
    agent_id        TEXT PRIMARY KEY NOT NULL,
    status          TEXT NOT NULL,            -- online | offline | degraded | maintenance
    latency_ms      INTEGER NOT NULL DEFAULT 0,
    success_rate    REAL NOT NULL DEFAULT 1.0,
    request_count   INTEGER NOT NULL DEFAULT 0,
    error_count     INTEGER NOT NULL DEFAULT 0,
    last_checked_at TEXT NOT NULL,
    details         TEXT NOT NULL DEFAULT '',

    FOREIGN KEY (agent_id) REFERENCES agents(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Audit log (append-only hash chain)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS audit_log (
    id                   TEXT PRIMARY KEY NOT NULL,
    action               TEXT NOT NULL,
    actor_user_id        TEXT,
    actor_email          TEXT,
    ip                   TEXT,
    user_agent           TEXT,
    resource_type        TEXT,
    resource_id          TEXT,
    details              TEXT NOT NULL DEFAULT '{}',  -- JSON object
    previous_fingerprint TEXT NOT NULL,               -- 64 hex, or GENESIS
    fingerprint          TEXT NOT NULL,               -- 64 hex
    timestamp            TEXT NOT NULL                -- ISO-8601, microseconds, Z
);

CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_audit_actor ON audit_log(actor_user_id);

-- ----------------------------------------------------------------
-- Rate-limit windows (tumbling buckets, pruned lazily)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS rate_limit_windows (
    key          TEXT NOT NULL,
    window_start TEXT NOT NULL,               -- ISO-8601, millisecond aligned
    count        INTEGER NOT NULL DEFAULT 0,

    PRIMARY KEY (key, window_start)
);

-- ----------------------------------------------------------------
-- Vault configuration (single row)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS vault_config (
    id                     INTEGER PRIMARY KEY CHECK (id = 1),
    api_key_ciphertext     TEXT,              -- iv_hex:tag_hex:ciphertext_hex
    base_url               TEXT NOT NULL,
    model                  TEXT NOT NULL,
    max_tokens_per_request INTEGER NOT NULL,
    updated_at             TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Dispatch sessions (running peanut counter per conversation)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS dispatch_sessions (
    id            TEXT PRIMARY KEY NOT NULL,
    agent_id      TEXT,                       -- last agent that served it
    model         TEXT,                       -- last model that served it
    peanuts       INTEGER NOT NULL DEFAULT 0, -- accumulated tokens_used
    request_count INTEGER NOT NULL DEFAULT 0,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
