//! SQLite-backed authoring store and trust authority.
//!
//! A single connection behind a mutex, WAL journaling, explicit
//! transactions. Flag rules and variations are stored as JSON columns; the
//! relational surface is only what the publish pipeline and token checks
//! need. SQLite serializes writers anyway, so the mutex costs nothing
//! beyond what the database would impose.
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use pennant_core::authoring::{
    AuthoringStore, EnvironmentRecord, FlagRecord, NewToken, PublishInputs, SegmentRecord, Trust,
};
use pennant_core::snapshot::{FlagStatus, FlagType, Timestamp};
use pennant_core::token::{TokenRecord, TokenScope};
use pennant_core::{Error, Result};

const SCHEMA_VERSION: i64 = 1;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS orgs (
    org_id      INTEGER PRIMARY KEY,
    slug        TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS projects (
    project_id  INTEGER PRIMARY KEY,
    org_id      INTEGER NOT NULL REFERENCES orgs(org_id),
    slug        TEXT NOT NULL,
    UNIQUE(org_id, slug)
);
CREATE TABLE IF NOT EXISTS environments (
    env_id      INTEGER PRIMARY KEY,
    project_id  INTEGER REFERENCES projects(project_id),
    env_key     TEXT NOT NULL UNIQUE,
    salt        TEXT NOT NULL,
    version     INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS flags (
    flag_id             INTEGER PRIMARY KEY,
    env_id              INTEGER NOT NULL REFERENCES environments(env_id),
    key                 TEXT NOT NULL,
    flag_type           TEXT NOT NULL,
    status              TEXT NOT NULL DEFAULT 'active',
    default_variation   TEXT NOT NULL,
    variations_json     TEXT NOT NULL,
    rules_json          TEXT NOT NULL,
    traffic_allocation  REAL NOT NULL DEFAULT 1.0,
    published           INTEGER NOT NULL DEFAULT 0,
    version             INTEGER NOT NULL DEFAULT 1,
    UNIQUE(env_id, key)
);
CREATE TABLE IF NOT EXISTS segments (
    segment_id  INTEGER PRIMARY KEY,
    env_id      INTEGER NOT NULL REFERENCES environments(env_id),
    key         TEXT NOT NULL,
    rules_json  TEXT NOT NULL,
    UNIQUE(env_id, key)
);
CREATE TABLE IF NOT EXISTS api_tokens (
    token_id      INTEGER PRIMARY KEY,
    env_id        INTEGER NOT NULL REFERENCES environments(env_id),
    scope         TEXT NOT NULL,
    hashed_token  TEXT NOT NULL,
    prefix        TEXT NOT NULL,
    is_active     INTEGER NOT NULL DEFAULT 1,
    expires_at    TEXT,
    last_used_at  TEXT
);
CREATE INDEX IF NOT EXISTS idx_api_tokens_prefix ON api_tokens(prefix);
";

/// Authoring store + trust authority in one SQLite file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (and migrate) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<SqliteStore> {
        Self::from_connection(Connection::open(path).map_err(db_err)?)
    }

    /// An in-memory store, used by tests and throwaway environments.
    pub fn open_in_memory() -> Result<SqliteStore> {
        Self::from_connection(Connection::open_in_memory().map_err(db_err)?)
    }

    fn from_connection(conn: Connection) -> Result<SqliteStore> {
        conn.busy_timeout(BUSY_TIMEOUT).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;").map_err(db_err)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;").map_err(db_err)?;

        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(db_err)?;
        if version < SCHEMA_VERSION {
            conn.execute_batch(SCHEMA).map_err(db_err)?;
            conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))
                .map_err(db_err)?;
        }

        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    /// Create an environment with a freshly generated salt. The salt never
    /// changes afterwards.
    pub fn create_environment(&self, env_key: &str) -> Result<EnvironmentRecord> {
        use rand::RngCore;
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        let salt = hex::encode(salt);

        let conn = self.lock();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO environments (env_key, salt) VALUES (?1, ?2)",
                params![env_key, salt],
            )
            .map_err(db_err)?;
        if inserted == 0 {
            return Err(Error::Conflict(format!(
                "environment {env_key} already exists"
            )));
        }
        drop(conn);
        self.environment_by_key(env_key)
    }

    /// Insert or replace a flag's authoring state.
    pub fn put_flag(&self, flag: &FlagRecord) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO flags
                 (env_id, key, flag_type, status, default_variation,
                  variations_json, rules_json, traffic_allocation, published, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(env_id, key) DO UPDATE SET
                 flag_type = excluded.flag_type,
                 status = excluded.status,
                 default_variation = excluded.default_variation,
                 variations_json = excluded.variations_json,
                 rules_json = excluded.rules_json,
                 traffic_allocation = excluded.traffic_allocation,
                 published = excluded.published,
                 version = flags.version + 1",
            params![
                flag.env_id,
                flag.key,
                flag_type_str(flag.flag_type),
                status_str(flag.status),
                flag.default_variation_key,
                serde_json::to_string(&flag.variations)?,
                serde_json::to_string(&flag.rules)?,
                flag.traffic_allocation,
                flag.published,
                flag.version as i64,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Insert or replace a segment.
    pub fn put_segment(&self, segment: &SegmentRecord) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO segments (env_id, key, rules_json) VALUES (?1, ?2, ?3)
             ON CONFLICT(env_id, key) DO UPDATE SET rules_json = excluded.rules_json",
            params![
                segment.env_id,
                segment.key,
                serde_json::to_string(&segment.conditions)?
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .expect("thread holding store lock should not panic")
    }
}

impl AuthoringStore for SqliteStore {
    fn environment_by_id(&self, env_id: i64) -> Result<EnvironmentRecord> {
        let conn = self.lock();
        conn.query_row(
            "SELECT env_id, env_key, salt, version FROM environments WHERE env_id = ?1",
            params![env_id],
            environment_from_row,
        )
        .optional()
        .map_err(db_err)?
        .ok_or(Error::NotFound("environment"))
    }

    fn environment_by_key(&self, env_key: &str) -> Result<EnvironmentRecord> {
        let conn = self.lock();
        conn.query_row(
            "SELECT env_id, env_key, salt, version FROM environments WHERE env_key = ?1",
            params![env_key],
            environment_from_row,
        )
        .optional()
        .map_err(db_err)?
        .ok_or(Error::NotFound("environment"))
    }

    fn publish_inputs(&self, env_id: i64) -> Result<PublishInputs> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(db_err)?;

        // The fetch-and-add is the single-writer guarantee: racing
        // compilations commit distinct versions and the higher one wins
        // downstream.
        let bumped = tx
            .execute(
                "UPDATE environments SET version = version + 1 WHERE env_id = ?1",
                params![env_id],
            )
            .map_err(db_err)?;
        if bumped == 0 {
            return Err(Error::NotFound("environment"));
        }

        let environment = tx
            .query_row(
                "SELECT env_id, env_key, salt, version FROM environments WHERE env_id = ?1",
                params![env_id],
                environment_from_row,
            )
            .map_err(db_err)?;

        let flags = {
            let mut stmt = tx
                .prepare(
                    "SELECT flag_id, env_id, key, flag_type, status, default_variation,
                            variations_json, rules_json, traffic_allocation, published, version
                     FROM flags WHERE env_id = ?1 ORDER BY key",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![env_id], flag_from_row)
                .map_err(db_err)?;
            let mut flags = Vec::new();
            for row in rows {
                flags.push(row.map_err(db_err)?);
            }
            flags
        };

        let segments = {
            let mut stmt = tx
                .prepare(
                    "SELECT segment_id, env_id, key, rules_json
                     FROM segments WHERE env_id = ?1 ORDER BY key",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![env_id], segment_from_row)
                .map_err(db_err)?;
            let mut segments = Vec::new();
            for row in rows {
                segments.push(row.map_err(db_err)?);
            }
            segments
        };

        tx.commit().map_err(db_err)?;

        Ok(PublishInputs {
            environment,
            flags,
            segments,
        })
    }

    fn set_flag_published(&self, env_id: i64, flag_key: &str, published: bool) -> Result<()> {
        let conn = self.lock();
        let current: Option<bool> = conn
            .query_row(
                "SELECT published FROM flags WHERE env_id = ?1 AND key = ?2",
                params![env_id, flag_key],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        match current {
            None => Err(Error::NotFound("flag")),
            Some(state) if state == published => Err(Error::Conflict(format!(
                "flag {flag_key} is already {}",
                if published { "published" } else { "unpublished" }
            ))),
            Some(_) => {
                conn.execute(
                    "UPDATE flags SET published = ?3, version = version + 1
                     WHERE env_id = ?1 AND key = ?2",
                    params![env_id, flag_key, published],
                )
                .map_err(db_err)?;
                Ok(())
            }
        }
    }
}

impl Trust for SqliteStore {
    fn create_token(&self, token: NewToken) -> Result<TokenRecord> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO api_tokens (env_id, scope, hashed_token, prefix, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                token.env_id,
                scope_str(token.scope),
                token.hashed_secret,
                token.prefix,
                token.expires_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(db_err)?;
        let token_id = conn.last_insert_rowid();
        conn.query_row(
            "SELECT token_id, env_id, scope, hashed_token, prefix, is_active, expires_at, last_used_at
             FROM api_tokens WHERE token_id = ?1",
            params![token_id],
            token_from_row,
        )
        .map_err(db_err)
    }

    fn revoke_token(&self, token_id: i64) -> Result<()> {
        let conn = self.lock();
        let updated = conn
            .execute(
                "UPDATE api_tokens SET is_active = 0 WHERE token_id = ?1",
                params![token_id],
            )
            .map_err(db_err)?;
        if updated == 0 {
            return Err(Error::NotFound("token"));
        }
        Ok(())
    }

    fn tokens_by_prefix(&self, prefix: &str) -> Result<Vec<TokenRecord>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT token_id, env_id, scope, hashed_token, prefix, is_active, expires_at, last_used_at
                 FROM api_tokens WHERE prefix = ?1 AND is_active = 1",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![prefix], token_from_row)
            .map_err(db_err)?;
        let mut tokens = Vec::new();
        for row in rows {
            tokens.push(row.map_err(db_err)?);
        }
        Ok(tokens)
    }

    fn touch_last_used(&self, token_id: i64, at: Timestamp) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE api_tokens SET last_used_at = ?2 WHERE token_id = ?1",
            params![token_id, at.to_rfc3339()],
        )
        .map_err(db_err)?;
        Ok(())
    }
}

fn environment_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EnvironmentRecord> {
    Ok(EnvironmentRecord {
        env_id: row.get(0)?,
        env_key: row.get(1)?,
        salt: row.get(2)?,
        version: row.get::<_, i64>(3)? as u64,
    })
}

fn flag_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FlagRecord> {
    let flag_type: String = row.get(3)?;
    let status: String = row.get(4)?;
    let variations_json: String = row.get(6)?;
    let rules_json: String = row.get(7)?;
    Ok(FlagRecord {
        flag_id: row.get(0)?,
        env_id: row.get(1)?,
        key: row.get(2)?,
        flag_type: parse_flag_type(&flag_type),
        status: parse_status(&status),
        default_variation_key: row.get(5)?,
        variations: parse_json_column(6, &variations_json)?,
        rules: parse_json_column(7, &rules_json)?,
        traffic_allocation: row.get(8)?,
        published: row.get(9)?,
        version: row.get::<_, i64>(10)? as u64,
    })
}

fn segment_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SegmentRecord> {
    let rules_json: String = row.get(3)?;
    Ok(SegmentRecord {
        segment_id: row.get(0)?,
        env_id: row.get(1)?,
        key: row.get(2)?,
        conditions: parse_json_column(3, &rules_json)?,
    })
}

fn parse_json_column<T: serde::de::DeserializeOwned>(
    index: usize,
    json: &str,
) -> rusqlite::Result<T> {
    serde_json::from_str(json).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(err))
    })
}

fn token_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TokenRecord> {
    let scope: String = row.get(2)?;
    let expires_at: Option<String> = row.get(6)?;
    let last_used_at: Option<String> = row.get(7)?;
    Ok(TokenRecord {
        token_id: row.get(0)?,
        env_id: row.get(1)?,
        scope: parse_scope(&scope),
        hashed_secret: row.get(3)?,
        prefix: row.get(4)?,
        is_active: row.get(5)?,
        expires_at: expires_at.and_then(parse_timestamp),
        last_used_at: last_used_at.and_then(parse_timestamp),
    })
}

fn parse_timestamp(text: String) -> Option<Timestamp> {
    DateTime::parse_from_rfc3339(&text)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn flag_type_str(t: FlagType) -> &'static str {
    match t {
        FlagType::Boolean => "boolean",
        FlagType::String => "string",
        FlagType::Number => "number",
        FlagType::Json => "json",
        FlagType::Multivariate => "multivariate",
    }
}

fn parse_flag_type(s: &str) -> FlagType {
    match s {
        "string" => FlagType::String,
        "number" => FlagType::Number,
        "json" => FlagType::Json,
        "multivariate" => FlagType::Multivariate,
        _ => FlagType::Boolean,
    }
}

fn status_str(s: FlagStatus) -> &'static str {
    match s {
        FlagStatus::Active => "active",
        FlagStatus::Archived => "archived",
    }
}

fn parse_status(s: &str) -> FlagStatus {
    if s == "archived" {
        FlagStatus::Archived
    } else {
        FlagStatus::Active
    }
}

fn scope_str(s: TokenScope) -> &'static str {
    match s {
        TokenScope::Read => "read",
        TokenScope::Write => "write",
    }
}

fn parse_scope(s: &str) -> TokenScope {
    if s == "write" {
        TokenScope::Write
    } else {
        TokenScope::Read
    }
}

fn db_err(err: rusqlite::Error) -> Error {
    Error::Unavailable(format!("sqlite: {err}"))
}
