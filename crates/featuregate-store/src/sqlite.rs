//! SQLite backend.
//!
//! One connection behind a mutex, WAL journal, busy timeout. Critical
//! sections are short: every method locks, runs its statements, and
//! releases before anything async happens. Cascades run manually inside
//! a transaction so a flag delete and its dependent rows commit
//! atomically. The organization scope is stored as `''` for the global
//! scope because SQLite's UNIQUE treats NULLs as distinct, which would
//! silently break `(organization, key)` uniqueness.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use featuregate_engine::{
    AuditId, Condition, EnvironmentId, EvaluationId, EvaluationReason, Flag, FlagId, FlagType,
    FlagValue, Override, OverrideId, Rule, RuleId, Variant,
};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use tracing::warn;

use crate::analytics::{
    EvaluationRecord, EvaluationStats, NewEvaluationRecord, StatsQuery, UsageMetrics,
    aggregate_stats,
};
use crate::audit::{AuditAction, AuditEntry, AuditFilter, NewAuditEntry};
use crate::environment::{Environment, EnvironmentUpdate, NewEnvironment};
use crate::error::StoreError;
use crate::query::{DateRange, FlagOrderBy, FlagQuery, OrderDirection};
use crate::store::{
    FlagStore, FlagUpdate, NewFlag, NewOverride, NewRule, OverrideUpdate, RuleUpdate,
    UNKNOWN_FLAG_KEY, UnknownFlagPolicy,
};

/// Schema version stored in `user_version`.
const SCHEMA_VERSION: i64 = 1;
/// Busy timeout for concurrent writers (ms).
const BUSY_TIMEOUT_MS: u64 = 5_000;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS flags (
    id                 TEXT PRIMARY KEY,
    organization_id    TEXT NOT NULL DEFAULT '',
    key                TEXT NOT NULL,
    name               TEXT NOT NULL,
    description        TEXT,
    flag_type          TEXT NOT NULL,
    enabled            INTEGER NOT NULL,
    default_value      TEXT NOT NULL,
    rollout_percentage REAL NOT NULL,
    variants           TEXT NOT NULL,
    metadata           TEXT,
    created_at         TEXT NOT NULL,
    updated_at         TEXT NOT NULL,
    UNIQUE (organization_id, key)
);

CREATE TABLE IF NOT EXISTS rules (
    id         TEXT PRIMARY KEY,
    flag_id    TEXT NOT NULL,
    priority   INTEGER NOT NULL,
    conditions TEXT NOT NULL,
    value      TEXT NOT NULL,
    variant    TEXT,
    percentage REAL,
    enabled    INTEGER NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_rules_flag_priority ON rules (flag_id, priority);

CREATE TABLE IF NOT EXISTS overrides (
    id         TEXT PRIMARY KEY,
    flag_id    TEXT NOT NULL,
    user_id    TEXT NOT NULL,
    value      TEXT NOT NULL,
    variant    TEXT,
    expires_at TEXT,
    reason     TEXT,
    created_at TEXT NOT NULL,
    UNIQUE (flag_id, user_id)
);
CREATE INDEX IF NOT EXISTS idx_overrides_flag_user ON overrides (flag_id, user_id);

CREATE TABLE IF NOT EXISTS evaluations (
    id           TEXT PRIMARY KEY,
    flag_id      TEXT NOT NULL,
    user_id      TEXT,
    value        TEXT NOT NULL,
    variant      TEXT,
    reason       TEXT NOT NULL,
    context      TEXT NOT NULL,
    latency_ms   REAL,
    error        INTEGER NOT NULL DEFAULT 0,
    evaluated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_evaluations_flag_time ON evaluations (flag_id, evaluated_at);

CREATE TABLE IF NOT EXISTS audits (
    id              TEXT PRIMARY KEY,
    flag_id         TEXT,
    user_id         TEXT,
    action          TEXT NOT NULL,
    organization_id TEXT,
    metadata        TEXT NOT NULL,
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audits_created ON audits (created_at);

CREATE TABLE IF NOT EXISTS environments (
    id              TEXT PRIMARY KEY,
    organization_id TEXT NOT NULL DEFAULT '',
    key             TEXT NOT NULL,
    name            TEXT NOT NULL,
    description     TEXT,
    created_at      TEXT NOT NULL,
    UNIQUE (organization_id, key)
);
";

pub struct SqliteStore {
    conn: Mutex<Connection>,
    unknown_flag_policy: UnknownFlagPolicy,
}

impl SqliteStore {
    /// Opens (creating if absent) the database at `path`.
    pub fn open(
        path: impl AsRef<Path>,
        unknown_flag_policy: UnknownFlagPolicy,
    ) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn, unknown_flag_policy)
    }

    /// A private in-memory database; used by tests and ephemeral
    /// deployments.
    pub fn open_in_memory(unknown_flag_policy: UnknownFlagPolicy) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, unknown_flag_policy)
    }

    fn init(conn: Connection, unknown_flag_policy: UnknownFlagPolicy) -> Result<Self, StoreError> {
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        conn.pragma_update(None, "synchronous", "normal")?;
        conn.execute_batch(SCHEMA)?;
        let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        if version == 0 {
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        } else if version != SCHEMA_VERSION {
            return Err(StoreError::Backend(format!(
                "unsupported schema version {version}, expected {SCHEMA_VERSION}"
            )));
        }
        Ok(Self {
            conn: Mutex::new(conn),
            unknown_flag_policy,
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("connection mutex poisoned".to_string()))
    }
}

fn fmt_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("bad timestamp {raw:?}: {e}")))
}

fn org_to_db(organization_id: Option<&str>) -> String {
    organization_id.unwrap_or_default().to_string()
}

fn org_from_db(raw: String) -> Option<String> {
    (!raw.is_empty()).then_some(raw)
}

fn map_conflict(err: rusqlite::Error, key: &str) -> StoreError {
    if let rusqlite::Error::SqliteFailure(failure, _) = &err {
        if failure.code == ErrorCode::ConstraintViolation {
            return StoreError::Conflict(key.to_string());
        }
    }
    err.into()
}

struct FlagRow {
    id: String,
    organization_id: String,
    key: String,
    name: String,
    description: Option<String>,
    flag_type: String,
    enabled: bool,
    default_value: String,
    rollout_percentage: f64,
    variants: String,
    metadata: Option<String>,
    created_at: String,
    updated_at: String,
}

const FLAG_COLUMNS: &str = "id, organization_id, key, name, description, flag_type, enabled, \
                            default_value, rollout_percentage, variants, metadata, created_at, \
                            updated_at";

fn read_flag_row(row: &Row<'_>) -> rusqlite::Result<FlagRow> {
    Ok(FlagRow {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        key: row.get(2)?,
        name: row.get(3)?,
        description: row.get(4)?,
        flag_type: row.get(5)?,
        enabled: row.get(6)?,
        default_value: row.get(7)?,
        rollout_percentage: row.get(8)?,
        variants: row.get(9)?,
        metadata: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

impl FlagRow {
    fn into_flag(self) -> Result<Flag, StoreError> {
        let flag_type: FlagType = self
            .flag_type
            .parse()
            .map_err(StoreError::Backend)?;
        let variants: Vec<Variant> = serde_json::from_str(&self.variants)?;
        Ok(Flag {
            id: FlagId(parse_uuid(&self.id)?),
            key: self.key,
            name: self.name,
            description: self.description,
            flag_type,
            enabled: self.enabled,
            default_value: serde_json::from_str(&self.default_value)?,
            rollout_percentage: self.rollout_percentage,
            organization_id: org_from_db(self.organization_id),
            variants,
            metadata: self
                .metadata
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
        })
    }
}

fn parse_uuid(raw: &str) -> Result<uuid::Uuid, StoreError> {
    uuid::Uuid::parse_str(raw).map_err(|e| StoreError::Backend(format!("bad id {raw:?}: {e}")))
}

struct RuleRow {
    id: String,
    flag_id: String,
    priority: i64,
    conditions: String,
    value: String,
    variant: Option<String>,
    percentage: Option<f64>,
    enabled: bool,
    created_at: String,
}

const RULE_COLUMNS: &str =
    "id, flag_id, priority, conditions, value, variant, percentage, enabled, created_at";

fn read_rule_row(row: &Row<'_>) -> rusqlite::Result<RuleRow> {
    Ok(RuleRow {
        id: row.get(0)?,
        flag_id: row.get(1)?,
        priority: row.get(2)?,
        conditions: row.get(3)?,
        value: row.get(4)?,
        variant: row.get(5)?,
        percentage: row.get(6)?,
        enabled: row.get(7)?,
        created_at: row.get(8)?,
    })
}

impl RuleRow {
    fn into_rule(self) -> Result<Rule, StoreError> {
        let conditions: Condition = serde_json::from_str(&self.conditions)?;
        Ok(Rule {
            id: RuleId(parse_uuid(&self.id)?),
            flag_id: FlagId(parse_uuid(&self.flag_id)?),
            priority: self.priority,
            conditions,
            value: serde_json::from_str(&self.value)?,
            variant: self.variant,
            percentage: self.percentage,
            enabled: self.enabled,
            created_at: parse_time(&self.created_at)?,
        })
    }
}

struct OverrideRow {
    id: String,
    flag_id: String,
    user_id: String,
    value: String,
    variant: Option<String>,
    expires_at: Option<String>,
    reason: Option<String>,
    created_at: String,
}

const OVERRIDE_COLUMNS: &str =
    "id, flag_id, user_id, value, variant, expires_at, reason, created_at";

fn read_override_row(row: &Row<'_>) -> rusqlite::Result<OverrideRow> {
    Ok(OverrideRow {
        id: row.get(0)?,
        flag_id: row.get(1)?,
        user_id: row.get(2)?,
        value: row.get(3)?,
        variant: row.get(4)?,
        expires_at: row.get(5)?,
        reason: row.get(6)?,
        created_at: row.get(7)?,
    })
}

impl OverrideRow {
    fn into_override(self) -> Result<Override, StoreError> {
        Ok(Override {
            id: OverrideId(parse_uuid(&self.id)?),
            flag_id: FlagId(parse_uuid(&self.flag_id)?),
            user_id: self.user_id,
            value: serde_json::from_str(&self.value)?,
            variant: self.variant,
            expires_at: self.expires_at.as_deref().map(parse_time).transpose()?,
            reason: self.reason,
            created_at: parse_time(&self.created_at)?,
        })
    }
}

fn insert_flag(conn: &Connection, flag: &Flag) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO flags (id, organization_id, key, name, description, flag_type, enabled, \
         default_value, rollout_percentage, variants, metadata, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            flag.id.to_string(),
            org_to_db(flag.organization_id.as_deref()),
            flag.key,
            flag.name,
            flag.description,
            flag.flag_type.to_string(),
            flag.enabled,
            serde_json::to_string(&flag.default_value)?,
            flag.rollout_percentage,
            serde_json::to_string(&flag.variants)?,
            flag.metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            fmt_time(flag.created_at),
            fmt_time(flag.updated_at),
        ],
    )
    .map_err(|e| map_conflict(e, &flag.key))?;
    Ok(())
}

fn fetch_flag_by_id(conn: &Connection, id: FlagId) -> Result<Option<Flag>, StoreError> {
    conn.query_row(
        &format!("SELECT {FLAG_COLUMNS} FROM flags WHERE id = ?1"),
        params![id.to_string()],
        read_flag_row,
    )
    .optional()?
    .map(FlagRow::into_flag)
    .transpose()
}

fn order_column(order_by: FlagOrderBy) -> &'static str {
    match order_by {
        FlagOrderBy::Key => "key",
        FlagOrderBy::Name => "name",
        FlagOrderBy::CreatedAt => "created_at",
        FlagOrderBy::UpdatedAt => "updated_at",
    }
}

#[async_trait]
impl FlagStore for SqliteStore {
    async fn flag_by_key(
        &self,
        key: &str,
        organization_id: Option<&str>,
    ) -> Result<Option<Flag>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {FLAG_COLUMNS} FROM flags WHERE organization_id = ?1 AND key = ?2"),
            params![org_to_db(organization_id), key],
            read_flag_row,
        )
        .optional()?
        .map(FlagRow::into_flag)
        .transpose()
    }

    async fn flag_by_id(&self, id: FlagId) -> Result<Option<Flag>, StoreError> {
        let conn = self.lock()?;
        fetch_flag_by_id(&conn, id)
    }

    async fn flags_by_keys(
        &self,
        keys: &[String],
        organization_id: Option<&str>,
    ) -> Result<Vec<Flag>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let placeholders = vec!["?"; keys.len()].join(", ");
        let sql = format!(
            "SELECT {FLAG_COLUMNS} FROM flags WHERE organization_id = ? AND key IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut bindings: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(keys.len() + 1);
        let org = org_to_db(organization_id);
        bindings.push(&org);
        for key in keys {
            bindings.push(key);
        }
        let rows = stmt.query_map(&bindings[..], read_flag_row)?;
        let mut flags = Vec::new();
        for row in rows {
            flags.push(row?.into_flag()?);
        }
        Ok(flags)
    }

    async fn list_flags(
        &self,
        organization_id: Option<&str>,
        query: &FlagQuery,
    ) -> Result<Vec<Flag>, StoreError> {
        let conn = self.lock()?;
        let mut sql = format!(
            "SELECT {FLAG_COLUMNS} FROM flags WHERE organization_id = ?1 AND key != ?2"
        );
        let org = org_to_db(organization_id);
        let unknown = UNKNOWN_FLAG_KEY.to_string();
        let mut bindings: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(org), Box::new(unknown)];
        if let Some(flag_type) = query.flag_type {
            bindings.push(Box::new(flag_type.to_string()));
            sql.push_str(&format!(" AND flag_type = ?{}", bindings.len()));
        }
        if let Some(enabled) = query.enabled {
            bindings.push(Box::new(enabled));
            sql.push_str(&format!(" AND enabled = ?{}", bindings.len()));
        }
        if let Some(prefix) = &query.key_prefix {
            bindings.push(Box::new(format!("{}%", escape_like(prefix))));
            sql.push_str(&format!(" AND key LIKE ?{} ESCAPE '\\'", bindings.len()));
        }
        if let Some(search) = &query.search {
            let needle = format!("%{}%", escape_like(search));
            bindings.push(Box::new(needle.clone()));
            sql.push_str(&format!(" AND (key LIKE ?{n} ESCAPE '\\'", n = bindings.len()));
            bindings.push(Box::new(needle));
            sql.push_str(&format!(" OR name LIKE ?{} ESCAPE '\\')", bindings.len()));
        }
        let direction = match query.order_direction {
            OrderDirection::Asc => "ASC",
            OrderDirection::Desc => "DESC",
        };
        sql.push_str(&format!(
            " ORDER BY {column} {direction}, id ASC",
            column = order_column(query.order_by)
        ));
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit} OFFSET {}", query.offset));
        } else if query.offset > 0 {
            sql.push_str(&format!(" LIMIT -1 OFFSET {}", query.offset));
        }

        let mut stmt = conn.prepare(&sql)?;
        let refs: Vec<&dyn rusqlite::ToSql> = bindings.iter().map(|b| b.as_ref()).collect();
        let rows = stmt.query_map(&refs[..], read_flag_row)?;
        let mut flags = Vec::new();
        for row in rows {
            flags.push(row?.into_flag()?);
        }
        Ok(flags)
    }

    async fn create_flag(&self, new_flag: NewFlag) -> Result<Flag, StoreError> {
        let flag = new_flag.into_flag(Utc::now())?;
        let conn = self.lock()?;
        insert_flag(&conn, &flag)?;
        Ok(flag)
    }

    async fn update_flag(&self, id: FlagId, update: FlagUpdate) -> Result<Flag, StoreError> {
        let conn = self.lock()?;
        let mut flag = fetch_flag_by_id(&conn, id)?.ok_or(StoreError::FlagNotFound)?;
        update.apply(&mut flag, Utc::now())?;
        conn.execute(
            "UPDATE flags SET name = ?1, description = ?2, enabled = ?3, default_value = ?4, \
             rollout_percentage = ?5, variants = ?6, metadata = ?7, updated_at = ?8 WHERE id = ?9",
            params![
                flag.name,
                flag.description,
                flag.enabled,
                serde_json::to_string(&flag.default_value)?,
                flag.rollout_percentage,
                serde_json::to_string(&flag.variants)?,
                flag.metadata
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                fmt_time(flag.updated_at),
                flag.id.to_string(),
            ],
        )?;
        Ok(flag)
    }

    async fn delete_flag(&self, id: FlagId) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let id_text = id.to_string();
        tx.execute("DELETE FROM rules WHERE flag_id = ?1", params![id_text])?;
        tx.execute("DELETE FROM overrides WHERE flag_id = ?1", params![id_text])?;
        tx.execute("DELETE FROM evaluations WHERE flag_id = ?1", params![id_text])?;
        let removed = tx.execute("DELETE FROM flags WHERE id = ?1", params![id_text])?;
        if removed == 0 {
            return Err(StoreError::FlagNotFound);
        }
        tx.commit()?;
        Ok(())
    }

    async fn rules_for_flag(&self, flag_id: FlagId) -> Result<Vec<Rule>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RULE_COLUMNS} FROM rules WHERE flag_id = ?1 \
             ORDER BY priority ASC, created_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map(params![flag_id.to_string()], read_rule_row)?;
        let mut rules = Vec::new();
        for row in rows {
            rules.push(row?.into_rule()?);
        }
        Ok(rules)
    }

    async fn rule_by_id(&self, id: RuleId) -> Result<Option<Rule>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {RULE_COLUMNS} FROM rules WHERE id = ?1"),
            params![id.to_string()],
            read_rule_row,
        )
        .optional()?
        .map(RuleRow::into_rule)
        .transpose()
    }

    async fn create_rule(&self, new_rule: NewRule) -> Result<Rule, StoreError> {
        let conn = self.lock()?;
        let flag_exists: Option<String> = conn
            .query_row(
                "SELECT id FROM flags WHERE id = ?1",
                params![new_rule.flag_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        if flag_exists.is_none() {
            return Err(StoreError::FlagNotFound);
        }
        let priority = match new_rule.priority {
            Some(priority) => priority,
            None => {
                let max: Option<i64> = conn.query_row(
                    "SELECT MAX(priority) FROM rules WHERE flag_id = ?1",
                    params![new_rule.flag_id.to_string()],
                    |row| row.get(0),
                )?;
                max.unwrap_or(0) + 1
            }
        };
        let rule = Rule {
            id: RuleId::new(),
            flag_id: new_rule.flag_id,
            priority,
            conditions: new_rule.conditions,
            value: new_rule.value,
            variant: new_rule.variant,
            percentage: new_rule.percentage,
            enabled: new_rule.enabled,
            created_at: Utc::now(),
        };
        rule.validate()?;
        conn.execute(
            "INSERT INTO rules (id, flag_id, priority, conditions, value, variant, percentage, \
             enabled, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                rule.id.to_string(),
                rule.flag_id.to_string(),
                rule.priority,
                serde_json::to_string(&rule.conditions)?,
                serde_json::to_string(&rule.value)?,
                rule.variant,
                rule.percentage,
                rule.enabled,
                fmt_time(rule.created_at),
            ],
        )?;
        Ok(rule)
    }

    async fn update_rule(&self, id: RuleId, update: RuleUpdate) -> Result<Rule, StoreError> {
        let conn = self.lock()?;
        let mut rule = conn
            .query_row(
                &format!("SELECT {RULE_COLUMNS} FROM rules WHERE id = ?1"),
                params![id.to_string()],
                read_rule_row,
            )
            .optional()?
            .map(RuleRow::into_rule)
            .transpose()?
            .ok_or(StoreError::RuleNotFound)?;
        update.apply(&mut rule)?;
        conn.execute(
            "UPDATE rules SET priority = ?1, conditions = ?2, value = ?3, variant = ?4, \
             percentage = ?5, enabled = ?6 WHERE id = ?7",
            params![
                rule.priority,
                serde_json::to_string(&rule.conditions)?,
                serde_json::to_string(&rule.value)?,
                rule.variant,
                rule.percentage,
                rule.enabled,
                rule.id.to_string(),
            ],
        )?;
        Ok(rule)
    }

    async fn delete_rule(&self, id: RuleId) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM rules WHERE id = ?1", params![id.to_string()])?;
        if removed == 0 {
            return Err(StoreError::RuleNotFound);
        }
        Ok(())
    }

    async fn reorder_rules(&self, flag_id: FlagId, order: &[RuleId]) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let existing: Vec<String> = {
            let mut stmt =
                tx.prepare("SELECT id FROM rules WHERE flag_id = ?1")?;
            let rows = stmt.query_map(params![flag_id.to_string()], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        let submitted: Vec<String> = order.iter().map(|id| id.to_string()).collect();
        // a true permutation: duplicate-free and covering every rule
        let unique: std::collections::HashSet<&String> = submitted.iter().collect();
        if unique.len() != submitted.len()
            || unique.len() != existing.len()
            || !existing.iter().all(|id| unique.contains(id))
        {
            return Err(StoreError::InvalidInput(
                "reorder must submit a permutation of the flag's rule ids".to_string(),
            ));
        }
        for (index, rule_id) in submitted.iter().enumerate() {
            tx.execute(
                "UPDATE rules SET priority = ?1 WHERE id = ?2",
                params![index as i64 + 1, rule_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn override_for(
        &self,
        flag_id: FlagId,
        user_id: &str,
    ) -> Result<Option<Override>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {OVERRIDE_COLUMNS} FROM overrides WHERE flag_id = ?1 AND user_id = ?2"),
            params![flag_id.to_string(), user_id],
            read_override_row,
        )
        .optional()?
        .map(OverrideRow::into_override)
        .transpose()
    }

    async fn override_by_id(&self, id: OverrideId) -> Result<Option<Override>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {OVERRIDE_COLUMNS} FROM overrides WHERE id = ?1"),
            params![id.to_string()],
            read_override_row,
        )
        .optional()?
        .map(OverrideRow::into_override)
        .transpose()
    }

    async fn create_override(&self, new_override: NewOverride) -> Result<Override, StoreError> {
        let conn = self.lock()?;
        let flag_exists: Option<String> = conn
            .query_row(
                "SELECT id FROM flags WHERE id = ?1",
                params![new_override.flag_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        if flag_exists.is_none() {
            return Err(StoreError::FlagNotFound);
        }
        let record = Override {
            id: OverrideId::new(),
            flag_id: new_override.flag_id,
            user_id: new_override.user_id,
            value: new_override.value,
            variant: new_override.variant,
            expires_at: new_override.expires_at,
            reason: new_override.reason,
            created_at: Utc::now(),
        };
        conn.execute(
            "INSERT INTO overrides (id, flag_id, user_id, value, variant, expires_at, reason, \
             created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.id.to_string(),
                record.flag_id.to_string(),
                record.user_id,
                serde_json::to_string(&record.value)?,
                record.variant,
                record.expires_at.map(fmt_time),
                record.reason,
                fmt_time(record.created_at),
            ],
        )
        .map_err(|e| map_conflict(e, &record.user_id))?;
        Ok(record)
    }

    async fn update_override(
        &self,
        id: OverrideId,
        update: OverrideUpdate,
    ) -> Result<Override, StoreError> {
        let conn = self.lock()?;
        let mut record = conn
            .query_row(
                &format!("SELECT {OVERRIDE_COLUMNS} FROM overrides WHERE id = ?1"),
                params![id.to_string()],
                read_override_row,
            )
            .optional()?
            .map(OverrideRow::into_override)
            .transpose()?
            .ok_or(StoreError::OverrideNotFound)?;
        update.apply(&mut record);
        conn.execute(
            "UPDATE overrides SET value = ?1, variant = ?2, expires_at = ?3, reason = ?4 \
             WHERE id = ?5",
            params![
                serde_json::to_string(&record.value)?,
                record.variant,
                record.expires_at.map(fmt_time),
                record.reason,
                record.id.to_string(),
            ],
        )?;
        Ok(record)
    }

    async fn delete_override(&self, id: OverrideId) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let removed =
            conn.execute("DELETE FROM overrides WHERE id = ?1", params![id.to_string()])?;
        if removed == 0 {
            return Err(StoreError::OverrideNotFound);
        }
        Ok(())
    }

    async fn list_overrides(
        &self,
        flag_id: Option<FlagId>,
        user_id: Option<&str>,
    ) -> Result<Vec<Override>, StoreError> {
        let conn = self.lock()?;
        let mut sql = format!("SELECT {OVERRIDE_COLUMNS} FROM overrides WHERE 1 = 1");
        let mut bindings: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(flag_id) = flag_id {
            bindings.push(Box::new(flag_id.to_string()));
            sql.push_str(&format!(" AND flag_id = ?{}", bindings.len()));
        }
        if let Some(user_id) = user_id {
            bindings.push(Box::new(user_id.to_string()));
            sql.push_str(&format!(" AND user_id = ?{}", bindings.len()));
        }
        sql.push_str(" ORDER BY created_at ASC, id ASC");
        let mut stmt = conn.prepare(&sql)?;
        let refs: Vec<&dyn rusqlite::ToSql> = bindings.iter().map(|b| b.as_ref()).collect();
        let rows = stmt.query_map(&refs[..], read_override_row)?;
        let mut overrides = Vec::new();
        for row in rows {
            overrides.push(row?.into_override()?);
        }
        Ok(overrides)
    }

    async fn track_evaluation(&self, record: NewEvaluationRecord) -> Result<(), StoreError> {
        let now = Utc::now();
        let conn = self.lock()?;
        let lookup: Option<String> = conn
            .query_row(
                "SELECT id FROM flags WHERE organization_id = ?1 AND key = ?2",
                params![org_to_db(record.organization_id.as_deref()), record.flag_key],
                |row| row.get(0),
            )
            .optional()?;
        let (flag_id, reason, context) = match lookup {
            Some(id) => (id, record.reason, record.context),
            None => match self.unknown_flag_policy {
                UnknownFlagPolicy::Log => {
                    warn!(flag_key = %record.flag_key, "dropping evaluation for unknown flag");
                    return Ok(());
                }
                UnknownFlagPolicy::Throw => {
                    return Err(StoreError::UnknownFlag(record.flag_key));
                }
                UnknownFlagPolicy::TrackUnknown => {
                    let sink = ensure_unknown_flag(&conn, now)?;
                    let mut context = record.context;
                    if let Some(object) = context.as_object_mut() {
                        object.insert(
                            "unknownFlagKey".to_string(),
                            serde_json::Value::String(record.flag_key.clone()),
                        );
                    }
                    (sink, EvaluationReason::NotFound, context)
                }
            },
        };
        conn.execute(
            "INSERT INTO evaluations (id, flag_id, user_id, value, variant, reason, context, \
             latency_ms, error, evaluated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                EvaluationId::new().to_string(),
                flag_id,
                record.user_id,
                serde_json::to_string(&record.value)?,
                record.variant,
                reason.to_string(),
                serde_json::to_string(&context)?,
                record.latency_ms,
                record.error,
                fmt_time(now),
            ],
        )?;
        Ok(())
    }

    async fn evaluation_stats(
        &self,
        flag_id: FlagId,
        query: &StatsQuery,
    ) -> Result<EvaluationStats, StoreError> {
        let conn = self.lock()?;
        let mut sql = "SELECT id, flag_id, user_id, value, variant, reason, context, latency_ms, \
                       error, evaluated_at FROM evaluations WHERE flag_id = ?1"
            .to_string();
        let mut bindings: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(flag_id.to_string())];
        if let Some(range) = &query.range {
            bindings.push(Box::new(fmt_time(range.start)));
            sql.push_str(&format!(" AND evaluated_at >= ?{}", bindings.len()));
            bindings.push(Box::new(fmt_time(range.end)));
            sql.push_str(&format!(" AND evaluated_at < ?{}", bindings.len()));
        }
        let mut stmt = conn.prepare(&sql)?;
        let refs: Vec<&dyn rusqlite::ToSql> = bindings.iter().map(|b| b.as_ref()).collect();
        let rows = stmt.query_map(&refs[..], read_evaluation_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(aggregate_stats(&records, query))
    }

    async fn usage_metrics(
        &self,
        organization_id: Option<&str>,
        range: Option<DateRange>,
    ) -> Result<UsageMetrics, StoreError> {
        let conn = self.lock()?;
        let org = org_to_db(organization_id);
        let total_flags: u64 = conn.query_row(
            "SELECT COUNT(*) FROM flags WHERE organization_id = ?1 AND key != ?2",
            params![org, UNKNOWN_FLAG_KEY],
            |row| row.get::<_, i64>(0),
        )? as u64;
        let enabled_flags: u64 = conn.query_row(
            "SELECT COUNT(*) FROM flags WHERE organization_id = ?1 AND key != ?2 AND enabled = 1",
            params![org, UNKNOWN_FLAG_KEY],
            |row| row.get::<_, i64>(0),
        )? as u64;
        let (start, end) = match range {
            Some(window) => (Some(fmt_time(window.start)), Some(fmt_time(window.end))),
            None => (None, None),
        };
        let base = "FROM evaluations e JOIN flags f ON f.id = e.flag_id \
                    WHERE f.organization_id = ?1 \
                    AND (?2 IS NULL OR e.evaluated_at >= ?2) \
                    AND (?3 IS NULL OR e.evaluated_at < ?3)";
        let total_evaluations: u64 = conn.query_row(
            &format!("SELECT COUNT(*) {base}"),
            params![org, start, end],
            |row| row.get::<_, i64>(0),
        )? as u64;
        let unique_users: u64 = conn.query_row(
            &format!("SELECT COUNT(DISTINCT e.user_id) {base} AND e.user_id IS NOT NULL"),
            params![org, start, end],
            |row| row.get::<_, i64>(0),
        )? as u64;
        Ok(UsageMetrics {
            total_flags,
            enabled_flags,
            total_evaluations,
            unique_users,
        })
    }

    async fn log_audit(&self, entry: NewAuditEntry) -> Result<AuditEntry, StoreError> {
        let stored = AuditEntry {
            id: AuditId::new(),
            flag_id: entry.flag_id,
            user_id: entry.user_id,
            action: entry.action,
            organization_id: entry.organization_id,
            metadata: entry.metadata,
            created_at: Utc::now(),
        };
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO audits (id, flag_id, user_id, action, organization_id, metadata, \
             created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                stored.id.to_string(),
                stored.flag_id.map(|id| id.to_string()),
                stored.user_id,
                stored.action.to_string(),
                stored.organization_id,
                serde_json::to_string(&stored.metadata)?,
                fmt_time(stored.created_at),
            ],
        )?;
        Ok(stored)
    }

    async fn audit_logs(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, StoreError> {
        let conn = self.lock()?;
        let mut sql = "SELECT id, flag_id, user_id, action, organization_id, metadata, \
                       created_at FROM audits WHERE 1 = 1"
            .to_string();
        let mut bindings: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(flag_id) = filter.flag_id {
            bindings.push(Box::new(flag_id.to_string()));
            sql.push_str(&format!(" AND flag_id = ?{}", bindings.len()));
        }
        if let Some(user_id) = &filter.user_id {
            bindings.push(Box::new(user_id.clone()));
            sql.push_str(&format!(" AND user_id = ?{}", bindings.len()));
        }
        if let Some(action) = filter.action {
            bindings.push(Box::new(action.to_string()));
            sql.push_str(&format!(" AND action = ?{}", bindings.len()));
        }
        if let Some(org) = &filter.organization_id {
            bindings.push(Box::new(org.clone()));
            sql.push_str(&format!(" AND organization_id = ?{}", bindings.len()));
        }
        if let Some(range) = &filter.range {
            bindings.push(Box::new(fmt_time(range.start)));
            sql.push_str(&format!(" AND created_at >= ?{}", bindings.len()));
            bindings.push(Box::new(fmt_time(range.end)));
            sql.push_str(&format!(" AND created_at < ?{}", bindings.len()));
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit} OFFSET {}", filter.offset));
        } else if filter.offset > 0 {
            sql.push_str(&format!(" LIMIT -1 OFFSET {}", filter.offset));
        }
        let mut stmt = conn.prepare(&sql)?;
        let refs: Vec<&dyn rusqlite::ToSql> = bindings.iter().map(|b| b.as_ref()).collect();
        let rows = stmt.query_map(&refs[..], read_audit_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?.into_entry()?);
        }
        Ok(entries)
    }

    async fn audit_by_id(&self, id: AuditId) -> Result<Option<AuditEntry>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, flag_id, user_id, action, organization_id, metadata, created_at \
             FROM audits WHERE id = ?1",
            params![id.to_string()],
            read_audit_row,
        )
        .optional()?
        .map(AuditRow::into_entry)
        .transpose()
    }

    async fn cleanup_audit_logs(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM audits WHERE created_at < ?1",
            params![fmt_time(older_than)],
        )?;
        Ok(removed as u64)
    }

    async fn list_environments(
        &self,
        organization_id: Option<&str>,
    ) -> Result<Vec<Environment>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, organization_id, key, name, description, created_at FROM environments \
             WHERE organization_id = ?1 ORDER BY key ASC",
        )?;
        let rows = stmt.query_map(params![org_to_db(organization_id)], read_environment_row)?;
        let mut environments = Vec::new();
        for row in rows {
            environments.push(row?.into_environment()?);
        }
        Ok(environments)
    }

    async fn environment_by_id(
        &self,
        id: EnvironmentId,
    ) -> Result<Option<Environment>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, organization_id, key, name, description, created_at FROM environments \
             WHERE id = ?1",
            params![id.to_string()],
            read_environment_row,
        )
        .optional()?
        .map(EnvironmentRow::into_environment)
        .transpose()
    }

    async fn create_environment(
        &self,
        new_environment: NewEnvironment,
    ) -> Result<Environment, StoreError> {
        if !Environment::validate_key(&new_environment.key) {
            return Err(StoreError::InvalidInput(format!(
                "invalid environment key {:?}",
                new_environment.key
            )));
        }
        let environment = Environment {
            id: EnvironmentId::new(),
            key: new_environment.key,
            name: new_environment.name,
            description: new_environment.description,
            organization_id: new_environment.organization_id,
            created_at: Utc::now(),
        };
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO environments (id, organization_id, key, name, description, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                environment.id.to_string(),
                org_to_db(environment.organization_id.as_deref()),
                environment.key,
                environment.name,
                environment.description,
                fmt_time(environment.created_at),
            ],
        )
        .map_err(|e| map_conflict(e, &environment.key))?;
        Ok(environment)
    }

    async fn update_environment(
        &self,
        id: EnvironmentId,
        update: EnvironmentUpdate,
    ) -> Result<Environment, StoreError> {
        let conn = self.lock()?;
        let mut environment = conn
            .query_row(
                "SELECT id, organization_id, key, name, description, created_at \
                 FROM environments WHERE id = ?1",
                params![id.to_string()],
                read_environment_row,
            )
            .optional()?
            .map(EnvironmentRow::into_environment)
            .transpose()?
            .ok_or(StoreError::EnvironmentNotFound)?;
        if let Some(name) = update.name {
            environment.name = name;
        }
        if let Some(description) = update.description {
            environment.description = Some(description);
        }
        conn.execute(
            "UPDATE environments SET name = ?1, description = ?2 WHERE id = ?3",
            params![
                environment.name,
                environment.description,
                environment.id.to_string()
            ],
        )?;
        Ok(environment)
    }

    async fn delete_environment(&self, id: EnvironmentId) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM environments WHERE id = ?1",
            params![id.to_string()],
        )?;
        if removed == 0 {
            return Err(StoreError::EnvironmentNotFound);
        }
        Ok(())
    }

    async fn healthy(&self) -> bool {
        match self.lock() {
            Ok(conn) => conn
                .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .is_ok(),
            Err(_) => false,
        }
    }
}

fn ensure_unknown_flag(conn: &Connection, now: DateTime<Utc>) -> Result<String, StoreError> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM flags WHERE organization_id = '' AND key = ?1",
            params![UNKNOWN_FLAG_KEY],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }
    let id = FlagId::new().to_string();
    conn.execute(
        "INSERT INTO flags (id, organization_id, key, name, description, flag_type, enabled, \
         default_value, rollout_percentage, variants, metadata, created_at, updated_at) \
         VALUES (?1, '', ?2, 'Unknown flag evaluations', \
         'Reserved sink for evaluations of unknown flag keys', 'json', 0, 'null', 0.0, '[]', \
         NULL, ?3, ?3)",
        params![id, UNKNOWN_FLAG_KEY, fmt_time(now)],
    )?;
    Ok(id)
}

/// Escapes `%` and `_` for a LIKE pattern with `\` as the escape char.
fn escape_like(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

struct EvaluationRow {
    id: String,
    flag_id: String,
    user_id: Option<String>,
    value: String,
    variant: Option<String>,
    reason: String,
    context: String,
    latency_ms: Option<f64>,
    error: bool,
    evaluated_at: String,
}

fn read_evaluation_row(row: &Row<'_>) -> rusqlite::Result<EvaluationRow> {
    Ok(EvaluationRow {
        id: row.get(0)?,
        flag_id: row.get(1)?,
        user_id: row.get(2)?,
        value: row.get(3)?,
        variant: row.get(4)?,
        reason: row.get(5)?,
        context: row.get(6)?,
        latency_ms: row.get(7)?,
        error: row.get(8)?,
        evaluated_at: row.get(9)?,
    })
}

impl EvaluationRow {
    fn into_record(self) -> Result<EvaluationRecord, StoreError> {
        let reason: EvaluationReason =
            serde_json::from_value(serde_json::Value::String(self.reason.clone()))
                .map_err(|_| StoreError::Backend(format!("bad reason {:?}", self.reason)))?;
        Ok(EvaluationRecord {
            id: EvaluationId(parse_uuid(&self.id)?),
            flag_id: FlagId(parse_uuid(&self.flag_id)?),
            user_id: self.user_id,
            value: serde_json::from_str::<FlagValue>(&self.value)?,
            variant: self.variant,
            reason,
            context: serde_json::from_str(&self.context)?,
            latency_ms: self.latency_ms,
            error: self.error,
            evaluated_at: parse_time(&self.evaluated_at)?,
        })
    }
}

struct AuditRow {
    id: String,
    flag_id: Option<String>,
    user_id: Option<String>,
    action: String,
    organization_id: Option<String>,
    metadata: String,
    created_at: String,
}

fn read_audit_row(row: &Row<'_>) -> rusqlite::Result<AuditRow> {
    Ok(AuditRow {
        id: row.get(0)?,
        flag_id: row.get(1)?,
        user_id: row.get(2)?,
        action: row.get(3)?,
        organization_id: row.get(4)?,
        metadata: row.get(5)?,
        created_at: row.get(6)?,
    })
}

impl AuditRow {
    fn into_entry(self) -> Result<AuditEntry, StoreError> {
        let action: AuditAction =
            serde_json::from_value(serde_json::Value::String(self.action.clone()))
                .map_err(|_| StoreError::Backend(format!("bad action {:?}", self.action)))?;
        Ok(AuditEntry {
            id: AuditId(parse_uuid(&self.id)?),
            flag_id: self
                .flag_id
                .as_deref()
                .map(parse_uuid)
                .transpose()?
                .map(FlagId),
            user_id: self.user_id,
            action,
            organization_id: self.organization_id,
            metadata: serde_json::from_str(&self.metadata)?,
            created_at: parse_time(&self.created_at)?,
        })
    }
}

struct EnvironmentRow {
    id: String,
    organization_id: String,
    key: String,
    name: String,
    description: Option<String>,
    created_at: String,
}

fn read_environment_row(row: &Row<'_>) -> rusqlite::Result<EnvironmentRow> {
    Ok(EnvironmentRow {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        key: row.get(2)?,
        name: row.get(3)?,
        description: row.get(4)?,
        created_at: row.get(5)?,
    })
}

impl EnvironmentRow {
    fn into_environment(self) -> Result<Environment, StoreError> {
        Ok(Environment {
            id: EnvironmentId(parse_uuid(&self.id)?),
            key: self.key,
            name: self.name,
            description: self.description,
            organization_id: org_from_db(self.organization_id),
            created_at: parse_time(&self.created_at)?,
        })
    }
}
