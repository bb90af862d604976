//! SQLite-backed [`AlertStore`] implementation.
//!
//! One connection behind a mutex; list queries for rules go through a
//! five-minute TTL cache that any rule write on the same node invalidates.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::{
    AlertEntry, AlertStatus, AlertStore, CompareOp, FiringAlert, MetricKind, NewAlert, NewRule,
    RuleEntry, RuleUpdate,
};

const RULES_CACHE_TTL: Duration = Duration::from_secs(300);

const RULE_COLUMNS: &str = "id, node_name, target, metric, operator, threshold, \
     resolve_threshold, duration_seconds, notify_frequency_minutes, mention_tag, enabled, \
     created_at, updated_at";

const ALERT_COLUMNS: &str = "id, rule_id, node_name, target, metric, status, current_value, \
     threshold_value, started_at, resolved_at, last_notified_at, notification_count, \
     created_at, updated_at";

pub struct SqliteAlertStore {
    conn: Mutex<Connection>,
    rules_cache: Mutex<HashMap<(String, bool), (Instant, Vec<RuleEntry>)>>,
}

impl SqliteAlertStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            rules_cache: Mutex::new(HashMap::new()),
        })
    }

    fn cached_rules(&self, node_name: &str, enabled_only: bool) -> Option<Vec<RuleEntry>> {
        let cache = self.rules_cache.lock().unwrap();
        let (stored_at, rules) = cache.get(&(node_name.to_string(), enabled_only))?;
        if stored_at.elapsed() < RULES_CACHE_TTL {
            Some(rules.clone())
        } else {
            None
        }
    }

    fn store_rules(&self, node_name: &str, enabled_only: bool, rules: &[RuleEntry]) {
        self.rules_cache.lock().unwrap().insert(
            (node_name.to_string(), enabled_only),
            (Instant::now(), rules.to_vec()),
        );
    }

    fn invalidate_rules(&self, node_name: &str) {
        let mut cache = self.rules_cache.lock().unwrap();
        cache.remove(&(node_name.to_string(), false));
        cache.remove(&(node_name.to_string(), true));
    }

    fn list_rules(&self, node_name: &str, enabled_only: bool) -> Result<Vec<RuleEntry>> {
        if let Some(rules) = self.cached_rules(node_name, enabled_only) {
            return Ok(rules);
        }

        let conn = self.conn.lock().unwrap();
        let sql = if enabled_only {
            format!(
                "SELECT {RULE_COLUMNS} FROM alert_rules \
                 WHERE node_name = ?1 AND enabled = 1 AND deleted_at IS NULL \
                 ORDER BY created_at DESC"
            )
        } else {
            format!(
                "SELECT {RULE_COLUMNS} FROM alert_rules \
                 WHERE node_name = ?1 AND deleted_at IS NULL \
                 ORDER BY created_at DESC"
            )
        };
        let mut stmt = conn.prepare_cached(&sql)?;
        let rules = stmt
            .query_map(params![node_name], rule_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        drop(conn);

        self.store_rules(node_name, enabled_only, &rules);
        Ok(rules)
    }
}

impl AlertStore for SqliteAlertStore {
    fn insert_rule(&self, rule: NewRule) -> Result<RuleEntry> {
        validate_rule(rule.operator, rule.threshold, rule.resolve_threshold)?;
        if rule.notify_frequency_minutes < 1 {
            return Err(StoreError::Conflict(
                "notify_frequency_minutes must be at least 1".into(),
            ));
        }
        if rule.duration_seconds < 0 {
            return Err(StoreError::Conflict(
                "duration_seconds must not be negative".into(),
            ));
        }

        let now = Utc::now();
        let entry = RuleEntry {
            id: Uuid::new_v4().to_string(),
            node_name: rule.node_name,
            target: rule.target,
            metric: rule.metric,
            operator: rule.operator,
            threshold: rule.threshold,
            resolve_threshold: rule.resolve_threshold,
            duration_seconds: rule.duration_seconds,
            notify_frequency_minutes: rule.notify_frequency_minutes,
            mention_tag: rule.mention_tag,
            enabled: rule.enabled,
            created_at: now,
            updated_at: now,
        };

        {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare_cached(
                "INSERT INTO alert_rules (id, node_name, target, metric, operator, threshold, \
                 resolve_threshold, duration_seconds, notify_frequency_minutes, mention_tag, \
                 enabled, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            )?;
            stmt.execute(params![
                entry.id,
                entry.node_name,
                entry.target,
                entry.metric.to_string(),
                entry.operator.to_string(),
                entry.threshold,
                entry.resolve_threshold,
                entry.duration_seconds,
                entry.notify_frequency_minutes,
                entry.mention_tag,
                entry.enabled,
                entry.created_at.timestamp_millis(),
                entry.updated_at.timestamp_millis(),
            ])?;
        }

        self.invalidate_rules(&entry.node_name);
        Ok(entry)
    }

    fn update_rule(&self, id: &str, update: RuleUpdate) -> Result<RuleEntry> {
        let mut entry = self.get_rule(id)?.ok_or_else(|| StoreError::NotFound {
            entity: "alert_rule",
            id: id.to_string(),
        })?;

        if let Some(operator) = update.operator {
            entry.operator = operator;
        }
        if let Some(threshold) = update.threshold {
            entry.threshold = threshold;
        }
        if let Some(resolve_threshold) = update.resolve_threshold {
            entry.resolve_threshold = resolve_threshold;
        }
        if let Some(duration_seconds) = update.duration_seconds {
            entry.duration_seconds = duration_seconds;
        }
        if let Some(notify_frequency_minutes) = update.notify_frequency_minutes {
            entry.notify_frequency_minutes = notify_frequency_minutes;
        }
        if let Some(mention_tag) = update.mention_tag {
            entry.mention_tag = mention_tag;
        }
        if let Some(enabled) = update.enabled {
            entry.enabled = enabled;
        }

        validate_rule(entry.operator, entry.threshold, entry.resolve_threshold)?;
        if entry.notify_frequency_minutes < 1 {
            return Err(StoreError::Conflict(
                "notify_frequency_minutes must be at least 1".into(),
            ));
        }
        if entry.duration_seconds < 0 {
            return Err(StoreError::Conflict(
                "duration_seconds must not be negative".into(),
            ));
        }
        entry.updated_at = Utc::now();

        {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare_cached(
                "UPDATE alert_rules SET operator = ?2, threshold = ?3, resolve_threshold = ?4, \
                 duration_seconds = ?5, notify_frequency_minutes = ?6, mention_tag = ?7, \
                 enabled = ?8, updated_at = ?9 WHERE id = ?1 AND deleted_at IS NULL",
            )?;
            stmt.execute(params![
                entry.id,
                entry.operator.to_string(),
                entry.threshold,
                entry.resolve_threshold,
                entry.duration_seconds,
                entry.notify_frequency_minutes,
                entry.mention_tag,
                entry.enabled,
                entry.updated_at.timestamp_millis(),
            ])?;
        }

        self.invalidate_rules(&entry.node_name);
        Ok(entry)
    }

    fn soft_delete_rule(&self, id: &str) -> Result<()> {
        let entry = self.get_rule(id)?.ok_or_else(|| StoreError::NotFound {
            entity: "alert_rule",
            id: id.to_string(),
        })?;

        {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare_cached(
                "UPDATE alert_rules SET deleted_at = ?2, updated_at = ?2 WHERE id = ?1",
            )?;
            stmt.execute(params![id, Utc::now().timestamp_millis()])?;
        }

        self.invalidate_rules(&entry.node_name);
        Ok(())
    }

    fn get_rule(&self, id: &str) -> Result<Option<RuleEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {RULE_COLUMNS} FROM alert_rules WHERE id = ?1 AND deleted_at IS NULL"
        ))?;
        Ok(stmt.query_row(params![id], rule_from_row).optional()?)
    }

    fn list_rules_by_node(&self, node_name: &str) -> Result<Vec<RuleEntry>> {
        self.list_rules(node_name, false)
    }

    fn list_enabled_rules_by_node(&self, node_name: &str) -> Result<Vec<RuleEntry>> {
        self.list_rules(node_name, true)
    }

    fn create_alert(&self, alert: NewAlert) -> Result<Option<AlertEntry>> {
        let now = Utc::now();
        let entry = AlertEntry {
            id: Uuid::new_v4().to_string(),
            rule_id: alert.rule_id,
            node_name: alert.node_name,
            target: alert.target,
            metric: alert.metric,
            status: AlertStatus::Firing,
            current_value: alert.current_value,
            threshold_value: alert.threshold_value,
            started_at: alert.started_at,
            resolved_at: None,
            last_notified_at: None,
            notification_count: 0,
            created_at: now,
            updated_at: now,
        };

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO alerts (id, rule_id, node_name, target, metric, status, current_value, \
             threshold_value, started_at, resolved_at, last_notified_at, notification_count, \
             created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, NULL, 0, ?10, ?11)",
        )?;
        let result = stmt.execute(params![
            entry.id,
            entry.rule_id,
            entry.node_name,
            entry.target,
            entry.metric.to_string(),
            entry.status.to_string(),
            entry.current_value,
            entry.threshold_value,
            entry.started_at.timestamp_millis(),
            entry.created_at.timestamp_millis(),
            entry.updated_at.timestamp_millis(),
        ]);

        match result {
            Ok(_) => Ok(Some(entry)),
            // The partial unique index on firing alerts: someone else already
            // fired for this key, which is a no-op for the caller.
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn resolve_alert(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().timestamp_millis();
        let mut stmt = conn.prepare_cached(
            "UPDATE alerts SET status = 'resolved', resolved_at = ?2, updated_at = ?2 \
             WHERE id = ?1",
        )?;
        let changed = stmt.execute(params![id, now])?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "alert",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    fn get_alert(&self, id: &str) -> Result<Option<AlertEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ALERT_COLUMNS} FROM alerts WHERE id = ?1"
        ))?;
        Ok(stmt.query_row(params![id], alert_from_row).optional()?)
    }

    fn get_firing_by_rule(
        &self,
        rule_id: &str,
        target: &str,
        metric: MetricKind,
    ) -> Result<Option<AlertEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ALERT_COLUMNS} FROM alerts \
             WHERE rule_id = ?1 AND target = ?2 AND metric = ?3 AND status = 'firing'"
        ))?;
        Ok(stmt
            .query_row(params![rule_id, target, metric.to_string()], alert_from_row)
            .optional()?)
    }

    fn list_firing_by_node(&self, node_name: &str) -> Result<Vec<AlertEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ALERT_COLUMNS} FROM alerts \
             WHERE node_name = ?1 AND status = 'firing' ORDER BY started_at DESC"
        ))?;
        let alerts = stmt
            .query_map(params![node_name], alert_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(alerts)
    }

    fn list_history_by_node(
        &self,
        node_name: &str,
        days: i64,
        limit: usize,
    ) -> Result<Vec<AlertEntry>> {
        let since = (Utc::now() - chrono::Duration::days(days)).timestamp_millis();
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ALERT_COLUMNS} FROM alerts \
             WHERE node_name = ?1 AND started_at > ?2 \
             ORDER BY started_at DESC LIMIT ?3"
        ))?;
        let alerts = stmt
            .query_map(params![node_name, since, limit as i64], alert_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(alerts)
    }

    fn update_notification(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().timestamp_millis();
        let mut stmt = conn.prepare_cached(
            "UPDATE alerts SET last_notified_at = ?2, \
             notification_count = notification_count + 1, updated_at = ?2 WHERE id = ?1",
        )?;
        let changed = stmt.execute(params![id, now])?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "alert",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    fn list_firing_with_rule(&self) -> Result<Vec<FiringAlert>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT a.id, a.rule_id, a.node_name, a.target, a.metric, a.status, \
             a.current_value, a.threshold_value, a.started_at, a.resolved_at, \
             a.last_notified_at, a.notification_count, a.created_at, a.updated_at, \
             r.id, r.node_name, r.target, r.metric, r.operator, r.threshold, \
             r.resolve_threshold, r.duration_seconds, r.notify_frequency_minutes, \
             r.mention_tag, r.enabled, r.created_at, r.updated_at \
             FROM alerts a JOIN alert_rules r ON a.rule_id = r.id \
             WHERE a.status = 'firing' ORDER BY a.started_at ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(FiringAlert {
                    alert: alert_from_row(row)?,
                    rule: rule_from_row_offset(row, 14)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn validate_rule(op: CompareOp, threshold: f64, resolve_threshold: Option<f64>) -> Result<()> {
    if let Some(rt) = resolve_threshold {
        if !op.resolve_orientation_ok(threshold, rt) {
            return Err(StoreError::Conflict(format!(
                "resolve_threshold {rt} is on the wrong side of threshold {threshold} for '{op}'"
            )));
        }
    }
    Ok(())
}

fn parse_col<T>(index: usize, raw: String) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, e.into())
    })
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn rule_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RuleEntry> {
    rule_from_row_offset(row, 0)
}

fn rule_from_row_offset(row: &rusqlite::Row<'_>, o: usize) -> rusqlite::Result<RuleEntry> {
    Ok(RuleEntry {
        id: row.get(o)?,
        node_name: row.get(o + 1)?,
        target: row.get(o + 2)?,
        metric: parse_col(o + 3, row.get(o + 3)?)?,
        operator: parse_col(o + 4, row.get(o + 4)?)?,
        threshold: row.get(o + 5)?,
        resolve_threshold: row.get(o + 6)?,
        duration_seconds: row.get(o + 7)?,
        notify_frequency_minutes: row.get(o + 8)?,
        mention_tag: row.get(o + 9)?,
        enabled: row.get(o + 10)?,
        created_at: millis_to_datetime(row.get(o + 11)?),
        updated_at: millis_to_datetime(row.get(o + 12)?),
    })
}

fn alert_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AlertEntry> {
    Ok(AlertEntry {
        id: row.get(0)?,
        rule_id: row.get(1)?,
        node_name: row.get(2)?,
        target: row.get(3)?,
        metric: parse_col(4, row.get(4)?)?,
        status: parse_col(5, row.get(5)?)?,
        current_value: row.get(6)?,
        threshold_value: row.get(7)?,
        started_at: millis_to_datetime(row.get(8)?),
        resolved_at: row.get::<_, Option<i64>>(9)?.map(millis_to_datetime),
        last_notified_at: row.get::<_, Option<i64>>(10)?.map(millis_to_datetime),
        notification_count: row.get(11)?,
        created_at: millis_to_datetime(row.get(12)?),
        updated_at: millis_to_datetime(row.get(13)?),
    })
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS alert_rules (
    id TEXT PRIMARY KEY,
    node_name TEXT NOT NULL,
    target TEXT NOT NULL,
    metric TEXT NOT NULL,
    operator TEXT NOT NULL,
    threshold REAL NOT NULL,
    resolve_threshold REAL,
    duration_seconds INTEGER NOT NULL DEFAULT 60,
    notify_frequency_minutes INTEGER NOT NULL DEFAULT 5,
    mention_tag TEXT NOT NULL DEFAULT '',
    enabled INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    deleted_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_rules_node ON alert_rules(node_name);

CREATE TABLE IF NOT EXISTS alerts (
    id TEXT PRIMARY KEY,
    rule_id TEXT NOT NULL REFERENCES alert_rules(id),
    node_name TEXT NOT NULL,
    target TEXT NOT NULL,
    metric TEXT NOT NULL,
    status TEXT NOT NULL,
    current_value REAL NOT NULL,
    threshold_value REAL NOT NULL,
    started_at INTEGER NOT NULL,
    resolved_at INTEGER,
    last_notified_at INTEGER,
    notification_count INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_alerts_node ON alerts(node_name);
CREATE INDEX IF NOT EXISTS idx_alerts_rule ON alerts(rule_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_alerts_firing
    ON alerts(rule_id, target, metric) WHERE status = 'firing';
";
