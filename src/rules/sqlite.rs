//! SQLite-backed rule table.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{info, warn};

use super::rule::{Rule, RuleUpdate};
use super::table::{RuleTable, RuleTableError};
use crate::ratelimit::Algorithm;

const COLUMNS: &str =
    "rule_id, client_id, algorithm, limit_count, window_secs, enabled, created_at, updated_at";

/// Rule table stored in a SQLite database file.
///
/// Each operation opens its own connection on the blocking pool, so the table
/// can be shared freely across tasks.
#[derive(Debug, Clone)]
pub struct SqliteRuleTable {
    path: Arc<PathBuf>,
}

impl SqliteRuleTable {
    /// Open (creating if needed) the database at `path` and ensure the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RuleTableError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| RuleTableError::Backend(e.to_string()))?;
            }
        }

        let conn = open_conn(&path)?;
        create_schema(&conn)?;
        info!(path = %path.display(), "Opened rule table");

        Ok(Self {
            path: Arc::new(path),
        })
    }

    async fn run<T, F>(&self, op: F) -> Result<T, RuleTableError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, RuleTableError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = open_conn(&path)?;
            op(&mut conn)
        })
        .await
        .map_err(|e| RuleTableError::Backend(format!("rule table task failed: {}", e)))?
    }
}

fn open_conn(path: &Path) -> Result<Connection, RuleTableError> {
    let conn = Connection::open(path).map_err(backend)?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(backend)?;
    conn.busy_timeout(Duration::from_millis(5_000))
        .map_err(backend)?;
    Ok(conn)
}

fn create_schema(conn: &Connection) -> Result<(), RuleTableError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS rate_limit_rules (
          id          INTEGER PRIMARY KEY AUTOINCREMENT,
          rule_id     TEXT NOT NULL UNIQUE,
          client_id   TEXT,
          algorithm   TEXT NOT NULL DEFAULT 'fixed_window',
          limit_count INTEGER NOT NULL CHECK (limit_count > 0),
          window_secs INTEGER NOT NULL CHECK (window_secs > 0),
          enabled     INTEGER NOT NULL DEFAULT 1,
          created_at  INTEGER NOT NULL,
          updated_at  INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_rate_limit_rules_enabled
          ON rate_limit_rules(enabled);
        ",
    )
    .map_err(backend)
}

fn backend(e: rusqlite::Error) -> RuleTableError {
    RuleTableError::Backend(e.to_string())
}

fn timestamp(micros: i64, column: &str) -> Result<DateTime<Utc>, RuleTableError> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| RuleTableError::Corrupt(format!("{} out of range: {}", column, micros)))
}

type RawRow = (String, Option<String>, String, i64, i64, bool, i64, i64);

fn raw_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn into_rule(raw: RawRow) -> Result<Rule, RuleTableError> {
    let (rule_id, client_id, algorithm, limit, window_secs, enabled, created_at, updated_at) = raw;

    let parsed = match algorithm.parse::<Algorithm>() {
        Ok(parsed) => parsed,
        Err(_) => {
            warn!(
                rule_id = %rule_id,
                algorithm = %algorithm,
                "Unknown algorithm in rule table, using fixed window"
            );
            Algorithm::default()
        }
    };

    let limit = u32::try_from(limit)
        .map_err(|_| RuleTableError::Corrupt(format!("{}: limit {}", rule_id, limit)))?;
    let window_secs = u32::try_from(window_secs)
        .map_err(|_| RuleTableError::Corrupt(format!("{}: window_secs {}", rule_id, window_secs)))?;

    Ok(Rule {
        client_scope: client_id.filter(|s| !s.is_empty()),
        algorithm: parsed,
        limit,
        window_secs,
        enabled,
        created_at: timestamp(created_at, "created_at")?,
        updated_at: timestamp(updated_at, "updated_at")?,
        rule_id,
    })
}

fn query_rules(conn: &Connection, sql: &str) -> Result<Vec<Rule>, RuleTableError> {
    let mut stmt = conn.prepare(sql).map_err(backend)?;
    let rows = stmt
        .query_map([], raw_row)
        .map_err(backend)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(backend)?;
    rows.into_iter().map(into_rule).collect()
}

fn insert_sql(or_ignore: bool) -> String {
    format!(
        "INSERT INTO rate_limit_rules ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8){}",
        COLUMNS,
        if or_ignore {
            " ON CONFLICT(rule_id) DO NOTHING"
        } else {
            ""
        }
    )
}

fn insert_row(conn: &Connection, rule: &Rule, or_ignore: bool) -> rusqlite::Result<usize> {
    conn.execute(
        &insert_sql(or_ignore),
        params![
            rule.rule_id,
            rule.client_scope,
            rule.algorithm.as_str(),
            rule.limit,
            rule.window_secs,
            rule.enabled,
            rule.created_at.timestamp_micros(),
            rule.updated_at.timestamp_micros(),
        ],
    )
}

#[async_trait]
impl RuleTable for SqliteRuleTable {
    async fn load_enabled(&self) -> Result<Vec<Rule>, RuleTableError> {
        self.run(|conn| {
            query_rules(
                conn,
                &format!(
                    "SELECT {} FROM rate_limit_rules WHERE enabled = 1 ORDER BY created_at, id",
                    COLUMNS
                ),
            )
        })
        .await
    }

    async fn list_all(&self) -> Result<Vec<Rule>, RuleTableError> {
        self.run(|conn| {
            query_rules(
                conn,
                &format!(
                    "SELECT {} FROM rate_limit_rules ORDER BY created_at, id",
                    COLUMNS
                ),
            )
        })
        .await
    }

    async fn insert(&self, rule: &Rule) -> Result<(), RuleTableError> {
        let rule = rule.clone();
        self.run(move |conn| match insert_row(conn, &rule, false) {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                Err(RuleTableError::Conflict(rule.rule_id.clone()))
            }
            Err(e) => Err(backend(e)),
        })
        .await
    }

    async fn insert_if_absent(&self, rule: &Rule) -> Result<bool, RuleTableError> {
        let rule = rule.clone();
        self.run(move |conn| {
            let changed = insert_row(conn, &rule, true).map_err(backend)?;
            Ok(changed > 0)
        })
        .await
    }

    async fn update(
        &self,
        rule_id: &str,
        update: &RuleUpdate,
        now: DateTime<Utc>,
    ) -> Result<Rule, RuleTableError> {
        let rule_id = rule_id.to_string();
        let update = update.clone();
        self.run(move |conn| {
            let tx = conn.transaction().map_err(backend)?;

            let changed = tx
                .execute(
                    "UPDATE rate_limit_rules
                     SET limit_count = COALESCE(?2, limit_count),
                         window_secs = COALESCE(?3, window_secs),
                         enabled     = COALESCE(?4, enabled),
                         updated_at  = ?5
                     WHERE rule_id = ?1",
                    params![
                        rule_id,
                        update.limit,
                        update.window_secs,
                        update.enabled,
                        now.timestamp_micros(),
                    ],
                )
                .map_err(backend)?;
            if changed == 0 {
                return Err(RuleTableError::NotFound(rule_id));
            }

            let raw = tx
                .query_row(
                    &format!("SELECT {} FROM rate_limit_rules WHERE rule_id = ?1", COLUMNS),
                    params![rule_id],
                    raw_row,
                )
                .optional()
                .map_err(backend)?
                .ok_or_else(|| RuleTableError::NotFound(rule_id.clone()))?;

            tx.commit().map_err(backend)?;
            into_rule(raw)
        })
        .await
    }

    async fn disable(&self, rule_id: &str, now: DateTime<Utc>) -> Result<(), RuleTableError> {
        let disable = RuleUpdate {
            enabled: Some(false),
            ..Default::default()
        };
        self.update(rule_id, &disable, now).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::NewRule;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn rule(id: &str, algorithm: Algorithm, secs: i64) -> Rule {
        NewRule::new(id, algorithm, 5, 60).into_rule(at(secs)).unwrap()
    }

    fn table() -> (tempfile::TempDir, SqliteRuleTable) {
        let dir = tempfile::tempdir().unwrap();
        let table = SqliteRuleTable::open(dir.path().join("nested/rules.db")).unwrap();
        (dir, table)
    }

    #[tokio::test]
    async fn test_insert_and_load_round_trip() {
        let (_dir, table) = table();
        let mut original = rule("export", Algorithm::TokenBucket, 100);
        original.client_scope = Some("acme".into());
        table.insert(&original).await.unwrap();

        let loaded = table.load_enabled().await.unwrap();
        assert_eq!(loaded, vec![original]);
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_conflict() {
        let (_dir, table) = table();
        table.insert(&rule("login", Algorithm::FixedWindow, 1)).await.unwrap();

        let err = table
            .insert(&rule("login", Algorithm::SlidingWindow, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, RuleTableError::Conflict(id) if id == "login"));
    }

    #[tokio::test]
    async fn test_insert_if_absent() {
        let (_dir, table) = table();
        assert!(table
            .insert_if_absent(&rule("default", Algorithm::FixedWindow, 1))
            .await
            .unwrap());
        assert!(!table
            .insert_if_absent(&rule("default", Algorithm::TokenBucket, 2))
            .await
            .unwrap());

        let all = table.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].algorithm, Algorithm::FixedWindow);
    }

    #[tokio::test]
    async fn test_update_coalesces_missing_fields() {
        let (_dir, table) = table();
        table.insert(&rule("login", Algorithm::FixedWindow, 1)).await.unwrap();

        let update = RuleUpdate {
            window_secs: Some(120),
            ..Default::default()
        };
        let updated = table.update("login", &update, at(50)).await.unwrap();

        assert_eq!(updated.limit, 5);
        assert_eq!(updated.window_secs, 120);
        assert!(updated.enabled);
        assert_eq!(updated.created_at, at(1));
        assert_eq!(updated.updated_at, at(50));
    }

    #[tokio::test]
    async fn test_disable_and_missing_rule() {
        let (_dir, table) = table();
        table.insert(&rule("upload", Algorithm::FixedWindow, 1)).await.unwrap();
        table.insert(&rule("search", Algorithm::SlidingWindow, 2)).await.unwrap();

        table.disable("upload", at(3)).await.unwrap();
        let enabled: Vec<_> = table
            .load_enabled()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.rule_id)
            .collect();
        assert_eq!(enabled, vec!["search"]);

        let ids: Vec<_> = table
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.rule_id)
            .collect();
        assert_eq!(ids, vec!["upload", "search"]);

        let err = table.disable("ghost", at(4)).await.unwrap_err();
        assert!(matches!(err, RuleTableError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unknown_algorithm_reads_as_fixed_window() {
        let (_dir, table) = table();
        table.insert(&rule("legacy", Algorithm::SlidingWindow, 1)).await.unwrap();

        let conn = Connection::open(table.path.as_path()).unwrap();
        conn.execute(
            "UPDATE rate_limit_rules SET algorithm = 'gcra' WHERE rule_id = 'legacy'",
            [],
        )
        .unwrap();

        let loaded = table.load_enabled().await.unwrap();
        assert_eq!(loaded[0].algorithm, Algorithm::FixedWindow);
    }

    #[tokio::test]
    async fn test_rows_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.db");
        {
            let table = SqliteRuleTable::open(&path).unwrap();
            table.insert(&rule("login", Algorithm::FixedWindow, 1)).await.unwrap();
        }

        let reopened = SqliteRuleTable::open(&path).unwrap();
        assert_eq!(reopened.list_all().await.unwrap().len(), 1);
    }
}
