//! Structural checks on staging tables.
//!
//! Every rule names a table and its key. Key columns must be non-null and
//! unique; declared foreign keys are counted for orphans with a
//! left-anti-join. Tables that do not exist are skipped silently so optional
//! entities never block a run.

use std::fmt;

use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::warehouse::{quote_ident, row_count, table_columns, table_exists};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Pass,
    Warn,
    Fail,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Outcome::Pass => "pass",
            Outcome::Warn => "warn",
            Outcome::Fail => "fail",
        })
    }
}

#[derive(Debug, Clone)]
pub struct ForeignKey {
    pub column: String,
    pub parent_table: String,
    pub parent_column: String,
}

#[derive(Debug, Clone)]
pub struct TableRule {
    pub table: String,
    pub primary_key: Vec<String>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableRule {
    pub fn new(table: &str, primary_key: &[&str]) -> Self {
        Self {
            table: table.to_string(),
            primary_key: primary_key.iter().map(|c| c.to_string()).collect(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn references(mut self, column: &str, parent_table: &str, parent_column: &str) -> Self {
        self.foreign_keys.push(ForeignKey {
            column: column.to_string(),
            parent_table: parent_table.to_string(),
            parent_column: parent_column.to_string(),
        });
        self
    }
}

#[derive(Debug, Clone)]
pub struct QualityConfig {
    pub fail_on_critical: bool,
    /// Orphan share (orphans / non-null child rows) tolerated as a warning.
    pub max_orphan_ratio: f64,
    pub rules: Vec<TableRule>,
}

impl QualityConfig {
    pub fn staging_defaults(fail_on_critical: bool, max_orphan_ratio: f64) -> Self {
        Self {
            fail_on_critical,
            max_orphan_ratio,
            rules: vec![
                TableRule::new("stg_tournaments", &["No"]),
                TableRule::new("stg_matches", &["No"]).references(
                    "NoTournament",
                    "stg_tournaments",
                    "No",
                ),
                TableRule::new("stg_match_details", &["No"]).references(
                    "NoMatch",
                    "stg_matches",
                    "No",
                ),
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub outcome: Outcome,
    pub count: i64,
    pub detail: String,
}

#[derive(Debug, Clone, Default)]
pub struct QualityReport {
    pub checks: Vec<CheckResult>,
    pub skipped_tables: Vec<String>,
}

impl QualityReport {
    pub fn failures(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| c.outcome == Outcome::Fail)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| c.outcome == Outcome::Warn)
    }

    pub fn passed(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Runs every configured rule. Fails with
/// [`PipelineError::CriticalQualityFailure`] only when a check fails and
/// `fail_on_critical` is set.
pub fn check(conn: &Connection, config: &QualityConfig) -> Result<QualityReport> {
    let mut report = QualityReport::default();
    for rule in &config.rules {
        if !table_exists(conn, &rule.table)? {
            debug!(table = %rule.table, "table absent, skipping checks");
            report.skipped_tables.push(rule.table.clone());
            continue;
        }
        let columns = table_columns(conn, &rule.table)?;
        let missing = rule
            .primary_key
            .iter()
            .filter(|c| !columns.contains(c))
            .cloned()
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            report.checks.push(CheckResult {
                name: format!("{}.pk_present", rule.table),
                outcome: Outcome::Fail,
                count: missing.len() as i64,
                detail: format!("key columns missing: {}", missing.join(", ")),
            });
            continue;
        }
        report.checks.push(check_not_null(conn, rule)?);
        report.checks.push(check_unique(conn, rule)?);
        for fk in &rule.foreign_keys {
            if !columns.contains(&fk.column) {
                debug!(table = %rule.table, column = %fk.column, "reference column absent, skipping");
                continue;
            }
            if let Some(result) = check_references(conn, rule, fk, config.max_orphan_ratio)? {
                report.checks.push(result);
            }
        }
    }

    for result in &report.checks {
        match result.outcome {
            Outcome::Pass => debug!(check = %result.name, "quality check passed"),
            Outcome::Warn => warn!(check = %result.name, count = result.count, detail = %result.detail, "quality warning"),
            Outcome::Fail => error!(check = %result.name, count = result.count, detail = %result.detail, "quality check failed"),
        }
    }

    let failed = report.failures().map(|c| c.name.clone()).collect::<Vec<_>>();
    info!(
        checks = report.checks.len(),
        failed = failed.len(),
        warned = report.warnings().count(),
        skipped_tables = report.skipped_tables.len(),
        "quality gate finished"
    );
    if !failed.is_empty() {
        if config.fail_on_critical {
            return Err(PipelineError::CriticalQualityFailure { failed }.into());
        }
        warn!("quality failures tolerated because fail_on_critical is off");
    }
    Ok(report)
}

fn check_not_null(conn: &Connection, rule: &TableRule) -> Result<CheckResult> {
    let name = format!("{}.pk_not_null", rule.table);
    let predicate = rule
        .primary_key
        .iter()
        .map(|c| format!("{} IS NULL", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(" OR ");
    let count: i64 = conn
        .query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE {predicate}",
                quote_ident(&rule.table)
            ),
            [],
            |row| row.get(0),
        )
        .with_context(|| format!("run {name}"))?;
    Ok(CheckResult {
        outcome: if count == 0 { Outcome::Pass } else { Outcome::Fail },
        detail: format!("{count} rows with a null key"),
        name,
        count,
    })
}

fn check_unique(conn: &Connection, rule: &TableRule) -> Result<CheckResult> {
    let name = format!("{}.pk_unique", rule.table);
    let cols = rule
        .primary_key
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let count: i64 = conn
        .query_row(
            &format!(
                "SELECT COUNT(*) FROM (SELECT 1 FROM {} GROUP BY {cols} HAVING COUNT(*) > 1)",
                quote_ident(&rule.table)
            ),
            [],
            |row| row.get(0),
        )
        .with_context(|| format!("run {name}"))?;
    Ok(CheckResult {
        outcome: if count == 0 { Outcome::Pass } else { Outcome::Fail },
        detail: format!("{count} duplicated keys"),
        name,
        count,
    })
}

fn check_references(
    conn: &Connection,
    rule: &TableRule,
    fk: &ForeignKey,
    max_orphan_ratio: f64,
) -> Result<Option<CheckResult>> {
    if !table_exists(conn, &fk.parent_table)? {
        debug!(table = %rule.table, parent = %fk.parent_table, "parent table absent, skipping reference check");
        return Ok(None);
    }
    let name = format!("{}.{}_references_{}", rule.table, fk.column, fk.parent_table);
    let child = quote_ident(&rule.table);
    let parent = quote_ident(&fk.parent_table);
    let child_col = quote_ident(&fk.column);
    let parent_col = quote_ident(&fk.parent_column);

    let referencing: i64 = conn
        .query_row(
            &format!("SELECT COUNT(*) FROM {child} WHERE {child_col} IS NOT NULL"),
            [],
            |row| row.get(0),
        )
        .with_context(|| format!("run {name}"))?;
    let orphans: i64 = conn
        .query_row(
            &format!(
                "SELECT COUNT(*) FROM {child} AS c
                 LEFT JOIN {parent} AS p ON c.{child_col} = p.{parent_col}
                 WHERE c.{child_col} IS NOT NULL AND p.{parent_col} IS NULL"
            ),
            [],
            |row| row.get(0),
        )
        .with_context(|| format!("run {name}"))?;

    let ratio = if referencing > 0 {
        orphans as f64 / referencing as f64
    } else {
        0.0
    };
    let outcome = if orphans == 0 {
        Outcome::Pass
    } else if ratio <= max_orphan_ratio {
        Outcome::Warn
    } else {
        Outcome::Fail
    };
    let parent_rows = row_count(conn, &fk.parent_table)?;
    Ok(Some(CheckResult {
        name,
        outcome,
        count: orphans,
        detail: format!(
            "{orphans} of {referencing} rows reference a missing {}.{} ({parent_rows} parent rows)",
            fk.parent_table, fk.parent_column
        ),
    }))
}
