//! Typed InfluxQL statements
//!
//! Every statement the agent issues is built from [`Statement`], so quoting
//! and duration rendering live in one place.

use super::{epoch_nanos, ClientError, ClientResult};
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

/// Retention policy parameters used when creating policies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicySpec {
    pub name: String,
    /// Zero means infinite retention
    pub duration: Duration,
    /// Zero lets the server pick its default
    pub shard_group_duration: Duration,
    pub replication: u32,
}

impl RetentionPolicySpec {
    pub fn new(name: impl Into<String>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            duration,
            shard_group_duration: Duration::ZERO,
            replication: 1,
        }
    }

    pub fn with_shard_group_duration(mut self, duration: Duration) -> Self {
        self.shard_group_duration = duration;
        self
    }

    pub fn with_replication(mut self, replication: u32) -> Self {
        self.replication = replication;
        self
    }

    fn clauses(&self) -> String {
        let mut out = format!(
            "DURATION {} REPLICATION {}",
            render_duration(self.duration),
            self.replication.max(1)
        );
        if !self.shard_group_duration.is_zero() {
            out.push_str(&format!(
                " SHARD DURATION {}",
                render_duration(self.shard_group_duration)
            ));
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    ShowDatabases,
    ShowRetentionPolicies {
        database: String,
    },
    /// Measurements of the query's database
    ShowMeasurements,
    ShowFieldKeys {
        retention_policy: String,
        measurement: String,
    },
    /// All fields of one measurement within `[start, end)`, grouped by every tag
    SelectWindow {
        retention_policy: String,
        measurement: String,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    CreateDatabase {
        database: String,
        default_rp: RetentionPolicySpec,
    },
    CreateRetentionPolicy {
        database: String,
        policy: RetentionPolicySpec,
        make_default: bool,
    },
    SetDefaultRetentionPolicy {
        database: String,
        name: String,
    },
}

impl Statement {
    pub fn to_influxql(&self) -> String {
        match self {
            Statement::ShowDatabases => "SHOW DATABASES".to_string(),
            Statement::ShowRetentionPolicies { database } => {
                format!("SHOW RETENTION POLICIES ON {}", quote_ident(database))
            }
            Statement::ShowMeasurements => "SHOW MEASUREMENTS".to_string(),
            Statement::ShowFieldKeys {
                retention_policy,
                measurement,
            } => format!(
                "SHOW FIELD KEYS FROM {}.{}",
                quote_ident(retention_policy),
                quote_ident(measurement)
            ),
            Statement::SelectWindow {
                retention_policy,
                measurement,
                start,
                end,
            } => format!(
                "SELECT * FROM {}.{} WHERE time >= {} AND time < {} GROUP BY *",
                quote_ident(retention_policy),
                quote_ident(measurement),
                epoch_nanos(*start),
                epoch_nanos(*end)
            ),
            Statement::CreateDatabase {
                database,
                default_rp,
            } => format!(
                "CREATE DATABASE {} WITH {} NAME {}",
                quote_ident(database),
                default_rp.clauses(),
                quote_ident(&default_rp.name)
            ),
            Statement::CreateRetentionPolicy {
                database,
                policy,
                make_default,
            } => {
                let mut out = format!(
                    "CREATE RETENTION POLICY {} ON {} {}",
                    quote_ident(&policy.name),
                    quote_ident(database),
                    policy.clauses()
                );
                if *make_default {
                    out.push_str(" DEFAULT");
                }
                out
            }
            Statement::SetDefaultRetentionPolicy { database, name } => format!(
                "ALTER RETENTION POLICY {} ON {} DEFAULT",
                quote_ident(name),
                quote_ident(database)
            ),
        }
    }

    /// Statements that change server state
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Statement::CreateDatabase { .. }
                | Statement::CreateRetentionPolicy { .. }
                | Statement::SetDefaultRetentionPolicy { .. }
        )
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_influxql())
    }
}

/// Double-quote an identifier, escaping backslashes and quotes
pub fn quote_ident(ident: &str) -> String {
    let mut out = String::with_capacity(ident.len() + 2);
    out.push('"');
    for c in ident.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

fn render_duration(d: Duration) -> String {
    if d.is_zero() {
        "INF".to_string()
    } else {
        format!("{}s", d.as_secs().max(1))
    }
}

/// Parse a server duration string such as `168h0m0s`, `1h30m`, `500ms` or `0s`
///
/// `INF` and the empty string parse as zero (infinite retention).
pub fn parse_duration(input: &str) -> ClientResult<Duration> {
    let s = input.trim();
    if s.is_empty() || s.eq_ignore_ascii_case("inf") {
        return Ok(Duration::ZERO);
    }

    let mut total: u128 = 0;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits == 0 {
            return Err(invalid_duration(input));
        }
        let value: u128 = rest[..digits]
            .parse()
            .map_err(|_| invalid_duration(input))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let nanos_per_unit: u128 = match &rest[..unit_len] {
            "ns" => 1,
            "us" | "µs" | "u" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3_600 * 1_000_000_000,
            "d" => 86_400 * 1_000_000_000,
            "w" => 7 * 86_400 * 1_000_000_000,
            _ => return Err(invalid_duration(input)),
        };
        rest = &rest[unit_len..];
        total = total.saturating_add(value.saturating_mul(nanos_per_unit));
    }

    let secs = (total / 1_000_000_000).min(u64::MAX as u128) as u64;
    let nanos = (total % 1_000_000_000) as u32;
    Ok(Duration::new(secs, nanos))
}

/// Render a duration the way the server reports it, e.g. `168h0m0s`
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}

fn invalid_duration(input: &str) -> ClientError {
    ClientError::Protocol(format!("invalid duration '{}'", input))
}
