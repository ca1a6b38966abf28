//! Schema discovery on a master and replication to a slave

mod common;

use chrono::{TimeZone, Utc};
use common::*;
use fluxsync_core::client::{DbClient, FieldValue, Point, RetentionPolicySpec};
use fluxsync_core::schema::{FieldType, SchemaCatalog, SchemaFilter, INTERNAL_DATABASE};
use std::sync::Arc;
use std::time::Duration;

const WEEK: Duration = Duration::from_secs(7 * 24 * 3600);

fn catalog(node: &Arc<fluxsync_core::client::memory::MemoryNode>) -> SchemaCatalog {
    SchemaCatalog::new(node.name().to_string(), node.clone() as Arc<dyn DbClient>)
}

/// `a` is replicable, `b` lacks a default policy, `_internal` is never touched
fn seeded_cluster() -> TestCluster {
    let cluster = TestCluster::new();
    let master = &cluster.master;

    with_autogen(master, "a");
    master.add_retention_policy("a", RetentionPolicySpec::new("raw", WEEK), false);

    master.add_retention_policy("b", RetentionPolicySpec::new("one", WEEK), false);
    master.add_retention_policy("b", RetentionPolicySpec::new("two", WEEK), false);

    with_autogen(master, INTERNAL_DATABASE);

    let t = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    insert(master, "a", "autogen", temp_points(t, t + chrono::Duration::minutes(1), 10));
    insert(
        master,
        "a",
        "raw",
        vec![Point::new("disk", 1_700_000_000_000_000_000)
            .tag("host", "h1")
            .field("free", FieldValue::Integer(42))
            .field("mounted", FieldValue::Boolean(true))],
    );
    cluster
}

#[tokio::test]
async fn test_discovery_skips_internal_and_databases_without_default() {
    let cluster = seeded_cluster();
    let schemas = catalog(&cluster.master)
        .discover(&SchemaFilter::all())
        .await
        .unwrap();

    assert_eq!(schemas.len(), 1);
    let a = &schemas[0];
    assert_eq!(a.name, "a");
    assert_eq!(a.default_rp, "autogen");
    assert_eq!(a.retention_policies.len(), 2);

    let raw = a
        .retention_policies
        .iter()
        .find(|rp| rp.name == "raw")
        .unwrap();
    assert_eq!(raw.duration, WEEK);
    assert!(!raw.is_default);
    let disk = &raw.measurements["disk"];
    assert_eq!(disk.fields["free"].field_type, FieldType::Integer);
    assert_eq!(disk.fields["mounted"].field_type, FieldType::Boolean);

    let autogen = a.default_policy().unwrap();
    assert!(autogen.is_infinite());
    assert!(autogen.measurements.contains_key("temp"));
}

#[tokio::test]
async fn test_replication_creates_only_valid_databases() {
    let cluster = seeded_cluster();
    let schemas = catalog(&cluster.master)
        .discover(&SchemaFilter::all())
        .await
        .unwrap();

    let report = catalog(&cluster.slave).replicate(&schemas).await;

    assert!(report.is_clean());
    assert_eq!(report.databases, 1);
    assert_eq!(cluster.slave.databases(), vec!["a".to_string()]);
    assert_eq!(
        cluster.slave.default_retention_policy("a").as_deref(),
        Some("autogen")
    );
    assert_eq!(cluster.slave.retention_policy("a", "raw").unwrap().duration, WEEK);
}

#[tokio::test]
async fn test_replication_statement_order() {
    let cluster = seeded_cluster();
    let schemas = catalog(&cluster.master)
        .discover(&SchemaFilter::all())
        .await
        .unwrap();
    catalog(&cluster.slave).replicate(&schemas).await;

    let statements = cluster.slave.executed_statements();
    assert_eq!(statements.len(), 4);
    assert!(statements[0].starts_with("CREATE DATABASE \"a\""));
    assert!(statements[1].starts_with("CREATE RETENTION POLICY \"autogen\" ON \"a\""));
    assert!(statements[1].ends_with("DEFAULT"));
    assert!(statements[2].starts_with("ALTER RETENTION POLICY \"autogen\" ON \"a\""));
    assert!(statements[3].starts_with("CREATE RETENTION POLICY \"raw\" ON \"a\""));
}

#[tokio::test]
async fn test_replication_is_repeatable() {
    let cluster = seeded_cluster();
    let schemas = catalog(&cluster.master)
        .discover(&SchemaFilter::all())
        .await
        .unwrap();
    let slave = catalog(&cluster.slave);

    assert!(slave.replicate(&schemas).await.is_clean());
    assert!(slave.replicate(&schemas).await.is_clean());
    assert_eq!(cluster.slave.databases(), vec!["a".to_string()]);
}

#[tokio::test]
async fn test_filtered_discovery() {
    let cluster = seeded_cluster();
    let filter = SchemaFilter::new("^a$", "^raw$", "").unwrap();
    let schemas = catalog(&cluster.master).discover(&filter).await.unwrap();

    assert_eq!(schemas.len(), 1);
    let a = &schemas[0];
    // the default policy is always kept so the database can be created
    assert!(a.default_policy().is_some());
    assert!(a.default_policy().unwrap().measurements.is_empty());
    let raw = a
        .retention_policies
        .iter()
        .find(|rp| rp.name == "raw")
        .unwrap();
    assert!(raw.measurements.contains_key("disk"));
}

#[tokio::test]
async fn test_renamed_replication() {
    let cluster = seeded_cluster();
    let schemas: Vec<_> = catalog(&cluster.master)
        .discover(&SchemaFilter::all())
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.with_rename(Some("a_copy".to_string()), Some("forever".to_string())))
        .collect();

    assert!(catalog(&cluster.slave).replicate(&schemas).await.is_clean());
    assert_eq!(
        cluster.slave.default_retention_policy("a_copy").as_deref(),
        Some("forever")
    );
    assert!(cluster.slave.retention_policy("a_copy", "raw").is_some());
    assert!(cluster.slave.retention_policy("a_copy", "autogen").is_none());
}

#[tokio::test]
async fn test_discovery_fails_when_node_down() {
    let cluster = seeded_cluster();
    cluster.master.set_online(false);

    assert!(catalog(&cluster.master)
        .discover(&SchemaFilter::all())
        .await
        .is_err());
}
