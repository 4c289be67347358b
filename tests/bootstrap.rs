use std::sync::Arc;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tenantdb::bootstrap;
use tenantdb::config::load_config;
use tenantdb::metrics::RecordingMetrics;
use tenantdb::{Filter, FindOptions, Update};

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Report {
    day: String,
    visits: u64,
}

fn write_config(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("tenantdb.toml");
    let contents = format!(
        r#"
valid_projects = ["alpha", "beta"]
warm_databases = ["reports"]

[document]
default = "sqlite://{data}/shared"

[document.tenants]
alpha = "sqlite://{data}/alpha"
beta = "sqlite://{data}/alpha"

[kv]
default = "sqlite://{data}/kv.db"
key_prefix = "jobs:"

[lock]
max_attempts = 3
retry_delay_ms = 5

[[indexes.reports]]
collection = "daily"
fields = ["day"]
unique = true
"#,
        data = dir.join("data").display()
    );
    std::fs::write(&path, contents).unwrap();
    path
}

#[tokio::test]
async fn test_config_file_to_tenant_operations() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_config(Some(&write_config(dir.path()))).unwrap().unwrap();
    let metrics = Arc::new(RecordingMetrics::new());
    let clients = bootstrap::connect_all(&config).await.unwrap().with_metrics(metrics.clone());

    // alpha and beta share one endpoint, the default is separate
    assert_eq!(clients.document_handles().len(), 2);

    let store = clients.tenant_store();
    let daily = store.collection_in("alpha", "reports", "daily").await.unwrap();
    assert_eq!(
        daily.database().list_indexes("daily").await.unwrap(),
        vec!["_id_", "day_1"]
    );

    daily.insert_one(&Report { day: "2024-01-01".into(), visits: 3 }).await.unwrap();
    assert!(daily.insert_one(&Report { day: "2024-01-01".into(), visits: 9 }).await.is_err());
    daily
        .upsert_one(&Filter::new().eq("day", "2024-01-02"), &Update::new().inc("visits", 1))
        .await
        .unwrap();

    // beta reads what alpha wrote through the shared handle
    let shared = store.collection_in("beta", "reports", "daily").await.unwrap();
    let reports: Vec<Report> = shared.find_all(&Filter::all(), &FindOptions::new()).await.unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[1], Report { day: "2024-01-02".into(), visits: 1 });

    // unknown tenants fall back to the default connection
    let other = store.collection_in("gamma", "reports", "daily").await.unwrap();
    assert_eq!(other.count(&Filter::all()).await.unwrap(), 0);

    assert!(metrics.count("insert_one") >= 2);
    assert!(dir.path().join("data/alpha/reports.db").exists());
}

#[tokio::test]
async fn test_config_file_to_lock() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_config(Some(&write_config(dir.path()))).unwrap().unwrap();
    let clients = bootstrap::connect_all(&config).await.unwrap();

    let first = clients.mutex("alpha").unwrap();
    let second = clients.mutex("beta").unwrap();
    assert_eq!(first.policy().max_attempts, 3);

    assert!(first.acquire("nightly", "w1", Duration::from_secs(10)).await.unwrap());
    assert!(!second.acquire("nightly", "w2", Duration::from_secs(10)).await.unwrap());

    let kv = clients.kv.resolve("alpha").unwrap();
    assert_eq!(kv.get("jobs:nightly").await.unwrap().as_deref(), Some("w1"));

    first.release("nightly").await.unwrap();
    assert!(second.acquire("nightly", "w2", Duration::from_secs(10)).await.unwrap());
}
