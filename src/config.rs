use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::index::{IndexCatalog, IndexSpec};
use crate::mutex::{Backoff, RetryPolicy};
use crate::store::ConnectOptions;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TenantDbConfig {
    /// Tenants allowed to get their own connection; empty admits all
    #[serde(default)]
    pub valid_projects: Vec<String>,
    /// Databases opened (and provisioned) at startup on every connection
    #[serde(default)]
    pub warm_databases: Vec<String>,
    #[serde(default)]
    pub document: StoreSection,
    #[serde(default)]
    pub kv: KvSection,
    #[serde(default)]
    pub lock: LockSection,
    /// Extra index specs per database name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub indexes: BTreeMap<String, Vec<IndexSpec>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreSection {
    pub default: Option<String>,
    pub ca_file: Option<PathBuf>,
    pub pool_size: Option<u32>,
    pub connect_timeout_secs: Option<u64>,
    #[serde(default)]
    pub tenants: BTreeMap<String, String>,
}

impl StoreSection {
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            ca_file: self.ca_file.clone(),
            pool_size: self.pool_size,
            connect_timeout: self.connect_timeout_secs.map(Duration::from_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KvSection {
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key_prefix: String,
    pub connect_timeout_secs: Option<u64>,
    #[serde(default)]
    pub tenants: BTreeMap<String, String>,
}

impl KvSection {
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            connect_timeout: self.connect_timeout_secs.map(Duration::from_secs),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub backoff: BackoffKind,
    /// Cap on the exponential delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    10
}

fn default_retry_delay_ms() -> u64 {
    10
}

fn default_max_delay_ms() -> u64 {
    1000
}

impl Default for LockSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            backoff: BackoffKind::Fixed,
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl LockSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        let mut policy = RetryPolicy::new(self.max_attempts, Duration::from_millis(self.retry_delay_ms));
        if self.backoff == BackoffKind::Exponential {
            policy.backoff = Backoff::Exponential {
                max: Duration::from_millis(self.max_delay_ms),
            };
        }
        policy
    }
}

impl TenantDbConfig {
    /// Whether `tenant` may get its own connection
    pub fn admits(&self, tenant: &str) -> bool {
        self.valid_projects.is_empty() || self.valid_projects.iter().any(|p| p == tenant)
    }

    /// Built-in index catalog plus the configured tables
    pub fn index_catalog(&self) -> IndexCatalog {
        let mut catalog = IndexCatalog::builtin();
        catalog.extend(self.indexes.clone());
        catalog
    }

    /// Starter config for `init`: file-backed SQLite under `data_dir`
    pub fn local(data_dir: &Path) -> Self {
        Self {
            warm_databases: vec!["adjust".to_string(), "databoat".to_string()],
            document: StoreSection {
                default: Some(format!("sqlite://{}", data_dir.join("documents").display())),
                ..Default::default()
            },
            kv: KvSection {
                default: Some(format!("sqlite://{}", data_dir.join("kv.db").display())),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("tenantdb.toml")
}

pub fn default_data_dir_in(base: &Path) -> PathBuf {
    base.join(".tenantdb")
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<Option<TenantDbConfig>> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(&path)?;
    let config: TenantDbConfig = toml::from_str(&contents)?;
    Ok(Some(config))
}

pub fn write_config(path: &Path, config: &TenantDbConfig, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("config already exists at {} (use --force to overwrite)", path.display());
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}

pub fn ensure_data_dir(dir: &Path) -> anyhow::Result<()> {
    if !dir.as_os_str().is_empty() && !dir.exists() {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
valid_projects = ["alpha"]
warm_databases = ["adjust"]

[document]
default = "sqlite::memory:"
pool_size = 16

[document.tenants]
alpha = "sqlite::memory:"

[kv]
default = "sqlite::memory:"
key_prefix = "jobs:"

[lock]
max_attempts = 5
backoff = "exponential"

[[indexes.reports]]
collection = "daily"
fields = ["day"]
unique = true
"#;

    #[test]
    fn test_parse_sample() {
        let config: TenantDbConfig = toml::from_str(SAMPLE).unwrap();
        assert!(config.admits("alpha"));
        assert!(!config.admits("beta"));
        assert_eq!(config.document.tenants["alpha"], "sqlite::memory:");
        assert_eq!(config.document.connect_options().pool_size, Some(16));
        assert_eq!(config.kv.key_prefix, "jobs:");

        let policy = config.lock.retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay, Duration::from_millis(10));
        assert_eq!(policy.backoff, Backoff::Exponential { max: Duration::from_millis(1000) });

        let catalog = config.index_catalog();
        assert_eq!(catalog.specs_for("reports").len(), 1);
        assert_eq!(catalog.specs_for("adjust").len(), 2);
    }

    #[test]
    fn test_empty_config_defaults() {
        let config: TenantDbConfig = toml::from_str("").unwrap();
        assert!(config.admits("anyone"));
        assert_eq!(config.lock.retry_policy(), RetryPolicy::default());
        assert!(config.document.default.is_none());
    }

    #[test]
    fn test_write_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tenantdb.toml");
        let config = TenantDbConfig::local(&default_data_dir_in(dir.path()));

        write_config(&path, &config, false).unwrap();
        assert!(write_config(&path, &config, false).is_err());
        write_config(&path, &config, true).unwrap();

        let loaded = load_config(Some(&path)).unwrap().unwrap();
        assert_eq!(loaded.warm_databases, config.warm_databases);
        assert_eq!(loaded.document.default, config.document.default);
        assert!(load_config(Some(&dir.path().join("missing.toml"))).unwrap().is_none());
    }

    #[test]
    fn test_ensure_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("a/b");
        ensure_data_dir(&data).unwrap();
        assert!(data.is_dir());
    }
}
