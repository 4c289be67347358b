//! Startup wiring: connect every configured endpoint and build the registries
//!
//! Endpoints shared by several tenants are connected once, so tenants that
//! point at the same endpoint share one handle and one database cache.

use std::collections::BTreeMap;
use std::sync::Arc;
use crate::config::TenantDbConfig;
use crate::connection::ConnectionHandle;
use crate::index::{CatalogProvisioner, IndexProvisioner};
use crate::metrics::{MetricsSink, TracingMetrics};
use crate::mutex::{DistributedMutex, RetryPolicy};
use crate::registry::ClientRegistry;
use crate::store::{connect_kv, redact, KeyValueStore};
use crate::tenant::TenantStore;
use crate::Result;

/// Everything the process needs to serve tenants
pub struct Clients {
    pub documents: Arc<ClientRegistry<ConnectionHandle>>,
    pub kv: Arc<ClientRegistry<dyn KeyValueStore>>,
    pub lock_policy: RetryPolicy,
    pub key_prefix: String,
    pub metrics: Arc<dyn MetricsSink>,
}

impl Clients {
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn tenant_store(&self) -> TenantStore {
        TenantStore::new(self.documents.clone()).with_metrics(self.metrics.clone())
    }

    /// Lock on the key-value store serving `tenant`
    pub fn mutex(&self, tenant: &str) -> Result<DistributedMutex> {
        Ok(DistributedMutex::new(self.kv.resolve(tenant)?)
            .with_policy(self.lock_policy)
            .with_prefix(self.key_prefix.clone())
            .with_metrics(self.metrics.clone()))
    }

    /// Distinct document connections, keyed by endpoint
    pub fn document_handles(&self) -> BTreeMap<String, Arc<ConnectionHandle>> {
        let mut handles = BTreeMap::new();
        let table = self.documents.table();
        for tenant in table.tenants() {
            if let Some(handle) = table.get(tenant) {
                handles.insert(handle.endpoint().to_string(), handle.clone());
            }
        }
        if let Some(handle) = table.default_entry() {
            handles.insert(handle.endpoint().to_string(), handle.clone());
        }
        handles
    }
}

/// Connect everything `config` names and open the warm databases
pub async fn connect_all(config: &TenantDbConfig) -> Result<Clients> {
    let provisioner: Arc<dyn IndexProvisioner> = Arc::new(CatalogProvisioner::new(config.index_catalog()));

    let mut handles: BTreeMap<String, Arc<ConnectionHandle>> = BTreeMap::new();
    let mut documents = ClientRegistry::builder();
    for (tenant, endpoint) in admitted(config, &config.document.tenants) {
        let handle = document_handle(&mut handles, endpoint, config, &provisioner).await?;
        documents = documents.tenant(tenant, handle);
    }
    if let Some(endpoint) = &config.document.default {
        let handle = document_handle(&mut handles, endpoint, config, &provisioner).await?;
        documents = documents.default_handle(handle);
    }

    for handle in handles.values() {
        for name in &config.warm_databases {
            handle.database(name).await?;
        }
    }

    let mut stores: BTreeMap<String, Arc<dyn KeyValueStore>> = BTreeMap::new();
    let mut kv = ClientRegistry::<dyn KeyValueStore>::builder();
    for (tenant, endpoint) in admitted(config, &config.kv.tenants) {
        let store = kv_store(&mut stores, endpoint, config).await?;
        kv = kv.tenant(tenant, store);
    }
    if let Some(endpoint) = &config.kv.default {
        let store = kv_store(&mut stores, endpoint, config).await?;
        kv = kv.default_handle(store);
    }

    tracing::info!(
        document_endpoints = handles.len(),
        kv_endpoints = stores.len(),
        "clients ready"
    );

    Ok(Clients {
        documents: Arc::new(documents.build()),
        kv: Arc::new(kv.build()),
        lock_policy: config.lock.retry_policy(),
        key_prefix: config.kv.key_prefix.clone(),
        metrics: Arc::new(TracingMetrics),
    })
}

/// Tenant entries allowed by `valid_projects`
fn admitted<'a>(
    config: &'a TenantDbConfig,
    tenants: &'a BTreeMap<String, String>,
) -> impl Iterator<Item = (&'a String, &'a String)> {
    tenants.iter().filter(move |(tenant, _)| {
        let admitted = config.admits(tenant);
        if !admitted {
            tracing::debug!(tenant = %tenant, "tenant not in valid_projects, skipped");
        }
        admitted
    })
}

async fn document_handle(
    handles: &mut BTreeMap<String, Arc<ConnectionHandle>>,
    endpoint: &str,
    config: &TenantDbConfig,
    provisioner: &Arc<dyn IndexProvisioner>,
) -> Result<Arc<ConnectionHandle>> {
    if let Some(handle) = handles.get(endpoint) {
        return Ok(handle.clone());
    }
    let handle = Arc::new(
        ConnectionHandle::connect(endpoint, &config.document.connect_options(), provisioner.clone()).await?,
    );
    handles.insert(endpoint.to_string(), handle.clone());
    Ok(handle)
}

async fn kv_store(
    stores: &mut BTreeMap<String, Arc<dyn KeyValueStore>>,
    endpoint: &str,
    config: &TenantDbConfig,
) -> Result<Arc<dyn KeyValueStore>> {
    if let Some(store) = stores.get(endpoint) {
        return Ok(store.clone());
    }
    let store = connect_kv(endpoint, &config.kv.connect_options()).await?;
    tracing::info!(endpoint = %redact(endpoint), backend = store.backend(), "key-value store connected");
    stores.insert(endpoint.to_string(), store.clone());
    Ok(store)
}
