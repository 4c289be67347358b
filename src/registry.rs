//! Client registry - maps tenant keys to pre-connected handles
//!
//! Resolution order for the default strategy:
//! 1. Exact tenant entry
//! 2. Shared default entry
//! 3. `Error::NoClientConfigured`
//!
//! The registry is built once at startup and is read-only afterwards, so lookups
//! take no locks. Custom routing is injected as a [`ResolveStrategy`] at construction.

use std::collections::BTreeMap;
use std::sync::Arc;
use crate::{Error, Result};

/// Read-only view of the registered entries handed to a strategy
pub struct ClientTable<H: ?Sized> {
    entries: BTreeMap<String, Arc<H>>,
    default: Option<Arc<H>>,
}

impl<H: ?Sized> ClientTable<H> {
    /// Entry registered for exactly this tenant key
    pub fn get(&self, tenant: &str) -> Option<&Arc<H>> {
        self.entries.get(tenant)
    }

    /// The shared fallback entry
    pub fn default_entry(&self) -> Option<&Arc<H>> {
        self.default.as_ref()
    }

    /// Registered tenant keys in sorted order
    pub fn tenants(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.default.is_none()
    }
}

/// Strategy deciding which entry serves a tenant
pub trait ResolveStrategy<H: ?Sized>: Send + Sync {
    fn resolve(&self, table: &ClientTable<H>, tenant: &str) -> Result<Arc<H>>;
}

impl<H: ?Sized, F> ResolveStrategy<H> for F
where
    F: Fn(&ClientTable<H>, &str) -> Result<Arc<H>> + Send + Sync,
{
    fn resolve(&self, table: &ClientTable<H>, tenant: &str) -> Result<Arc<H>> {
        self(table, tenant)
    }
}

/// Exact key lookup falling back to the default entry
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactOrDefault;

impl<H: ?Sized> ResolveStrategy<H> for ExactOrDefault {
    fn resolve(&self, table: &ClientTable<H>, tenant: &str) -> Result<Arc<H>> {
        table
            .get(tenant)
            .or_else(|| table.default_entry())
            .cloned()
            .ok_or_else(|| Error::NoClientConfigured(tenant.to_string()))
    }
}

/// Spreads tenants over the named entries by a stable hash of the tenant key.
///
/// Exact entries still win; the hash only picks among the named entries when
/// the tenant has none of its own. Falls back to the default entry when the
/// table holds no named entries.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShardByHash;

impl ShardByHash {
    fn fnv1a(key: &str) -> u64 {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in key.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        hash
    }
}

impl<H: ?Sized> ResolveStrategy<H> for ShardByHash {
    fn resolve(&self, table: &ClientTable<H>, tenant: &str) -> Result<Arc<H>> {
        if let Some(exact) = table.get(tenant) {
            return Ok(exact.clone());
        }
        if table.len() == 0 {
            return ExactOrDefault.resolve(table, tenant);
        }
        let slot = (Self::fnv1a(tenant) % table.len() as u64) as usize;
        table
            .entries
            .values()
            .nth(slot)
            .cloned()
            .ok_or_else(|| Error::NoClientConfigured(tenant.to_string()))
    }
}

/// Tenant key to handle registry
pub struct ClientRegistry<H: ?Sized> {
    table: ClientTable<H>,
    strategy: Arc<dyn ResolveStrategy<H>>,
}

impl<H: ?Sized + 'static> ClientRegistry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder::new()
    }

    /// Resolve the handle serving `tenant`
    pub fn resolve(&self, tenant: &str) -> Result<Arc<H>> {
        self.strategy.resolve(&self.table, tenant)
    }

    pub fn table(&self) -> &ClientTable<H> {
        &self.table
    }

    pub fn tenants(&self) -> impl Iterator<Item = &str> {
        self.table.tenants()
    }

    pub fn default_entry(&self) -> Option<&Arc<H>> {
        self.table.default_entry()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Populates a registry before it is shared
pub struct RegistryBuilder<H: ?Sized> {
    entries: BTreeMap<String, Arc<H>>,
    default: Option<Arc<H>>,
    strategy: Option<Arc<dyn ResolveStrategy<H>>>,
}

impl<H: ?Sized + 'static> RegistryBuilder<H> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            default: None,
            strategy: None,
        }
    }

    /// Register a handle for one tenant key (replaces any earlier entry)
    pub fn tenant(mut self, tenant: impl Into<String>, handle: Arc<H>) -> Self {
        self.entries.insert(tenant.into(), handle);
        self
    }

    /// Register the shared fallback handle
    pub fn default_handle(mut self, handle: Arc<H>) -> Self {
        self.default = Some(handle);
        self
    }

    /// Override how tenants are routed
    pub fn strategy(mut self, strategy: impl ResolveStrategy<H> + 'static) -> Self {
        self.strategy = Some(Arc::new(strategy));
        self
    }

    pub fn build(self) -> ClientRegistry<H> {
        ClientRegistry {
            table: ClientTable {
                entries: self.entries,
                default: self.default,
            },
            strategy: self.strategy.unwrap_or_else(|| Arc::new(ExactOrDefault)),
        }
    }
}

impl<H: ?Sized + 'static> Default for RegistryBuilder<H> {
    fn default() -> Self {
        Self::new()
    }
}
