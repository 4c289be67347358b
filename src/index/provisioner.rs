//! Best-effort index provisioning for newly opened databases

use async_trait::async_trait;
use crate::Error;
use crate::store::DocumentDatabase;
use super::IndexCatalog;

/// Outcome of one provisioning pass
#[derive(Debug, Default)]
pub struct ProvisionReport {
    /// Names of indexes the backend confirmed
    pub created: Vec<String>,
    /// Specs the backend rejected; provisioning carried on past them
    pub failed: Vec<Error>,
}

impl ProvisionReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Ensures the indexes a database needs exist
#[async_trait]
pub trait IndexProvisioner: Send + Sync {
    /// Runs once per database per process; never fails the caller
    async fn provision(&self, database: &dyn DocumentDatabase) -> ProvisionReport;
}

/// Applies the catalog table matching the database name
#[derive(Debug, Clone, Default)]
pub struct CatalogProvisioner {
    catalog: IndexCatalog,
}

impl CatalogProvisioner {
    pub fn new(catalog: IndexCatalog) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &IndexCatalog {
        &self.catalog
    }
}

#[async_trait]
impl IndexProvisioner for CatalogProvisioner {
    async fn provision(&self, database: &dyn DocumentDatabase) -> ProvisionReport {
        let mut report = ProvisionReport::default();

        for spec in self.catalog.specs_for(database.name()) {
            let qualified = format!("{}.{}", spec.collection, spec.name());
            match database.create_index(spec).await {
                Ok(name) => {
                    tracing::info!(database = database.name(), index = %qualified, "index ensured");
                    report.created.push(name);
                }
                Err(e) => {
                    tracing::error!(database = database.name(), index = %qualified, "create index failed: {}", e);
                    report.failed.push(Error::IndexProvision {
                        database: database.name().to_string(),
                        index: qualified,
                        reason: e.to_string(),
                    });
                }
            }
        }

        report
    }
}
