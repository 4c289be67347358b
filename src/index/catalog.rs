//! Static index tables keyed by database name

use std::collections::BTreeMap;
use std::time::Duration;
use super::IndexSpec;

/// Ad attribution callback database
pub const ADJUST_DB: &str = "adjust";
/// Shared user-data database
pub const DATABOAT_DB: &str = "databoat";

/// Attribution installs, one document per advertising id
pub const INSTALL_COLLECTION: &str = "install";
/// Save-game backups kept when a client resolves a save conflict
pub const FILES_BACKUP_COLLECTION: &str = "files_backup";

/// Device identifiers a backup can be looked up by
const FILES_BACKUP_LOOKUP_FIELDS: &[&str] = &[
    "userId",
    "adjustId",
    "deviceId",
    "idfa",
    "idfv",
    "androidId",
    "gpsAdid",
];

/// Index tables per database name
#[derive(Debug, Clone, Default)]
pub struct IndexCatalog {
    tables: BTreeMap<String, Vec<IndexSpec>>,
}

impl IndexCatalog {
    /// Catalog with no tables; provisioning becomes a no-op
    pub fn empty() -> Self {
        Self::default()
    }

    /// Tables for the well-known databases
    pub fn builtin() -> Self {
        let mut catalog = Self::empty();

        catalog.add(ADJUST_DB, IndexSpec::new(INSTALL_COLLECTION, &["adid"]).unique());
        catalog.add(ADJUST_DB, IndexSpec::new(INSTALL_COLLECTION, &["app_id"]));

        for field in FILES_BACKUP_LOOKUP_FIELDS {
            catalog.add(DATABOAT_DB, IndexSpec::new(FILES_BACKUP_COLLECTION, &[*field]));
        }
        // expireAt holds the absolute expiry time
        catalog.add(
            DATABOAT_DB,
            IndexSpec::new(FILES_BACKUP_COLLECTION, &["expireAt"]).expire_after(Duration::ZERO),
        );

        catalog
    }

    /// Append a spec to a database's table
    pub fn add(&mut self, database: &str, spec: IndexSpec) {
        let table = self.tables.entry(database.to_string()).or_default();
        if !table.contains(&spec) {
            table.push(spec);
        }
    }

    /// Merge additional tables, e.g. from configuration
    pub fn extend(&mut self, tables: impl IntoIterator<Item = (String, Vec<IndexSpec>)>) {
        for (database, specs) in tables {
            for spec in specs {
                self.add(&database, spec);
            }
        }
    }

    /// Specs to ensure for a database; empty for unknown databases
    pub fn specs_for(&self, database: &str) -> &[IndexSpec] {
        self.tables.get(database).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn databases(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_tables() {
        let catalog = IndexCatalog::builtin();

        let adjust = catalog.specs_for(ADJUST_DB);
        assert_eq!(adjust.len(), 2);
        assert!(adjust[0].unique);
        assert_eq!(adjust[0].name(), "adid_1");

        let databoat = catalog.specs_for(DATABOAT_DB);
        assert_eq!(databoat.len(), 8);
        assert_eq!(databoat.last().unwrap().expire_after, Some(Duration::ZERO));

        assert!(catalog.specs_for("unknown").is_empty());
    }

    #[test]
    fn test_add_ignores_duplicates() {
        let mut catalog = IndexCatalog::empty();
        catalog.add("reports", IndexSpec::new("daily", &["day"]));
        catalog.add("reports", IndexSpec::new("daily", &["day"]));
        catalog.extend(vec![("reports".to_string(), vec![IndexSpec::new("daily", &["day"])])]);
        assert_eq!(catalog.specs_for("reports").len(), 1);
    }
}
