//! Index definitions and one-time provisioning
//!
//! - `IndexSpec` describes a secondary index on one collection
//! - `IndexCatalog` holds the static table of specs per database name
//! - `IndexProvisioner` applies a catalog to a freshly opened database

pub mod catalog;
pub mod provisioner;

use std::time::Duration;
use serde::{Deserialize, Serialize};

pub use catalog::IndexCatalog;
pub use provisioner::{IndexProvisioner, CatalogProvisioner, ProvisionReport};

/// Key ordering of an index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexOrder {
    #[default]
    Ascending,
    Descending,
}

impl IndexOrder {
    /// Direction value as used in index key documents
    pub fn direction(&self) -> i32 {
        match self {
            Self::Ascending => 1,
            Self::Descending => -1,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Ascending => "ASC",
            Self::Descending => "DESC",
        }
    }
}

/// Declarative description of a secondary index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub collection: String,
    pub fields: Vec<String>,
    #[serde(default)]
    pub order: IndexOrder,
    #[serde(default)]
    pub unique: bool,
    #[serde(
        default,
        with = "expire_secs",
        rename = "expire_after_secs",
        skip_serializing_if = "Option::is_none"
    )]
    pub expire_after: Option<Duration>,
}

impl IndexSpec {
    /// Ascending, non-unique index on `fields`
    pub fn new(collection: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            collection: collection.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            order: IndexOrder::Ascending,
            unique: false,
            expire_after: None,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn descending(mut self) -> Self {
        self.order = IndexOrder::Descending;
        self
    }

    /// Documents expire `ttl` after the timestamp stored in the (single) field
    pub fn expire_after(mut self, ttl: Duration) -> Self {
        self.expire_after = Some(ttl);
        self
    }

    /// Deterministic index name: each field followed by its direction, joined by `_`.
    ///
    /// `["userId", "day"]` ascending becomes `userId_1_day_1`.
    pub fn name(&self) -> String {
        let direction = self.order.direction();
        self.fields
            .iter()
            .map(|field| format!("{}_{}", field, direction))
            .collect::<Vec<_>>()
            .join("_")
    }
}

mod expire_secs {
    use std::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}
