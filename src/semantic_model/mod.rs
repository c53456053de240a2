pub mod duration;
pub mod local_store;
pub mod mdl;
pub mod metric;
pub mod model;

pub use mdl::Mdl;
pub use metric::{CumulativeMetric, Measure, Metric, TimeGrain, TimeUnit, Window};
pub use model::{Column, EnumDefinition, EnumValue, JoinType, Model, Relationship, View};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The manifest ("MDL") document: every semantic object of one catalog/schema.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub catalog: String,
    pub schema: String,
    #[serde(default)]
    pub models: Vec<Model>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    #[serde(default)]
    pub metrics: Vec<Metric>,
    #[serde(default)]
    pub cumulative_metrics: Vec<CumulativeMetric>,
    #[serde(default)]
    pub views: Vec<View>,
    #[serde(default, rename = "enums")]
    pub enum_definitions: Vec<EnumDefinition>,
}

impl Manifest {
    pub fn to_json(&self) -> Result<String, SemanticModelError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, SemanticModelError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Fully qualified name of a table or semantic object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CatalogSchemaTableName {
    pub catalog: String,
    pub schema: String,
    pub table: String,
}

impl CatalogSchemaTableName {
    pub fn new(
        catalog: impl Into<String>,
        schema: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        CatalogSchemaTableName {
            catalog: catalog.into(),
            schema: schema.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for CatalogSchemaTableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.catalog, self.schema, self.table)
    }
}

/// Source of manifests.
pub trait SemanticModelStore {
    fn get_manifest(&self) -> Result<Manifest, SemanticModelError>;
    fn save_manifest(&mut self, manifest: Manifest) -> Result<(), SemanticModelError>;
}

#[derive(Error, Debug)]
pub enum SemanticModelError {
    #[error("Invalid model {0}: {1}")]
    InvalidModel(String, String),

    #[error("Invalid column {0}: {1}")]
    InvalidColumn(String, String),

    #[error("Invalid relationship {0}: {1}")]
    InvalidRelationship(String, String),

    #[error("Duplicate object name: {0}")]
    DuplicateName(String),

    #[error("Invalid JSON format: {0}")]
    InvalidJsonFormat(#[from] serde_json::Error),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::local_store::LocalSemanticModelStore;
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_manifest_round_trip() {
        let original = LocalSemanticModelStore::mock().get_manifest().unwrap();
        let json = original.to_json().unwrap();
        let copy = Manifest::from_json(&json).unwrap();
        assert_eq!(original, copy);
    }

    #[test]
    fn test_manifest_json_shape() {
        let json = r#"{
            "catalog": "test-catalog",
            "schema": "test-schema",
            "models": [{
                "name": "OrdersModel",
                "refSql": "select * from orders",
                "columns": [
                    {"name": "orderkey", "type": "integer", "notNull": true},
                    {"name": "customer", "type": "CustomerModel", "relationship": "OrdersCustomer"}
                ],
                "primaryKey": "orderkey",
                "preAggregated": true,
                "refreshTime": "30m"
            }],
            "relationships": [{
                "name": "OrdersCustomer",
                "models": ["OrdersModel", "CustomerModel"],
                "joinType": "MANY_TO_ONE",
                "condition": "OrdersModel.custkey = CustomerModel.custkey"
            }],
            "enums": [{"name": "OrderStatus", "values": [{"name": "PENDING", "value": "pending"}]}]
        }"#;

        let manifest = Manifest::from_json(json).unwrap();
        let orders = &manifest.models[0];
        assert_eq!(orders.refresh_time, Some(Duration::from_secs(1800)));
        assert!(orders.columns[1].is_relationship());
        assert_eq!(manifest.relationships[0].join_type, JoinType::ManyToOne);
        assert_eq!(manifest.enum_definitions[0].values[0].value.as_deref(), Some("pending"));
        assert_eq!(Manifest::from_json(&manifest.to_json().unwrap()).unwrap(), manifest);
    }
}
