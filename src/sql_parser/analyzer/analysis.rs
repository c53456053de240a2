use super::scope::{Field, Scope};
use crate::semantic_model::{CatalogSchemaTableName, TimeGrain, TimeUnit};
use crate::sql_parser::SqlTransformError;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// A `roll_up(metric, timeColumn, GRAIN)` relation.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRollupInfo {
    pub metric: String,
    pub time_grain: TimeGrain,
    pub unit: TimeUnit,
}

/// A `column <op> literal` conjunct of a WHERE clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimplePredicate {
    pub table: CatalogSchemaTableName,
    pub column: String,
    pub operator: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortItem {
    pub expression: String,
    pub ascending: bool,
}

/// Everything the analyzer learned about one statement.
#[derive(Debug, Default)]
pub struct Analysis {
    tables: BTreeSet<CatalogSchemaTableName>,
    physical_tables: BTreeSet<CatalogSchemaTableName>,
    models: BTreeSet<String>,
    metrics: BTreeSet<String>,
    cumulative_metrics: BTreeSet<String>,
    views: BTreeSet<String>,
    collected_columns: BTreeMap<CatalogSchemaTableName, BTreeSet<String>>,
    metric_rollups: BTreeMap<usize, MetricRollupInfo>,
    rollup_sequence: usize,
    simple_predicates: Vec<SimplePredicate>,
    sort_items: Vec<SortItem>,
    limit: Option<String>,
    expression_types: BTreeMap<String, String>,
    scopes: Vec<Arc<Scope>>,
}

impl Analysis {
    pub fn tables(&self) -> &BTreeSet<CatalogSchemaTableName> {
        &self.tables
    }

    /// Referenced tables that are not semantic objects.
    pub fn physical_tables(&self) -> &BTreeSet<CatalogSchemaTableName> {
        &self.physical_tables
    }

    pub fn models(&self) -> &BTreeSet<String> {
        &self.models
    }

    pub fn metrics(&self) -> &BTreeSet<String> {
        &self.metrics
    }

    pub fn cumulative_metrics(&self) -> &BTreeSet<String> {
        &self.cumulative_metrics
    }

    pub fn views(&self) -> &BTreeSet<String> {
        &self.views
    }

    pub fn collected_columns(&self) -> &BTreeMap<CatalogSchemaTableName, BTreeSet<String>> {
        &self.collected_columns
    }

    pub fn columns_of(&self, table: &CatalogSchemaTableName) -> BTreeSet<String> {
        self.collected_columns.get(table).cloned().unwrap_or_default()
    }

    pub fn metric_rollups(&self) -> &BTreeMap<usize, MetricRollupInfo> {
        &self.metric_rollups
    }

    pub fn simple_predicates(&self) -> &[SimplePredicate] {
        &self.simple_predicates
    }

    pub fn sort_items(&self) -> &[SortItem] {
        &self.sort_items
    }

    pub fn limit(&self) -> Option<&str> {
        self.limit.as_deref()
    }

    pub fn expression_types(&self) -> &BTreeMap<String, String> {
        &self.expression_types
    }

    pub fn scopes(&self) -> &[Arc<Scope>] {
        &self.scopes
    }

    pub(super) fn add_table(&mut self, table: CatalogSchemaTableName) {
        self.tables.insert(table);
    }

    pub(super) fn add_physical_table(&mut self, table: CatalogSchemaTableName) {
        self.physical_tables.insert(table.clone());
        self.tables.insert(table);
    }

    pub(super) fn add_model(&mut self, name: &str) {
        self.models.insert(name.to_string());
    }

    pub(super) fn add_metric(&mut self, name: &str) {
        self.metrics.insert(name.to_string());
    }

    pub(super) fn add_cumulative_metric(&mut self, name: &str) {
        self.cumulative_metrics.insert(name.to_string());
    }

    pub(super) fn add_view(&mut self, name: &str) {
        self.views.insert(name.to_string());
    }

    pub(super) fn collect_field(&mut self, field: &Field) {
        self.collected_columns
            .entry(field.table_name.clone())
            .or_default()
            .insert(field.column_name.clone());
    }

    pub(super) fn add_metric_rollup(&mut self, rollup: MetricRollupInfo) {
        self.metric_rollups.insert(self.rollup_sequence, rollup);
        self.rollup_sequence += 1;
    }

    pub(super) fn add_simple_predicate(&mut self, predicate: SimplePredicate) {
        self.simple_predicates.push(predicate);
    }

    pub(super) fn set_sort_items(&mut self, sort_items: Vec<SortItem>) {
        self.sort_items = sort_items;
    }

    pub(super) fn set_limit(&mut self, limit: Option<String>) {
        self.limit = limit;
    }

    pub(super) fn add_expression_type(&mut self, expression: String, type_name: String) {
        self.expression_types.insert(expression, type_name);
    }

    pub(super) fn add_scope(&mut self, scope: Arc<Scope>) {
        self.scopes.push(scope);
    }

    /// A metric must not be used both directly and through `roll_up`.
    pub(super) fn check_rollup_conflicts(&self) -> Result<(), SqlTransformError> {
        match self
            .metric_rollups
            .values()
            .find(|rollup| self.metrics.contains(&rollup.metric))
        {
            Some(rollup) => Err(SqlTransformError::DuplicateName(format!(
                "metric {} is referenced both directly and in roll_up",
                rollup.metric
            ))),
            None => Ok(()),
        }
    }
}
