use super::{
    CatalogSchemaTableName, CumulativeMetric, Manifest, Metric, Model, Relationship,
    SemanticModelError, View,
};
use sqlparser::ast::{Expr, SelectItem, SetExpr, Statement, Visit, Visitor};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::Arc;

/// Validated, name-indexed view over a [`Manifest`].
#[derive(Debug)]
pub struct Mdl {
    manifest: Manifest,
    models: HashMap<String, Arc<Model>>,
    metrics: HashMap<String, Arc<Metric>>,
    cumulative_metrics: HashMap<String, Arc<CumulativeMetric>>,
    views: HashMap<String, Arc<View>>,
    relationships: HashMap<String, Arc<Relationship>>,
    relationships_by_model: HashMap<String, Vec<String>>,
}

/// The kind of semantic object a name denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Model,
    Metric,
    CumulativeMetric,
    View,
}

impl Mdl {
    pub fn from_manifest(manifest: Manifest) -> Result<Self, SemanticModelError> {
        let mut names = HashSet::new();
        let object_names = manifest
            .models
            .iter()
            .map(|m| &m.name)
            .chain(manifest.metrics.iter().map(|m| &m.name))
            .chain(manifest.cumulative_metrics.iter().map(|m| &m.name))
            .chain(manifest.views.iter().map(|v| &v.name));
        for name in object_names {
            if !names.insert(name.clone()) {
                return Err(SemanticModelError::DuplicateName(name.clone()));
            }
        }

        let mdl = Mdl {
            models: index(&manifest.models, |m| &m.name),
            metrics: index(&manifest.metrics, |m| &m.name),
            cumulative_metrics: index(&manifest.cumulative_metrics, |m| &m.name),
            views: index(&manifest.views, |v| &v.name),
            relationships: index(&manifest.relationships, |r| &r.name),
            relationships_by_model: relationships_by_model(&manifest.relationships),
            manifest,
        };
        mdl.validate()?;
        Ok(mdl)
    }

    fn validate(&self) -> Result<(), SemanticModelError> {
        for model in &self.manifest.models {
            self.validate_model(model)?;
        }
        for relationship in &self.manifest.relationships {
            self.validate_relationship(relationship)?;
        }
        Ok(())
    }

    fn validate_model(&self, model: &Model) -> Result<(), SemanticModelError> {
        let invalid = |reason: &str| SemanticModelError::InvalidModel(model.name.clone(), reason.to_string());
        match (&model.ref_sql, &model.base_model) {
            (Some(_), Some(_)) => return Err(invalid("refSql and baseModel are mutually exclusive")),
            (None, None) => return Err(invalid("one of refSql or baseModel is required")),
            (None, Some(base)) if !self.models.contains_key(base) => {
                return Err(invalid(&format!("base model {} not found", base)))
            }
            _ => {}
        }
        if let Some(primary_key) = &model.primary_key {
            if model.get_column(primary_key).is_none() {
                return Err(invalid(&format!("primary key {} is not a column", primary_key)));
            }
        }

        for column in &model.columns {
            let invalid_column = |reason: &str| {
                SemanticModelError::InvalidColumn(
                    format!("{}.{}", model.name, column.name),
                    reason.to_string(),
                )
            };
            if column.is_calculated && column.expression.is_none() {
                return Err(invalid_column("calculated column requires an expression"));
            }
            if let Some(relationship) = &column.relationship {
                if column.expression.is_some() {
                    return Err(invalid_column("relationship column cannot carry an expression"));
                }
                let Some(relationship) = self.relationships.get(relationship) else {
                    return Err(invalid_column(&format!("relationship {} not found", relationship)));
                };
                if !relationship.models.contains(&model.name)
                    || !relationship.models.contains(&column.type_name)
                {
                    return Err(invalid_column(&format!(
                        "relationship {} does not join {} and {}",
                        relationship.name, model.name, column.type_name
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_relationship(&self, relationship: &Relationship) -> Result<(), SemanticModelError> {
        let invalid = |reason: String| {
            SemanticModelError::InvalidRelationship(relationship.name.clone(), reason)
        };
        if relationship.models.len() != 2 {
            return Err(invalid("exactly two models are required".to_string()));
        }
        if relationship.models[0] == relationship.models[1] {
            return Err(invalid("a model cannot relate to itself".to_string()));
        }
        for model in &relationship.models {
            if !self.models.contains_key(model) {
                return Err(invalid(format!("model {} not found", model)));
            }
        }

        let referenced = condition_qualifiers(&relationship.condition).map_err(invalid)?;
        let expected: BTreeSet<String> = relationship.models.iter().cloned().collect();
        if referenced != expected {
            return Err(invalid(format!(
                "condition must reference exactly {:?}, found {:?}",
                expected, referenced
            )));
        }
        Ok(())
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn catalog(&self) -> &str {
        &self.manifest.catalog
    }

    pub fn schema(&self) -> &str {
        &self.manifest.schema
    }

    pub fn get_model(&self, name: &str) -> Option<Arc<Model>> {
        self.models.get(name).cloned()
    }

    pub fn get_metric(&self, name: &str) -> Option<Arc<Metric>> {
        self.metrics.get(name).cloned()
    }

    pub fn get_cumulative_metric(&self, name: &str) -> Option<Arc<CumulativeMetric>> {
        self.cumulative_metrics.get(name).cloned()
    }

    pub fn get_view(&self, name: &str) -> Option<Arc<View>> {
        self.views.get(name).cloned()
    }

    pub fn get_relationship(&self, name: &str) -> Option<Arc<Relationship>> {
        self.relationships.get(name).cloned()
    }

    /// Relationships a model takes part in, looked up by name.
    pub fn relationships_of(&self, model: &str) -> Vec<Arc<Relationship>> {
        self.relationships_by_model
            .get(model)
            .into_iter()
            .flatten()
            .filter_map(|name| self.get_relationship(name))
            .collect()
    }

    pub fn object_kind(&self, name: &str) -> Option<ObjectKind> {
        if self.models.contains_key(name) {
            Some(ObjectKind::Model)
        } else if self.metrics.contains_key(name) {
            Some(ObjectKind::Metric)
        } else if self.cumulative_metrics.contains_key(name) {
            Some(ObjectKind::CumulativeMetric)
        } else if self.views.contains_key(name) {
            Some(ObjectKind::View)
        } else {
            None
        }
    }

    /// Whether `name` lives in this manifest's catalog and schema.
    pub fn owns(&self, name: &CatalogSchemaTableName) -> bool {
        name.catalog == self.manifest.catalog && name.schema == self.manifest.schema
    }

    pub fn qualified(&self, object: &str) -> CatalogSchemaTableName {
        CatalogSchemaTableName::new(self.catalog(), self.schema(), object)
    }

    /// Models, metrics and cumulative metrics flagged for pre-aggregation.
    pub fn pre_aggregated_objects(&self) -> Vec<CatalogSchemaTableName> {
        let models = self.manifest.models.iter().filter(|m| m.pre_aggregated).map(|m| &m.name);
        let metrics = self.manifest.metrics.iter().filter(|m| m.pre_aggregated).map(|m| &m.name);
        let cumulative = self
            .manifest
            .cumulative_metrics
            .iter()
            .filter(|m| m.pre_aggregated)
            .map(|m| &m.name);
        models
            .chain(metrics)
            .chain(cumulative)
            .map(|name| self.qualified(name))
            .collect()
    }

    pub fn refresh_time(&self, object: &str) -> Option<std::time::Duration> {
        if let Some(model) = self.models.get(object) {
            model.refresh_time
        } else if let Some(metric) = self.metrics.get(object) {
            metric.refresh_time
        } else {
            self.cumulative_metrics
                .get(object)
                .and_then(|metric| metric.refresh_time)
        }
    }
}

fn index<T: Clone>(items: &[T], name: impl Fn(&T) -> &String) -> HashMap<String, Arc<T>> {
    items
        .iter()
        .map(|item| (name(item).clone(), Arc::new(item.clone())))
        .collect()
}

fn relationships_by_model(relationships: &[Relationship]) -> HashMap<String, Vec<String>> {
    let mut by_model: HashMap<String, Vec<String>> = HashMap::new();
    for relationship in relationships {
        for model in &relationship.models {
            let names = by_model.entry(model.clone()).or_default();
            if !names.contains(&relationship.name) {
                names.push(relationship.name.clone());
            }
        }
    }
    by_model
}

struct QualifierCollector(BTreeSet<String>);

impl Visitor for QualifierCollector {
    type Break = ();

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        if let Expr::CompoundIdentifier(parts) = expr {
            if parts.len() >= 2 {
                self.0.insert(parts[parts.len() - 2].value.clone());
            }
        }
        ControlFlow::Continue(())
    }
}

/// Relation qualifiers referenced by a join condition.
pub(crate) fn condition_qualifiers(condition: &str) -> Result<BTreeSet<String>, String> {
    let expr = parse_expression(condition)?;
    let mut collector = QualifierCollector(BTreeSet::new());
    let _ = expr.visit(&mut collector);
    Ok(collector.0)
}

/// Parses a standalone SQL expression by wrapping it in a `SELECT`.
pub(crate) fn parse_expression(sql: &str) -> Result<Expr, String> {
    let statements = Parser::parse_sql(&GenericDialect {}, &format!("SELECT {}", sql))
        .map_err(|e| format!("invalid expression '{}': {}", sql, e))?;
    match statements.into_iter().next() {
        Some(Statement::Query(query)) => match *query.body {
            SetExpr::Select(select) => match select.projection.into_iter().next() {
                Some(SelectItem::UnnamedExpr(expr)) => Ok(expr),
                _ => Err(format!("invalid expression '{}'", sql)),
            },
            _ => Err(format!("invalid expression '{}'", sql)),
        },
        _ => Err(format!("invalid expression '{}'", sql)),
    }
}
