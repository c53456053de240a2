use crate::semantic_model::{CatalogSchemaTableName, Column};
use crate::sql_parser::SqlTransformError;
use sqlparser::ast::{Ident, ObjectName};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// A dotted name such as `alias.column` or `catalog.schema.table`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedName(Vec<String>);

impl QualifiedName {
    pub fn new(parts: Vec<String>) -> Self {
        QualifiedName(parts)
    }

    pub fn of(name: &str) -> Self {
        QualifiedName(vec![name.to_string()])
    }

    pub fn from_idents(idents: &[Ident]) -> Self {
        QualifiedName(idents.iter().map(|ident| ident.value.clone()).collect())
    }

    pub fn from_object_name(name: &ObjectName) -> Self {
        Self::from_idents(&name.0)
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The last part, i.e. the visible column or table name.
    pub fn suffix(&self) -> &str {
        self.0.last().map(String::as_str).unwrap_or_default()
    }

    /// Everything but the last part.
    pub fn prefix(&self) -> Option<QualifiedName> {
        if self.0.len() > 1 {
            Some(QualifiedName(self.0[..self.0.len() - 1].to_vec()))
        } else {
            None
        }
    }

    /// The first `len` parts.
    pub fn head(&self, len: usize) -> QualifiedName {
        QualifiedName(self.0[..len.min(self.0.len())].to_vec())
    }

    pub fn has_suffix(&self, suffix: &QualifiedName) -> bool {
        self.0.ends_with(&suffix.0)
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

/// A resolvable column-like reference.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub table_name: CatalogSchemaTableName,
    pub column_name: String,
    pub name: String,
    pub relation_alias: Option<QualifiedName>,
    pub type_name: String,
    pub relationship: Option<String>,
    pub target_model: Option<String>,
}

impl Field {
    pub fn new(table_name: CatalogSchemaTableName, name: impl Into<String>, type_name: impl Into<String>) -> Self {
        let name = name.into();
        Field {
            table_name,
            column_name: name.clone(),
            name,
            relation_alias: None,
            type_name: type_name.into(),
            relationship: None,
            target_model: None,
        }
    }

    pub fn from_column(table_name: &CatalogSchemaTableName, column: &Column) -> Self {
        let mut field = Field::new(table_name.clone(), &column.name, &column.type_name);
        if let Some(relationship) = &column.relationship {
            field.relationship = Some(relationship.clone());
            field.target_model = Some(column.type_name.clone());
        }
        field
    }

    pub fn is_relationship(&self) -> bool {
        self.relationship.is_some()
    }

    pub fn with_alias(mut self, alias: QualifiedName) -> Self {
        self.relation_alias = Some(alias);
        self
    }

    /// The name a query uses to qualify this field: its alias, else its table name.
    pub fn qualifier(&self) -> String {
        match &self.relation_alias {
            Some(alias) => alias.suffix().to_string(),
            None => self.table_name.table.clone(),
        }
    }

    pub fn can_resolve(&self, name: &QualifiedName) -> bool {
        if name.suffix() != self.name {
            return false;
        }
        match name.prefix() {
            None => true,
            Some(prefix) => match &self.relation_alias {
                Some(alias) => alias.has_suffix(&prefix),
                None => {
                    let table = QualifiedName::new(vec![
                        self.table_name.catalog.clone(),
                        self.table_name.schema.clone(),
                        self.table_name.table.clone(),
                    ]);
                    table.has_suffix(&prefix)
                }
            },
        }
    }
}

/// Ordered fields produced by a relation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelationType {
    fields: Vec<Field>,
}

impl RelationType {
    pub fn new(fields: Vec<Field>) -> Self {
        RelationType { fields }
    }

    pub fn empty() -> Self {
        RelationType::default()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn resolve_fields(&self, name: &QualifiedName) -> Vec<&Field> {
        self.fields
            .iter()
            .filter(|field| field.can_resolve(name))
            .collect()
    }

    /// Left fields then right fields, duplicates kept.
    pub fn join(&self, other: &RelationType) -> RelationType {
        let mut fields = self.fields.clone();
        fields.extend(other.fields.iter().cloned());
        RelationType { fields }
    }

    pub fn with_alias(self, alias: &str) -> RelationType {
        let alias = QualifiedName::of(alias);
        RelationType {
            fields: self
                .fields
                .into_iter()
                .map(|field| field.with_alias(alias.clone()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Scope {
    parent: Option<Arc<Scope>>,
    relation_type: RelationType,
    named_queries: HashSet<String>,
}

impl Scope {
    pub fn new(parent: Option<Arc<Scope>>, relation_type: RelationType) -> Self {
        Scope {
            parent,
            relation_type,
            named_queries: HashSet::new(),
        }
    }

    pub fn with_named_queries(parent: Option<Arc<Scope>>, named_queries: HashSet<String>) -> Self {
        Scope {
            parent,
            relation_type: RelationType::empty(),
            named_queries,
        }
    }

    pub fn parent(&self) -> Option<&Arc<Scope>> {
        self.parent.as_ref()
    }

    pub fn relation_type(&self) -> &RelationType {
        &self.relation_type
    }

    /// Whether a WITH query called `name` is visible here.
    pub fn is_named_query(&self, name: &str) -> bool {
        self.named_queries.contains(name)
            || self
                .parent
                .as_ref()
                .map_or(false, |parent| parent.is_named_query(name))
    }

    /// Resolves `name` in this scope, falling back to enclosing scopes.
    pub fn resolve(&self, name: &QualifiedName) -> Result<Option<Field>, SqlTransformError> {
        let matches = self.relation_type.resolve_fields(name);
        match matches.as_slice() {
            [] => match &self.parent {
                Some(parent) => parent.resolve(name),
                None => Ok(None),
            },
            [field] => Ok(Some((*field).clone())),
            _ => Err(SqlTransformError::AmbiguousName(name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(name: &str) -> CatalogSchemaTableName {
        CatalogSchemaTableName::new("mdl", "test", name)
    }

    fn name(parts: &[&str]) -> QualifiedName {
        QualifiedName::new(parts.iter().map(|p| p.to_string()).collect())
    }

    #[test]
    fn test_resolve_by_table_suffix() {
        let field = Field::new(table("Album"), "id", "integer");
        assert!(field.can_resolve(&name(&["id"])));
        assert!(field.can_resolve(&name(&["Album", "id"])));
        assert!(field.can_resolve(&name(&["mdl", "test", "Album", "id"])));
        assert!(!field.can_resolve(&name(&["Band", "id"])));
    }

    #[test]
    fn test_alias_shadows_table_name() {
        let field = Field::new(table("Album"), "id", "integer").with_alias(QualifiedName::of("a"));
        assert!(field.can_resolve(&name(&["a", "id"])));
        assert!(!field.can_resolve(&name(&["Album", "id"])));
    }

    #[test]
    fn test_join_keeps_duplicates_resolvable_by_qualifier() {
        let left = RelationType::new(vec![Field::new(table("Album"), "id", "integer")]);
        let right = RelationType::new(vec![Field::new(table("Band"), "id", "integer")]);
        let scope = Scope::new(None, left.join(&right));

        assert_eq!(scope.relation_type().fields().len(), 2);
        assert!(matches!(
            scope.resolve(&name(&["id"])),
            Err(SqlTransformError::AmbiguousName(_))
        ));
        let band_id = scope.resolve(&name(&["Band", "id"])).unwrap().unwrap();
        assert_eq!(band_id.table_name, table("Band"));
    }

    #[test]
    fn test_resolve_falls_back_to_parent() {
        let outer = Arc::new(Scope::new(
            None,
            RelationType::new(vec![Field::new(table("Album"), "author", "varchar")]),
        ));
        let inner = Scope::new(Some(outer), RelationType::empty());
        assert!(inner.resolve(&name(&["author"])).unwrap().is_some());
        assert!(inner.resolve(&name(&["missing"])).unwrap().is_none());
    }
}
