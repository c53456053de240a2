use super::duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_model: Option<String>,
    #[serde(default)]
    pub columns: Vec<Column>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<String>,
    #[serde(default)]
    pub pre_aggregated: bool,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "duration::option"
    )]
    pub refresh_time: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Model {
    pub fn new(name: impl Into<String>, ref_sql: impl Into<String>, columns: Vec<Column>) -> Self {
        Model {
            name: name.into(),
            ref_sql: Some(ref_sql.into()),
            base_model: None,
            columns,
            primary_key: None,
            pre_aggregated: false,
            refresh_time: None,
            description: None,
        }
    }

    pub fn on_base_model(
        name: impl Into<String>,
        base_model: impl Into<String>,
        columns: Vec<Column>,
    ) -> Self {
        Model {
            ref_sql: None,
            base_model: Some(base_model.into()),
            ..Model::new(name, String::new(), columns)
        }
    }

    pub fn with_primary_key(mut self, primary_key: impl Into<String>) -> Self {
        self.primary_key = Some(primary_key.into());
        self
    }

    pub fn with_pre_aggregation(mut self, refresh_time: Option<Duration>) -> Self {
        self.pre_aggregated = true;
        self.refresh_time = refresh_time;
        self
    }

    pub fn get_column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|column| column.name == name)
    }
}

/// A model column. Exactly one of three shapes: a plain column, a relationship column
/// (`relationship` set, `type` naming the target model), or a calculated column carrying an
/// expression.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationship: Option<String>,
    #[serde(default)]
    pub is_calculated: bool,
    #[serde(default)]
    pub not_null: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl Column {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Column {
            name: name.into(),
            type_name: type_name.into(),
            relationship: None,
            is_calculated: false,
            not_null: false,
            expression: None,
            description: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn relationship(
        name: impl Into<String>,
        target_model: impl Into<String>,
        relationship: impl Into<String>,
    ) -> Self {
        Column {
            relationship: Some(relationship.into()),
            ..Column::new(name, target_model)
        }
    }

    pub fn calculated(
        name: impl Into<String>,
        type_name: impl Into<String>,
        expression: impl Into<String>,
    ) -> Self {
        Column {
            is_calculated: true,
            expression: Some(expression.into()),
            ..Column::new(name, type_name)
        }
    }

    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        self.expression = Some(expression.into());
        self
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn is_relationship(&self) -> bool {
        self.relationship.is_some()
    }

    /// SQL text producing this column's value, or `None` when the column is read as is.
    pub fn sql_expression(&self) -> Option<&str> {
        self.expression
            .as_deref()
            .filter(|expression| *expression != self.name)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JoinType {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    pub name: String,
    pub models: Vec<String>,
    pub join_type: JoinType,
    pub condition: String,
}

impl Relationship {
    pub fn new(
        name: impl Into<String>,
        models: [&str; 2],
        join_type: JoinType,
        condition: impl Into<String>,
    ) -> Self {
        Relationship {
            name: name.into(),
            models: models.iter().map(|model| model.to_string()).collect(),
            join_type,
            condition: condition.into(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct View {
    pub name: String,
    pub statement: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl View {
    pub fn new(name: impl Into<String>, statement: impl Into<String>) -> Self {
        View {
            name: name.into(),
            statement: statement.into(),
            description: None,
            properties: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct EnumDefinition {
    pub name: String,
    pub values: Vec<EnumValue>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct EnumValue {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}
