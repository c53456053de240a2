use super::analysis::{Analysis, MetricRollupInfo, SimplePredicate, SortItem};
use super::expression_analyzer::{analyze_expression, resolve_reference};
use super::scope::{Field, QualifiedName, RelationType, Scope};
use crate::semantic_model::mdl::ObjectKind;
use crate::semantic_model::{CatalogSchemaTableName, Mdl, TimeUnit};
use crate::sql_parser::{SessionContext, SqlTransformError};
use sqlparser::ast::{
    BinaryOperator, Expr, FunctionArg, FunctionArgExpr, GroupByExpr, Join, JoinConstraint,
    JoinOperator, ObjectName, Query, Select, SelectItem, SetExpr, Statement, TableAlias,
    TableFactor, TableWithJoins, Value, With,
};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

pub const ROLLUP_FUNCTION: &str = "roll_up";

pub fn analyze(
    statement: &Statement,
    session: &SessionContext,
    mdl: &Mdl,
) -> Result<Analysis, SqlTransformError> {
    match statement {
        Statement::Query(query) => analyze_query(query, session, mdl),
        other => Err(SqlTransformError::UnsupportedSqlConstruct(format!(
            "only queries can be analyzed: {}",
            other
        ))),
    }
}

pub fn analyze_query(
    query: &Query,
    session: &SessionContext,
    mdl: &Mdl,
) -> Result<Analysis, SqlTransformError> {
    let mut analysis = Analysis::default();
    let mut analyzer = StatementAnalyzer {
        session,
        mdl,
        analysis: &mut analysis,
        depth: 0,
    };
    analyzer.visit_query(query, None)?;
    analysis.check_rollup_conflicts()?;
    Ok(analysis)
}

/// Scope of the FROM clause of `select`, as seen from `parent`.
pub fn source_scope(
    select: &Select,
    parent: Option<Arc<Scope>>,
    session: &SessionContext,
    mdl: &Mdl,
) -> Result<Arc<Scope>, SqlTransformError> {
    let mut analysis = Analysis::default();
    let mut analyzer = StatementAnalyzer {
        session,
        mdl,
        analysis: &mut analysis,
        depth: 1,
    };
    let relation = analyzer.visit_from(&select.from, parent.clone())?;
    Ok(Arc::new(Scope::new(parent, relation)))
}

/// Fully qualifies a table name against the session's catalog and schema.
pub fn qualify_table_name(
    name: &ObjectName,
    session: &SessionContext,
) -> Result<CatalogSchemaTableName, SqlTransformError> {
    let parts = QualifiedName::from_object_name(name);
    match parts.parts() {
        [table] => Ok(CatalogSchemaTableName::new(
            &session.catalog,
            &session.schema,
            table,
        )),
        [schema, table] => Ok(CatalogSchemaTableName::new(&session.catalog, schema, table)),
        [catalog, schema, table] => Ok(CatalogSchemaTableName::new(catalog, schema, table)),
        _ => Err(SqlTransformError::UnsupportedSqlConstruct(format!(
            "too many dots in table name: {}",
            name
        ))),
    }
}

/// Validates a `roll_up(metric, timeColumn, GRAIN)` call.
pub fn resolve_rollup(args: &[FunctionArg], mdl: &Mdl) -> Result<MetricRollupInfo, SqlTransformError> {
    let invalid = |reason: String| SqlTransformError::InvalidMetric(format!("{}: {}", ROLLUP_FUNCTION, reason));
    let names = args
        .iter()
        .map(|arg| match arg {
            FunctionArg::Unnamed(FunctionArgExpr::Expr(Expr::Identifier(ident))) => {
                Ok(ident.value.clone())
            }
            FunctionArg::Unnamed(FunctionArgExpr::Expr(Expr::CompoundIdentifier(idents))) => {
                Ok(QualifiedName::from_idents(idents).suffix().to_string())
            }
            other => Err(invalid(format!("expected an identifier, found {}", other))),
        })
        .collect::<Result<Vec<String>, SqlTransformError>>()?;
    let [metric_name, time_column, grain] = names.as_slice() else {
        return Err(invalid(format!("expected 3 arguments, found {}", names.len())));
    };

    let metric = mdl
        .get_metric(metric_name)
        .ok_or_else(|| invalid(format!("metric {} not found", metric_name)))?;
    let time_grain = metric
        .get_time_grain(time_column)
        .ok_or_else(|| invalid(format!("time column {} not found in metric {}", time_column, metric_name)))?;
    let unit = TimeUnit::from_str(grain).map_err(invalid)?;
    if !time_grain.date_parts.is_empty() && !time_grain.date_parts.contains(&unit) {
        return Err(invalid(format!(
            "{} is not a date part of time grain {}",
            unit, time_grain.name
        )));
    }
    Ok(MetricRollupInfo {
        metric: metric.name.clone(),
        time_grain: time_grain.clone(),
        unit,
    })
}

pub fn join_constraint(operator: &JoinOperator) -> Option<&JoinConstraint> {
    match operator {
        JoinOperator::Inner(constraint)
        | JoinOperator::LeftOuter(constraint)
        | JoinOperator::RightOuter(constraint)
        | JoinOperator::FullOuter(constraint)
        | JoinOperator::LeftSemi(constraint)
        | JoinOperator::RightSemi(constraint)
        | JoinOperator::LeftAnti(constraint)
        | JoinOperator::RightAnti(constraint)
        | JoinOperator::AsOf { constraint, .. } => Some(constraint),
        JoinOperator::CrossJoin | JoinOperator::CrossApply | JoinOperator::OuterApply => None,
    }
}

struct StatementAnalyzer<'a> {
    session: &'a SessionContext,
    mdl: &'a Mdl,
    analysis: &'a mut Analysis,
    depth: usize,
}

impl StatementAnalyzer<'_> {
    fn visit_query(&mut self, query: &Query, parent: Option<Arc<Scope>>) -> Result<Arc<Scope>, SqlTransformError> {
        let top_level = self.depth == 0;
        self.depth += 1;

        let with_scope = self.visit_with(query.with.as_ref(), parent.clone())?;
        let body_scope = self.visit_set_expr(&query.body, with_scope)?;

        let output_names = match query.body.as_ref() {
            SetExpr::Select(select) => output_names(select),
            _ => HashSet::new(),
        };
        let mut sort_items = vec![];
        if let Some(order_by) = &query.order_by {
            for item in &order_by.exprs {
                sort_items.push(SortItem {
                    expression: item.expr.to_string(),
                    ascending: item.asc.unwrap_or(true),
                });
                if matches!(&item.expr, Expr::Identifier(ident) if output_names.contains(&ident.value)) {
                    continue;
                }
                self.visit_expression(&item.expr, &body_scope)?;
            }
        }

        self.depth -= 1;
        if top_level {
            self.analysis.set_sort_items(sort_items);
            self.analysis.set_limit(query.limit.as_ref().map(|limit| limit.to_string()));
        }
        let scope = Arc::new(Scope::new(parent, body_scope.relation_type().clone()));
        self.analysis.add_scope(scope.clone());
        Ok(scope)
    }

    fn visit_with(&mut self, with: Option<&With>, parent: Option<Arc<Scope>>) -> Result<Option<Arc<Scope>>, SqlTransformError> {
        let Some(with) = with else {
            return Ok(parent);
        };
        let mut names = HashSet::new();
        for cte in &with.cte_tables {
            let name = cte.alias.name.value.clone();
            if names.contains(&name) {
                return Err(SqlTransformError::DuplicateName(format!("WITH query name {} specified more than once", name)));
            }
            let mut visible = names.clone();
            if with.recursive {
                visible.insert(name.clone());
            }
            let cte_scope = Arc::new(Scope::with_named_queries(parent.clone(), visible));
            self.visit_query(&cte.query, Some(cte_scope))?;
            names.insert(name);
        }
        Ok(Some(Arc::new(Scope::with_named_queries(parent, names))))
    }

    fn visit_set_expr(&mut self, body: &SetExpr, scope: Option<Arc<Scope>>) -> Result<Arc<Scope>, SqlTransformError> {
        match body {
            SetExpr::Select(select) => self.visit_select(select, scope),
            SetExpr::Query(query) => self.visit_query(query, scope),
            SetExpr::SetOperation { left, right, .. } => {
                self.visit_set_expr(left, scope.clone())?;
                self.visit_set_expr(right, scope.clone())?;
                Ok(Arc::new(Scope::new(scope, RelationType::empty())))
            }
            SetExpr::Values(values) => {
                let values_scope = Arc::new(Scope::new(scope, RelationType::empty()));
                for expr in values.rows.iter().flatten() {
                    self.visit_expression(expr, &values_scope)?;
                }
                Ok(values_scope)
            }
            SetExpr::Insert(_) | SetExpr::Update(_) | SetExpr::Table(_) => Err(
                SqlTransformError::UnsupportedSqlConstruct(format!("unsupported query body: {}", body)),
            ),
        }
    }

    fn visit_select(&mut self, select: &Select, scope: Option<Arc<Scope>>) -> Result<Arc<Scope>, SqlTransformError> {
        let relation = self.visit_from(&select.from, scope.clone())?;
        let source = Arc::new(Scope::new(scope, relation));

        for item in &select.projection {
            match item {
                SelectItem::Wildcard(_) => {
                    for field in source.relation_type().fields() {
                        self.analysis.collect_field(field);
                    }
                }
                SelectItem::QualifiedWildcard(prefix, _) => {
                    let prefix = QualifiedName::from_object_name(prefix);
                    for field in source.relation_type().fields() {
                        let name = QualifiedName::new(
                            prefix.parts().iter().cloned().chain([field.name.clone()]).collect(),
                        );
                        if field.can_resolve(&name) {
                            self.analysis.collect_field(field);
                        }
                    }
                }
                SelectItem::UnnamedExpr(expr) => {
                    self.record_type(expr, expr.to_string(), &source)?;
                    self.visit_expression(expr, &source)?;
                }
                SelectItem::ExprWithAlias { expr, alias } => {
                    self.record_type(expr, alias.value.clone(), &source)?;
                    self.visit_expression(expr, &source)?;
                }
            }
        }

        if let Some(selection) = &select.selection {
            self.visit_expression(selection, &source)?;
            self.record_predicates(selection, &source)?;
        }
        if let GroupByExpr::Expressions(exprs, _) = &select.group_by {
            let output_names = output_names(select);
            for expr in exprs {
                match expr {
                    Expr::Value(Value::Number(..)) => {}
                    Expr::Identifier(ident) if output_names.contains(&ident.value) && source.resolve(&QualifiedName::of(&ident.value)).is_err() => {}
                    _ => self.visit_expression(expr, &source)?,
                }
            }
        }
        for expr in select.having.iter().chain(select.qualify.iter()) {
            self.visit_expression(expr, &source)?;
        }
        Ok(source)
    }

    fn visit_from(&mut self, from: &[TableWithJoins], scope: Option<Arc<Scope>>) -> Result<RelationType, SqlTransformError> {
        let mut relation = RelationType::empty();
        for table in from {
            let right = self.visit_table_with_joins(table, scope.clone())?;
            relation = relation.join(&right);
        }
        Ok(relation)
    }

    fn visit_table_with_joins(&mut self, table: &TableWithJoins, scope: Option<Arc<Scope>>) -> Result<RelationType, SqlTransformError> {
        let mut relation = self.visit_table_factor(&table.relation, scope.clone())?;
        for join in &table.joins {
            relation = self.visit_join(join, relation, scope.clone())?;
        }
        Ok(relation)
    }

    fn visit_join(&mut self, join: &Join, left: RelationType, scope: Option<Arc<Scope>>) -> Result<RelationType, SqlTransformError> {
        let right = self.visit_table_factor(&join.relation, scope.clone())?;
        let relation = left.join(&right);
        if let Some(JoinConstraint::On(condition)) = join_constraint(&join.join_operator) {
            let join_scope = Arc::new(Scope::new(scope, relation.clone()));
            self.visit_expression(condition, &join_scope)?;
        }
        Ok(relation)
    }

    fn visit_table_factor(&mut self, factor: &TableFactor, scope: Option<Arc<Scope>>) -> Result<RelationType, SqlTransformError> {
        match factor {
            TableFactor::Table {
                name,
                alias,
                args: Some(args),
                ..
            } => {
                if !is_rollup(name) {
                    return Err(SqlTransformError::UnsupportedSqlConstruct(format!(
                        "table function {} is not supported",
                        name
                    )));
                }
                let rollup = resolve_rollup(&args.args, self.mdl)?;
                self.analysis.add_metric_rollup(rollup);
                // roll_up contributes no fields to its enclosing scope.
                Ok(with_alias(RelationType::empty(), alias.as_ref()))
            }
            TableFactor::Table {
                name,
                alias,
                args: None,
                ..
            } => {
                let relation = self.visit_table(name, scope.as_deref())?;
                Ok(with_alias(relation, alias.as_ref()))
            }
            TableFactor::Derived { subquery, .. } => {
                self.visit_query(subquery, scope)?;
                Ok(RelationType::empty())
            }
            TableFactor::NestedJoin {
                table_with_joins,
                alias,
            } => {
                let relation = self.visit_table_with_joins(table_with_joins, scope)?;
                Ok(with_alias(relation, alias.as_ref()))
            }
            TableFactor::UNNEST { array_exprs, .. } => {
                let unnest_scope = Arc::new(Scope::new(scope, RelationType::empty()));
                for expr in array_exprs {
                    self.visit_expression(expr, &unnest_scope)?;
                }
                Ok(RelationType::empty())
            }
            other => Err(SqlTransformError::UnsupportedSqlConstruct(format!(
                "unsupported relation: {}",
                other
            ))),
        }
    }

    fn visit_table(&mut self, name: &ObjectName, scope: Option<&Scope>) -> Result<RelationType, SqlTransformError> {
        if let [ident] = name.0.as_slice() {
            let is_named_query = scope.map_or(false, |scope| scope.is_named_query(&ident.value));
            if is_named_query && self.mdl.object_kind(&ident.value).is_none() {
                return Ok(RelationType::empty());
            }
        }

        let table_name = qualify_table_name(name, self.session)?;
        let kind = if self.mdl.owns(&table_name) {
            self.mdl.object_kind(&table_name.table)
        } else {
            None
        };
        match kind {
            Some(ObjectKind::Model) => {
                self.analysis.add_table(table_name.clone());
                self.analysis.add_model(&table_name.table);
                let fields = self
                    .mdl
                    .get_model(&table_name.table)
                    .map(|model| {
                        model
                            .columns
                            .iter()
                            .map(|column| Field::from_column(&table_name, column))
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(RelationType::new(fields))
            }
            Some(ObjectKind::Metric) => {
                self.analysis.add_table(table_name.clone());
                self.analysis.add_metric(&table_name.table);
                let fields = self
                    .mdl
                    .get_metric(&table_name.table)
                    .map(|metric| {
                        metric
                            .columns()
                            .map(|column| Field::from_column(&table_name, column))
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(RelationType::new(fields))
            }
            Some(ObjectKind::CumulativeMetric) => {
                self.analysis.add_table(table_name.clone());
                self.analysis.add_cumulative_metric(&table_name.table);
                let fields = self
                    .mdl
                    .get_cumulative_metric(&table_name.table)
                    .map(|metric| {
                        vec![
                            Field::new(table_name.clone(), &metric.window.name, "timestamp"),
                            Field::new(table_name.clone(), &metric.measure.name, &metric.measure.type_name),
                        ]
                    })
                    .unwrap_or_default();
                Ok(RelationType::new(fields))
            }
            Some(ObjectKind::View) => {
                self.analysis.add_table(table_name.clone());
                self.analysis.add_view(&table_name.table);
                Ok(RelationType::empty())
            }
            None => {
                self.analysis.add_physical_table(table_name);
                Ok(RelationType::empty())
            }
        }
    }

    fn visit_expression(&mut self, expr: &Expr, scope: &Arc<Scope>) -> Result<(), SqlTransformError> {
        let result = analyze_expression(expr, scope)?;
        for field in &result.fields {
            self.analysis.collect_field(field);
        }
        for subquery in &result.subqueries {
            self.visit_query(subquery, Some(scope.clone()))?;
        }
        Ok(())
    }

    fn record_type(&mut self, expr: &Expr, output_name: String, scope: &Scope) -> Result<(), SqlTransformError> {
        let name = match expr {
            Expr::Identifier(ident) => QualifiedName::of(&ident.value),
            Expr::CompoundIdentifier(idents) => QualifiedName::from_idents(idents),
            _ => return Ok(()),
        };
        if let Some(field) = scope.resolve(&name)? {
            self.analysis.add_expression_type(output_name, field.type_name);
        }
        Ok(())
    }

    fn record_predicates(&mut self, expr: &Expr, scope: &Scope) -> Result<(), SqlTransformError> {
        match expr {
            Expr::BinaryOp {
                left,
                op: BinaryOperator::And,
                right,
            } => {
                self.record_predicates(left, scope)?;
                self.record_predicates(right, scope)
            }
            Expr::Nested(inner) => self.record_predicates(inner, scope),
            Expr::BinaryOp { left, op, right } if is_comparison(op) => {
                let (column, value) = match (left.as_ref(), right.as_ref()) {
                    (column, Expr::Value(value)) | (Expr::Value(value), column) => (column, value),
                    _ => return Ok(()),
                };
                let name = match column {
                    Expr::Identifier(ident) => QualifiedName::of(&ident.value),
                    Expr::CompoundIdentifier(idents) => QualifiedName::from_idents(idents),
                    _ => return Ok(()),
                };
                if let Some(field) = resolve_reference(scope, &name)? {
                    if !field.is_relationship() {
                        self.analysis.add_simple_predicate(SimplePredicate {
                            table: field.table_name,
                            column: field.column_name,
                            operator: op.to_string(),
                            value: value.to_string(),
                        });
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn is_comparison(op: &BinaryOperator) -> bool {
    matches!(
        op,
        BinaryOperator::Eq
            | BinaryOperator::NotEq
            | BinaryOperator::Lt
            | BinaryOperator::LtEq
            | BinaryOperator::Gt
            | BinaryOperator::GtEq
    )
}

pub fn is_rollup(name: &ObjectName) -> bool {
    matches!(name.0.as_slice(), [ident] if ident.value.eq_ignore_ascii_case(ROLLUP_FUNCTION))
}

fn with_alias(relation: RelationType, alias: Option<&TableAlias>) -> RelationType {
    match alias {
        Some(alias) => relation.with_alias(&alias.name.value),
        None => relation,
    }
}

/// Names a select exposes: aliases and bare column names.
fn output_names(select: &Select) -> HashSet<String> {
    select
        .projection
        .iter()
        .filter_map(|item| match item {
            SelectItem::ExprWithAlias { alias, .. } => Some(alias.value.clone()),
            SelectItem::UnnamedExpr(Expr::Identifier(ident)) => Some(ident.value.clone()),
            SelectItem::UnnamedExpr(Expr::CompoundIdentifier(idents)) => {
                idents.last().map(|ident| ident.value.clone())
            }
            _ => None,
        })
        .collect()
}
