use super::model_rewrite::ensure_model_cte;
use super::relationship_rewrite::rewrite_relationships;
use super::{has_cte, ident, parse_query, push_cte, quote, sort_ctes, Rule};
use crate::semantic_model::mdl::ObjectKind;
use crate::semantic_model::{Column, CumulativeMetric, Mdl, Metric};
use crate::sql_parser::analyzer::{analyze_query, is_rollup, resolve_rollup, MetricRollupInfo};
use crate::sql_parser::{SessionContext, SqlTransformError};
use log::debug;
use sqlparser::ast::{Query, TableAlias, TableFactor, VisitMut, VisitorMut};
use std::collections::BTreeSet;
use std::ops::ControlFlow;

/// Output column added to a metric CTE when no measure is read.
pub const COUNT_FILLER: &str = "_count_filler";

/// Renders metrics, cumulative metrics and `roll_up` relations as aggregating SQL.
pub struct MetricRewrite;

impl Rule for MetricRewrite {
    fn name(&self) -> &'static str {
        "MetricRewrite"
    }

    fn apply(
        &self,
        mut query: Query,
        session: &SessionContext,
        mdl: &Mdl,
    ) -> Result<Query, SqlTransformError> {
        let analysis = analyze_query(&query, session, mdl)?;
        let mut renderer = MetricRenderer {
            session,
            mdl,
            full: BTreeSet::new(),
            visiting: vec![],
        };

        let rollup_metrics = analysis.metric_rollups().values().map(|rollup| &rollup.metric);
        for name in analysis.metrics().iter().chain(rollup_metrics) {
            renderer.mark_bases(name);
        }
        for name in analysis.cumulative_metrics() {
            renderer.mark_bases(name);
        }

        for name in analysis.metrics() {
            let required = analysis.columns_of(&mdl.qualified(name));
            renderer.ensure_metric(&mut query, name, Some(&required))?;
        }
        for name in analysis.cumulative_metrics() {
            renderer.ensure_cumulative_metric(&mut query, name)?;
        }
        renderer.replace_rollups(&mut query)?;
        sort_ctes(&mut query);
        Ok(query)
    }
}

struct MetricRenderer<'a> {
    session: &'a SessionContext,
    mdl: &'a Mdl,
    /// Metrics read by other metrics, which need every column.
    full: BTreeSet<String>,
    visiting: Vec<String>,
}

impl MetricRenderer<'_> {
    fn mark_bases(&mut self, name: &str) {
        let mut base = self.base_object(name);
        while let Some(name) = base {
            if self.mdl.object_kind(&name) != Some(ObjectKind::Metric) || !self.full.insert(name.clone()) {
                break;
            }
            base = self.base_object(&name);
        }
    }

    fn base_object(&self, name: &str) -> Option<String> {
        match self.mdl.object_kind(name) {
            Some(ObjectKind::Metric) => self.mdl.get_metric(name).map(|m| m.base_object.clone()),
            Some(ObjectKind::CumulativeMetric) => self
                .mdl
                .get_cumulative_metric(name)
                .map(|m| m.base_object.clone()),
            _ => None,
        }
    }

    fn ensure_metric(
        &mut self,
        query: &mut Query,
        name: &str,
        required: Option<&BTreeSet<String>>,
    ) -> Result<(), SqlTransformError> {
        if has_cte(query, name) {
            return Ok(());
        }
        let metric = self
            .mdl
            .get_metric(name)
            .ok_or_else(|| SqlTransformError::InvalidMetric(format!("metric {} not found", name)))?;
        self.enter(name)?;
        self.ensure_base(query, &metric.name, &metric.base_object)?;
        self.visiting.pop();

        let required = if self.full.contains(name) { None } else { required };
        let mut body = parse_query(&metric_sql(&metric, required))?;
        for target in rewrite_relationships(&mut body, self.session, self.mdl)? {
            ensure_model_cte(query, self.mdl, &target)?;
        }
        debug!("Metric {} rendered as {}", name, body);
        push_cte(query, self.mdl, name, body);
        Ok(())
    }

    fn ensure_cumulative_metric(&mut self, query: &mut Query, name: &str) -> Result<(), SqlTransformError> {
        if has_cte(query, name) {
            return Ok(());
        }
        let metric = self.mdl.get_cumulative_metric(name).ok_or_else(|| {
            SqlTransformError::InvalidMetric(format!("cumulative metric {} not found", name))
        })?;
        self.enter(name)?;
        self.ensure_base(query, &metric.name, &metric.base_object)?;
        self.visiting.pop();

        let body = parse_query(&cumulative_metric_sql(&metric)?)?;
        debug!("Cumulative metric {} rendered as {}", name, body);
        push_cte(query, self.mdl, name, body);
        Ok(())
    }

    fn ensure_base(&mut self, query: &mut Query, owner: &str, base: &str) -> Result<(), SqlTransformError> {
        match self.mdl.object_kind(base) {
            Some(ObjectKind::Model) => ensure_model_cte(query, self.mdl, base),
            Some(ObjectKind::Metric) => self.ensure_metric(query, base, None),
            Some(ObjectKind::CumulativeMetric) => self.ensure_cumulative_metric(query, base),
            _ => Err(SqlTransformError::InvalidMetric(format!(
                "base object {} of {} is not a model, metric or cumulative metric",
                base, owner
            ))),
        }
    }

    fn enter(&mut self, name: &str) -> Result<(), SqlTransformError> {
        if self.visiting.iter().any(|visiting| visiting == name) {
            return Err(SqlTransformError::InvalidMetric(format!(
                "{} is its own base object",
                name
            )));
        }
        self.visiting.push(name.to_string());
        Ok(())
    }

    /// Swaps every `roll_up(...)` relation for a derived table over the metric's base object.
    fn replace_rollups(&mut self, query: &mut Query) -> Result<(), SqlTransformError> {
        let mut replacer = RollupReplacer {
            mdl: self.mdl,
            rolled_up: vec![],
        };
        if let ControlFlow::Break(e) = VisitMut::visit(query, &mut replacer) {
            return Err(e);
        }
        for metric in replacer.rolled_up {
            self.ensure_base(query, &metric.name, &metric.base_object)?;
        }
        Ok(())
    }
}

struct RollupReplacer<'a> {
    mdl: &'a Mdl,
    rolled_up: Vec<std::sync::Arc<Metric>>,
}

impl RollupReplacer<'_> {
    fn replace(&mut self, factor: &mut TableFactor) -> Result<(), SqlTransformError> {
        let TableFactor::Table {
            name,
            alias,
            args: Some(args),
            ..
        } = factor
        else {
            return Ok(());
        };
        if !is_rollup(name) {
            return Ok(());
        }
        let rollup = resolve_rollup(&args.args, self.mdl)?;
        let metric = self.mdl.get_metric(&rollup.metric).ok_or_else(|| {
            SqlTransformError::InvalidMetric(format!("metric {} not found", rollup.metric))
        })?;
        let subquery = parse_query(&rollup_sql(&metric, &rollup))?;
        let alias = alias.take().unwrap_or_else(|| TableAlias {
            name: ident(&metric.name),
            columns: vec![],
        });
        *factor = TableFactor::Derived {
            lateral: false,
            subquery: Box::new(subquery),
            alias: Some(alias),
        };
        self.rolled_up.push(metric);
        Ok(())
    }
}

impl VisitorMut for RollupReplacer<'_> {
    type Break = SqlTransformError;

    fn pre_visit_table_factor(&mut self, factor: &mut TableFactor) -> ControlFlow<Self::Break> {
        match self.replace(factor) {
            Ok(()) => ControlFlow::Continue(()),
            Err(e) => ControlFlow::Break(e),
        }
    }
}

fn column_item(column: &Column) -> String {
    match column.sql_expression() {
        Some(expression) => format!("{} AS {}", expression, quote(&column.name)),
        None => quote(&column.name),
    }
}

fn group_by_positions(count: usize) -> String {
    if count == 0 {
        return String::new();
    }
    let positions: Vec<String> = (1..=count).map(|position| position.to_string()).collect();
    format!(" GROUP BY {}", positions.join(", "))
}

/// `required` limits the rendered columns to those the query reads.
fn metric_sql(metric: &Metric, required: Option<&BTreeSet<String>>) -> String {
    let mut dimensions: Vec<&Column> = metric.dimension.iter().collect();
    let mut measures: Vec<&Column> = metric.measure.iter().collect();
    if let Some(required) = required {
        let selected: Vec<&Column> = dimensions
            .iter()
            .copied()
            .filter(|column| required.contains(&column.name))
            .collect();
        if !selected.is_empty() {
            dimensions = selected;
        }
        measures.retain(|column| required.contains(&column.name));
    }

    let mut items: Vec<String> = dimensions
        .iter()
        .chain(measures.iter())
        .map(|column| column_item(column))
        .collect();
    if measures.is_empty() {
        items.push(format!("COUNT(*) AS {}", COUNT_FILLER));
    }
    format!(
        "SELECT {} FROM {}{}",
        items.join(", "),
        quote(&metric.base_object),
        group_by_positions(dimensions.len())
    )
}

fn cumulative_metric_sql(metric: &CumulativeMetric) -> Result<String, SqlTransformError> {
    let window = &metric.window;
    let measure = &metric.measure;
    let running = match measure.operator.to_lowercase().as_str() {
        "sum" | "count" => "SUM",
        "min" => "MIN",
        "max" => "MAX",
        other => {
            return Err(SqlTransformError::InvalidMetric(format!(
                "operator {} of {} cannot be accumulated",
                other, metric.name
            )))
        }
    };

    let mut filters = vec![];
    if let Some(start) = &window.start {
        filters.push(format!("{} >= '{}'", quote(&window.ref_column), start.replace('\'', "''")));
    }
    if let Some(end) = &window.end {
        filters.push(format!("{} <= '{}'", quote(&window.ref_column), end.replace('\'', "''")));
    }
    let filter = if filters.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", filters.join(" AND "))
    };

    let period = quote(&window.name);
    let value = quote(&measure.name);
    let inner = format!(
        "SELECT DATE_TRUNC('{}', {}) AS {}, {}({}) AS {} FROM {}{} GROUP BY 1",
        window.time_unit.as_date_trunc_unit(),
        quote(&window.ref_column),
        period,
        measure.operator,
        quote(&measure.ref_column),
        value,
        quote(&metric.base_object),
        filter
    );
    Ok(format!(
        "SELECT {period}, {running}({value}) OVER (ORDER BY {period} ROWS BETWEEN UNBOUNDED PRECEDING AND CURRENT ROW) AS {value} FROM ({inner}) AS windows"
    ))
}

fn rollup_sql(metric: &Metric, rollup: &MetricRollupInfo) -> String {
    let grain = &rollup.time_grain;
    let dimensions: Vec<&Column> = metric
        .dimension
        .iter()
        .filter(|column| column.name != grain.name)
        .collect();
    let mut items = vec![format!(
        "DATE_TRUNC('{}', {}) AS {}",
        rollup.unit.as_date_trunc_unit(),
        quote(&grain.ref_column),
        quote(&grain.name)
    )];
    items.extend(dimensions.iter().map(|column| column_item(column)));
    items.extend(metric.measure.iter().map(column_item));
    format!(
        "SELECT {} FROM {}{}",
        items.join(", "),
        quote(&metric.base_object),
        group_by_positions(dimensions.len() + 1)
    )
}
