use super::model_rewrite::ensure_model_cte;
use super::{ident, sort_ctes, Rule};
use crate::semantic_model::mdl::parse_expression;
use crate::semantic_model::Mdl;
use crate::sql_parser::analyzer::{source_scope, Field, QualifiedName, Scope};
use crate::sql_parser::{SessionContext, SqlTransformError};
use log::debug;
use sqlparser::ast::{
    visit_expressions_mut, Expr, Join, JoinConstraint, JoinOperator, ObjectName, OrderBy, Query,
    Select, SelectItem, SetExpr, TableAlias, TableFactor, TableWithJoins, VisitMut, VisitorMut,
};
use std::collections::{BTreeSet, HashSet};
use std::ops::ControlFlow;
use std::sync::Arc;

/// Turns `relationshipColumn.targetColumn` into a LEFT JOIN against the target model.
pub struct RelationshipRewrite;

impl Rule for RelationshipRewrite {
    fn name(&self) -> &'static str {
        "RelationshipRewrite"
    }

    fn apply(
        &self,
        mut query: Query,
        session: &SessionContext,
        mdl: &Mdl,
    ) -> Result<Query, SqlTransformError> {
        let targets = rewrite_relationships(&mut query, session, mdl)?;
        for target in &targets {
            ensure_model_cte(&mut query, mdl, target)?;
        }
        sort_ctes(&mut query);
        Ok(query)
    }
}

/// Rewrites dereferences in every SELECT of `query`. Returns the models joined in.
pub(crate) fn rewrite_relationships(
    query: &mut Query,
    session: &SessionContext,
    mdl: &Mdl,
) -> Result<BTreeSet<String>, SqlTransformError> {
    join_relationships(query, session, mdl, &mut |select, order_by, scope| {
        let mut rewriter = DereferenceRewriter {
            scope,
            mdl,
            joins: vec![],
            depth: 0,
        };
        visit_clauses(select, order_by, &mut rewriter)?;
        Ok(rewriter.joins)
    })
}

/// Finds the joins one SELECT needs, given the scope of its FROM clause.
pub(crate) type FindJoins<'f> = dyn FnMut(&mut Select, Option<&mut OrderBy>, &Scope) -> Result<Vec<RelationshipJoin>, SqlTransformError>
    + 'f;

/// Adds the joins `find_joins` asks for to every SELECT of `query`. Returns the models joined in.
///
/// SELECTs are walked top-down, so a subquery resolves names against the SELECTs enclosing it.
/// A join owned by a relation of an enclosing SELECT is added to that SELECT.
pub(crate) fn join_relationships(
    query: &mut Query,
    session: &SessionContext,
    mdl: &Mdl,
    find_joins: &mut FindJoins<'_>,
) -> Result<BTreeSet<String>, SqlTransformError> {
    let mut walker = JoinWalker {
        session,
        mdl,
        find_joins,
        targets: BTreeSet::new(),
    };
    if let Some(join) = walker.query(query, None)?.first() {
        return Err(SqlTransformError::InvalidStatement(format!(
            "relation {} joined as {} is not in scope",
            join.owner, join.alias
        )));
    }
    Ok(walker.targets)
}

struct JoinWalker<'a, 'f> {
    session: &'a SessionContext,
    mdl: &'a Mdl,
    find_joins: &'a mut FindJoins<'f>,
    targets: BTreeSet<String>,
}

impl JoinWalker<'_, '_> {
    /// Returns the joins owned by relations outside `query`.
    fn query(
        &mut self,
        query: &mut Query,
        parent: Option<Arc<Scope>>,
    ) -> Result<Vec<RelationshipJoin>, SqlTransformError> {
        let mut escaped = vec![];
        if let Some(with) = query.with.as_mut() {
            for cte in &mut with.cte_tables {
                escaped.extend(self.query(&mut cte.query, parent.clone())?);
            }
        }
        escaped.extend(self.set_expr(query.body.as_mut(), query.order_by.as_mut(), parent)?);
        Ok(escaped)
    }

    fn set_expr(
        &mut self,
        body: &mut SetExpr,
        order_by: Option<&mut OrderBy>,
        parent: Option<Arc<Scope>>,
    ) -> Result<Vec<RelationshipJoin>, SqlTransformError> {
        match body {
            SetExpr::Select(select) => self.select(select, order_by, parent),
            SetExpr::Query(query) => self.query(query, parent),
            SetExpr::SetOperation { left, right, .. } => {
                let mut escaped = self.set_expr(left, None, parent.clone())?;
                escaped.extend(self.set_expr(right, None, parent)?);
                Ok(escaped)
            }
            _ => Ok(vec![]),
        }
    }

    fn select(
        &mut self,
        select: &mut Select,
        mut order_by: Option<&mut OrderBy>,
        parent: Option<Arc<Scope>>,
    ) -> Result<Vec<RelationshipJoin>, SqlTransformError> {
        // Derived tables cannot see the SELECT they appear in.
        let mut derived = Subqueries::new(self, None);
        visit(&mut select.from, &mut derived)?;

        let scope = source_scope(select, parent, self.session, self.mdl)?;
        let mut subqueries = Subqueries::new(self, Some(scope.clone()));
        visit_clauses(select, order_by.as_deref_mut(), &mut subqueries)?;
        let mut joins = subqueries.escaped;
        joins.extend((self.find_joins)(select, order_by.as_deref_mut(), &scope)?);

        let (local, escaped): (Vec<_>, Vec<_>) = joins.into_iter().partition(|join| {
            scope
                .relation_type()
                .fields()
                .iter()
                .any(|field| field.qualifier() == join.owner)
        });
        if local.is_empty() {
            return Ok(escaped);
        }

        qualify_columns(select, order_by, &scope, self.session, self.mdl)?;
        for join in &local {
            debug!("Joining {} as {} for {}", join.target, join.alias, join.owner);
            join.add_to(select);
            self.targets.insert(join.target.clone());
        }
        Ok(escaped)
    }
}

/// Walks the subqueries of a clause, collecting the joins they leave to enclosing SELECTs.
struct Subqueries<'w, 'a, 'f> {
    walker: &'w mut JoinWalker<'a, 'f>,
    parent: Option<Arc<Scope>>,
    escaped: Vec<RelationshipJoin>,
    depth: usize,
}

impl<'w, 'a, 'f> Subqueries<'w, 'a, 'f> {
    fn new(walker: &'w mut JoinWalker<'a, 'f>, parent: Option<Arc<Scope>>) -> Self {
        Subqueries {
            walker,
            parent,
            escaped: vec![],
            depth: 0,
        }
    }
}

impl VisitorMut for Subqueries<'_, '_, '_> {
    type Break = SqlTransformError;

    fn pre_visit_query(&mut self, query: &mut Query) -> ControlFlow<Self::Break> {
        if self.depth == 0 {
            match self.walker.query(query, self.parent.clone()) {
                Ok(escaped) => self.escaped.extend(escaped),
                Err(e) => return ControlFlow::Break(e),
            }
        }
        self.depth += 1;
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &mut Query) -> ControlFlow<Self::Break> {
        self.depth -= 1;
        ControlFlow::Continue(())
    }
}

/// A LEFT JOIN bringing a relationship's target model into a SELECT.
#[derive(Debug, Clone)]
pub(crate) struct RelationshipJoin {
    pub owner: String,
    pub alias: String,
    pub target: String,
    pub condition: Expr,
}

impl RelationshipJoin {
    /// The join reached through relationship column `field`.
    pub(crate) fn for_field(field: &Field, mdl: &Mdl) -> Result<Self, SqlTransformError> {
        let (Some(relationship), Some(target)) = (&field.relationship, &field.target_model) else {
            return Err(SqlTransformError::InvalidStatement(format!(
                "{} is not a relationship column",
                field.name
            )));
        };
        let relationship = mdl.get_relationship(relationship).ok_or_else(|| {
            SqlTransformError::InvalidStatement(format!("relationship {} not found", relationship))
        })?;
        let owner_model = field.table_name.table.clone();
        if &owner_model == target {
            return Err(SqlTransformError::UnsupportedSqlConstruct(format!(
                "relationship {} joins {} to itself",
                relationship.name, owner_model
            )));
        }

        let owner = field.qualifier();
        let alias = format!("{}_{}", owner, field.name);
        let mut condition = parse_expression(&relationship.condition)
            .map_err(SqlTransformError::SemanticModelError)?;
        let _ = visit_expressions_mut(&mut condition, |expr| {
            let requalified = match expr {
                Expr::CompoundIdentifier(parts) => match parts.as_slice() {
                    [qualifier, column] if qualifier.value == owner_model => Some(
                        Expr::CompoundIdentifier(vec![ident(&owner), column.clone()]),
                    ),
                    [qualifier, column] if qualifier.value == *target => Some(
                        Expr::CompoundIdentifier(vec![ident(&alias), column.clone()]),
                    ),
                    _ => None,
                },
                _ => None,
            };
            if let Some(requalified) = requalified {
                *expr = requalified;
            }
            ControlFlow::<()>::Continue(())
        });

        Ok(RelationshipJoin {
            owner,
            alias,
            target: target.clone(),
            condition,
        })
    }

    /// Appends this join to the FROM item holding its owner, unless already joined.
    pub(crate) fn add_to(&self, select: &mut Select) {
        if select
            .from
            .iter()
            .any(|table| relation_names(table).contains(&self.alias))
        {
            return;
        }
        let join = Join {
            relation: TableFactor::Table {
                name: ObjectName(vec![ident(&self.target)]),
                alias: Some(TableAlias {
                    name: ident(&self.alias),
                    columns: vec![],
                }),
                args: None,
                with_hints: vec![],
                version: None,
                with_ordinality: false,
                partitions: vec![],
            },
            global: false,
            join_operator: JoinOperator::LeftOuter(JoinConstraint::On(self.condition.clone())),
        };
        let position = select
            .from
            .iter()
            .position(|table| relation_names(table).contains(&self.owner))
            .unwrap_or(0);
        if let Some(table) = select.from.get_mut(position) {
            table.joins.push(join);
        }
    }
}

/// Qualifies every bare column of `select` with its relation, ahead of joining more models in.
///
/// Bare names in subqueries that resolve to `scope` instead of the subquery's own FROM are
/// qualified too, since the joined columns would make them ambiguous.
pub(crate) fn qualify_columns(
    select: &mut Select,
    order_by: Option<&mut OrderBy>,
    scope: &Arc<Scope>,
    session: &SessionContext,
    mdl: &Mdl,
) -> Result<(), SqlTransformError> {
    let output_names = output_names(select);
    let mut qualifier = ColumnQualifier {
        scope,
        local: None,
        output_names: HashSet::new(),
        depth: 0,
    };
    visit_clauses(select, None, &mut qualifier)?;
    if let Some(order_by) = order_by {
        qualifier.output_names = output_names;
        for item in &mut order_by.exprs {
            visit(item, &mut qualifier)?;
        }
    }

    let mut correlated = CorrelatedQualifier {
        outer: scope.clone(),
        session,
        mdl,
        depth: 0,
    };
    visit_clauses(select, None, &mut correlated)?;
    qualify_wildcard(select);
    Ok(())
}

/// Qualifies names in the SELECTs of `body` that resolve to `outer` rather than to their own FROM.
fn qualify_correlated(
    body: &mut SetExpr,
    outer: &Arc<Scope>,
    session: &SessionContext,
    mdl: &Mdl,
) -> Result<(), SqlTransformError> {
    match body {
        SetExpr::Select(select) => {
            let local = source_scope(select, None, session, mdl)?;
            let mut qualifier = ColumnQualifier {
                scope: outer,
                local: Some(local.as_ref()),
                output_names: HashSet::new(),
                depth: 0,
            };
            visit_clauses(select, None, &mut qualifier)?;

            let mut nested = CorrelatedQualifier {
                outer: source_scope(select, Some(outer.clone()), session, mdl)?,
                session,
                mdl,
                depth: 0,
            };
            visit_clauses(select, None, &mut nested)
        }
        SetExpr::Query(query) => qualify_correlated(query.body.as_mut(), outer, session, mdl),
        SetExpr::SetOperation { left, right, .. } => {
            qualify_correlated(left, outer, session, mdl)?;
            qualify_correlated(right, outer, session, mdl)
        }
        _ => Ok(()),
    }
}

struct CorrelatedQualifier<'a> {
    outer: Arc<Scope>,
    session: &'a SessionContext,
    mdl: &'a Mdl,
    depth: usize,
}

impl VisitorMut for CorrelatedQualifier<'_> {
    type Break = SqlTransformError;

    fn pre_visit_query(&mut self, query: &mut Query) -> ControlFlow<Self::Break> {
        if self.depth == 0 {
            if let Err(e) = qualify_correlated(query.body.as_mut(), &self.outer, self.session, self.mdl) {
                return ControlFlow::Break(e);
            }
        }
        self.depth += 1;
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &mut Query) -> ControlFlow<Self::Break> {
        self.depth -= 1;
        ControlFlow::Continue(())
    }
}

fn visit_clauses<V>(select: &mut Select, order_by: Option<&mut OrderBy>, visitor: &mut V) -> Result<(), SqlTransformError>
where
    V: VisitorMut<Break = SqlTransformError>,
{
    for item in &mut select.projection {
        visit(item, visitor)?;
    }
    if let Some(selection) = select.selection.as_mut() {
        visit(selection, visitor)?;
    }
    visit(&mut select.group_by, visitor)?;
    if let Some(having) = select.having.as_mut() {
        visit(having, visitor)?;
    }
    if let Some(qualify) = select.qualify.as_mut() {
        visit(qualify, visitor)?;
    }
    if let Some(order_by) = order_by {
        for item in &mut order_by.exprs {
            visit(item, visitor)?;
        }
    }
    Ok(())
}

fn visit<T, V>(node: &mut T, visitor: &mut V) -> Result<(), SqlTransformError>
where
    T: VisitMut,
    V: VisitorMut<Break = SqlTransformError>,
{
    match node.visit(visitor) {
        ControlFlow::Continue(()) => Ok(()),
        ControlFlow::Break(e) => Err(e),
    }
}

struct DereferenceRewriter<'a> {
    scope: &'a Scope,
    mdl: &'a Mdl,
    joins: Vec<RelationshipJoin>,
    depth: usize,
}

impl DereferenceRewriter<'_> {
    fn rewrite(&mut self, name: &QualifiedName) -> Result<Option<Expr>, SqlTransformError> {
        if self.scope.resolve(name)?.is_some() {
            return Ok(None);
        }
        for len in 1..name.len() {
            let Some(field) = self.scope.resolve(&name.head(len))? else {
                continue;
            };
            if !field.is_relationship() {
                return Ok(None);
            }
            let [column] = &name.parts()[len..] else {
                return Err(SqlTransformError::InvalidStatement(format!(
                    "{} dereferences more than one relationship",
                    name
                )));
            };
            let join = RelationshipJoin::for_field(&field, self.mdl)?;
            let target = self.mdl.get_model(&join.target).ok_or_else(|| {
                SqlTransformError::InvalidStatement(format!("model {} not found", join.target))
            })?;
            match target.get_column(column) {
                None => {
                    return Err(SqlTransformError::InvalidStatement(format!(
                        "column {} not found in model {}",
                        column, target.name
                    )))
                }
                Some(target_column) if target_column.is_relationship() => {
                    return Err(SqlTransformError::InvalidStatement(format!(
                        "{} dereferences more than one relationship",
                        name
                    )))
                }
                Some(_) => {}
            }

            let rewritten = Expr::CompoundIdentifier(vec![ident(&join.alias), ident(column)]);
            if !self.joins.iter().any(|known| known.alias == join.alias) {
                self.joins.push(join);
            }
            return Ok(Some(rewritten));
        }
        Ok(None)
    }
}

impl VisitorMut for DereferenceRewriter<'_> {
    type Break = SqlTransformError;

    fn pre_visit_query(&mut self, _query: &mut Query) -> ControlFlow<Self::Break> {
        self.depth += 1;
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &mut Query) -> ControlFlow<Self::Break> {
        self.depth -= 1;
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &mut Expr) -> ControlFlow<Self::Break> {
        if self.depth > 0 {
            return ControlFlow::Continue(());
        }
        let Expr::CompoundIdentifier(idents) = expr else {
            return ControlFlow::Continue(());
        };
        match self.rewrite(&QualifiedName::from_idents(idents)) {
            Ok(Some(rewritten)) => {
                *expr = rewritten;
                ControlFlow::Continue(())
            }
            Ok(None) => ControlFlow::Continue(()),
            Err(e) => ControlFlow::Break(e),
        }
    }
}

/// Qualifies bare column references with their relation.
struct ColumnQualifier<'a> {
    scope: &'a Scope,
    /// Names this scope binds are left alone.
    local: Option<&'a Scope>,
    output_names: HashSet<String>,
    depth: usize,
}

impl VisitorMut for ColumnQualifier<'_> {
    type Break = SqlTransformError;

    fn pre_visit_query(&mut self, _query: &mut Query) -> ControlFlow<Self::Break> {
        self.depth += 1;
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &mut Query) -> ControlFlow<Self::Break> {
        self.depth -= 1;
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &mut Expr) -> ControlFlow<Self::Break> {
        if self.depth > 0 {
            return ControlFlow::Continue(());
        }
        let Expr::Identifier(column) = expr else {
            return ControlFlow::Continue(());
        };
        if self.output_names.contains(&column.value) {
            return ControlFlow::Continue(());
        }
        let name = QualifiedName::of(&column.value);
        if let Some(local) = self.local {
            if !matches!(local.resolve(&name), Ok(None)) {
                return ControlFlow::Continue(());
            }
        }
        match self.scope.resolve(&name) {
            Ok(Some(field)) => {
                *expr = Expr::CompoundIdentifier(vec![ident(&field.qualifier()), column.clone()]);
                ControlFlow::Continue(())
            }
            Ok(None) => ControlFlow::Continue(()),
            Err(e) => ControlFlow::Break(e),
        }
    }
}

/// `*` would pick up the joined columns; spell out the original relations instead.
fn qualify_wildcard(select: &mut Select) {
    let Some(position) = select
        .projection
        .iter()
        .position(|item| matches!(item, SelectItem::Wildcard(_)))
    else {
        return;
    };
    let names: Vec<String> = select.from.iter().flat_map(relation_names).collect();
    if let SelectItem::Wildcard(options) = select.projection.remove(position) {
        for (offset, name) in names.iter().enumerate() {
            select.projection.insert(
                position + offset,
                SelectItem::QualifiedWildcard(ObjectName(vec![ident(name)]), options.clone()),
            );
        }
    }
}

/// Names by which the relations of a FROM item can be qualified.
fn relation_names(table: &TableWithJoins) -> Vec<String> {
    std::iter::once(&table.relation)
        .chain(table.joins.iter().map(|join| &join.relation))
        .filter_map(|relation| match relation {
            TableFactor::Table { alias: Some(alias), .. }
            | TableFactor::Derived { alias: Some(alias), .. }
            | TableFactor::NestedJoin { alias: Some(alias), .. } => Some(alias.name.value.clone()),
            TableFactor::Table { name, alias: None, .. } => {
                name.0.last().map(|ident| ident.value.clone())
            }
            _ => None,
        })
        .collect()
}

fn output_names(select: &Select) -> HashSet<String> {
    select
        .projection
        .iter()
        .filter_map(|item| match item {
            SelectItem::ExprWithAlias { alias, .. } => Some(alias.value.clone()),
            _ => None,
        })
        .collect()
}
