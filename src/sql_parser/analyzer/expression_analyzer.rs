use super::scope::{Field, QualifiedName, Scope};
use crate::sql_parser::SqlTransformError;
use sqlparser::ast::{Expr, Query, Visit, Visitor};
use std::ops::ControlFlow;
use std::slice;

/// Fields referenced by an expression, plus the subqueries nested in it.
#[derive(Debug, Default)]
pub struct ExpressionAnalysis {
    pub fields: Vec<Field>,
    pub subqueries: Vec<Query>,
}

struct ExpressionVisitor<'a> {
    scope: &'a Scope,
    depth: usize,
    analysis: ExpressionAnalysis,
}

impl Visitor for ExpressionVisitor<'_> {
    type Break = SqlTransformError;

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if self.depth == 0 {
            self.analysis.subqueries.push(query.clone());
        }
        self.depth += 1;
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.depth -= 1;
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        if self.depth > 0 {
            return ControlFlow::Continue(());
        }
        let name = match expr {
            Expr::Identifier(ident) => QualifiedName::from_idents(slice::from_ref(ident)),
            Expr::CompoundIdentifier(idents) => QualifiedName::from_idents(idents),
            _ => return ControlFlow::Continue(()),
        };
        match resolve_reference(self.scope, &name) {
            Ok(Some(field)) => {
                self.analysis.fields.push(field);
                ControlFlow::Continue(())
            }
            Ok(None) => ControlFlow::Continue(()),
            Err(e) => ControlFlow::Break(e),
        }
    }
}

pub fn analyze_expression(expr: &Expr, scope: &Scope) -> Result<ExpressionAnalysis, SqlTransformError> {
    let mut visitor = ExpressionVisitor {
        scope,
        depth: 0,
        analysis: ExpressionAnalysis::default(),
    };
    match expr.visit(&mut visitor) {
        ControlFlow::Continue(()) => Ok(visitor.analysis),
        ControlFlow::Break(e) => Err(e),
    }
}

/// Resolves a column reference. A dereference through a relationship column
/// (`rel.col`, `alias.rel.col`) resolves to the relationship field itself.
pub fn resolve_reference(scope: &Scope, name: &QualifiedName) -> Result<Option<Field>, SqlTransformError> {
    if let Some(field) = scope.resolve(name)? {
        return Ok(Some(field));
    }
    for len in 1..name.len() {
        if let Some(field) = scope.resolve(&name.head(len))? {
            return Ok(field.is_relationship().then_some(field));
        }
    }
    Ok(None)
}
