//! Scope-based name resolution over a parsed query.
//!
//! The analyzer walks a statement once, building a [`Scope`] per relation, and records in an
//! [`Analysis`] which manifest objects the statement touches and which of their columns it
//! reads. The rewrite rules consume that record.

mod analysis;
mod expression_analyzer;
pub mod scope;
mod statement_analyzer;

pub use analysis::{Analysis, MetricRollupInfo, SimplePredicate, SortItem};
pub use expression_analyzer::{analyze_expression, resolve_reference, ExpressionAnalysis};
pub use scope::{Field, QualifiedName, RelationType, Scope};
pub use statement_analyzer::{
    analyze, analyze_query, is_rollup, join_constraint, qualify_table_name, resolve_rollup,
    source_scope, ROLLUP_FUNCTION,
};
