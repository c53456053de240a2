use super::model_rewrite::ensure_model_cte;
use super::relationship_rewrite::{join_relationships, RelationshipJoin};
use super::{ident, sort_ctes, Rule};
use crate::semantic_model::Mdl;
use crate::sql_parser::analyzer::{Field, QualifiedName, Scope};
use crate::sql_parser::{SessionContext, SqlTransformError};
use sqlparser::ast::{Expr, GroupByExpr, Query, Select, SelectItem, Value};

/// Grouping by a relationship column groups by the target's primary key as well.
pub struct GroupByKeyRewrite;

impl Rule for GroupByKeyRewrite {
    fn name(&self) -> &'static str {
        "GroupByKeyRewrite"
    }

    fn apply(
        &self,
        mut query: Query,
        session: &SessionContext,
        mdl: &Mdl,
    ) -> Result<Query, SqlTransformError> {
        let targets = join_relationships(&mut query, session, mdl, &mut |select, _, scope| {
            group_by_joins(select, scope, mdl)
        })?;
        for target in &targets {
            ensure_model_cte(&mut query, mdl, target)?;
        }
        sort_ctes(&mut query);
        Ok(query)
    }
}

/// Puts the target primary key ahead of each relationship group key and returns the joins
/// those keys read.
fn group_by_joins(
    select: &mut Select,
    scope: &Scope,
    mdl: &Mdl,
) -> Result<Vec<RelationshipJoin>, SqlTransformError> {
    let GroupByExpr::Expressions(exprs, _) = &select.group_by else {
        return Ok(vec![]);
    };

    let mut keys = vec![];
    let mut joins = vec![];
    for (index, expr) in exprs.iter().enumerate() {
        let Some(field) = relationship_key(expr, &select.projection, scope)? else {
            continue;
        };
        let join = RelationshipJoin::for_field(&field, mdl)?;
        let target = mdl.get_model(&join.target).ok_or_else(|| {
            SqlTransformError::InvalidStatement(format!("model {} not found", join.target))
        })?;
        let primary_key = target.primary_key.as_ref().ok_or_else(|| {
            SqlTransformError::InvalidStatement(format!(
                "cannot group by relationship {}: model {} has no primary key",
                field.name, target.name
            ))
        })?;
        keys.push((
            index,
            Expr::CompoundIdentifier(vec![ident(&join.alias), ident(primary_key)]),
        ));
        joins.push(join);
    }

    if let GroupByExpr::Expressions(exprs, _) = &mut select.group_by {
        for (index, key) in keys.into_iter().rev() {
            exprs.insert(index, key);
        }
    }
    Ok(joins)
}

/// The relationship field a GROUP BY item names, directly or by output position.
fn relationship_key(
    expr: &Expr,
    projection: &[SelectItem],
    scope: &Scope,
) -> Result<Option<Field>, SqlTransformError> {
    let expr = match expr {
        Expr::Value(Value::Number(position, _)) => {
            let item = position
                .parse::<usize>()
                .ok()
                .and_then(|position| position.checked_sub(1))
                .and_then(|index| projection.get(index));
            match item {
                Some(SelectItem::UnnamedExpr(expr)) | Some(SelectItem::ExprWithAlias { expr, .. }) => expr,
                _ => return Ok(None),
            }
        }
        expr => expr,
    };
    let name = match expr {
        Expr::Identifier(ident) => QualifiedName::of(&ident.value),
        Expr::CompoundIdentifier(idents) => QualifiedName::from_idents(idents),
        _ => return Ok(None),
    };
    Ok(scope.resolve(&name)?.filter(Field::is_relationship))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic_model::local_store::LocalSemanticModelStore;
    use crate::semantic_model::{Manifest, SemanticModelStore};
    use crate::sql_parser::transformations::{live_rules, parse_query};
    use rstest::*;

    #[fixture]
    fn manifest() -> Manifest {
        LocalSemanticModelStore::mock().get_manifest().unwrap()
    }

    fn rewrite(sql: &str, manifest: Manifest) -> Result<String, SqlTransformError> {
        let mdl = Mdl::from_manifest(manifest).unwrap();
        let session = SessionContext::for_mdl(&mdl);
        let mut query = parse_query(sql)?;
        for rule in live_rules() {
            query = rule.apply(query, &session, &mdl)?;
        }
        Ok(query.to_string())
    }

    #[rstest]
    #[case::by_name(
        "SELECT band, count(*) FROM Album GROUP BY band",
        "SELECT Album.band, count(*) FROM Album LEFT JOIN Band AS Album_band ON Album.bandId = Album_band.id \
         GROUP BY Album_band.id, Album.band"
    )]
    #[case::by_position(
        "SELECT band, count(*) FROM Album GROUP BY 1",
        "SELECT Album.band, count(*) FROM Album LEFT JOIN Band AS Album_band ON Album.bandId = Album_band.id \
         GROUP BY Album_band.id, 1"
    )]
    #[case::reuses_dereference_join(
        "SELECT band, band.name FROM Album GROUP BY band, band.name",
        "SELECT Album.band, Album_band.name FROM Album LEFT JOIN Band AS Album_band ON Album.bandId = Album_band.id \
         GROUP BY Album_band.id, Album.band, Album_band.name"
    )]
    #[case::plain_keys_untouched(
        "SELECT author, count(*) FROM Album GROUP BY author",
        "SELECT author, count(*) FROM Album GROUP BY author"
    )]
    fn test_group_by_key(manifest: Manifest, #[case] sql: &str, #[case] expected: &str) {
        let rewritten = rewrite(sql, manifest).unwrap();
        assert!(
            rewritten.ends_with(expected),
            "{} does not end with {}",
            rewritten,
            expected
        );
        assert!(rewritten.starts_with("WITH Album AS"));
    }

    #[rstest]
    fn test_target_without_primary_key(mut manifest: Manifest) {
        manifest.models[1].primary_key = None;
        let result = rewrite("SELECT band FROM Album GROUP BY band", manifest);
        assert!(matches!(result, Err(SqlTransformError::InvalidStatement(_))));
    }
}
