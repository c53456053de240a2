use super::{has_cte, parse_query, push_cte, quote, referenced_relations, sort_ctes, Rule};
use crate::semantic_model::mdl::{parse_expression, ObjectKind};
use crate::semantic_model::{Mdl, Model};
use crate::sql_parser::analyzer::{analyze_query, qualify_table_name};
use crate::sql_parser::{SessionContext, SqlTransformError};
use log::debug;
use sqlparser::ast::{visit_expressions, visit_relations_mut, Expr, ObjectName, Query};
use std::collections::BTreeSet;
use std::ops::ControlFlow;

/// Replaces model and view references with generated CTEs over their source SQL.
pub struct ModelRewrite;

impl Rule for ModelRewrite {
    fn name(&self) -> &'static str {
        "ModelRewrite"
    }

    fn apply(
        &self,
        mut query: Query,
        session: &SessionContext,
        mdl: &Mdl,
    ) -> Result<Query, SqlTransformError> {
        strip_manifest_qualifiers(&mut query, session, mdl);
        inline_views(&mut query, session, mdl)?;

        let analysis = analyze_query(&query, session, mdl)?;
        for model in analysis.models() {
            ensure_model_cte(&mut query, mdl, model)?;
        }
        sort_ctes(&mut query);
        Ok(query)
    }
}

/// Adds the CTE for `name`, and for its base models, unless already present.
pub(crate) fn ensure_model_cte(query: &mut Query, mdl: &Mdl, name: &str) -> Result<(), SqlTransformError> {
    ensure_model_cte_inner(query, mdl, name, &mut vec![])
}

fn ensure_model_cte_inner(
    query: &mut Query,
    mdl: &Mdl,
    name: &str,
    visiting: &mut Vec<String>,
) -> Result<(), SqlTransformError> {
    if has_cte(query, name) {
        return Ok(());
    }
    if visiting.iter().any(|model| model == name) {
        return Err(SqlTransformError::InvalidStatement(format!(
            "model {} is its own base model",
            name
        )));
    }
    let model = mdl
        .get_model(name)
        .ok_or_else(|| SqlTransformError::InvalidStatement(format!("model {} not found", name)))?;
    if let Some(base) = &model.base_model {
        visiting.push(name.to_string());
        ensure_model_cte_inner(query, mdl, base, visiting)?;
        visiting.pop();
    }

    let body = parse_query(&model_sql(&model, mdl)?)?;
    debug!("Model {} rendered as {}", name, body);
    push_cte(query, mdl, name, body);
    Ok(())
}

fn model_sql(model: &Model, mdl: &Mdl) -> Result<String, SqlTransformError> {
    let mut items = vec![];
    for column in &model.columns {
        let item = match (&column.relationship, column.sql_expression()) {
            (Some(relationship), _) => {
                format!("'relationship<{}>' AS {}", relationship, quote(&column.name))
            }
            (None, Some(expression)) => format!("{} AS {}", expression, quote(&column.name)),
            (None, None) => quote(&column.name),
        };
        items.push(item);
    }
    for key in join_keys(model, mdl)? {
        if model.get_column(&key).is_none() {
            items.push(quote(&key));
        }
    }

    let source = match (&model.ref_sql, &model.base_model) {
        (Some(ref_sql), _) => format!(
            "({}) AS {}",
            ref_sql.trim().trim_end_matches(';'),
            quote(&model.name)
        ),
        (None, Some(base)) => format!("{} AS {}", quote(base), quote(&model.name)),
        (None, None) => {
            return Err(SqlTransformError::InvalidStatement(format!(
                "model {} has neither refSql nor baseModel",
                model.name
            )))
        }
    };
    let projection = if items.is_empty() {
        "*".to_string()
    } else {
        items.join(", ")
    };
    Ok(format!("SELECT {} FROM {}", projection, source))
}

/// Columns of `model` its relationship conditions join on.
fn join_keys(model: &Model, mdl: &Mdl) -> Result<Vec<String>, SqlTransformError> {
    let mut keys: Vec<String> = vec![];
    for relationship in mdl.relationships_of(&model.name) {
        let condition = parse_expression(&relationship.condition)
            .map_err(SqlTransformError::SemanticModelError)?;
        let _ = visit_expressions(&condition, |expr| {
            if let Expr::CompoundIdentifier(parts) = expr {
                if let [qualifier, column] = parts.as_slice() {
                    if qualifier.value == model.name && !keys.contains(&column.value) {
                        keys.push(column.value.clone());
                    }
                }
            }
            ControlFlow::<()>::Continue(())
        });
    }
    Ok(keys)
}

/// `catalog.schema.Object` becomes `Object` for objects of this manifest.
fn strip_manifest_qualifiers(query: &mut Query, session: &SessionContext, mdl: &Mdl) {
    let _ = visit_relations_mut(query, |relation| {
        if relation.0.len() > 1 {
            if let Ok(table) = qualify_table_name(relation, session) {
                if mdl.owns(&table) && mdl.object_kind(&table.table).is_some() {
                    *relation = ObjectName(vec![super::ident(&table.table)]);
                }
            }
        }
        ControlFlow::<()>::Continue(())
    });
}

fn inline_views(query: &mut Query, session: &SessionContext, mdl: &Mdl) -> Result<(), SqlTransformError> {
    loop {
        let analysis = analyze_query(query, session, mdl)?;
        let pending: Vec<String> = analysis
            .views()
            .iter()
            .filter(|view| !has_cte(query, view))
            .cloned()
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        for name in pending {
            check_view_cycle(mdl, &name, &mut vec![])?;
            let view = mdl.get_view(&name).ok_or_else(|| {
                SqlTransformError::InvalidStatement(format!("view {} not found", name))
            })?;
            let mut body = parse_query(&view.statement)?;
            strip_manifest_qualifiers(&mut body, session, mdl);
            debug!("Inlining view {}", name);
            push_cte(query, mdl, &name, body);
        }
    }
}

fn check_view_cycle(mdl: &Mdl, name: &str, path: &mut Vec<String>) -> Result<(), SqlTransformError> {
    if path.iter().any(|view| view == name) {
        path.push(name.to_string());
        return Err(SqlTransformError::InvalidStatement(format!(
            "views reference each other in a cycle: {}",
            path.join(" -> ")
        )));
    }
    let Some(view) = mdl.get_view(name) else {
        return Ok(());
    };
    let body = parse_query(&view.statement)?;
    let dependencies: BTreeSet<String> = referenced_relations(&body)
        .into_iter()
        .filter(|relation| mdl.object_kind(relation) == Some(ObjectKind::View))
        .collect();
    path.push(name.to_string());
    for dependency in dependencies {
        check_view_cycle(mdl, &dependency, path)?;
    }
    path.pop();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic_model::local_store::LocalSemanticModelStore;
    use crate::semantic_model::{Column, Manifest, SemanticModelStore, View};
    use rstest::*;

    #[fixture]
    fn manifest() -> Manifest {
        LocalSemanticModelStore::mock().get_manifest().unwrap()
    }

    fn rewrite(sql: &str, manifest: Manifest) -> Result<String, SqlTransformError> {
        let mdl = Mdl::from_manifest(manifest).unwrap();
        let session = SessionContext::for_mdl(&mdl);
        let query = parse_query(sql)?;
        ModelRewrite.apply(query, &session, &mdl).map(|q| q.to_string())
    }

    const ALBUM: &str = "Album AS (SELECT id, name, author, price, bandId, 'relationship<AlbumBand>' AS band FROM (SELECT * FROM album) AS Album)";

    #[rstest]
    #[case::model_with_expressions(
        "SELECT orderkey FROM Orders",
        "WITH Orders AS (SELECT orderkey, custkey, orderstatus AS status, totalprice, orderdate, totalprice * 0.9 AS discounted FROM (SELECT * FROM orders) AS Orders) SELECT orderkey FROM Orders"
    )]
    #[case::each_model_once(
        "SELECT a.name FROM Album a JOIN Album b ON a.id = b.id",
        &format!("WITH {} SELECT a.name FROM Album AS a JOIN Album AS b ON a.id = b.id", ALBUM)
    )]
    #[case::user_cte_kept_after(
        "WITH cheap AS (SELECT name FROM Album WHERE price < 10) SELECT * FROM cheap",
        &format!("WITH {}, cheap AS (SELECT name FROM Album WHERE price < 10) SELECT * FROM cheap", ALBUM)
    )]
    #[case::view_inlined(
        "SELECT name FROM ZutomayoAlbums",
        &format!("WITH {}, ZutomayoAlbums AS (SELECT name, price FROM Album WHERE author = 'ZUTOMAYO') SELECT name FROM ZutomayoAlbums", ALBUM)
    )]
    #[case::physical_table_untouched("SELECT * FROM album", "SELECT * FROM album")]
    fn test_model_rewrite(manifest: Manifest, #[case] sql: &str, #[case] expected: &str) {
        assert_eq!(rewrite(sql, manifest).unwrap(), expected);
    }

    #[rstest]
    fn test_base_model(mut manifest: Manifest) {
        manifest.models.push(Model::on_base_model(
            "CheapAlbum",
            "Album",
            vec![Column::new("name", "varchar"), Column::calculated("half", "integer", "price / 2")],
        ));
        let sql = rewrite("SELECT half FROM CheapAlbum", manifest).unwrap();
        assert_eq!(
            sql,
            format!(
                "WITH {}, CheapAlbum AS (SELECT name, price / 2 AS half FROM Album AS CheapAlbum) SELECT half FROM CheapAlbum",
                ALBUM
            )
        );
    }

    #[rstest]
    fn test_undeclared_join_key_is_projected(mut manifest: Manifest) {
        manifest.models[0].columns.retain(|column| column.name != "bandId");
        let sql = rewrite("SELECT name FROM Album", manifest).unwrap();
        assert_eq!(
            sql,
            "WITH Album AS (SELECT id, name, author, price, 'relationship<AlbumBand>' AS band, bandId FROM (SELECT * FROM album) AS Album) SELECT name FROM Album"
        );
    }

    #[rstest]
    fn test_view_cycle(mut manifest: Manifest) {
        manifest.views = vec![
            View::new("Ping", "SELECT * FROM Pong"),
            View::new("Pong", "SELECT * FROM Ping"),
        ];
        let result = rewrite("SELECT * FROM Ping", manifest);
        assert!(matches!(result, Err(SqlTransformError::InvalidStatement(_))));
    }
}
