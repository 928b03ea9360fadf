//! The relational planner: eager-loading via correlated JSON subqueries.
//!
//! Given a schema graph and a selection spec, the planner builds one SELECT
//! per root call in which every requested relation becomes a correlated,
//! JSON-producing subquery, plus a selection map describing how to fold the
//! returned rows back into nested objects.

use crate::compiler::Compiler;
use crate::config::{ForJson, FromTarget, SelectConfig};
use crate::error::{OrmError, OrmResult};
use crate::expr::{Expr, OrderBy, Predicate};
use crate::fragment::{Compiled, Decoder};
use crate::schema::{RelationKind, Schema, Table};
use crate::session::Row;
use crate::value::SqlValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// What to load for one table, possibly nested through `with`.
#[derive(Debug, Clone, Default)]
pub struct SelectionSpec {
    /// Column include/exclude map. Absent means all declared columns; a map
    /// with any `true` entry keeps only those; an all-`false` map keeps
    /// everything but those.
    pub columns: Option<BTreeMap<String, bool>>,
    /// Relations to eager-load, in request order.
    pub with: Vec<(String, WithSpec)>,
    pub filter: Option<Predicate>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    /// Extra computed output columns.
    pub extras: Vec<Extra>,
}

impl SelectionSpec {
    pub fn all() -> Self {
        Self::default()
    }
}

/// An extra computed output column, with an optional result decoder.
#[derive(Debug, Clone)]
pub struct Extra {
    pub key: String,
    pub expr: Expr,
    pub decoder: Option<Decoder>,
}

impl Extra {
    pub fn new(key: impl Into<String>, expr: Expr) -> Self {
        Self {
            key: key.into(),
            expr,
            decoder: None,
        }
    }

    pub fn with_decoder(mut self, decoder: Decoder) -> Self {
        self.decoder = Some(decoder);
        self
    }
}

/// A `with` entry: the whole related row set, or a nested spec.
#[derive(Debug, Clone)]
pub enum WithSpec {
    All,
    Spec(Box<SelectionSpec>),
}

/// One node of the selection map. Leaves are plain columns; JSON nodes carry
/// the relation's own selection map as children.
#[derive(Debug, Clone)]
pub struct SelectionNode {
    pub key: String,
    pub table: String,
    pub is_json: bool,
    pub kind: Option<RelationKind>,
    pub children: Vec<SelectionNode>,
    pub decoder: Option<Decoder>,
}

impl SelectionNode {
    fn column(key: &str, table: &str, decoder: Option<Decoder>) -> Self {
        Self {
            key: key.to_string(),
            table: table.to_string(),
            is_json: false,
            kind: None,
            children: Vec::new(),
            decoder,
        }
    }
}

/// A planned query: the statement config, its compiled form, and the
/// selection map for row reduction.
#[derive(Debug, Clone)]
pub struct Plan {
    pub select: SelectConfig,
    pub compiled: Compiled,
    pub selection: Vec<SelectionNode>,
}

/// Plans eager-loading queries against one schema graph.
#[derive(Debug, Clone)]
pub struct Planner {
    schema: Arc<Schema>,
    compiler: Compiler,
}

impl Planner {
    pub fn new(schema: Arc<Schema>, compiler: Compiler) -> Self {
        Self { schema, compiler }
    }

    /// Plan a root query over `table`. Each level of the spec's `with` tree
    /// becomes a correlated subquery at alias `{parent_alias}_{key}`.
    pub fn plan(&self, table: &str, spec: &SelectionSpec) -> OrmResult<Plan> {
        let root = self.schema.table(table)?.clone();
        let mut stack = vec![(0usize, root.name.clone())];
        let (select, selection) = self.resolve(&root, spec, &mut stack, false)?;
        let fragment = self.compiler.build_select(&select)?;
        let compiled = self.compiler.to_text(&fragment);
        debug!(table, text = %compiled.text, "planned relational query");
        Ok(Plan {
            select,
            compiled,
            selection,
        })
    }

    /// The alias for the current recursion level: the root table name
    /// followed by each relation key on the path, underscore-joined.
    fn alias_of(stack: &[(usize, String)]) -> String {
        stack
            .iter()
            .map(|(_, key)| key.as_str())
            .collect::<Vec<_>>()
            .join("_")
    }

    fn resolve(
        &self,
        table: &Arc<Table>,
        spec: &SelectionSpec,
        stack: &mut Vec<(usize, String)>,
        nested: bool,
    ) -> OrmResult<(SelectConfig, Vec<SelectionNode>)> {
        let alias = Self::alias_of(stack);
        let from = if nested {
            FromTarget::AliasedTable {
                table: table.clone(),
                alias: alias.clone(),
            }
        } else {
            FromTarget::Table(table.clone())
        };
        let mut config = SelectConfig::new(from);
        let mut selection = Vec::new();

        for column in self.kept_columns(table, spec) {
            config
                .fields
                .push((column.to_string(), Expr::col(&alias, column)));
            let decoder = table.column_by_name(column).and_then(|c| c.decoder.clone());
            selection.push(SelectionNode::column(column, &table.name, decoder));
        }
        for extra in &spec.extras {
            config
                .fields
                .push((extra.key.clone(), extra.expr.rebind(&table.name, &alias)));
            selection.push(SelectionNode::column(
                &extra.key,
                &table.name,
                extra.decoder.clone(),
            ));
        }

        for (key, with) in &spec.with {
            let relation = self
                .schema
                .relation(&table.name, key)
                .ok_or_else(|| OrmError::UnknownRelation {
                    relation: key.clone(),
                    table: table.name.clone(),
                })?
                .clone();
            let target = self.schema.table(&relation.target)?.clone();

            stack.push((stack.len(), key.clone()));
            let child_alias = Self::alias_of(stack);
            let child_spec = match with {
                WithSpec::All => SelectionSpec::all(),
                WithSpec::Spec(s) => (**s).clone(),
            };
            let (mut child, children) = self.resolve(&target, &child_spec, stack, true)?;
            stack.pop();

            let mut correlation: Vec<Predicate> = relation
                .fields
                .iter()
                .zip(&relation.references)
                .map(|(field, reference)| {
                    Predicate::eq_col(
                        Expr::col(&child_alias, reference),
                        Expr::col(&alias, field),
                    )
                })
                .collect();
            if let Some(existing) = child.where_clause.take() {
                correlation.push(existing);
            }
            child.where_clause = Some(if correlation.len() == 1 {
                correlation.remove(0)
            } else {
                Predicate::And(correlation)
            });

            if relation.kind == RelationKind::One {
                child.limit = Some(1);
            }
            child.for_json = Some(ForJson {
                single: relation.kind == RelationKind::One,
            });

            config.fields.push((key.clone(), Expr::subquery(child)));
            selection.push(SelectionNode {
                key: key.clone(),
                table: relation.target.clone(),
                is_json: true,
                kind: Some(relation.kind),
                children,
                decoder: None,
            });
        }

        if config.fields.is_empty() {
            return Err(OrmError::EmptyProjection {
                table: alias.clone(),
            });
        }

        config.where_clause = spec
            .filter
            .as_ref()
            .map(|p| p.rebind(&table.name, &alias));
        config.order_by = spec
            .order_by
            .iter()
            .map(|o| o.rebind(&table.name, &alias))
            .collect();
        config.limit = spec.limit;
        config.offset = spec.offset;
        // Offset/fetch pagination is invalid without an order-by clause, so
        // an unordered paginated query gets a positional one.
        if config.order_by.is_empty() && config.offset.is_some() && config.limit.is_some() {
            config.order_by.push(OrderBy::asc(Expr::raw("1")));
        }
        Ok((config, selection))
    }

    fn kept_columns<'a>(&self, table: &'a Table, spec: &SelectionSpec) -> Vec<&'a str> {
        match &spec.columns {
            None => table.columns.iter().map(|c| c.name.as_str()).collect(),
            Some(map) => {
                let include = map.values().any(|v| *v);
                table
                    .columns
                    .iter()
                    .filter(|c| match map.get(&c.name) {
                        Some(flag) => *flag,
                        None => !include,
                    })
                    .map(|c| c.name.as_str())
                    .collect()
            }
        }
    }
}

/// Fold driver rows back into nested JSON objects, following the plan's
/// selection map: JSON columns are parsed and recursively reduced, plain
/// columns pass through their decoder.
pub fn reduce_rows(selection: &[SelectionNode], rows: &[Row]) -> OrmResult<Vec<serde_json::Value>> {
    rows.iter()
        .map(|row| {
            let mut object = serde_json::Map::new();
            for node in selection {
                let value = row.get(&node.key).cloned().unwrap_or(SqlValue::Null);
                let reduced = if node.is_json {
                    reduce_json_column(node, value)?
                } else {
                    let value = match &node.decoder {
                        Some(d) => d.apply(value)?,
                        None => value,
                    };
                    value.to_json()
                };
                object.insert(node.key.clone(), reduced);
            }
            Ok(serde_json::Value::Object(object))
        })
        .collect()
}

fn reduce_json_column(node: &SelectionNode, value: SqlValue) -> OrmResult<serde_json::Value> {
    let parsed = match value {
        SqlValue::Null => serde_json::Value::Null,
        other => other.parse_json(&node.key)?,
    };
    reduce_json_value(node, parsed)
}

fn reduce_json_value(
    node: &SelectionNode,
    value: serde_json::Value,
) -> OrmResult<serde_json::Value> {
    match node.kind {
        Some(RelationKind::Many) => match value {
            serde_json::Value::Null => Ok(serde_json::Value::Array(Vec::new())),
            serde_json::Value::Array(items) => Ok(serde_json::Value::Array(
                items
                    .into_iter()
                    .map(|item| reduce_json_object(&node.children, item, &node.key))
                    .collect::<OrmResult<Vec<_>>>()?,
            )),
            other => Err(OrmError::decode(
                &node.key,
                format!("expected a JSON array, got {other}"),
            )),
        },
        Some(RelationKind::One) | None => match value {
            serde_json::Value::Null => Ok(serde_json::Value::Null),
            // Drivers without an object-output modifier return a one-element
            // array for a to-one relation.
            serde_json::Value::Array(mut items) => match items.len() {
                0 => Ok(serde_json::Value::Null),
                1 => reduce_json_object(&node.children, items.remove(0), &node.key),
                n => Err(OrmError::decode(
                    &node.key,
                    format!("expected at most one JSON object, got {n}"),
                )),
            },
            other => reduce_json_object(&node.children, other, &node.key),
        },
    }
}

fn reduce_json_object(
    children: &[SelectionNode],
    value: serde_json::Value,
    key: &str,
) -> OrmResult<serde_json::Value> {
    let serde_json::Value::Object(mut fields) = value else {
        return Err(OrmError::decode(
            key,
            format!("expected a JSON object, got {value}"),
        ));
    };
    let mut object = serde_json::Map::new();
    for child in children {
        let raw = fields.remove(&child.key).unwrap_or(serde_json::Value::Null);
        let reduced = if child.is_json {
            // Nested relation columns arrive as embedded JSON text.
            let parsed = match raw {
                serde_json::Value::String(text) => serde_json::from_str(&text)
                    .map_err(|e| OrmError::decode(&child.key, e.to_string()))?,
                other => other,
            };
            reduce_json_value(child, parsed)?
        } else {
            raw
        };
        object.insert(child.key.clone(), reduced);
    }
    Ok(serde_json::Value::Object(object))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::MsSql;
    use crate::schema::{Column, ColumnType, Relation};
    use serde_json::json;

    fn schema() -> Arc<Schema> {
        let users = Table::new("users")
            .column(Column::new("id", ColumnType::Int).identity())
            .column(Column::new("name", ColumnType::Text))
            .build();
        let posts = Table::new("posts")
            .column(Column::new("id", ColumnType::Int).identity())
            .column(Column::new("author_id", ColumnType::Int))
            .column(Column::new("title", ColumnType::Text))
            .build();
        let comments = Table::new("comments")
            .column(Column::new("id", ColumnType::Int).identity())
            .column(Column::new("post_id", ColumnType::Int))
            .column(Column::new("body", ColumnType::Text))
            .build();
        Arc::new(
            Schema::builder()
                .table(users)
                .table(posts)
                .table(comments)
                .relation(Relation::many("posts", "users", "posts").on("id", "author_id"))
                .relation(Relation::one("author", "posts", "users").on("author_id", "id"))
                .relation(Relation::many("comments", "posts", "comments").on("id", "post_id"))
                .build()
                .unwrap(),
        )
    }

    fn planner() -> Planner {
        Planner::new(schema(), Compiler::new(Arc::new(MsSql)))
    }

    fn with_all(key: &str) -> (String, WithSpec) {
        (key.to_string(), WithSpec::All)
    }

    #[test]
    fn many_relation_becomes_correlated_json_subquery() {
        let spec = SelectionSpec {
            with: vec![with_all("posts")],
            ..SelectionSpec::all()
        };
        let plan = planner().plan("users", &spec).unwrap();
        assert_eq!(
            plan.compiled.text,
            "select [id], [name], \
             (select [users_posts].[id], [users_posts].[author_id], [users_posts].[title] \
             from [posts] [users_posts] \
             where [users_posts].[author_id] = [users].[id] \
             for json path) as [posts] \
             from [users]"
        );

        let posts = &plan.selection[2];
        assert_eq!(posts.key, "posts");
        assert!(posts.is_json);
        assert_eq!(posts.kind, Some(RelationKind::Many));
        let child_keys: Vec<_> = posts.children.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(child_keys, vec!["id", "author_id", "title"]);
    }

    #[test]
    fn one_relation_forces_limit_and_object_output() {
        let spec = SelectionSpec {
            with: vec![with_all("author")],
            ..SelectionSpec::all()
        };
        let plan = planner().plan("posts", &spec).unwrap();
        assert!(plan.compiled.text.contains("select top (1)"));
        assert!(plan
            .compiled
            .text
            .contains("for json path, without_array_wrapper) as [author]"));
    }

    #[test]
    fn nested_with_stacks_aliases() {
        let inner = SelectionSpec {
            with: vec![with_all("comments")],
            ..SelectionSpec::all()
        };
        let spec = SelectionSpec {
            with: vec![("posts".to_string(), WithSpec::Spec(Box::new(inner)))],
            ..SelectionSpec::all()
        };
        let plan = planner().plan("users", &spec).unwrap();
        assert!(plan.compiled.text.contains("[comments] [users_posts_comments]"));
        assert!(plan
            .compiled
            .text
            .contains("[users_posts_comments].[post_id] = [users_posts].[id]"));
    }

    #[test]
    fn unknown_relation_fails_before_compilation() {
        let spec = SelectionSpec {
            with: vec![with_all("likes")],
            ..SelectionSpec::all()
        };
        let err = planner().plan("users", &spec).unwrap_err();
        assert!(matches!(
            err,
            OrmError::UnknownRelation { ref relation, ref table }
                if relation == "likes" && table == "users"
        ));
    }

    #[test]
    fn excluding_every_column_is_an_empty_projection() {
        let spec = SelectionSpec {
            columns: Some(BTreeMap::from([
                ("id".to_string(), false),
                ("name".to_string(), false),
            ])),
            ..SelectionSpec::all()
        };
        let err = planner().plan("users", &spec).unwrap_err();
        assert!(matches!(err, OrmError::EmptyProjection { .. }));
    }

    #[test]
    fn include_map_keeps_only_named_columns() {
        let spec = SelectionSpec {
            columns: Some(BTreeMap::from([("name".to_string(), true)])),
            ..SelectionSpec::all()
        };
        let plan = planner().plan("users", &spec).unwrap();
        assert_eq!(plan.compiled.text, "select [name] from [users]");
    }

    #[test]
    fn paginated_query_without_order_gets_a_positional_one() {
        let spec = SelectionSpec {
            limit: Some(10),
            offset: Some(5),
            ..SelectionSpec::all()
        };
        let plan = planner().plan("users", &spec).unwrap();
        assert_eq!(
            plan.compiled.text,
            "select [id], [name] from [users] order by 1 asc \
             offset 5 rows fetch next 10 rows only"
        );

        let ordered = SelectionSpec {
            order_by: vec![OrderBy::desc(Expr::col("users", "name"))],
            limit: Some(10),
            offset: Some(5),
            ..SelectionSpec::all()
        };
        let plan = planner().plan("users", &ordered).unwrap();
        assert!(!plan.compiled.text.contains("order by 1"));
    }

    #[test]
    fn filter_is_rebound_to_the_level_alias() {
        let inner = SelectionSpec {
            filter: Some(Predicate::eq(Expr::col("posts", "title"), "hi")),
            ..SelectionSpec::all()
        };
        let spec = SelectionSpec {
            with: vec![("posts".to_string(), WithSpec::Spec(Box::new(inner)))],
            ..SelectionSpec::all()
        };
        let plan = planner().plan("users", &spec).unwrap();
        assert!(plan
            .compiled
            .text
            .contains("where ([users_posts].[author_id] = [users].[id] and [users_posts].[title] = @par0)"));
    }

    #[test]
    fn reducer_parses_json_relations_into_nested_objects() {
        let spec = SelectionSpec {
            with: vec![with_all("posts")],
            ..SelectionSpec::all()
        };
        let plan = planner().plan("users", &spec).unwrap();

        let row = Row::new(
            vec!["id".into(), "name".into(), "posts".into()],
            vec![
                SqlValue::Int(1),
                SqlValue::Text("Ada".into()),
                SqlValue::Text(
                    r#"[{"id":10,"author_id":1,"title":"first"},{"id":11,"author_id":1,"title":"second"}]"#
                        .into(),
                ),
            ],
        );
        let reduced = reduce_rows(&plan.selection, &[row]).unwrap();
        assert_eq!(
            reduced[0],
            json!({
                "id": 1,
                "name": "Ada",
                "posts": [
                    {"id": 10, "author_id": 1, "title": "first"},
                    {"id": 11, "author_id": 1, "title": "second"},
                ],
            })
        );
    }

    #[test]
    fn extras_carry_their_own_decoders_through_reduction() {
        let spec = SelectionSpec {
            extras: vec![
                Extra::new("name_len", Expr::raw("len([name])")),
                Extra::new("shout", Expr::raw("upper([name])")).with_decoder(Decoder::new(
                    |value| match value {
                        SqlValue::Text(s) => Ok(SqlValue::Text(format!("{s}!"))),
                        other => Ok(other),
                    },
                )),
            ],
            ..SelectionSpec::all()
        };
        let plan = planner().plan("users", &spec).unwrap();
        assert_eq!(
            plan.compiled.text,
            "select [id], [name], len([name]) as [name_len], upper([name]) as [shout] \
             from [users]"
        );

        let by_key = |key: &str| plan.selection.iter().find(|n| n.key == key).unwrap();
        assert!(by_key("name_len").decoder.is_none());
        assert!(by_key("shout").decoder.is_some());

        let row = Row::new(
            vec!["id".into(), "name".into(), "name_len".into(), "shout".into()],
            vec![
                SqlValue::Int(1),
                SqlValue::Text("Ada".into()),
                SqlValue::Int(3),
                SqlValue::Text("ADA".into()),
            ],
        );
        let reduced = reduce_rows(&plan.selection, &[row]).unwrap();
        assert_eq!(reduced[0]["name_len"], json!(3));
        assert_eq!(reduced[0]["shout"], json!("ADA!"));
    }

    #[test]
    fn reducer_turns_missing_one_relation_into_null_and_many_into_empty() {
        let spec = SelectionSpec {
            with: vec![with_all("posts")],
            ..SelectionSpec::all()
        };
        let plan = planner().plan("users", &spec).unwrap();
        let row = Row::new(
            vec!["id".into(), "name".into(), "posts".into()],
            vec![SqlValue::Int(2), SqlValue::Text("Bo".into()), SqlValue::Null],
        );
        let reduced = reduce_rows(&plan.selection, &[row]).unwrap();
        assert_eq!(reduced[0]["posts"], json!([]));
    }
}
