//! Compiles the operator algebra into parameterized SQL.
//!
//! SQLite's LIKE is case-insensitive for ASCII, so case-sensitive prefix
//! matches compile to GLOB and the case-insensitive ones to LIKE with an
//! explicit escape character.

use serde_json::Value;

use crate::query::{Condition, QueryOptions, QueryPlan, WhereOp};
use crate::record::LOCAL_ID;

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Double-quote an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Convert a JSON value into something rusqlite can bind. Booleans are
/// stored as 0/1; arrays and objects as JSON text.
pub fn bind_value(v: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match v {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Sql::Integer(i)
            } else {
                Sql::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => Sql::Text(s.clone()),
        other => Sql::Text(other.to_string()),
    }
}

/// LIKE pattern for a prefix match: escape `%`, `_` and `\`, append `%`.
fn like_prefix(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

/// GLOB pattern for a prefix match: bracket the metacharacters, append
/// `*`.
fn glob_prefix(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        match c {
            '*' | '?' | '[' => {
                out.push('[');
                out.push(c);
                out.push(']');
            }
            other => out.push(other),
        }
    }
    out.push('*');
    out
}

fn placeholders(n: usize) -> String {
    let mut s = String::new();
    for i in 0..n {
        if i > 0 {
            s.push_str(", ");
        }
        s.push('?');
    }
    s
}

fn range_sql(col: &str, include_lower: bool, include_upper: bool) -> String {
    let lo = if include_lower { ">=" } else { ">" };
    let hi = if include_upper { "<=" } else { "<" };
    format!("({col} {lo} ? AND {col} {hi} ?)")
}

fn condition_sql(cond: &Condition, params: &mut Vec<Value>) -> String {
    let col = quote_ident(&cond.field);
    match &cond.op {
        WhereOp::Equals(v) => {
            params.push(v.clone());
            format!("{col} = ?")
        }
        WhereOp::EqualsIgnoreCase(s) => {
            params.push(Value::String(s.clone()));
            format!("{col} = ? COLLATE NOCASE")
        }
        WhereOp::NotEqual(v) => {
            params.push(v.clone());
            format!("{col} <> ?")
        }
        WhereOp::Above(v) => {
            params.push(v.clone());
            format!("{col} > ?")
        }
        WhereOp::AboveOrEqual(v) => {
            params.push(v.clone());
            format!("{col} >= ?")
        }
        WhereOp::Below(v) => {
            params.push(v.clone());
            format!("{col} < ?")
        }
        WhereOp::BelowOrEqual(v) => {
            params.push(v.clone());
            format!("{col} <= ?")
        }
        WhereOp::Between { lower, upper, include_lower, include_upper } => {
            params.push(lower.clone());
            params.push(upper.clone());
            range_sql(&col, *include_lower, *include_upper)
        }
        WhereOp::InAnyRange { ranges, include_lower, include_upper } => {
            if ranges.is_empty() {
                return "0 = 1".into();
            }
            let parts: Vec<String> = ranges
                .iter()
                .map(|(lo, hi)| {
                    params.push(lo.clone());
                    params.push(hi.clone());
                    range_sql(&col, *include_lower, *include_upper)
                })
                .collect();
            format!("({})", parts.join(" OR "))
        }
        WhereOp::StartsWith(p) => {
            params.push(Value::String(glob_prefix(p)));
            format!("{col} GLOB ?")
        }
        WhereOp::StartsWithIgnoreCase(p) => {
            params.push(Value::String(like_prefix(p)));
            format!("{col} LIKE ? ESCAPE '\\'")
        }
        WhereOp::StartsWithAnyOf(prefixes) => {
            if prefixes.is_empty() {
                return "0 = 1".into();
            }
            let parts: Vec<String> = prefixes
                .iter()
                .map(|p| {
                    params.push(Value::String(glob_prefix(p)));
                    format!("{col} GLOB ?")
                })
                .collect();
            format!("({})", parts.join(" OR "))
        }
        WhereOp::StartsWithAnyOfIgnoreCase(prefixes) => {
            if prefixes.is_empty() {
                return "0 = 1".into();
            }
            let parts: Vec<String> = prefixes
                .iter()
                .map(|p| {
                    params.push(Value::String(like_prefix(p)));
                    format!("{col} LIKE ? ESCAPE '\\'")
                })
                .collect();
            format!("({})", parts.join(" OR "))
        }
        WhereOp::AnyOf(values) => {
            if values.is_empty() {
                return "0 = 1".into();
            }
            params.extend(values.iter().cloned());
            format!("{col} IN ({})", placeholders(values.len()))
        }
        WhereOp::AnyOfIgnoreCase(values) => {
            if values.is_empty() {
                return "0 = 1".into();
            }
            params.extend(values.iter().map(|s| Value::String(s.clone())));
            format!("{col} COLLATE NOCASE IN ({})", placeholders(values.len()))
        }
        WhereOp::NoneOf(values) => {
            if values.is_empty() {
                return "1 = 1".into();
            }
            params.extend(values.iter().cloned());
            format!("{col} NOT IN ({})", placeholders(values.len()))
        }
    }
}

/// OR-groups joined by OR; conditions within a group joined by AND.
fn where_sql(groups: &[Vec<Condition>], params: &mut Vec<Value>) -> Option<String> {
    if groups.is_empty() {
        return None;
    }
    let rendered: Vec<String> = groups
        .iter()
        .map(|group| {
            let parts: Vec<String> = group.iter().map(|c| condition_sql(c, params)).collect();
            format!("({})", parts.join(" AND "))
        })
        .collect();
    Some(rendered.join(" OR "))
}

fn order_sql(options: &QueryOptions) -> String {
    let dir = if options.reverse { "DESC" } else { "ASC" };
    match options.order_by.as_deref().filter(|f| *f != LOCAL_ID) {
        Some(field) => {
            format!("ORDER BY {} {dir}, {} {dir}", quote_ident(field), quote_ident(LOCAL_ID))
        }
        None => format!("ORDER BY {} {dir}", quote_ident(LOCAL_ID)),
    }
}

fn paging_sql(options: &QueryOptions, sql: &mut String) {
    match (options.limit, options.offset) {
        (Some(limit), Some(offset)) => sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}")),
        (Some(limit), None) => sql.push_str(&format!(" LIMIT {limit}")),
        (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {offset}")),
        (None, None) => {}
    }
}

/// SELECT of whole rows, or of one projected column when `projection`
/// is set.
pub fn compile_select(table: &str, plan: &QueryPlan, projection: Option<&str>) -> CompiledQuery {
    let mut params = Vec::new();
    let distinct = if plan.options.distinct { "DISTINCT " } else { "" };
    let cols = match projection {
        Some(field) => quote_ident(field),
        None => "*".to_string(),
    };
    let mut sql = format!("SELECT {distinct}{cols} FROM {}", quote_ident(table));
    if let Some(w) = where_sql(&plan.groups, &mut params) {
        sql.push_str(&format!(" WHERE {w}"));
    }
    sql.push(' ');
    sql.push_str(&order_sql(&plan.options));
    paging_sql(&plan.options, &mut sql);
    CompiledQuery { sql, params }
}

/// COUNT over the fully-applied pipeline (including distinct and
/// paging), so it agrees with the reference engine.
pub fn compile_count(table: &str, plan: &QueryPlan) -> CompiledQuery {
    let inner = compile_select(table, plan, None);
    CompiledQuery { sql: format!("SELECT COUNT(*) FROM ({})", inner.sql), params: inner.params }
}

fn key_subselect(table: &str, plan: &QueryPlan) -> CompiledQuery {
    let mut plan = plan.clone();
    plan.options.distinct = false;
    compile_select(table, &plan, Some(LOCAL_ID))
}

pub fn compile_delete(table: &str, plan: &QueryPlan) -> CompiledQuery {
    let keys = key_subselect(table, plan);
    CompiledQuery {
        sql: format!(
            "DELETE FROM {} WHERE {} IN ({})",
            quote_ident(table),
            quote_ident(LOCAL_ID),
            keys.sql
        ),
        params: keys.params,
    }
}

pub fn compile_update(table: &str, plan: &QueryPlan, changes: &crate::record::Record) -> CompiledQuery {
    let mut params: Vec<Value> = Vec::new();
    let assignments: Vec<String> = changes
        .iter()
        .map(|(k, v)| {
            params.push(v.clone());
            format!("{} = ?", quote_ident(k))
        })
        .collect();
    let keys = key_subselect(table, plan);
    params.extend(keys.params);
    CompiledQuery {
        sql: format!(
            "UPDATE {} SET {} WHERE {} IN ({})",
            quote_ident(table),
            assignments.join(", "),
            quote_ident(LOCAL_ID),
            keys.sql
        ),
        params,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan(groups: Vec<Vec<Condition>>) -> QueryPlan {
        QueryPlan { groups, options: Default::default() }
    }

    fn cond(field: &str, op: WhereOp) -> Vec<Vec<Condition>> {
        vec![vec![Condition { field: field.into(), op }]]
    }

    #[test]
    fn equals_compiles_to_placeholder() {
        let q = compile_select("todos", &plan(cond("title", WhereOp::Equals(json!("x")))), None);
        assert_eq!(
            q.sql,
            "SELECT * FROM \"todos\" WHERE (\"title\" = ?) ORDER BY \"local_id\" ASC"
        );
        assert_eq!(q.params, vec![json!("x")]);
    }

    #[test]
    fn between_swaps_comparators_with_inclusivity() {
        let op = WhereOp::Between {
            lower: json!(1),
            upper: json!(5),
            include_lower: true,
            include_upper: false,
        };
        let q = compile_select("t", &plan(cond("n", op)), None);
        assert!(q.sql.contains("(\"n\" >= ? AND \"n\" < ?)"), "{}", q.sql);
    }

    #[test]
    fn empty_any_of_and_none_of_fold_to_constants() {
        let q = compile_select("t", &plan(cond("n", WhereOp::AnyOf(vec![]))), None);
        assert!(q.sql.contains("WHERE (0 = 1)"), "{}", q.sql);
        let q = compile_select("t", &plan(cond("n", WhereOp::NoneOf(vec![]))), None);
        assert!(q.sql.contains("WHERE (1 = 1)"), "{}", q.sql);
    }

    #[test]
    fn starts_with_uses_glob_and_escapes() {
        let q = compile_select("t", &plan(cond("s", WhereOp::StartsWith("a*b".into()))), None);
        assert!(q.sql.contains("\"s\" GLOB ?"), "{}", q.sql);
        assert_eq!(q.params, vec![json!("a[*]b*")]);
    }

    #[test]
    fn starts_with_ignore_case_uses_escaped_like() {
        let q = compile_select(
            "t",
            &plan(cond("s", WhereOp::StartsWithIgnoreCase("50%_a\\".into()))),
            None,
        );
        assert!(q.sql.contains("\"s\" LIKE ? ESCAPE '\\'"), "{}", q.sql);
        assert_eq!(q.params, vec![json!("50\\%\\_a\\\\%")]);
    }

    #[test]
    fn or_groups_join_with_or_and_inside_with_and() {
        let groups = vec![
            vec![
                Condition { field: "a".into(), op: WhereOp::Equals(json!(1)) },
                Condition { field: "b".into(), op: WhereOp::Above(json!(2)) },
            ],
            vec![Condition { field: "c".into(), op: WhereOp::Equals(json!(3)) }],
        ];
        let q = compile_select("t", &plan(groups), None);
        assert!(
            q.sql.contains("WHERE (\"a\" = ? AND \"b\" > ?) OR (\"c\" = ?)"),
            "{}",
            q.sql
        );
        assert_eq!(q.params, vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn ordering_and_paging() {
        let p = QueryPlan {
            groups: vec![],
            options: QueryOptions {
                order_by: Some("n".into()),
                reverse: true,
                offset: Some(4),
                limit: Some(2),
                distinct: false,
            },
        };
        let q = compile_select("t", &p, None);
        assert!(
            q.sql.ends_with("ORDER BY \"n\" DESC, \"local_id\" DESC LIMIT 2 OFFSET 4"),
            "{}",
            q.sql
        );
    }

    #[test]
    fn identifier_quoting_doubles_embedded_quotes() {
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn delete_and_update_share_the_select_path() {
        let p = plan(cond("n", WhereOp::BelowOrEqual(json!(3))));
        let d = compile_delete("t", &p);
        assert!(d.sql.starts_with("DELETE FROM \"t\" WHERE \"local_id\" IN (SELECT"), "{}", d.sql);
        let mut changes = crate::record::Record::new();
        changes.insert("done".into(), json!(true));
        let u = compile_update("t", &p, &changes);
        assert!(u.sql.starts_with("UPDATE \"t\" SET \"done\" = ? WHERE \"local_id\" IN ("), "{}", u.sql);
        assert_eq!(u.params[0], json!(true));
    }

    #[test]
    fn bools_bind_as_integers() {
        assert_eq!(bind_value(&json!(true)), rusqlite::types::Value::Integer(1));
        assert_eq!(bind_value(&json!([1, 2])), rusqlite::types::Value::Text("[1,2]".into()));
    }
}
