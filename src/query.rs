//! Where-clause operator algebra and its reference evaluation.
//!
//! A query is a DNF of operator conditions (OR-groups of AND-conditions)
//! plus ordering/paging options. Backends either evaluate it here in the
//! value domain (the in-memory engine) or compile it to SQL.

use std::cmp::Ordering;

use serde_json::Value;

use crate::record::{LOCAL_ID, Record};

#[derive(Debug, Clone, PartialEq)]
pub enum WhereOp {
    Equals(Value),
    EqualsIgnoreCase(String),
    NotEqual(Value),
    Above(Value),
    AboveOrEqual(Value),
    Below(Value),
    BelowOrEqual(Value),
    Between { lower: Value, upper: Value, include_lower: bool, include_upper: bool },
    InAnyRange { ranges: Vec<(Value, Value)>, include_lower: bool, include_upper: bool },
    StartsWith(String),
    StartsWithIgnoreCase(String),
    StartsWithAnyOf(Vec<String>),
    StartsWithAnyOfIgnoreCase(Vec<String>),
    AnyOf(Vec<Value>),
    AnyOfIgnoreCase(Vec<String>),
    NoneOf(Vec<Value>),
}

/// One operator applied to one field.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub op: WhereOp,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    pub order_by: Option<String>,
    pub reverse: bool,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
    pub distinct: bool,
}

/// OR-groups of AND-conditions plus options. An empty group list matches
/// every record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryPlan {
    pub groups: Vec<Vec<Condition>>,
    pub options: QueryOptions,
}

impl QueryPlan {
    pub fn for_table_scan() -> Self {
        QueryPlan::default()
    }

    /// Copy without paging, for backends that must post-filter with an
    /// opaque predicate before offset/limit apply.
    pub fn without_paging(&self) -> QueryPlan {
        let mut plan = self.clone();
        plan.options.offset = None;
        plan.options.limit = None;
        plan
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over values: null < false < true < numbers < strings
/// (lexicographic) < arrays (lexicographic). Objects sort last.
pub fn cmp_values(a: &Value, b: &Value) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (xi, yi) in x.iter().zip(y.iter()) {
                match cmp_values(xi, yi) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            x.len().cmp(&y.len())
        }
        _ => Ordering::Equal,
    }
}

/// Missing attributes normalize to null.
pub fn field_value<'a>(record: &'a Record, field: &str) -> &'a Value {
    record.get(field).unwrap_or(&Value::Null)
}

fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn fold(s: &str) -> String {
    s.to_lowercase()
}

fn in_range(
    v: &Value,
    lower: &Value,
    upper: &Value,
    include_lower: bool,
    include_upper: bool,
) -> bool {
    let lo = cmp_values(v, lower);
    let hi = cmp_values(v, upper);
    let lower_ok = if include_lower { lo != Ordering::Less } else { lo == Ordering::Greater };
    let upper_ok = if include_upper { hi != Ordering::Greater } else { hi == Ordering::Less };
    lower_ok && upper_ok
}

pub fn op_matches(v: &Value, op: &WhereOp) -> bool {
    match op {
        WhereOp::Equals(rhs) => cmp_values(v, rhs) == Ordering::Equal,
        WhereOp::EqualsIgnoreCase(rhs) => {
            matches!(v, Value::String(s) if fold(s) == fold(rhs))
        }
        WhereOp::NotEqual(rhs) => cmp_values(v, rhs) != Ordering::Equal,
        WhereOp::Above(rhs) => cmp_values(v, rhs) == Ordering::Greater,
        WhereOp::AboveOrEqual(rhs) => cmp_values(v, rhs) != Ordering::Less,
        WhereOp::Below(rhs) => cmp_values(v, rhs) == Ordering::Less,
        WhereOp::BelowOrEqual(rhs) => cmp_values(v, rhs) != Ordering::Greater,
        WhereOp::Between { lower, upper, include_lower, include_upper } => {
            in_range(v, lower, upper, *include_lower, *include_upper)
        }
        WhereOp::InAnyRange { ranges, include_lower, include_upper } => ranges
            .iter()
            .any(|(lo, hi)| in_range(v, lo, hi, *include_lower, *include_upper)),
        WhereOp::StartsWith(prefix) => stringify(v).starts_with(prefix),
        WhereOp::StartsWithIgnoreCase(prefix) => fold(&stringify(v)).starts_with(&fold(prefix)),
        WhereOp::StartsWithAnyOf(prefixes) => {
            let s = stringify(v);
            prefixes.iter().any(|p| s.starts_with(p))
        }
        WhereOp::StartsWithAnyOfIgnoreCase(prefixes) => {
            let s = fold(&stringify(v));
            prefixes.iter().any(|p| s.starts_with(&fold(p)))
        }
        WhereOp::AnyOf(values) => values.iter().any(|rhs| cmp_values(v, rhs) == Ordering::Equal),
        WhereOp::AnyOfIgnoreCase(values) => {
            matches!(v, Value::String(s) if values.iter().any(|rhs| fold(s) == fold(rhs)))
        }
        WhereOp::NoneOf(values) => values.iter().all(|rhs| cmp_values(v, rhs) != Ordering::Equal),
    }
}

pub fn matches_groups(record: &Record, groups: &[Vec<Condition>]) -> bool {
    if groups.is_empty() {
        return true;
    }
    groups
        .iter()
        .any(|group| group.iter().all(|c| op_matches(field_value(record, &c.field), &c.op)))
}

fn sort_records(records: &mut [Record], order_by: Option<&str>, reverse: bool) {
    let key = order_by.unwrap_or(LOCAL_ID);
    records.sort_by(|a, b| {
        cmp_values(field_value(a, key), field_value(b, key))
            .then_with(|| cmp_values(field_value(a, LOCAL_ID), field_value(b, LOCAL_ID)))
    });
    if reverse {
        records.reverse();
    }
}

fn dedup_records(records: Vec<Record>) -> Vec<Record> {
    let mut seen = std::collections::HashSet::new();
    records
        .into_iter()
        .filter(|r| seen.insert(serde_json::to_string(&Value::Object(r.clone())).unwrap_or_default()))
        .collect()
}

fn page<T>(items: Vec<T>, offset: Option<usize>, limit: Option<usize>) -> Vec<T> {
    let mut iter = items.into_iter().skip(offset.unwrap_or(0));
    match limit {
        Some(n) => iter.by_ref().take(n).collect(),
        None => iter.collect(),
    }
}

/// Reference execution: filter, order (tie-break on `local_id`),
/// reverse, distinct, then offset/limit.
pub fn execute_plan(rows: Vec<Record>, plan: &QueryPlan) -> Vec<Record> {
    let mut matched: Vec<Record> =
        rows.into_iter().filter(|r| matches_groups(r, &plan.groups)).collect();
    sort_records(&mut matched, plan.options.order_by.as_deref(), plan.options.reverse);
    if plan.options.distinct {
        matched = dedup_records(matched);
    }
    page(matched, plan.options.offset, plan.options.limit)
}

/// Reference key projection: same pipeline, projecting one field, with
/// distinct applied to the projected values.
pub fn execute_plan_keys(rows: Vec<Record>, plan: &QueryPlan, field: &str) -> Vec<Value> {
    let mut matched: Vec<Record> =
        rows.into_iter().filter(|r| matches_groups(r, &plan.groups)).collect();
    sort_records(&mut matched, plan.options.order_by.as_deref(), plan.options.reverse);
    let mut keys: Vec<Value> = matched.iter().map(|r| field_value(r, field).clone()).collect();
    if plan.options.distinct {
        let mut seen = std::collections::HashSet::new();
        keys.retain(|k| seen.insert(serde_json::to_string(k).unwrap_or_default()));
    }
    page(keys, plan.options.offset, plan.options.limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(v: serde_json::Value) -> Record {
        v.as_object().unwrap().clone()
    }

    fn cond(field: &str, op: WhereOp) -> Vec<Vec<Condition>> {
        vec![vec![Condition { field: field.into(), op }]]
    }

    #[test]
    fn value_order_is_total() {
        let ordered = [
            json!(null),
            json!(false),
            json!(true),
            json!(-3),
            json!(2.5),
            json!("a"),
            json!("b"),
            json!(["a"]),
            json!(["a", "b"]),
        ];
        for w in ordered.windows(2) {
            assert_eq!(cmp_values(&w[0], &w[1]), Ordering::Less, "{:?} < {:?}", w[0], w[1]);
        }
    }

    #[test]
    fn missing_field_normalizes_to_null() {
        let r = rec(json!({"local_id": "a"}));
        assert!(op_matches(field_value(&r, "ghost"), &WhereOp::Below(json!(0))));
    }

    #[test]
    fn between_respects_inclusivity() {
        let op = |il, iu| WhereOp::Between {
            lower: json!(1),
            upper: json!(3),
            include_lower: il,
            include_upper: iu,
        };
        assert!(op_matches(&json!(1), &op(true, false)));
        assert!(!op_matches(&json!(3), &op(true, false)));
        assert!(!op_matches(&json!(1), &op(false, true)));
        assert!(op_matches(&json!(3), &op(false, true)));
    }

    #[test]
    fn case_folding_operators() {
        assert!(op_matches(&json!("Hello"), &WhereOp::EqualsIgnoreCase("hELLO".into())));
        assert!(op_matches(&json!("Hello"), &WhereOp::StartsWithIgnoreCase("he".into())));
        assert!(!op_matches(&json!("Hello"), &WhereOp::StartsWith("he".into())));
        assert!(op_matches(
            &json!("Hello"),
            &WhereOp::AnyOfIgnoreCase(vec!["x".into(), "HELLO".into()])
        ));
    }

    #[test]
    fn starts_with_stringifies() {
        assert!(op_matches(&json!(42), &WhereOp::StartsWith("4".into())));
    }

    #[test]
    fn any_of_and_none_of() {
        assert!(op_matches(&json!(2), &WhereOp::AnyOf(vec![json!(1), json!(2)])));
        assert!(!op_matches(&json!(2), &WhereOp::NoneOf(vec![json!(1), json!(2)])));
        assert!(!op_matches(&json!(2), &WhereOp::AnyOf(vec![])));
        assert!(op_matches(&json!(2), &WhereOp::NoneOf(vec![])));
    }

    #[test]
    fn dnf_groups_are_or_of_ands() {
        let r = rec(json!({"local_id": "a", "x": 1, "y": 2}));
        let mut groups = cond("x", WhereOp::Equals(json!(9)));
        groups.push(vec![
            Condition { field: "x".into(), op: WhereOp::Equals(json!(1)) },
            Condition { field: "y".into(), op: WhereOp::Equals(json!(2)) },
        ]);
        assert!(matches_groups(&r, &groups));
        groups[1][1].op = WhereOp::Equals(json!(3));
        assert!(!matches_groups(&r, &groups));
    }

    #[test]
    fn default_order_is_local_id_ascending() {
        let rows = vec![
            rec(json!({"local_id": "b", "n": 1})),
            rec(json!({"local_id": "a", "n": 2})),
        ];
        let out = execute_plan(rows, &QueryPlan::default());
        assert_eq!(out[0].get("local_id"), Some(&json!("a")));
        assert_eq!(out[1].get("local_id"), Some(&json!("b")));
    }

    #[test]
    fn paging_applies_after_ordering() {
        let rows: Vec<Record> = (0..5)
            .map(|i| rec(json!({"local_id": format!("id{i}"), "n": i})))
            .collect();
        let plan = QueryPlan {
            groups: vec![],
            options: QueryOptions {
                order_by: Some("n".into()),
                reverse: true,
                offset: Some(1),
                limit: Some(2),
                distinct: false,
            },
        };
        let out = execute_plan(rows, &plan);
        let ns: Vec<_> = out.iter().map(|r| r.get("n").unwrap().clone()).collect();
        assert_eq!(ns, vec![json!(3), json!(2)]);
    }

    #[test]
    fn key_projection_distinct() {
        let rows = vec![
            rec(json!({"local_id": "a", "tag": "x"})),
            rec(json!({"local_id": "b", "tag": "x"})),
            rec(json!({"local_id": "c", "tag": "y"})),
        ];
        let plan = QueryPlan {
            groups: vec![],
            options: QueryOptions { distinct: true, ..Default::default() },
        };
        let keys = execute_plan_keys(rows, &plan, "tag");
        assert_eq!(keys, vec![json!("x"), json!("y")]);
    }
}
