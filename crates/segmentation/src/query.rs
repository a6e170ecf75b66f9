//! Store query translation: folds a rule tree into immutable filter
//! fragments, and plans how much of that query a given store can run.

use chrono::{DateTime, Duration, Utc};
use crm_core::{CrmError, CrmResult};
use serde::Serialize;

use crate::rules::{Condition, Field, FieldKind, LogicalOperator, Operand, OperatorKind, RuleNode};

/// A comparable bound value for range fragments.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RangeValue {
    Number(f64),
    Instant(DateTime<Utc>),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RangeBound {
    pub value: RangeValue,
    pub inclusive: bool,
}

impl RangeBound {
    pub fn inclusive(value: RangeValue) -> Self {
        Self {
            value,
            inclusive: true,
        }
    }

    pub fn exclusive(value: RangeValue) -> Self {
        Self {
            value,
            inclusive: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    Exact,
    Contains,
    Prefix,
    Suffix,
}

/// Native filter operation of the customer store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterKind {
    /// Numeric or timestamp range; null timestamps never fall in a range.
    Range {
        field: Field,
        lower: Option<RangeBound>,
        upper: Option<RangeBound>,
    },
    /// Set membership on a collection field.
    SetContains { field: Field, value: String },
    /// Case-insensitive text match; absent text never matches.
    Pattern {
        field: Field,
        pattern: PatternKind,
        value: String,
    },
    /// Null, empty string, or empty set.
    Empty { field: Field },
}

/// One filter fragment. `negated` selects the exact complement, including
/// rows where the field is absent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Filter {
    pub kind: FilterKind,
    pub negated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "args", rename_all = "snake_case")]
pub enum StoreQuery {
    MatchAll,
    MatchNone,
    Filter(Filter),
    And(Vec<StoreQuery>),
    Or(Vec<StoreQuery>),
}

impl StoreQuery {
    /// Conjunction with identity/absorbing elements folded away.
    pub fn and(parts: Vec<StoreQuery>) -> StoreQuery {
        let mut out = Vec::with_capacity(parts.len());
        for part in parts {
            match part {
                StoreQuery::MatchAll => {}
                StoreQuery::MatchNone => return StoreQuery::MatchNone,
                StoreQuery::And(inner) => out.extend(inner),
                other => out.push(other),
            }
        }
        match out.len() {
            0 => StoreQuery::MatchAll,
            1 => out.pop().unwrap_or(StoreQuery::MatchAll),
            _ => StoreQuery::And(out),
        }
    }

    /// Disjunction with identity/absorbing elements folded away.
    pub fn or(parts: Vec<StoreQuery>) -> StoreQuery {
        let mut out = Vec::with_capacity(parts.len());
        for part in parts {
            match part {
                StoreQuery::MatchNone => {}
                StoreQuery::MatchAll => return StoreQuery::MatchAll,
                StoreQuery::Or(inner) => out.extend(inner),
                other => out.push(other),
            }
        }
        match out.len() {
            0 => StoreQuery::MatchNone,
            1 => out.pop().unwrap_or(StoreQuery::MatchNone),
            _ => StoreQuery::Or(out),
        }
    }

    fn filter(kind: FilterKind, negated: bool) -> StoreQuery {
        StoreQuery::Filter(Filter { kind, negated })
    }

    /// Levels of nested OR in this query.
    pub fn or_depth(&self) -> usize {
        match self {
            StoreQuery::MatchAll | StoreQuery::MatchNone | StoreQuery::Filter(_) => 0,
            StoreQuery::And(parts) => parts.iter().map(StoreQuery::or_depth).max().unwrap_or(0),
            StoreQuery::Or(parts) => 1 + parts.iter().map(StoreQuery::or_depth).max().unwrap_or(0),
        }
    }
}

/// Translate a rule into a store query as of `now`. An empty group becomes
/// `MatchNone` regardless of its operator.
pub fn to_query(rule: &RuleNode, now: DateTime<Utc>) -> CrmResult<StoreQuery> {
    match rule {
        RuleNode::Group(group) => {
            if group.conditions.is_empty() {
                return Ok(StoreQuery::MatchNone);
            }
            let parts = group
                .conditions
                .iter()
                .map(|child| to_query(child, now))
                .collect::<CrmResult<Vec<_>>>()?;
            Ok(match group.operator {
                LogicalOperator::And => StoreQuery::and(parts),
                LogicalOperator::Or => StoreQuery::or(parts),
            })
        }
        RuleNode::Condition(condition) => condition_fragment(condition, now),
    }
}

fn condition_fragment(condition: &Condition, now: DateTime<Utc>) -> CrmResult<StoreQuery> {
    use OperatorKind::*;

    let field = condition.field();
    let op = condition.operation();
    let negated = matches!(op, NotEquals | NotContains | NotBetween | IsNotEmpty | IsNotInLast);
    let positive = match op {
        NotEquals => Equals,
        NotContains => Contains,
        NotBetween => Between,
        IsNotEmpty => IsEmpty,
        IsNotInLast => IsInLast,
        other => other,
    };

    let range = |lower: Option<RangeBound>, upper: Option<RangeBound>| FilterKind::Range {
        field,
        lower,
        upper,
    };

    let kind = match (field.kind(), positive, condition.operand()) {
        (FieldKind::Numeric, Equals, Operand::Number(v)) => {
            let v = RangeValue::Number(*v);
            range(Some(RangeBound::inclusive(v)), Some(RangeBound::inclusive(v)))
        }
        (FieldKind::Numeric, GreaterThan, Operand::Number(v)) => {
            range(Some(RangeBound::exclusive(RangeValue::Number(*v))), None)
        }
        (FieldKind::Numeric, GreaterThanOrEqual, Operand::Number(v)) => {
            range(Some(RangeBound::inclusive(RangeValue::Number(*v))), None)
        }
        (FieldKind::Numeric, LessThan, Operand::Number(v)) => {
            range(None, Some(RangeBound::exclusive(RangeValue::Number(*v))))
        }
        (FieldKind::Numeric, LessThanOrEqual, Operand::Number(v)) => {
            range(None, Some(RangeBound::inclusive(RangeValue::Number(*v))))
        }
        (FieldKind::Numeric, Between, Operand::NumberRange(lo, hi)) => range(
            Some(RangeBound::inclusive(RangeValue::Number(*lo))),
            Some(RangeBound::inclusive(RangeValue::Number(*hi))),
        ),

        (FieldKind::Timestamp, Equals, Operand::Instant(v)) => {
            let day_start = v
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .map(|d| d.and_utc())
                .unwrap_or(*v);
            range(
                Some(RangeBound::inclusive(RangeValue::Instant(day_start))),
                Some(RangeBound::exclusive(RangeValue::Instant(day_start + Duration::days(1)))),
            )
        }
        (FieldKind::Timestamp, GreaterThan, Operand::Instant(v)) => {
            range(Some(RangeBound::exclusive(RangeValue::Instant(*v))), None)
        }
        (FieldKind::Timestamp, GreaterThanOrEqual, Operand::Instant(v)) => {
            range(Some(RangeBound::inclusive(RangeValue::Instant(*v))), None)
        }
        (FieldKind::Timestamp, LessThan, Operand::Instant(v)) => {
            range(None, Some(RangeBound::exclusive(RangeValue::Instant(*v))))
        }
        (FieldKind::Timestamp, LessThanOrEqual, Operand::Instant(v)) => {
            range(None, Some(RangeBound::inclusive(RangeValue::Instant(*v))))
        }
        (FieldKind::Timestamp, Between, Operand::InstantRange(lo, hi)) => range(
            Some(RangeBound::inclusive(RangeValue::Instant(*lo))),
            Some(RangeBound::inclusive(RangeValue::Instant(*hi))),
        ),
        (FieldKind::Timestamp, IsInLast, Operand::Window { amount, unit }) => {
            let threshold = unit.window_start(now, *amount);
            range(Some(RangeBound::inclusive(RangeValue::Instant(threshold))), None)
        }

        (FieldKind::Text, Equals, Operand::Text(v)) => FilterKind::Pattern {
            field,
            pattern: PatternKind::Exact,
            value: v.clone(),
        },
        (FieldKind::Text, Contains, Operand::Text(v)) => FilterKind::Pattern {
            field,
            pattern: PatternKind::Contains,
            value: v.clone(),
        },
        (FieldKind::Text, StartsWith, Operand::Text(v)) => FilterKind::Pattern {
            field,
            pattern: PatternKind::Prefix,
            value: v.clone(),
        },
        (FieldKind::Text, EndsWith, Operand::Text(v)) => FilterKind::Pattern {
            field,
            pattern: PatternKind::Suffix,
            value: v.clone(),
        },

        (FieldKind::Tags, Contains, Operand::Text(v)) => FilterKind::SetContains {
            field,
            value: v.clone(),
        },

        (_, IsEmpty, Operand::None) => FilterKind::Empty { field },

        _ => {
            return Err(CrmError::unsupported(format!(
                "'{}' cannot be translated for field '{}' (condition {})",
                op,
                field,
                condition.id()
            )))
        }
    };
    Ok(StoreQuery::filter(kind, negated))
}

/// Which native operations a customer store can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueryCapabilities {
    /// Store accepts filtered queries at all; otherwise only `list_all`.
    pub queryable: bool,
    pub range: bool,
    pub set_containment: bool,
    pub pattern: bool,
    pub emptiness: bool,
    /// Levels of nested OR the store can compose natively.
    pub max_or_depth: usize,
    /// Store can answer count-only queries.
    pub count: bool,
}

impl QueryCapabilities {
    /// `list_all` only; every rule is evaluated in memory.
    pub fn list_only() -> Self {
        Self {
            queryable: false,
            range: false,
            set_containment: false,
            pattern: false,
            emptiness: false,
            max_or_depth: 0,
            count: false,
        }
    }

    pub fn full() -> Self {
        Self {
            queryable: true,
            range: true,
            set_containment: true,
            pattern: true,
            emptiness: true,
            max_or_depth: usize::MAX,
            count: true,
        }
    }

    pub fn supports(&self, kind: &FilterKind) -> bool {
        match kind {
            FilterKind::Range { .. } => self.range,
            FilterKind::SetContains { .. } => self.set_containment,
            FilterKind::Pattern { .. } => self.pattern,
            FilterKind::Empty { .. } => self.emptiness,
        }
    }
}

/// What to send to the store, and whether its answer is already exact.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryPlan {
    pub pushdown: StoreQuery,
    /// `false` means `pushdown` returns a superset that must be rechecked
    /// in memory.
    pub exact: bool,
}

/// Fit `query` to `caps`. Fragments the store cannot run, and OR groups
/// nested deeper than it supports, are widened to `MatchAll`. Negation only
/// lives inside leaf fragments, so widening a fragment always yields a
/// superset of the exact answer.
pub fn plan(query: &StoreQuery, caps: &QueryCapabilities) -> QueryPlan {
    let (pushdown, exact) = widen(query, caps, 0);
    QueryPlan { pushdown, exact }
}

fn widen(query: &StoreQuery, caps: &QueryCapabilities, or_depth: usize) -> (StoreQuery, bool) {
    match query {
        StoreQuery::MatchAll | StoreQuery::MatchNone => (query.clone(), true),
        StoreQuery::Filter(filter) => {
            if caps.supports(&filter.kind) {
                (query.clone(), true)
            } else {
                (StoreQuery::MatchAll, false)
            }
        }
        StoreQuery::And(parts) => {
            let mut exact = true;
            let widened = parts
                .iter()
                .map(|p| {
                    let (q, e) = widen(p, caps, or_depth);
                    exact &= e;
                    q
                })
                .collect();
            (StoreQuery::and(widened), exact)
        }
        StoreQuery::Or(parts) => {
            if or_depth >= caps.max_or_depth {
                return (StoreQuery::MatchAll, false);
            }
            let mut exact = true;
            let widened = parts
                .iter()
                .map(|p| {
                    let (q, e) = widen(p, caps, or_depth + 1);
                    exact &= e;
                    q
                })
                .collect();
            (StoreQuery::or(widened), exact)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{validate_rule, DEFAULT_MAX_DEPTH};
    use serde_json::json;

    fn query(json: serde_json::Value) -> StoreQuery {
        let rule = validate_rule(&json, DEFAULT_MAX_DEPTH).unwrap();
        to_query(&rule, Utc::now()).unwrap()
    }

    #[test]
    fn test_single_condition_becomes_range() {
        let q = query(json!({"operator": "AND", "conditions": [
            {"id": "1", "field": "total_spend", "operation": "greaterThan", "value": 10000}
        ]}));
        match q {
            StoreQuery::Filter(Filter {
                kind: FilterKind::Range { field, lower, upper },
                negated,
            }) => {
                assert_eq!(field, Field::TotalSpend);
                assert_eq!(lower, Some(RangeBound::exclusive(RangeValue::Number(10000.0))));
                assert!(upper.is_none());
                assert!(!negated);
            }
            other => panic!("unexpected query {other:?}"),
        }
    }

    #[test]
    fn test_negated_operators_set_flag() {
        let q = query(json!({"field": "tags", "operation": "notContains", "value": "vip"}));
        assert_eq!(
            q,
            StoreQuery::Filter(Filter {
                kind: FilterKind::SetContains {
                    field: Field::Tags,
                    value: "vip".into()
                },
                negated: true,
            })
        );
    }

    #[test]
    fn test_composition_is_flattened() {
        let q = query(json!({"operator": "AND", "conditions": [
            {"id": "1", "field": "email", "operation": "contains", "value": "a"},
            {"operator": "AND", "conditions": [
                {"id": "2", "field": "email", "operation": "contains", "value": "b"},
                {"id": "3", "field": "email", "operation": "contains", "value": "c"}
            ]}
        ]}));
        match q {
            StoreQuery::And(parts) => assert_eq!(parts.len(), 3),
            other => panic!("unexpected query {other:?}"),
        }
    }

    #[test]
    fn test_empty_group_is_match_none() {
        assert_eq!(to_query(&RuleNode::or(Vec::new()), Utc::now()).unwrap(), StoreQuery::MatchNone);
        let nested = RuleNode::or(vec![RuleNode::and(Vec::new())]);
        assert_eq!(to_query(&nested, Utc::now()).unwrap(), StoreQuery::MatchNone);
    }

    #[test]
    fn test_plan_full_capabilities_is_exact() {
        let q = query(json!({"operator": "OR", "conditions": [
            {"id": "1", "field": "total_visits", "operation": "equals", "value": 0},
            {"operator": "AND", "conditions": [
                {"id": "2", "field": "tags", "operation": "contains", "value": "vip"},
                {"operator": "OR", "conditions": [
                    {"id": "3", "field": "address", "operation": "isEmpty"},
                    {"id": "4", "field": "email", "operation": "endsWith", "value": ".org"}
                ]}
            ]}
        ]}));
        let plan = plan(&q, &QueryCapabilities::full());
        assert!(plan.exact);
        assert_eq!(plan.pushdown, q);
    }

    #[test]
    fn test_plan_widens_deep_or() {
        let q = query(json!({"operator": "AND", "conditions": [
            {"id": "1", "field": "total_spend", "operation": "greaterThan", "value": 10},
            {"operator": "OR", "conditions": [
                {"id": "2", "field": "tags", "operation": "contains", "value": "vip"},
                {"operator": "AND", "conditions": [
                    {"id": "3", "field": "total_visits", "operation": "greaterThan", "value": 1},
                    {"operator": "OR", "conditions": [
                        {"id": "4", "field": "address", "operation": "isEmpty"},
                        {"id": "5", "field": "email", "operation": "endsWith", "value": ".org"}
                    ]}
                ]}
            ]}
        ]}));
        assert_eq!(q.or_depth(), 2);

        let caps = QueryCapabilities {
            max_or_depth: 1,
            ..QueryCapabilities::full()
        };
        let plan = plan(&q, &caps);
        assert!(!plan.exact);
        assert_eq!(plan.pushdown.or_depth(), 1);

        let flat = QueryCapabilities {
            max_or_depth: 0,
            ..QueryCapabilities::full()
        };
        let plan = super::plan(&q, &flat);
        assert!(!plan.exact);
        // only the spend range survives
        assert!(matches!(plan.pushdown, StoreQuery::Filter(_)));
    }

    #[test]
    fn test_plan_widens_unsupported_fragment() {
        let q = query(json!({"operator": "AND", "conditions": [
            {"id": "1", "field": "total_spend", "operation": "greaterThan", "value": 10},
            {"id": "2", "field": "email", "operation": "contains", "value": "x"}
        ]}));
        let caps = QueryCapabilities {
            pattern: false,
            ..QueryCapabilities::full()
        };
        let plan = plan(&q, &caps);
        assert!(!plan.exact);
        assert!(matches!(plan.pushdown, StoreQuery::Filter(Filter { kind: FilterKind::Range { .. }, .. })));
    }
}
