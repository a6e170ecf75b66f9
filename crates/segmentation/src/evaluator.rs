//! In-memory predicate evaluation: decides whether one customer matches a
//! rule tree.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use crm_core::{CrmError, CrmResult, Customer};

use crate::rules::{Condition, Field, LogicalOperator, Operand, OperatorKind, RuleGroup, RuleNode};

/// A field value read from a subject, with semantic defaults already applied.
#[derive(Debug, Clone, Copy)]
pub enum FieldValue<'a> {
    Number(f64),
    Timestamp(Option<DateTime<Utc>>),
    Text(Option<&'a str>),
    Tags(&'a BTreeSet<String>),
}

/// Field-access capability the evaluator reads through.
pub trait FieldSource {
    fn field_value(&self, field: Field) -> FieldValue<'_>;
}

impl FieldSource for Customer {
    fn field_value(&self, field: Field) -> FieldValue<'_> {
        match field {
            Field::TotalSpend => FieldValue::Number(self.total_spend),
            Field::TotalVisits => FieldValue::Number(self.total_visits as f64),
            Field::LastVisitDate => FieldValue::Timestamp(self.last_visit_date),
            Field::CreatedAt => FieldValue::Timestamp(Some(self.created_at)),
            Field::Email => FieldValue::Text(Some(self.email.as_str())),
            Field::Address => FieldValue::Text(self.address.as_deref()),
            Field::FirstName => FieldValue::Text(Some(self.first_name.as_str())),
            Field::LastName => FieldValue::Text(Some(self.last_name.as_str())),
            Field::Tags => FieldValue::Tags(&self.tags),
        }
    }
}

/// Evaluates rules against subjects as of a fixed instant, so every subject
/// in one resolution sees the same time window.
#[derive(Debug, Clone, Copy)]
pub struct Evaluator {
    now: DateTime<Utc>,
}

impl Evaluator {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self { now }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn matches<S: FieldSource + ?Sized>(&self, subject: &S, rule: &RuleNode) -> CrmResult<bool> {
        match rule {
            RuleNode::Group(group) => self.matches_group(subject, group),
            RuleNode::Condition(condition) => self.matches_condition(subject, condition),
        }
    }

    fn matches_group<S: FieldSource + ?Sized>(&self, subject: &S, group: &RuleGroup) -> CrmResult<bool> {
        // Empty groups never match, for either operator.
        if group.conditions.is_empty() {
            return Ok(false);
        }
        match group.operator {
            LogicalOperator::And => {
                for child in &group.conditions {
                    if !self.matches(subject, child)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            LogicalOperator::Or => {
                for child in &group.conditions {
                    if self.matches(subject, child)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    fn matches_condition<S: FieldSource + ?Sized>(
        &self,
        subject: &S,
        condition: &Condition,
    ) -> CrmResult<bool> {
        use OperatorKind::*;

        let op = condition.operation();
        let value = subject.field_value(condition.field());
        let operand = condition.operand();

        let matched = match (value, op, operand) {
            // Negated operators are exact complements of their positive form.
            (_, NotEquals, _) => !self.positive(value, Equals, operand, condition)?,
            (_, NotContains, _) => !self.positive(value, Contains, operand, condition)?,
            (_, NotBetween, _) => !self.positive(value, Between, operand, condition)?,
            (_, IsNotEmpty, _) => !self.positive(value, IsEmpty, operand, condition)?,
            (_, IsNotInLast, _) => !self.positive(value, IsInLast, operand, condition)?,
            _ => self.positive(value, op, operand, condition)?,
        };
        Ok(matched)
    }

    fn positive(
        &self,
        value: FieldValue<'_>,
        op: OperatorKind,
        operand: &Operand,
        condition: &Condition,
    ) -> CrmResult<bool> {
        use OperatorKind::*;

        let matched = match (value, op, operand) {
            (FieldValue::Number(n), Equals, Operand::Number(v)) => n == *v,
            (FieldValue::Number(n), GreaterThan, Operand::Number(v)) => n > *v,
            (FieldValue::Number(n), GreaterThanOrEqual, Operand::Number(v)) => n >= *v,
            (FieldValue::Number(n), LessThan, Operand::Number(v)) => n < *v,
            (FieldValue::Number(n), LessThanOrEqual, Operand::Number(v)) => n <= *v,
            (FieldValue::Number(n), Between, Operand::NumberRange(lo, hi)) => *lo <= n && n <= *hi,
            (FieldValue::Number(_), IsEmpty, Operand::None) => false,

            (FieldValue::Timestamp(ts), Equals, Operand::Instant(v)) => {
                ts.is_some_and(|t| t.date_naive() == v.date_naive())
            }
            (FieldValue::Timestamp(ts), GreaterThan, Operand::Instant(v)) => ts.is_some_and(|t| t > *v),
            (FieldValue::Timestamp(ts), GreaterThanOrEqual, Operand::Instant(v)) => {
                ts.is_some_and(|t| t >= *v)
            }
            (FieldValue::Timestamp(ts), LessThan, Operand::Instant(v)) => ts.is_some_and(|t| t < *v),
            (FieldValue::Timestamp(ts), LessThanOrEqual, Operand::Instant(v)) => {
                ts.is_some_and(|t| t <= *v)
            }
            (FieldValue::Timestamp(ts), Between, Operand::InstantRange(lo, hi)) => {
                ts.is_some_and(|t| *lo <= t && t <= *hi)
            }
            (FieldValue::Timestamp(ts), IsEmpty, Operand::None) => ts.is_none(),
            (FieldValue::Timestamp(ts), IsInLast, Operand::Window { amount, unit }) => {
                let threshold = unit.window_start(self.now, *amount);
                ts.is_some_and(|t| t >= threshold)
            }

            (FieldValue::Text(text), Equals, Operand::Text(v)) => {
                text.is_some_and(|t| t.to_lowercase() == v.to_lowercase())
            }
            (FieldValue::Text(text), Contains, Operand::Text(v)) => {
                text.is_some_and(|t| t.to_lowercase().contains(&v.to_lowercase()))
            }
            (FieldValue::Text(text), StartsWith, Operand::Text(v)) => {
                text.is_some_and(|t| t.to_lowercase().starts_with(&v.to_lowercase()))
            }
            (FieldValue::Text(text), EndsWith, Operand::Text(v)) => {
                text.is_some_and(|t| t.to_lowercase().ends_with(&v.to_lowercase()))
            }
            (FieldValue::Text(text), IsEmpty, Operand::None) => text.map_or(true, str::is_empty),

            (FieldValue::Tags(tags), Contains, Operand::Text(v)) => tags.contains(v),
            (FieldValue::Tags(tags), IsEmpty, Operand::None) => tags.is_empty(),

            _ => {
                return Err(CrmError::unsupported(format!(
                    "'{}' cannot be evaluated on field '{}' (condition {})",
                    condition.operation(),
                    condition.field(),
                    condition.id()
                )))
            }
        };
        Ok(matched)
    }
}

/// Convenience wrapper: evaluate `rule` for one customer as of `now`.
pub fn matches(customer: &Customer, rule: &RuleNode, now: DateTime<Utc>) -> CrmResult<bool> {
    Evaluator::at(now).matches(customer, rule)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{validate_rule, DEFAULT_MAX_DEPTH};
    use chrono::Duration;
    use serde_json::json;
    use uuid::Uuid;

    fn customer() -> Customer {
        Customer {
            id: Uuid::new_v4(),
            email: "Jane.Doe@Example.com".into(),
            first_name: "Jane".into(),
            last_name: "Doe".into(),
            phone: None,
            address: None,
            total_spend: 15000.0,
            total_visits: 2,
            last_visit_date: None,
            tags: ["vip".to_string()].into_iter().collect(),
            created_at: Utc::now() - Duration::days(400),
        }
    }

    fn rule(json: serde_json::Value) -> RuleNode {
        validate_rule(&json, DEFAULT_MAX_DEPTH).unwrap()
    }

    fn check(c: &Customer, json: serde_json::Value) -> bool {
        matches(c, &rule(json), Utc::now()).unwrap()
    }

    #[test]
    fn test_spend_greater_than() {
        assert!(check(
            &customer(),
            json!({"operator": "AND", "conditions": [
                {"id": "1", "field": "total_spend", "operation": "greaterThan", "value": 10000}
            ]})
        ));
    }

    #[test]
    fn test_or_matches_on_second_condition() {
        assert!(check(
            &customer(),
            json!({"operator": "OR", "conditions": [
                {"id": "1", "field": "total_visits", "operation": "equals", "value": 0},
                {"id": "2", "field": "tags", "operation": "contains", "value": "vip"}
            ]})
        ));
    }

    #[test]
    fn test_is_not_in_last() {
        let now = Utc::now();
        let rule = rule(json!({"field": "last_visit_date", "operation": "isNotInLast", "value": 90, "unit": "days"}));

        let mut lapsed = customer();
        lapsed.last_visit_date = Some(now - Duration::days(200));
        assert!(matches(&lapsed, &rule, now).unwrap());

        let mut recent = customer();
        recent.last_visit_date = Some(now - Duration::days(10));
        assert!(!matches(&recent, &rule, now).unwrap());

        let never = customer();
        assert!(matches(&never, &rule, now).unwrap());
    }

    #[test]
    fn test_is_in_last_boundary_inclusive() {
        let now = Utc::now();
        let rule = rule(json!({"field": "last_visit_date", "operation": "isInLast", "value": 7}));
        let mut c = customer();
        c.last_visit_date = Some(now - Duration::days(7));
        assert!(matches(&c, &rule, now).unwrap());
        c.last_visit_date = Some(now - Duration::days(7) - Duration::seconds(1));
        assert!(!matches(&c, &rule, now).unwrap());
    }

    #[test]
    fn test_string_operators_case_insensitive() {
        let c = customer();
        assert!(check(&c, json!({"field": "email", "operation": "endsWith", "value": "@example.COM"})));
        assert!(check(&c, json!({"field": "email", "operation": "startsWith", "value": "jane"})));
        assert!(check(&c, json!({"field": "first_name", "operation": "contains", "value": "AN"})));
        assert!(check(&c, json!({"field": "email", "operation": "equals", "value": "jane.doe@example.com"})));
        assert!(!check(&c, json!({"field": "last_name", "operation": "notContains", "value": "do"})));
    }

    #[test]
    fn test_tags_are_set_membership() {
        let c = customer();
        assert!(check(&c, json!({"field": "tags", "operation": "contains", "value": "vip"})));
        assert!(!check(&c, json!({"field": "tags", "operation": "contains", "value": "vi"})));
        assert!(check(&c, json!({"field": "tags", "operation": "notContains", "value": "churned"})));
        assert!(check(&c, json!({"field": "tags", "operation": "isNotEmpty"})));
    }

    #[test]
    fn test_empty_checks() {
        let mut c = customer();
        assert!(check(&c, json!({"field": "address", "operation": "isEmpty"})));
        c.address = Some(String::new());
        assert!(check(&c, json!({"field": "address", "operation": "isEmpty"})));
        c.address = Some("1 Main St".into());
        assert!(check(&c, json!({"field": "address", "operation": "isNotEmpty"})));
        assert!(check(&c, json!({"field": "last_visit_date", "operation": "isEmpty"})));
        assert!(!check(&c, json!({"field": "total_spend", "operation": "isEmpty"})));
    }

    #[test]
    fn test_absent_text_semantics() {
        let c = customer();
        assert!(!check(&c, json!({"field": "address", "operation": "contains", "value": "x"})));
        assert!(check(&c, json!({"field": "address", "operation": "notContains", "value": "x"})));
        assert!(check(&c, json!({"field": "address", "operation": "notEquals", "value": "x"})));
    }

    #[test]
    fn test_between_inclusive_and_equivalence() {
        let c = customer();
        for (lo, hi) in [(15000.0, 20000.0), (0.0, 15000.0), (15000.5, 16000.0), (0.0, 14999.0)] {
            let between = check(&c, json!({"field": "total_spend", "operation": "between", "value": [lo, hi]}));
            let both = check(&c, json!({"operator": "AND", "conditions": [
                {"id": "a", "field": "total_spend", "operation": "greaterThanOrEqual", "value": lo},
                {"id": "b", "field": "total_spend", "operation": "lessThanOrEqual", "value": hi}
            ]}));
            let not_between = check(&c, json!({"field": "total_spend", "operation": "notBetween", "value": [lo, hi]}));
            assert_eq!(between, both);
            assert_eq!(not_between, !between);
        }
    }

    #[test]
    fn test_timestamp_equals_compares_calendar_day() {
        let mut c = customer();
        c.last_visit_date = Some(crate::rules::parse_instant("2024-05-10T18:30:00Z").unwrap());
        assert!(check(&c, json!({"field": "last_visit_date", "operation": "equals", "value": "2024-05-10"})));
        assert!(check(&c, json!({"field": "last_visit_date", "operation": "notEquals", "value": "2024-05-11"})));
    }

    #[test]
    fn test_empty_group_matches_nothing() {
        let c = customer();
        assert!(!matches(&c, &RuleNode::and(Vec::new()), Utc::now()).unwrap());
        assert!(!matches(&c, &RuleNode::or(Vec::new()), Utc::now()).unwrap());
    }

    #[test]
    fn test_and_short_circuits_before_later_children() {
        // The second child would match; the first failing child decides.
        let c = customer();
        assert!(!check(&c, json!({"operator": "AND", "conditions": [
            {"id": "1", "field": "total_visits", "operation": "greaterThan", "value": 100},
            {"id": "2", "field": "tags", "operation": "contains", "value": "vip"}
        ]})));
    }
}
