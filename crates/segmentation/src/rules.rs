//! Rule AST: boolean predicate trees over customer attributes, plus the
//! validating parser for the persisted JSON form.
//!
//! JSON shape (durable, stored in segment `rules` columns):
//! groups are `{"operator": "AND"|"OR", "conditions": [...]}`, conditions are
//! `{"id", "field", "operation", "value", "unit"}`.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Months, NaiveDate, Utc};
use crm_core::{CrmError, CrmResult};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Depth limit applied when a rule is deserialized without explicit config.
pub const DEFAULT_MAX_DEPTH: usize = 16;

// ─── Vocabulary ─────────────────────────────────────────────────────────────

/// Customer attributes a condition can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    TotalSpend,
    TotalVisits,
    LastVisitDate,
    CreatedAt,
    Email,
    Address,
    FirstName,
    LastName,
    Tags,
}

/// Semantic type of a field; decides which operators apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Numeric,
    Timestamp,
    Text,
    Tags,
}

impl Field {
    pub const ALL: [Field; 9] = [
        Field::TotalSpend,
        Field::TotalVisits,
        Field::LastVisitDate,
        Field::CreatedAt,
        Field::Email,
        Field::Address,
        Field::FirstName,
        Field::LastName,
        Field::Tags,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Field::TotalSpend => "total_spend",
            Field::TotalVisits => "total_visits",
            Field::LastVisitDate => "last_visit_date",
            Field::CreatedAt => "created_at",
            Field::Email => "email",
            Field::Address => "address",
            Field::FirstName => "first_name",
            Field::LastName => "last_name",
            Field::Tags => "tags",
        }
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            Field::TotalSpend | Field::TotalVisits => FieldKind::Numeric,
            Field::LastVisitDate | Field::CreatedAt => FieldKind::Timestamp,
            Field::Email | Field::Address | Field::FirstName | Field::LastName => FieldKind::Text,
            Field::Tags => FieldKind::Tags,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Field {
    type Err = CrmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Field::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| CrmError::invalid_rule(format!("unknown field '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperatorKind {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    GreaterThanOrEqual,
    LessThanOrEqual,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Between,
    NotBetween,
    IsEmpty,
    IsNotEmpty,
    IsInLast,
    IsNotInLast,
}

/// Shape of the `value` an operator expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Nullary,
    Scalar,
    Pair,
}

impl OperatorKind {
    pub const ALL: [OperatorKind; 16] = [
        OperatorKind::Equals,
        OperatorKind::NotEquals,
        OperatorKind::GreaterThan,
        OperatorKind::LessThan,
        OperatorKind::GreaterThanOrEqual,
        OperatorKind::LessThanOrEqual,
        OperatorKind::Contains,
        OperatorKind::NotContains,
        OperatorKind::StartsWith,
        OperatorKind::EndsWith,
        OperatorKind::Between,
        OperatorKind::NotBetween,
        OperatorKind::IsEmpty,
        OperatorKind::IsNotEmpty,
        OperatorKind::IsInLast,
        OperatorKind::IsNotInLast,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperatorKind::Equals => "equals",
            OperatorKind::NotEquals => "notEquals",
            OperatorKind::GreaterThan => "greaterThan",
            OperatorKind::LessThan => "lessThan",
            OperatorKind::GreaterThanOrEqual => "greaterThanOrEqual",
            OperatorKind::LessThanOrEqual => "lessThanOrEqual",
            OperatorKind::Contains => "contains",
            OperatorKind::NotContains => "notContains",
            OperatorKind::StartsWith => "startsWith",
            OperatorKind::EndsWith => "endsWith",
            OperatorKind::Between => "between",
            OperatorKind::NotBetween => "notBetween",
            OperatorKind::IsEmpty => "isEmpty",
            OperatorKind::IsNotEmpty => "isNotEmpty",
            OperatorKind::IsInLast => "isInLast",
            OperatorKind::IsNotInLast => "isNotInLast",
        }
    }

    pub fn arity(&self) -> Arity {
        match self {
            OperatorKind::IsEmpty | OperatorKind::IsNotEmpty => Arity::Nullary,
            OperatorKind::Between | OperatorKind::NotBetween => Arity::Pair,
            _ => Arity::Scalar,
        }
    }

    /// Whether the operator is defined for fields of `kind`.
    pub fn applies_to(&self, kind: FieldKind) -> bool {
        use OperatorKind::*;
        match kind {
            FieldKind::Numeric => matches!(
                self,
                Equals
                    | NotEquals
                    | GreaterThan
                    | LessThan
                    | GreaterThanOrEqual
                    | LessThanOrEqual
                    | Between
                    | NotBetween
                    | IsEmpty
                    | IsNotEmpty
            ),
            FieldKind::Timestamp => !matches!(self, Contains | NotContains | StartsWith | EndsWith),
            FieldKind::Text => matches!(
                self,
                Equals | NotEquals | Contains | NotContains | StartsWith | EndsWith | IsEmpty | IsNotEmpty
            ),
            FieldKind::Tags => matches!(self, Contains | NotContains | IsEmpty | IsNotEmpty),
        }
    }
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperatorKind {
    type Err = CrmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperatorKind::ALL
            .iter()
            .copied()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| CrmError::unsupported(format!("'{s}' is not a known operation")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Days,
    Weeks,
    Months,
}

impl TimeUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeUnit::Days => "days",
            TimeUnit::Weeks => "weeks",
            TimeUnit::Months => "months",
        }
    }

    /// `now - amount·unit`. Months are calendar months. Windows reaching past
    /// the representable range start at the earliest instant.
    pub fn window_start(&self, now: DateTime<Utc>, amount: u32) -> DateTime<Utc> {
        match self {
            TimeUnit::Days => Duration::try_days(i64::from(amount)).and_then(|d| now.checked_sub_signed(d)),
            TimeUnit::Weeks => Duration::try_weeks(i64::from(amount)).and_then(|d| now.checked_sub_signed(d)),
            TimeUnit::Months => now.checked_sub_months(Months::new(amount)),
        }
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

impl FromStr for TimeUnit {
    type Err = CrmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "day" | "days" => Ok(TimeUnit::Days),
            "week" | "weeks" => Ok(TimeUnit::Weeks),
            "month" | "months" => Ok(TimeUnit::Months),
            other => Err(CrmError::invalid_rule(format!("unknown time unit '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicalOperator {
    And,
    Or,
}

impl FromStr for LogicalOperator {
    type Err = CrmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "AND" => Ok(LogicalOperator::And),
            "OR" => Ok(LogicalOperator::Or),
            other => Err(CrmError::invalid_rule(format!(
                "group operator must be AND or OR, got '{other}'"
            ))),
        }
    }
}

// ─── Values ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Number(f64),
    Text(String),
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Number(v)
    }
}

impl From<u64> for Scalar {
    fn from(v: u64) -> Self {
        Scalar::Number(v as f64)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Text(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::Text(v)
    }
}

/// The condition's `value` as written by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleValue {
    Single(Scalar),
    Pair(Scalar, Scalar),
}

impl RuleValue {
    fn from_json(value: &serde_json::Value) -> CrmResult<Option<Self>> {
        match value {
            serde_json::Value::Null => Ok(None),
            serde_json::Value::Array(items) => match items.as_slice() {
                [lo, hi] => Ok(Some(RuleValue::Pair(
                    scalar_from_json(lo)?,
                    scalar_from_json(hi)?,
                ))),
                _ => Err(CrmError::invalid_rule(format!(
                    "range value must have exactly two bounds, got {}",
                    items.len()
                ))),
            },
            other => Ok(Some(RuleValue::Single(scalar_from_json(other)?))),
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            RuleValue::Single(s) => scalar_to_json(s),
            RuleValue::Pair(lo, hi) => serde_json::Value::Array(vec![scalar_to_json(lo), scalar_to_json(hi)]),
        }
    }
}

fn scalar_from_json(value: &serde_json::Value) -> CrmResult<Scalar> {
    match value {
        serde_json::Value::Number(n) => n
            .as_f64()
            .map(Scalar::Number)
            .ok_or_else(|| CrmError::invalid_rule(format!("number {n} out of range"))),
        serde_json::Value::String(s) => Ok(Scalar::Text(s.clone())),
        other => Err(CrmError::invalid_rule(format!(
            "condition values must be numbers or strings, got {other}"
        ))),
    }
}

fn scalar_to_json(scalar: &Scalar) -> serde_json::Value {
    match scalar {
        Scalar::Number(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Scalar::Text(s) => serde_json::Value::String(s.clone()),
    }
}

/// Operand compiled from `RuleValue` against the field's type. Evaluation
/// and query translation read this, never the raw value.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    None,
    Number(f64),
    NumberRange(f64, f64),
    Text(String),
    Instant(DateTime<Utc>),
    InstantRange(DateTime<Utc>, DateTime<Utc>),
    Window { amount: u32, unit: TimeUnit },
}

fn as_number(scalar: &Scalar) -> CrmResult<f64> {
    let n = match scalar {
        Scalar::Number(n) => *n,
        Scalar::Text(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| CrmError::invalid_rule(format!("'{s}' is not a number")))?,
    };
    if n.is_finite() {
        Ok(n)
    } else {
        Err(CrmError::invalid_rule("numeric values must be finite"))
    }
}

fn as_text(scalar: &Scalar) -> CrmResult<String> {
    match scalar {
        Scalar::Text(s) => Ok(s.clone()),
        Scalar::Number(n) => Err(CrmError::invalid_rule(format!(
            "expected a string value, got number {n}"
        ))),
    }
}

/// Parses RFC 3339 timestamps or bare `YYYY-MM-DD` dates (midnight UTC).
pub fn parse_instant(raw: &str) -> CrmResult<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| CrmError::invalid_rule(format!("'{raw}' is not a date or RFC 3339 timestamp")))
}

fn as_instant(scalar: &Scalar) -> CrmResult<DateTime<Utc>> {
    match scalar {
        Scalar::Text(s) => parse_instant(s),
        Scalar::Number(n) => Err(CrmError::invalid_rule(format!(
            "expected a date string, got number {n}"
        ))),
    }
}

fn as_window_amount(scalar: &Scalar) -> CrmResult<u32> {
    let n = as_number(scalar)?;
    if n < 0.0 || n.fract() != 0.0 || n > f64::from(u32::MAX) {
        return Err(CrmError::invalid_rule(format!(
            "time window must be a non-negative whole number, got {n}"
        )));
    }
    Ok(n as u32)
}

// ─── Nodes ──────────────────────────────────────────────────────────────────

/// A leaf predicate. Constructed only through [`Condition::new`], so the
/// operand always agrees with the field type and operator arity.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    id: String,
    field: Field,
    operation: OperatorKind,
    value: Option<RuleValue>,
    unit: Option<TimeUnit>,
    operand: Operand,
}

impl Condition {
    pub fn new(
        id: impl Into<String>,
        field: Field,
        operation: OperatorKind,
        value: Option<RuleValue>,
        unit: Option<TimeUnit>,
    ) -> CrmResult<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(CrmError::invalid_rule("condition id must not be empty"));
        }
        let kind = field.kind();
        if !operation.applies_to(kind) {
            return Err(CrmError::invalid_rule(format!(
                "operation '{operation}' is not applicable to field '{field}'"
            )));
        }

        let operand = match (operation.arity(), &value) {
            (Arity::Nullary, None) => Operand::None,
            (Arity::Nullary, Some(_)) => {
                return Err(CrmError::invalid_rule(format!(
                    "operation '{operation}' takes no value"
                )))
            }
            (Arity::Scalar, Some(RuleValue::Single(s))) => match (kind, operation) {
                (FieldKind::Timestamp, OperatorKind::IsInLast | OperatorKind::IsNotInLast) => {
                    Operand::Window {
                        amount: as_window_amount(s)?,
                        unit: unit.unwrap_or(TimeUnit::Days),
                    }
                }
                (FieldKind::Numeric, _) => Operand::Number(as_number(s)?),
                (FieldKind::Timestamp, _) => Operand::Instant(as_instant(s)?),
                (FieldKind::Text | FieldKind::Tags, _) => Operand::Text(as_text(s)?),
            },
            (Arity::Pair, Some(RuleValue::Pair(lo, hi))) => match kind {
                FieldKind::Numeric => {
                    let (lo, hi) = (as_number(lo)?, as_number(hi)?);
                    if lo > hi {
                        return Err(CrmError::invalid_rule(format!(
                            "range lower bound {lo} exceeds upper bound {hi}"
                        )));
                    }
                    Operand::NumberRange(lo, hi)
                }
                FieldKind::Timestamp => {
                    let (lo, hi) = (as_instant(lo)?, as_instant(hi)?);
                    if lo > hi {
                        return Err(CrmError::invalid_rule(format!(
                            "range lower bound {lo} is after upper bound {hi}"
                        )));
                    }
                    Operand::InstantRange(lo, hi)
                }
                FieldKind::Text | FieldKind::Tags => {
                    return Err(CrmError::invalid_rule(format!(
                        "operation '{operation}' is not applicable to field '{field}'"
                    )))
                }
            },
            (Arity::Scalar, _) => {
                return Err(CrmError::invalid_rule(format!(
                    "operation '{operation}' requires a single value"
                )))
            }
            (Arity::Pair, _) => {
                return Err(CrmError::invalid_rule(format!(
                    "operation '{operation}' requires a [lower, upper] pair"
                )))
            }
        };

        Ok(Self {
            id,
            field,
            operation,
            value,
            unit,
            operand,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn field(&self) -> Field {
        self.field
    }

    pub fn operation(&self) -> OperatorKind {
        self.operation
    }

    pub fn value(&self) -> Option<&RuleValue> {
        self.value.as_ref()
    }

    pub fn unit(&self) -> Option<TimeUnit> {
        self.unit
    }

    pub fn operand(&self) -> &Operand {
        &self.operand
    }
}

/// Boolean combination of child nodes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleGroup {
    pub operator: LogicalOperator,
    pub conditions: Vec<RuleNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuleNode {
    Group(RuleGroup),
    Condition(Condition),
}

impl RuleNode {
    pub fn and(conditions: Vec<RuleNode>) -> Self {
        RuleNode::Group(RuleGroup {
            operator: LogicalOperator::And,
            conditions,
        })
    }

    pub fn or(conditions: Vec<RuleNode>) -> Self {
        RuleNode::Group(RuleGroup {
            operator: LogicalOperator::Or,
            conditions,
        })
    }

    /// Number of leaf conditions in the tree.
    pub fn condition_count(&self) -> usize {
        match self {
            RuleNode::Condition(_) => 1,
            RuleNode::Group(g) => g.conditions.iter().map(RuleNode::condition_count).sum(),
        }
    }

    /// Nesting depth counted in groups; a bare condition has depth 0.
    pub fn depth(&self) -> usize {
        match self {
            RuleNode::Condition(_) => 0,
            RuleNode::Group(g) => 1 + g.conditions.iter().map(RuleNode::depth).max().unwrap_or(0),
        }
    }

    /// Structural validation for trees built in code: groups are non-empty,
    /// condition ids are unique and nesting stays within `max_depth`.
    /// Applies the same checks as `validate_rule`.
    pub fn check(&self, max_depth: usize) -> CrmResult<()> {
        let mut ids = HashSet::new();
        self.check_node(0, max_depth, &mut ids)
    }

    fn check_node(&self, depth: usize, max_depth: usize, ids: &mut HashSet<String>) -> CrmResult<()> {
        match self {
            RuleNode::Condition(c) => claim_id(ids, c.id()),
            RuleNode::Group(g) => {
                check_group(depth, max_depth, g.conditions.len())?;
                g.conditions
                    .iter()
                    .try_for_each(|child| child.check_node(depth + 1, max_depth, ids))
            }
        }
    }
}

fn check_group(depth: usize, max_depth: usize, children: usize) -> CrmResult<()> {
    if depth >= max_depth {
        return Err(CrmError::invalid_rule(format!(
            "rule nesting exceeds maximum depth of {max_depth}"
        )));
    }
    if children == 0 {
        return Err(CrmError::invalid_rule("group must contain at least one condition"));
    }
    Ok(())
}

fn claim_id(ids: &mut HashSet<String>, id: &str) -> CrmResult<()> {
    if ids.insert(id.to_string()) {
        Ok(())
    } else {
        Err(CrmError::invalid_rule(format!("duplicate condition id '{id}'")))
    }
}

// ─── Wire form ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    field: String,
    #[serde(alias = "op")]
    operation: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unit: Option<String>,
}

impl From<&Condition> for RawCondition {
    fn from(c: &Condition) -> Self {
        Self {
            id: Some(c.id.clone()),
            field: c.field.as_str().to_string(),
            operation: c.operation.as_str().to_string(),
            value: c.value.as_ref().map(RuleValue::to_json).unwrap_or_default(),
            unit: c.unit.map(|u| u.as_str().to_string()),
        }
    }
}

impl Serialize for Condition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        RawCondition::from(self).serialize(serializer)
    }
}

impl Serialize for RuleNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RuleNode::Group(g) => g.serialize(serializer),
            RuleNode::Condition(c) => c.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for RuleNode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        validate_rule(&value, DEFAULT_MAX_DEPTH).map_err(D::Error::custom)
    }
}

/// Parse and validate an untrusted rule document.
///
/// Fails with `UnsupportedOperator` for operation names outside the
/// vocabulary and `InvalidRule` for every other structural or type error.
/// Conditions without an `id` get a fresh one; duplicate ids are rejected.
pub fn validate_rule(json: &serde_json::Value, max_depth: usize) -> CrmResult<RuleNode> {
    let mut ids = HashSet::new();
    parse_node(json, 0, max_depth, &mut ids)
}

fn parse_node(
    json: &serde_json::Value,
    depth: usize,
    max_depth: usize,
    ids: &mut HashSet<String>,
) -> CrmResult<RuleNode> {
    let obj = json
        .as_object()
        .ok_or_else(|| CrmError::invalid_rule(format!("rule node must be an object, got {json}")))?;

    if obj.contains_key("conditions") || obj.contains_key("operator") {
        let operator = obj
            .get("operator")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CrmError::invalid_rule("group is missing a string 'operator'"))?
            .parse::<LogicalOperator>()?;
        let children = obj
            .get("conditions")
            .and_then(|v| v.as_array())
            .ok_or_else(|| CrmError::invalid_rule("group is missing a 'conditions' array"))?;
        check_group(depth, max_depth, children.len())?;
        let conditions = children
            .iter()
            .map(|child| parse_node(child, depth + 1, max_depth, ids))
            .collect::<CrmResult<Vec<_>>>()?;
        return Ok(RuleNode::Group(RuleGroup {
            operator,
            conditions,
        }));
    }

    let raw: RawCondition = serde_json::from_value(json.clone())
        .map_err(|e| CrmError::invalid_rule(format!("malformed condition: {e}")))?;
    let field = raw.field.parse::<Field>()?;
    let operation = raw.operation.parse::<OperatorKind>()?;
    let value = RuleValue::from_json(&raw.value)?;
    let unit = raw.unit.as_deref().map(str::parse::<TimeUnit>).transpose()?;
    let id = raw
        .id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    claim_id(ids, &id)?;
    Ok(RuleNode::Condition(Condition::new(
        id, field, operation, value, unit,
    )?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validate(json: serde_json::Value) -> CrmResult<RuleNode> {
        validate_rule(&json, DEFAULT_MAX_DEPTH)
    }

    #[test]
    fn test_parse_nested_group() {
        let rule = validate(json!({
            "operator": "AND",
            "conditions": [
                {"id": "1", "field": "total_spend", "operation": "greaterThan", "value": 10000},
                {"operator": "OR", "conditions": [
                    {"id": "2", "field": "tags", "operation": "contains", "value": "vip"},
                    {"id": "3", "field": "last_visit_date", "operation": "isInLast", "value": 30, "unit": "days"}
                ]}
            ]
        }))
        .unwrap();
        assert_eq!(rule.condition_count(), 3);
        assert_eq!(rule.depth(), 2);
    }

    #[test]
    fn test_unknown_field_is_invalid() {
        let err = validate(json!({"field": "shoe_size", "operation": "equals", "value": 42})).unwrap_err();
        assert!(matches!(err, CrmError::InvalidRule(_)));
    }

    #[test]
    fn test_unknown_operation_is_unsupported() {
        let err = validate(json!({"field": "email", "op": "fuzzyMatch", "value": "x"})).unwrap_err();
        assert!(matches!(err, CrmError::UnsupportedOperator(_)));
    }

    #[test]
    fn test_operator_field_compatibility() {
        let err = validate(json!({"field": "total_spend", "operation": "contains", "value": "10"})).unwrap_err();
        assert!(matches!(err, CrmError::InvalidRule(_)));
        assert!(validate(json!({"field": "tags", "operation": "contains", "value": "vip"})).is_ok());
        assert!(validate(json!({"field": "address", "operation": "contains", "value": "Main"})).is_ok());
        assert!(validate(json!({"field": "tags", "operation": "greaterThan", "value": "a"})).is_err());
    }

    #[test]
    fn test_between_arity_and_order() {
        assert!(validate(json!({"field": "total_visits", "operation": "between", "value": [1, 5]})).is_ok());
        assert!(validate(json!({"field": "total_visits", "operation": "between", "value": 3})).is_err());
        assert!(validate(json!({"field": "total_visits", "operation": "between", "value": [1, 2, 3]})).is_err());
        let err = validate(json!({"field": "total_visits", "operation": "between", "value": [9, 2]})).unwrap_err();
        assert!(matches!(err, CrmError::InvalidRule(_)));
    }

    #[test]
    fn test_nullary_rejects_value() {
        assert!(validate(json!({"field": "address", "operation": "isEmpty"})).is_ok());
        assert!(validate(json!({"field": "address", "operation": "isEmpty", "value": null})).is_ok());
        assert!(validate(json!({"field": "address", "operation": "isEmpty", "value": "x"})).is_err());
    }

    #[test]
    fn test_empty_group_rejected() {
        let err = validate(json!({"operator": "OR", "conditions": []})).unwrap_err();
        assert!(matches!(err, CrmError::InvalidRule(_)));
    }

    #[test]
    fn test_duplicate_ids_rejected_and_missing_ids_assigned() {
        let dup = validate(json!({"operator": "AND", "conditions": [
            {"id": "a", "field": "email", "operation": "isNotEmpty"},
            {"id": "a", "field": "address", "operation": "isNotEmpty"}
        ]}));
        assert!(dup.is_err());

        let rule = validate(json!({"operator": "AND", "conditions": [
            {"field": "email", "operation": "isNotEmpty"},
            {"field": "address", "operation": "isNotEmpty"}
        ]}))
        .unwrap();
        let RuleNode::Group(group) = rule else { panic!("expected group") };
        let ids: Vec<&str> = group
            .conditions
            .iter()
            .map(|n| match n {
                RuleNode::Condition(c) => c.id(),
                RuleNode::Group(_) => panic!("expected condition"),
            })
            .collect();
        assert_ne!(ids[0], ids[1]);
    }

    #[test]
    fn test_max_depth() {
        let mut node = json!({"id": "leaf", "field": "email", "operation": "isNotEmpty"});
        for _ in 0..4 {
            node = json!({"operator": "AND", "conditions": [node]});
        }
        assert!(validate_rule(&node, 4).is_ok());
        assert!(validate_rule(&node, 3).is_err());
    }

    #[test]
    fn test_window_requires_whole_number() {
        assert!(validate(json!({"field": "created_at", "operation": "isInLast", "value": 2, "unit": "months"})).is_ok());
        assert!(validate(json!({"field": "created_at", "operation": "isInLast", "value": -1})).is_err());
        assert!(validate(json!({"field": "created_at", "operation": "isInLast", "value": 1.5})).is_err());
        assert!(validate(json!({"field": "created_at", "operation": "isInLast", "value": 1, "unit": "years"})).is_err());
    }

    #[test]
    fn test_timestamp_operands() {
        assert!(validate(json!({"field": "created_at", "operation": "greaterThan", "value": "2024-03-01"})).is_ok());
        assert!(validate(json!({"field": "created_at", "operation": "lessThan", "value": "2024-03-01T10:00:00Z"})).is_ok());
        assert!(validate(json!({"field": "created_at", "operation": "lessThan", "value": "last tuesday"})).is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let original = validate(json!({
            "operator": "OR",
            "conditions": [
                {"id": "a", "field": "total_spend", "operation": "between", "value": [100, 500.5]},
                {"id": "b", "field": "email", "operation": "endsWith", "value": "@example.com"},
                {"operator": "AND", "conditions": [
                    {"id": "c", "field": "last_visit_date", "operation": "isNotInLast", "value": 90, "unit": "days"},
                    {"id": "d", "field": "address", "operation": "isEmpty"}
                ]}
            ]
        }))
        .unwrap();

        let text = serde_json::to_string(&original).unwrap();
        let parsed: RuleNode = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_window_start_saturates_for_huge_windows() {
        let now = parse_instant("2024-03-31T12:00:00Z").unwrap();
        for unit in [TimeUnit::Days, TimeUnit::Weeks, TimeUnit::Months] {
            assert_eq!(unit.window_start(now, 100_000_000), DateTime::<Utc>::MIN_UTC);
            assert_eq!(unit.window_start(now, u32::MAX), DateTime::<Utc>::MIN_UTC);
        }
    }

    #[test]
    fn test_check_rejects_code_built_defects() {
        let cond = |id: &str| {
            RuleNode::Condition(Condition::new(id, Field::Email, OperatorKind::IsNotEmpty, None, None).unwrap())
        };
        assert!(RuleNode::and(vec![cond("a"), cond("b")]).check(DEFAULT_MAX_DEPTH).is_ok());

        let empty = RuleNode::and(Vec::new());
        assert!(matches!(empty.check(DEFAULT_MAX_DEPTH), Err(CrmError::InvalidRule(_))));
        let nested_empty = RuleNode::or(vec![cond("a"), RuleNode::and(Vec::new())]);
        assert!(matches!(nested_empty.check(DEFAULT_MAX_DEPTH), Err(CrmError::InvalidRule(_))));

        let dup = RuleNode::and(vec![cond("a"), RuleNode::or(vec![cond("a")])]);
        assert!(matches!(dup.check(DEFAULT_MAX_DEPTH), Err(CrmError::InvalidRule(_))));

        let deep = RuleNode::and(vec![RuleNode::and(vec![cond("a")])]);
        assert!(deep.check(2).is_ok());
        assert!(deep.check(1).is_err());
    }

    #[test]
    fn test_window_start_months() {
        let now = parse_instant("2024-03-31T12:00:00Z").unwrap();
        let start = TimeUnit::Months.window_start(now, 1);
        assert_eq!(start, parse_instant("2024-02-29T12:00:00Z").unwrap());
        assert_eq!(
            TimeUnit::Weeks.window_start(now, 2),
            now - Duration::days(14)
        );
    }
}
