//! Rule builder: fluent API for constructing rule trees in code.

use crm_core::{CrmError, CrmResult};
use uuid::Uuid;

use crate::rules::{Condition, Field, LogicalOperator, OperatorKind, RuleGroup, RuleNode, RuleValue, Scalar, TimeUnit};

pub struct RuleBuilder {
    operator: LogicalOperator,
    nodes: Vec<RuleNode>,
    error: Option<CrmError>,
}

impl RuleBuilder {
    /// Group whose children must all match.
    pub fn all() -> Self {
        Self::new(LogicalOperator::And)
    }

    /// Group where any child may match.
    pub fn any() -> Self {
        Self::new(LogicalOperator::Or)
    }

    fn new(operator: LogicalOperator) -> Self {
        Self {
            operator,
            nodes: Vec::new(),
            error: None,
        }
    }

    /// Append a condition. The first construction error is kept and
    /// reported by `build`.
    pub fn condition(
        mut self,
        field: Field,
        operation: OperatorKind,
        value: Option<RuleValue>,
        unit: Option<TimeUnit>,
    ) -> Self {
        if self.error.is_some() {
            return self;
        }
        match Condition::new(Uuid::new_v4().to_string(), field, operation, value, unit) {
            Ok(c) => self.nodes.push(RuleNode::Condition(c)),
            Err(e) => self.error = Some(e),
        }
        self
    }

    fn scalar(self, field: Field, operation: OperatorKind, value: impl Into<Scalar>) -> Self {
        self.condition(field, operation, Some(RuleValue::Single(value.into())), None)
    }

    pub fn equals(self, field: Field, value: impl Into<Scalar>) -> Self {
        self.scalar(field, OperatorKind::Equals, value)
    }

    pub fn greater_than(self, field: Field, value: impl Into<Scalar>) -> Self {
        self.scalar(field, OperatorKind::GreaterThan, value)
    }

    pub fn greater_than_or_equal(self, field: Field, value: impl Into<Scalar>) -> Self {
        self.scalar(field, OperatorKind::GreaterThanOrEqual, value)
    }

    pub fn less_than(self, field: Field, value: impl Into<Scalar>) -> Self {
        self.scalar(field, OperatorKind::LessThan, value)
    }

    pub fn contains(self, field: Field, value: impl Into<Scalar>) -> Self {
        self.scalar(field, OperatorKind::Contains, value)
    }

    pub fn ends_with(self, field: Field, value: impl Into<Scalar>) -> Self {
        self.scalar(field, OperatorKind::EndsWith, value)
    }

    pub fn between(self, field: Field, lower: impl Into<Scalar>, upper: impl Into<Scalar>) -> Self {
        self.condition(
            field,
            OperatorKind::Between,
            Some(RuleValue::Pair(lower.into(), upper.into())),
            None,
        )
    }

    pub fn empty(self, field: Field) -> Self {
        self.condition(field, OperatorKind::IsEmpty, None, None)
    }

    pub fn in_last(self, field: Field, amount: u32, unit: TimeUnit) -> Self {
        self.condition(
            field,
            OperatorKind::IsInLast,
            Some(RuleValue::Single(Scalar::Number(f64::from(amount)))),
            Some(unit),
        )
    }

    pub fn not_in_last(self, field: Field, amount: u32, unit: TimeUnit) -> Self {
        self.condition(
            field,
            OperatorKind::IsNotInLast,
            Some(RuleValue::Single(Scalar::Number(f64::from(amount)))),
            Some(unit),
        )
    }

    /// Nest another group.
    pub fn group(mut self, inner: RuleBuilder) -> Self {
        if self.error.is_some() {
            return self;
        }
        match inner.build() {
            Ok(node) => self.nodes.push(node),
            Err(e) => self.error = Some(e),
        }
        self
    }

    /// Number of direct children added so far.
    pub fn child_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn build(self) -> CrmResult<RuleNode> {
        if let Some(e) = self.error {
            return Err(e);
        }
        if self.nodes.is_empty() {
            return Err(CrmError::invalid_rule("group must contain at least one condition"));
        }
        Ok(RuleNode::Group(RuleGroup {
            operator: self.operator,
            conditions: self.nodes,
        }))
    }
}
