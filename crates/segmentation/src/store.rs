//! Customer store capability and an in-memory implementation backed by
//! DashMap.
//!
//! The in-memory store interprets `StoreQuery` filter fragments natively,
//! independently of the rule evaluator, so pushdown and in-memory
//! evaluation can be checked against each other.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use crm_core::types::{CustomerUpdate, EventType, NewCustomer, OrderEvent};
use crm_core::{event_bus, CrmError, CrmResult, Customer, EventSink};
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::evaluator::{FieldSource, FieldValue};
use crate::query::{Filter, FilterKind, PatternKind, QueryCapabilities, RangeBound, RangeValue, StoreQuery};

/// Read capability the segmentation core consumes.
#[async_trait]
pub trait CustomerStore: Send + Sync {
    /// Every customer, ordered by `(created_at, id)`.
    async fn list_all(&self) -> CrmResult<Vec<Customer>>;

    async fn get(&self, id: Uuid) -> CrmResult<Option<Customer>>;

    fn capabilities(&self) -> QueryCapabilities {
        QueryCapabilities::list_only()
    }

    /// Customers matching `query`, same ordering as `list_all`.
    async fn query(&self, query: &StoreQuery) -> CrmResult<Vec<Customer>> {
        let _ = query;
        Err(CrmError::StoreUnavailable(
            "store does not support filtered queries".into(),
        ))
    }

    async fn count(&self, query: &StoreQuery) -> CrmResult<u64> {
        Ok(self.query(query).await?.len() as u64)
    }
}

pub struct InMemoryCustomerStore {
    customers: DashMap<Uuid, Customer>,
    emails: DashMap<String, Uuid>,
    capabilities: RwLock<QueryCapabilities>,
    events: Arc<dyn EventSink>,
}

impl InMemoryCustomerStore {
    pub fn new() -> Self {
        Self::with_capabilities(QueryCapabilities::full())
    }

    pub fn with_capabilities(capabilities: QueryCapabilities) -> Self {
        info!(?capabilities, "Customer store initialized (in-memory)");
        Self {
            customers: DashMap::new(),
            emails: DashMap::new(),
            capabilities: RwLock::new(capabilities),
            events: event_bus::noop_sink(),
        }
    }

    /// Publish `OrderRecorded` events to `events`.
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn set_capabilities(&self, capabilities: QueryCapabilities) {
        *self.capabilities.write() = capabilities;
    }

    pub fn len(&self) -> usize {
        self.customers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.customers.is_empty()
    }

    pub fn create_customer(&self, req: NewCustomer) -> CrmResult<Customer> {
        let key = req.email.trim().to_lowercase();
        let customer = Customer {
            id: Uuid::new_v4(),
            email: req.email.trim().to_string(),
            first_name: req.first_name,
            last_name: req.last_name,
            phone: req.phone,
            address: req.address,
            total_spend: 0.0,
            total_visits: 0,
            last_visit_date: None,
            tags: req.tags,
            created_at: Utc::now(),
        };
        match self.emails.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(CrmError::DuplicateEmail(customer.email));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(customer.id);
            }
        }
        self.customers.insert(customer.id, customer.clone());
        debug!(customer_id = %customer.id, "Customer created");
        Ok(customer)
    }

    /// Load a fully formed customer (imports, fixtures). Enforces email
    /// uniqueness like `create_customer`; replacing a customer releases its
    /// previous email.
    pub fn insert(&self, customer: Customer) -> CrmResult<()> {
        let key = customer.email.trim().to_lowercase();
        match self.emails.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) if *existing.get() != customer.id => {
                return Err(CrmError::DuplicateEmail(customer.email));
            }
            dashmap::mapref::entry::Entry::Occupied(_) => {}
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(customer.id);
            }
        }
        if let Some(previous) = self.customers.insert(customer.id, customer) {
            let previous_key = previous.email.trim().to_lowercase();
            if previous_key != key {
                self.emails.remove_if(&previous_key, |_, owner| *owner == previous.id);
            }
        }
        Ok(())
    }

    pub fn update_customer(&self, id: Uuid, req: CustomerUpdate) -> CrmResult<Customer> {
        let mut entry = self
            .customers
            .get_mut(&id)
            .ok_or(CrmError::CustomerNotFound(id))?;
        let c = entry.value_mut();
        if let Some(first_name) = req.first_name {
            c.first_name = first_name;
        }
        if let Some(last_name) = req.last_name {
            c.last_name = last_name;
        }
        if let Some(phone) = req.phone {
            c.phone = Some(phone);
        }
        if let Some(address) = req.address {
            c.address = Some(address);
        }
        if let Some(tags) = req.tags {
            c.tags = tags;
        }
        Ok(c.clone())
    }

    /// Apply a completed order to the customer's aggregates.
    pub fn record_order(&self, order: &OrderEvent) -> CrmResult<Customer> {
        if !order.amount.is_finite() || order.amount < 0.0 {
            return Err(CrmError::InvalidState(format!(
                "order {} has invalid amount {}",
                order.order_id, order.amount
            )));
        }
        let mut entry = self
            .customers
            .get_mut(&order.customer_id)
            .ok_or(CrmError::CustomerNotFound(order.customer_id))?;
        let c = entry.value_mut();
        c.total_spend += order.amount;
        c.total_visits += 1;
        c.last_visit_date = Some(order.occurred_at);
        debug!(
            customer_id = %c.id,
            order_id = %order.order_id,
            total_spend = c.total_spend,
            total_visits = c.total_visits,
            "Order recorded"
        );
        let updated = c.clone();
        drop(entry);

        let mut event = event_bus::make_event(EventType::OrderRecorded)
            .with_customer(updated.id)
            .with_detail(format!("order {} amount {}", order.order_id, order.amount));
        event.timestamp = order.occurred_at;
        self.events.emit(event);
        Ok(updated)
    }

    fn snapshot(&self) -> Vec<Customer> {
        let mut all: Vec<Customer> = self.customers.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }

    fn check_supported(&self, query: &StoreQuery, caps: &QueryCapabilities) -> CrmResult<()> {
        if !caps.queryable {
            return Err(CrmError::StoreUnavailable(
                "store does not support filtered queries".into(),
            ));
        }
        if query.or_depth() > caps.max_or_depth {
            return Err(CrmError::StoreUnavailable(format!(
                "query nests OR {} levels deep, store supports {}",
                query.or_depth(),
                caps.max_or_depth
            )));
        }
        let mut unsupported = HashSet::new();
        collect_unsupported(query, caps, &mut unsupported);
        if let Some(kind) = unsupported.into_iter().next() {
            return Err(CrmError::StoreUnavailable(format!(
                "store cannot execute {kind} filters"
            )));
        }
        Ok(())
    }
}

impl Default for InMemoryCustomerStore {
    fn default() -> Self {
        Self::new()
    }
}

fn collect_unsupported(query: &StoreQuery, caps: &QueryCapabilities, out: &mut HashSet<&'static str>) {
    match query {
        StoreQuery::MatchAll | StoreQuery::MatchNone => {}
        StoreQuery::Filter(f) => {
            if !caps.supports(&f.kind) {
                out.insert(match f.kind {
                    FilterKind::Range { .. } => "range",
                    FilterKind::SetContains { .. } => "set-containment",
                    FilterKind::Pattern { .. } => "pattern",
                    FilterKind::Empty { .. } => "emptiness",
                });
            }
        }
        StoreQuery::And(parts) | StoreQuery::Or(parts) => {
            for p in parts {
                collect_unsupported(p, caps, out);
            }
        }
    }
}

#[async_trait]
impl CustomerStore for InMemoryCustomerStore {
    async fn list_all(&self) -> CrmResult<Vec<Customer>> {
        Ok(self.snapshot())
    }

    async fn get(&self, id: Uuid) -> CrmResult<Option<Customer>> {
        Ok(self.customers.get(&id).map(|r| r.value().clone()))
    }

    fn capabilities(&self) -> QueryCapabilities {
        *self.capabilities.read()
    }

    async fn query(&self, query: &StoreQuery) -> CrmResult<Vec<Customer>> {
        self.check_supported(query, &self.capabilities())?;
        Ok(self
            .snapshot()
            .into_iter()
            .filter(|c| eval_query(c, query))
            .collect())
    }

    async fn count(&self, query: &StoreQuery) -> CrmResult<u64> {
        self.check_supported(query, &self.capabilities())?;
        Ok(self
            .customers
            .iter()
            .filter(|r| eval_query(r.value(), query))
            .count() as u64)
    }
}

// ─── Native filter interpreter ──────────────────────────────────────────────

fn eval_query(customer: &Customer, query: &StoreQuery) -> bool {
    match query {
        StoreQuery::MatchAll => true,
        StoreQuery::MatchNone => false,
        StoreQuery::Filter(filter) => eval_filter(customer, filter),
        StoreQuery::And(parts) => parts.iter().all(|p| eval_query(customer, p)),
        StoreQuery::Or(parts) => parts.iter().any(|p| eval_query(customer, p)),
    }
}

fn eval_filter(customer: &Customer, filter: &Filter) -> bool {
    let hit = match &filter.kind {
        FilterKind::Range { field, lower, upper } => match customer.field_value(*field) {
            FieldValue::Number(n) => in_range(RangeValue::Number(n), lower, upper),
            FieldValue::Timestamp(Some(ts)) => in_range(RangeValue::Instant(ts), lower, upper),
            _ => false,
        },
        FilterKind::SetContains { field, value } => match customer.field_value(*field) {
            FieldValue::Tags(tags) => tags.contains(value),
            _ => false,
        },
        FilterKind::Pattern { field, pattern, value } => match customer.field_value(*field) {
            FieldValue::Text(Some(text)) => {
                let (text, needle) = (text.to_lowercase(), value.to_lowercase());
                match pattern {
                    PatternKind::Exact => text == needle,
                    PatternKind::Contains => text.contains(&needle),
                    PatternKind::Prefix => text.starts_with(&needle),
                    PatternKind::Suffix => text.ends_with(&needle),
                }
            }
            _ => false,
        },
        FilterKind::Empty { field } => match customer.field_value(*field) {
            FieldValue::Number(_) => false,
            FieldValue::Timestamp(ts) => ts.is_none(),
            FieldValue::Text(text) => text.map_or(true, |t| t.is_empty()),
            FieldValue::Tags(tags) => tags.is_empty(),
        },
    };
    hit != filter.negated
}

fn in_range(value: RangeValue, lower: &Option<RangeBound>, upper: &Option<RangeBound>) -> bool {
    let above = lower.map_or(true, |b| match (value, b.value) {
        (RangeValue::Number(v), RangeValue::Number(l)) => if b.inclusive { v >= l } else { v > l },
        (RangeValue::Instant(v), RangeValue::Instant(l)) => if b.inclusive { v >= l } else { v > l },
        _ => false,
    });
    let below = upper.map_or(true, |b| match (value, b.value) {
        (RangeValue::Number(v), RangeValue::Number(u)) => if b.inclusive { v <= u } else { v < u },
        (RangeValue::Instant(v), RangeValue::Instant(u)) => if b.inclusive { v <= u } else { v < u },
        _ => false,
    });
    above && below
}
