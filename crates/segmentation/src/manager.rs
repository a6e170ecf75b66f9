//! Segment manager: persists named rules and keeps their cached audience
//! size current.
//!
//! Counting is best-effort on the write path: a failed count is logged and
//! the segment keeps its previous size.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crm_core::types::{DomainEvent, EventType};
use crm_core::{event_bus, Clock, CrmError, CrmResult, EventSink};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::resolver::{AudiencePreview, AudienceResolver};
use crate::rules::RuleNode;

#[derive(Debug, Clone, Serialize)]
pub struct Segment {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub rules: RuleNode,
    pub audience_size: u64,
    pub last_calculated_at: Option<DateTime<Utc>>,
    pub created_by: Uuid,
    pub is_dynamic: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSegment {
    pub name: String,
    pub description: Option<String>,
    pub rules: RuleNode,
    pub created_by: Uuid,
    pub is_dynamic: bool,
}

impl NewSegment {
    pub fn new(name: impl Into<String>, rules: RuleNode, created_by: Uuid) -> Self {
        Self {
            name: name.into(),
            description: None,
            rules,
            created_by,
            is_dynamic: true,
        }
    }
}

/// Persistence for segment definitions.
#[async_trait]
pub trait SegmentRepository: Send + Sync {
    async fn save(&self, segment: Segment) -> CrmResult<()>;
    async fn find(&self, id: Uuid) -> CrmResult<Option<Segment>>;
    async fn list_by_owner(&self, owner: Uuid) -> CrmResult<Vec<Segment>>;
    /// Returns whether a segment was removed.
    async fn remove(&self, id: Uuid) -> CrmResult<bool>;
}

#[derive(Default)]
pub struct InMemorySegmentRepository {
    segments: DashMap<Uuid, Segment>,
}

impl InMemorySegmentRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SegmentRepository for InMemorySegmentRepository {
    async fn save(&self, segment: Segment) -> CrmResult<()> {
        self.segments.insert(segment.id, segment);
        Ok(())
    }

    async fn find(&self, id: Uuid) -> CrmResult<Option<Segment>> {
        Ok(self.segments.get(&id).map(|s| s.clone()))
    }

    async fn list_by_owner(&self, owner: Uuid) -> CrmResult<Vec<Segment>> {
        Ok(self
            .segments
            .iter()
            .filter(|s| s.created_by == owner)
            .map(|s| s.value().clone())
            .collect())
    }

    async fn remove(&self, id: Uuid) -> CrmResult<bool> {
        Ok(self.segments.remove(&id).is_some())
    }
}

pub struct SegmentManager {
    repo: Arc<dyn SegmentRepository>,
    resolver: Arc<AudienceResolver>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

impl SegmentManager {
    pub fn new(
        repo: Arc<dyn SegmentRepository>,
        resolver: Arc<AudienceResolver>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repo,
            resolver,
            events,
            clock,
        }
    }

    pub fn resolver(&self) -> &Arc<AudienceResolver> {
        &self.resolver
    }

    /// Persist a segment, then compute its audience size.
    pub async fn create(&self, req: NewSegment) -> CrmResult<Segment> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(CrmError::invalid_rule("segment name must not be empty"));
        }
        req.rules.check(self.resolver.config().max_rule_depth)?;

        let now = self.clock.now();
        let mut segment = Segment {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: req.description,
            rules: req.rules,
            audience_size: 0,
            last_calculated_at: None,
            created_by: req.created_by,
            is_dynamic: req.is_dynamic,
            created_at: now,
            updated_at: now,
        };
        self.repo.save(segment.clone()).await?;
        self.recount(&mut segment).await?;

        info!(
            segment_id = %segment.id,
            name = %segment.name,
            audience_size = segment.audience_size,
            "Segment created"
        );
        self.emit(EventType::SegmentCreated, segment.id, None);
        Ok(segment)
    }

    /// Validate an untrusted rule document and create a segment from it.
    pub async fn create_from_json(
        &self,
        name: &str,
        rules: &serde_json::Value,
        created_by: Uuid,
    ) -> CrmResult<Segment> {
        let rules = self.resolver.validate(rules)?;
        self.create(NewSegment::new(name, rules, created_by)).await
    }

    /// Re-run the count and persist it. Returns the cached size, which is
    /// unchanged if counting failed.
    pub async fn refresh(&self, segment_id: Uuid) -> CrmResult<u64> {
        let mut segment = self.load(segment_id).await?;
        let before = segment.audience_size;
        self.recount(&mut segment).await?;
        self.emit(
            EventType::SegmentRefreshed,
            segment.id,
            Some(format!("{before} -> {}", segment.audience_size)),
        );
        Ok(segment.audience_size)
    }

    pub async fn preview(&self, rule: &RuleNode) -> CrmResult<AudiencePreview> {
        self.resolver.preview(rule).await
    }

    /// Replace a segment's rule tree and recount.
    pub async fn update_rules(&self, segment_id: Uuid, rules: RuleNode) -> CrmResult<Segment> {
        rules.check(self.resolver.config().max_rule_depth)?;
        let mut segment = self.load(segment_id).await?;
        segment.rules = rules;
        segment.updated_at = self.clock.now();
        self.repo.save(segment.clone()).await?;
        self.recount(&mut segment).await?;
        self.emit(EventType::SegmentUpdated, segment.id, None);
        Ok(segment)
    }

    pub async fn get(&self, segment_id: Uuid) -> CrmResult<Segment> {
        self.load(segment_id).await
    }

    /// Segments owned by `owner`, newest first.
    pub async fn list(&self, owner: Uuid) -> CrmResult<Vec<Segment>> {
        let mut segments = self.repo.list_by_owner(owner).await?;
        segments.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(segments)
    }

    pub async fn delete(&self, segment_id: Uuid) -> CrmResult<()> {
        if self.repo.remove(segment_id).await? {
            info!(segment_id = %segment_id, "Segment deleted");
            Ok(())
        } else {
            Err(CrmError::SegmentNotFound(segment_id))
        }
    }

    async fn load(&self, segment_id: Uuid) -> CrmResult<Segment> {
        self.repo
            .find(segment_id)
            .await?
            .ok_or(CrmError::SegmentNotFound(segment_id))
    }

    /// Count failures are swallowed; repository failures are not.
    async fn recount(&self, segment: &mut Segment) -> CrmResult<()> {
        match self.resolver.count(&segment.rules).await {
            Ok(size) => {
                segment.audience_size = size;
                segment.last_calculated_at = Some(self.clock.now());
                self.repo.save(segment.clone()).await
            }
            Err(e) => {
                warn!(
                    segment_id = %segment.id,
                    error = %e,
                    "Audience size calculation failed, keeping previous size"
                );
                Ok(())
            }
        }
    }

    fn emit(&self, event_type: EventType, segment_id: Uuid, detail: Option<String>) {
        let mut event: DomainEvent = event_bus::make_event(event_type).with_segment(segment_id);
        event.timestamp = self.clock.now();
        if let Some(detail) = detail {
            event = event.with_detail(detail);
        }
        self.events.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::RuleBuilder;
    use crate::query::QueryCapabilities;
    use crate::rules::{Condition, Field, OperatorKind};
    use crate::store::InMemoryCustomerStore;
    use chrono::Duration;
    use crm_core::config::SegmentationConfig;
    use crm_core::event_bus::{capture_sink, CaptureSink};
    use crm_core::types::{NewCustomer, OrderEvent};
    use crm_core::FixedClock;
    use serde_json::json;

    struct Harness {
        store: Arc<InMemoryCustomerStore>,
        clock: Arc<FixedClock>,
        sink: Arc<CaptureSink>,
        manager: SegmentManager,
    }

    fn harness(config: SegmentationConfig) -> Harness {
        let store = Arc::new(InMemoryCustomerStore::new());
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let sink = capture_sink();
        let resolver = Arc::new(AudienceResolver::new(store.clone(), clock.clone(), config));
        let manager = SegmentManager::new(
            Arc::new(InMemorySegmentRepository::new()),
            resolver,
            sink.clone(),
            clock.clone(),
        );
        Harness {
            store,
            clock,
            sink,
            manager,
        }
    }

    fn add_customer(store: &InMemoryCustomerStore, email: &str, spend: f64) {
        let c = store
            .create_customer(NewCustomer {
                email: email.into(),
                first_name: "Ada".into(),
                last_name: "Lovelace".into(),
                phone: None,
                address: None,
                tags: Default::default(),
            })
            .unwrap();
        store
            .record_order(&OrderEvent {
                order_id: Uuid::new_v4(),
                customer_id: c.id,
                amount: spend,
                occurred_at: Utc::now(),
            })
            .unwrap();
    }

    fn big_spenders() -> RuleNode {
        RuleBuilder::all().greater_than(Field::TotalSpend, 1000.0).build().unwrap()
    }

    #[tokio::test]
    async fn test_create_counts_audience() {
        let h = harness(SegmentationConfig::default());
        add_customer(&h.store, "a@x.com", 5000.0);
        add_customer(&h.store, "b@x.com", 10.0);

        let owner = Uuid::new_v4();
        let seg = h
            .manager
            .create(NewSegment::new("Big spenders", big_spenders(), owner))
            .await
            .unwrap();
        assert_eq!(seg.audience_size, 1);
        assert_eq!(seg.last_calculated_at, Some(h.clock.now()));
        assert_eq!(h.sink.count_type(EventType::SegmentCreated), 1);

        let stored = h.manager.get(seg.id).await.unwrap();
        assert_eq!(stored.audience_size, 1);
    }

    #[tokio::test]
    async fn test_create_survives_count_failure() {
        let h = harness(SegmentationConfig {
            max_materialized_rows: 1,
            ..SegmentationConfig::default()
        });
        h.store.set_capabilities(QueryCapabilities::list_only());
        add_customer(&h.store, "a@x.com", 5000.0);
        add_customer(&h.store, "b@x.com", 5000.0);

        let seg = h
            .manager
            .create(NewSegment::new("Too big", big_spenders(), Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(seg.audience_size, 0);
        assert!(seg.last_calculated_at.is_none());
        assert!(h.manager.get(seg.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_refresh_tracks_new_customers() {
        let h = harness(SegmentationConfig::default());
        let seg = h
            .manager
            .create(NewSegment::new("Big spenders", big_spenders(), Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(seg.audience_size, 0);

        add_customer(&h.store, "late@x.com", 2500.0);
        h.clock.advance(Duration::minutes(5));
        assert_eq!(h.manager.refresh(seg.id).await.unwrap(), 1);

        let stored = h.manager.get(seg.id).await.unwrap();
        assert_eq!(stored.last_calculated_at, Some(h.clock.now()));
        assert_eq!(h.sink.count_type(EventType::SegmentRefreshed), 1);
    }

    #[tokio::test]
    async fn test_update_rules_recounts() {
        let h = harness(SegmentationConfig::default());
        add_customer(&h.store, "a@x.com", 5000.0);
        add_customer(&h.store, "b@y.com", 10.0);
        let seg = h
            .manager
            .create(NewSegment::new("Big spenders", big_spenders(), Uuid::new_v4()))
            .await
            .unwrap();

        let everyone = RuleBuilder::any().ends_with(Field::Email, ".com").build().unwrap();
        let updated = h.manager.update_rules(seg.id, everyone).await.unwrap();
        assert_eq!(updated.audience_size, 2);
        assert_eq!(h.sink.count_type(EventType::SegmentUpdated), 1);
    }

    #[tokio::test]
    async fn test_list_newest_first_and_delete() {
        let h = harness(SegmentationConfig::default());
        let owner = Uuid::new_v4();
        let first = h
            .manager
            .create(NewSegment::new("first", big_spenders(), owner))
            .await
            .unwrap();
        h.clock.advance(Duration::seconds(1));
        let second = h
            .manager
            .create(NewSegment::new("second", big_spenders(), owner))
            .await
            .unwrap();
        h.manager
            .create(NewSegment::new("other", big_spenders(), Uuid::new_v4()))
            .await
            .unwrap();

        let listed: Vec<Uuid> = h.manager.list(owner).await.unwrap().iter().map(|s| s.id).collect();
        assert_eq!(listed, vec![second.id, first.id]);

        h.manager.delete(first.id).await.unwrap();
        assert!(matches!(
            h.manager.get(first.id).await,
            Err(CrmError::SegmentNotFound(_))
        ));
        assert!(matches!(
            h.manager.delete(first.id).await,
            Err(CrmError::SegmentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_from_json_validates() {
        let h = harness(SegmentationConfig::default());
        let err = h
            .manager
            .create_from_json(
                "bad",
                &json!({"operator": "AND", "conditions": [
                    {"id": "1", "field": "total_spend", "operation": "contains", "value": "1"}
                ]}),
                Uuid::new_v4(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CrmError::InvalidRule(_)));

        let blank = h
            .manager
            .create(NewSegment::new("  ", big_spenders(), Uuid::new_v4()))
            .await;
        assert!(matches!(blank, Err(CrmError::InvalidRule(_))));
    }

    #[tokio::test]
    async fn test_write_path_rejects_malformed_trees() {
        let h = harness(SegmentationConfig::default());
        let owner = Uuid::new_v4();
        let empty = h
            .manager
            .create(NewSegment::new("empty", RuleNode::and(Vec::new()), owner))
            .await;
        assert!(matches!(empty, Err(CrmError::InvalidRule(_))));

        let cond = |id: &str| {
            RuleNode::Condition(Condition::new(id, Field::Email, OperatorKind::IsNotEmpty, None, None).unwrap())
        };
        let dup = h
            .manager
            .create(NewSegment::new("dup", RuleNode::or(vec![cond("x"), cond("x")]), owner))
            .await;
        assert!(matches!(dup, Err(CrmError::InvalidRule(_))));
        assert!(h.manager.list(owner).await.unwrap().is_empty());

        let seg = h
            .manager
            .create(NewSegment::new("ok", big_spenders(), owner))
            .await
            .unwrap();
        let nested_empty = RuleNode::and(vec![cond("a"), RuleNode::or(Vec::new())]);
        assert!(matches!(
            h.manager.update_rules(seg.id, nested_empty).await,
            Err(CrmError::InvalidRule(_))
        ));

        // Whatever was persisted still parses as a rule document.
        let stored = h.manager.get(seg.id).await.unwrap();
        let persisted = serde_json::to_value(&stored.rules).unwrap();
        let reparsed: RuleNode = serde_json::from_value(persisted).unwrap();
        assert_eq!(reparsed, stored.rules);
    }

    #[tokio::test]
    async fn test_refresh_unknown_segment() {
        let h = harness(SegmentationConfig::default());
        assert!(matches!(
            h.manager.refresh(Uuid::new_v4()).await,
            Err(CrmError::SegmentNotFound(_))
        ));
    }
}
