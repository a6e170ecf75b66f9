//! Audience resolution: the customer set matching a rule, computed by
//! pushing what the store can run into the store and rechecking the rest in
//! memory.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crm_core::config::SegmentationConfig;
use crm_core::{Clock, CrmError, CrmResult, Customer};
use serde::Serialize;
use tracing::debug;

use crate::evaluator::Evaluator;
use crate::query::{plan, to_query, StoreQuery};
use crate::rules::{validate_rule, RuleNode};
use crate::store::CustomerStore;

/// Count plus a small sample for display.
#[derive(Debug, Clone, Serialize)]
pub struct AudiencePreview {
    pub count: u64,
    pub sample: Vec<Customer>,
}

pub struct AudienceResolver {
    store: Arc<dyn CustomerStore>,
    clock: Arc<dyn Clock>,
    config: SegmentationConfig,
}

impl AudienceResolver {
    pub fn new(store: Arc<dyn CustomerStore>, clock: Arc<dyn Clock>, config: SegmentationConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn CustomerStore> {
        &self.store
    }

    pub fn config(&self) -> &SegmentationConfig {
        &self.config
    }

    /// Validate an untrusted rule document with this resolver's depth limit.
    pub fn validate(&self, json: &serde_json::Value) -> CrmResult<RuleNode> {
        validate_rule(json, self.config.max_rule_depth)
    }

    /// Customers for which the rule matches, ordered as the store orders them.
    pub async fn resolve(&self, rule: &RuleNode) -> CrmResult<Vec<Customer>> {
        let evaluator = Evaluator::at(self.clock.now());
        let query = to_query(rule, evaluator.now())?;
        metrics::counter!("segmentation.resolutions").increment(1);

        if query == StoreQuery::MatchNone {
            return Ok(Vec::new());
        }

        let caps = self.store.capabilities();
        if !caps.queryable {
            debug!("Store is list-only, evaluating rule in memory");
            metrics::counter!("segmentation.fallback_resolutions").increment(1);
            let rows = self.bounded(self.store.list_all()).await?;
            return self.recheck(&evaluator, rule, rows);
        }

        let plan = plan(&query, &caps);
        debug!(exact = plan.exact, or_depth = query.or_depth(), "Query plan chosen");
        let rows = self.bounded(self.store.query(&plan.pushdown)).await?;
        if plan.exact {
            return Ok(rows);
        }
        metrics::counter!("segmentation.fallback_resolutions").increment(1);
        self.recheck(&evaluator, rule, rows)
    }

    /// Number of matching customers. Uses a count-only store query when the
    /// whole rule can be pushed down.
    pub async fn count(&self, rule: &RuleNode) -> CrmResult<u64> {
        let caps = self.store.capabilities();
        if caps.queryable && caps.count {
            let query = to_query(rule, self.clock.now())?;
            if query == StoreQuery::MatchNone {
                return Ok(0);
            }
            let plan = plan(&query, &caps);
            if plan.exact {
                metrics::counter!("segmentation.resolutions").increment(1);
                return self.bounded(self.store.count(&plan.pushdown)).await;
            }
        }
        Ok(self.resolve(rule).await?.len() as u64)
    }

    pub async fn preview(&self, rule: &RuleNode) -> CrmResult<AudiencePreview> {
        let audience = self.resolve(rule).await?;
        let count = audience.len() as u64;
        let sample = audience
            .into_iter()
            .take(self.config.preview_sample_size)
            .collect();
        Ok(AudiencePreview { count, sample })
    }

    /// Validate then resolve an untrusted rule document.
    pub async fn resolve_json(&self, json: &serde_json::Value) -> CrmResult<Vec<Customer>> {
        let rule = self.validate(json)?;
        self.resolve(&rule).await
    }

    fn recheck(&self, evaluator: &Evaluator, rule: &RuleNode, rows: Vec<Customer>) -> CrmResult<Vec<Customer>> {
        let limit = self.config.max_materialized_rows;
        if rows.len() > limit {
            return Err(CrmError::ResolutionTooLarge {
                rows: rows.len(),
                limit,
            });
        }
        let mut matched = Vec::new();
        for customer in rows {
            if evaluator.matches(&customer, rule)? {
                matched.push(customer);
            }
        }
        Ok(matched)
    }

    async fn bounded<T>(&self, fut: impl Future<Output = CrmResult<T>>) -> CrmResult<T> {
        let timeout = Duration::from_millis(self.config.query_timeout_ms);
        tokio::time::timeout(timeout, fut).await.map_err(|_| {
            CrmError::StoreUnavailable(format!(
                "store query timed out after {}ms",
                self.config.query_timeout_ms
            ))
        })?
    }
}
