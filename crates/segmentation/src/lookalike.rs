//! Lookalike audiences: derives a rule that targets customers resembling a
//! reference population (past successful recipients, a seed segment, or
//! current high-value customers).
//!
//! Synthesis is advisory: it never fails. Without a usable reference
//! population it returns a fixed low-confidence rule.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crm_core::config::LookalikeConfig;
use crm_core::{Clock, CrmResult, Customer};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::builder::RuleBuilder;
use crate::resolver::AudienceResolver;
use crate::rules::{Field, RuleNode};

/// Confidence reported with the fixed fallback rule.
pub const FALLBACK_CONFIDENCE: u32 = 30;

const TAG_SHARE_THRESHOLD: f64 = 0.20;
const DOMAIN_SHARE_THRESHOLD: f64 = 0.15;
const PREMIUM_SHARE_THRESHOLD: f64 = 0.10;
const MAX_TAG_CONDITIONS: usize = 2;
const MAX_DOMAIN_CONDITIONS: usize = 2;

/// Source of past campaign recipients, implemented by the campaign store.
#[async_trait]
pub trait RecipientHistory: Send + Sync {
    /// Customers with a successful delivery in a completed campaign, most
    /// recent first, without duplicates.
    async fn successful_recipients(&self, limit: usize) -> CrmResult<Vec<Uuid>>;
}

#[derive(Debug, Clone, Default)]
pub struct LookalikeContext {
    /// Rule of the segment the operator is working from, if any.
    pub seed_rule: Option<RuleNode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceSource {
    Provided,
    CampaignHistory,
    SeedSegment,
    HighValueCustomers,
    None,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FieldStatistics {
    pub spend_p25: f64,
    pub spend_p50: f64,
    pub spend_p75: f64,
    pub spend_p90: f64,
    pub visits_p25: f64,
    pub visits_p75: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SpendTiers {
    pub low: usize,
    pub medium: usize,
    pub high: usize,
    pub premium: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VisitTiers {
    pub occasional: usize,
    pub regular: usize,
    pub frequent: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TenureBuckets {
    /// Created within the last 30 days.
    pub new: usize,
    /// Within the last year.
    pub established: usize,
    pub longtime: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Frequency {
    pub value: String,
    pub count: usize,
    pub share: f64,
}

/// Report data describing the reference population.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LookalikeInsights {
    pub reference_count: usize,
    pub average_spend: f64,
    pub average_visits: f64,
    pub statistics: FieldStatistics,
    pub spend_tiers: SpendTiers,
    pub visit_tiers: VisitTiers,
    pub tenure: TenureBuckets,
    pub top_tags: Vec<Frequency>,
    pub top_domains: Vec<Frequency>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LookalikeSuggestion {
    pub rule: RuleNode,
    pub confidence: u32,
    pub source: ReferenceSource,
    pub insights: Option<LookalikeInsights>,
    /// Matching audience size for `rule`, when it could be counted.
    pub estimated_audience: Option<u64>,
}

/// Nearest-rank percentile over an ascending slice:
/// `sorted[ceil(n·p/100) - 1]`, clamped to the slice. Empty input yields 0.
pub fn percentile(sorted: &[f64], p: u32) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let n = sorted.len();
    let rank = (n * p as usize).div_ceil(100);
    let idx = rank.saturating_sub(1).min(n - 1);
    sorted[idx]
}

/// `total_spend > 2000 OR total_visits > 2`, confidence 30.
pub fn fallback_suggestion() -> LookalikeSuggestion {
    let rule = RuleBuilder::any()
        .greater_than(Field::TotalSpend, 2000.0)
        .greater_than(Field::TotalVisits, 2u64)
        .build()
        .unwrap_or_else(|_| RuleNode::or(Vec::new()));
    LookalikeSuggestion {
        rule,
        confidence: FALLBACK_CONFIDENCE,
        source: ReferenceSource::None,
        insights: None,
        estimated_audience: None,
    }
}

fn sorted_values(values: impl Iterator<Item = f64>) -> Vec<f64> {
    let mut v: Vec<f64> = values.collect();
    v.sort_by(|a, b| a.total_cmp(b));
    v
}

fn top_frequencies(counts: BTreeMap<String, usize>, total: usize, threshold: f64, max: usize) -> Vec<Frequency> {
    let mut ranked: Vec<Frequency> = counts
        .into_iter()
        .map(|(value, count)| Frequency {
            share: count as f64 / total as f64,
            value,
            count,
        })
        .filter(|f| f.share > threshold)
        .collect();
    // BTreeMap order makes ties resolve alphabetically.
    ranked.sort_by(|a, b| b.count.cmp(&a.count));
    ranked.truncate(max);
    ranked
}

/// Compute insights for a non-empty reference population.
pub fn analyze(reference: &[Customer], now: DateTime<Utc>) -> LookalikeInsights {
    let n = reference.len();
    let spend = sorted_values(reference.iter().map(|c| c.total_spend));
    let visits = sorted_values(reference.iter().map(|c| c.total_visits as f64));

    let statistics = FieldStatistics {
        spend_p25: percentile(&spend, 25),
        spend_p50: percentile(&spend, 50),
        spend_p75: percentile(&spend, 75),
        spend_p90: percentile(&spend, 90),
        visits_p25: percentile(&visits, 25),
        visits_p75: percentile(&visits, 75),
    };

    let mut spend_tiers = SpendTiers::default();
    let mut visit_tiers = VisitTiers::default();
    let mut tenure = TenureBuckets::default();
    let mut tag_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut domain_counts: BTreeMap<String, usize> = BTreeMap::new();

    for c in reference {
        if c.total_spend >= statistics.spend_p90 {
            spend_tiers.premium += 1;
        } else if c.total_spend >= statistics.spend_p75 {
            spend_tiers.high += 1;
        } else if c.total_spend >= statistics.spend_p50 {
            spend_tiers.medium += 1;
        } else {
            spend_tiers.low += 1;
        }

        let v = c.total_visits as f64;
        if v >= statistics.visits_p75 {
            visit_tiers.frequent += 1;
        } else if v >= statistics.visits_p25 {
            visit_tiers.regular += 1;
        } else {
            visit_tiers.occasional += 1;
        }

        let age_days = (now - c.created_at).num_days();
        if age_days <= 30 {
            tenure.new += 1;
        } else if age_days <= 365 {
            tenure.established += 1;
        } else {
            tenure.longtime += 1;
        }

        for tag in &c.tags {
            *tag_counts.entry(tag.clone()).or_default() += 1;
        }
        if let Some(domain) = c.email_domain() {
            *domain_counts.entry(domain).or_default() += 1;
        }
    }

    LookalikeInsights {
        reference_count: n,
        average_spend: spend.iter().sum::<f64>() / n as f64,
        average_visits: visits.iter().sum::<f64>() / n as f64,
        statistics,
        spend_tiers,
        visit_tiers,
        tenure,
        top_tags: top_frequencies(tag_counts, n, TAG_SHARE_THRESHOLD, MAX_TAG_CONDITIONS),
        top_domains: top_frequencies(domain_counts, n, DOMAIN_SHARE_THRESHOLD, MAX_DOMAIN_CONDITIONS),
    }
}

fn round_cents(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn build_rule(insights: &LookalikeInsights) -> CrmResult<RuleNode> {
    let stats = &insights.statistics;
    let n = insights.reference_count as f64;
    let mut rule = RuleBuilder::any();

    if stats.spend_p50 > 0.0 {
        let upper = round_cents(stats.spend_p90 * 1.2).max(stats.spend_p25);
        rule = rule.between(Field::TotalSpend, stats.spend_p25, upper);
    }

    rule = rule.greater_than_or_equal(Field::TotalVisits, stats.visits_p25.max(1.0));

    if insights.spend_tiers.premium as f64 / n > PREMIUM_SHARE_THRESHOLD {
        rule = rule.greater_than(Field::TotalSpend, stats.spend_p75);
    }

    for tag in &insights.top_tags {
        rule = rule.contains(Field::Tags, tag.value.as_str());
    }
    for domain in &insights.top_domains {
        rule = rule.ends_with(Field::Email, format!("@{}", domain.value));
    }

    if rule.child_count() < 2 {
        rule = rule
            .greater_than(Field::TotalSpend, stats.spend_p25.max(1000.0))
            .greater_than(Field::TotalVisits, (stats.visits_p25 * 0.5).floor().max(1.0));
    }

    rule.build()
}

/// Synthesize a lookalike rule from a reference population.
pub fn synthesize(reference: &[Customer], now: DateTime<Utc>) -> LookalikeSuggestion {
    if reference.is_empty() {
        return fallback_suggestion();
    }
    let insights = analyze(reference, now);
    match build_rule(&insights) {
        Ok(rule) => LookalikeSuggestion {
            rule,
            confidence: (60 + 2 * reference.len()).min(95) as u32,
            source: ReferenceSource::Provided,
            insights: Some(insights),
            estimated_audience: None,
        },
        Err(e) => {
            warn!(error = %e, "Lookalike rule could not be built, using fallback");
            fallback_suggestion()
        }
    }
}

pub struct LookalikeSynthesizer {
    resolver: Arc<AudienceResolver>,
    history: Option<Arc<dyn RecipientHistory>>,
    clock: Arc<dyn Clock>,
    config: LookalikeConfig,
}

impl LookalikeSynthesizer {
    pub fn new(resolver: Arc<AudienceResolver>, clock: Arc<dyn Clock>, config: LookalikeConfig) -> Self {
        Self {
            resolver,
            history: None,
            clock,
            config,
        }
    }

    pub fn with_history(mut self, history: Arc<dyn RecipientHistory>) -> Self {
        self.history = Some(history);
        self
    }

    /// Synthesize from an explicit reference population.
    pub fn synthesize(&self, reference: &[Customer]) -> LookalikeSuggestion {
        synthesize(reference, self.clock.now())
    }

    /// Assemble a reference population from history, the seed segment, or
    /// high-value customers (first non-empty wins), then synthesize and
    /// estimate the resulting audience.
    pub async fn suggest(&self, context: &LookalikeContext) -> LookalikeSuggestion {
        let (source, reference) = self.assemble(context).await;
        if reference.is_empty() {
            info!("No reference population available, returning fallback lookalike rule");
            return fallback_suggestion();
        }

        let mut suggestion = self.synthesize(&reference);
        if suggestion.source == ReferenceSource::Provided {
            suggestion.source = source;
        }
        suggestion.estimated_audience = match self.resolver.count(&suggestion.rule).await {
            Ok(n) => Some(n),
            Err(e) => {
                warn!(error = %e, "Could not estimate lookalike audience");
                None
            }
        };
        info!(
            source = ?suggestion.source,
            reference_count = reference.len(),
            confidence = suggestion.confidence,
            estimated_audience = ?suggestion.estimated_audience,
            "Lookalike rule synthesized"
        );
        suggestion
    }

    async fn assemble(&self, context: &LookalikeContext) -> (ReferenceSource, Vec<Customer>) {
        let limit = self.config.reference_limit;

        if let Some(history) = &self.history {
            match self.from_history(history.as_ref(), limit).await {
                Ok(found) if !found.is_empty() => return (ReferenceSource::CampaignHistory, found),
                Ok(_) => debug!("No successful campaign recipients"),
                Err(e) => warn!(error = %e, "Campaign history unavailable for lookalike"),
            }
        }

        if let Some(seed) = &context.seed_rule {
            match self.resolver.resolve(seed).await {
                Ok(mut found) if !found.is_empty() => {
                    found.truncate(limit);
                    return (ReferenceSource::SeedSegment, found);
                }
                Ok(_) => debug!("Seed segment is empty"),
                Err(e) => warn!(error = %e, "Seed segment could not be resolved for lookalike"),
            }
        }

        match self.high_value_customers(limit).await {
            Ok(found) if !found.is_empty() => (ReferenceSource::HighValueCustomers, found),
            Ok(_) => (ReferenceSource::None, Vec::new()),
            Err(e) => {
                warn!(error = %e, "High-value customers could not be resolved for lookalike");
                (ReferenceSource::None, Vec::new())
            }
        }
    }

    async fn from_history(&self, history: &dyn RecipientHistory, limit: usize) -> CrmResult<Vec<Customer>> {
        let ids = history.successful_recipients(limit).await?;
        let mut seen = HashSet::new();
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            if !seen.insert(id) {
                continue;
            }
            if let Some(customer) = self.resolver.store().get(id).await? {
                found.push(customer);
            }
        }
        Ok(found)
    }

    async fn high_value_customers(&self, limit: usize) -> CrmResult<Vec<Customer>> {
        let rule = RuleBuilder::all()
            .greater_than_or_equal(Field::TotalSpend, self.config.high_value_min_spend)
            .build()?;
        let mut found = self.resolver.resolve(&rule).await?;
        found.sort_by(|a, b| b.total_spend.total_cmp(&a.total_spend));
        found.truncate(limit);
        Ok(found)
    }
}
