//! Campaign orchestrator: creates campaigns against segments and runs them.
//!
//! Execution resolves the segment's audience, then sends one personalized
//! message per customer in sequence with a fixed pacing delay. A failed send
//! is recorded on its log and counted; it never stops the run.

use std::sync::Arc;
use std::time::Duration;

use crm_core::config::CampaignConfig;
use crm_core::types::EventType;
use crm_core::{event_bus, Clock, CrmError, CrmResult, Customer, EventSink};
use crm_segmentation::SegmentManager;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::delivery::{DeliveryProvider, DeliveryRequest};
use crate::models::{Campaign, CampaignStatus, CommunicationLog, DeliveryReceipt, DeliveryStatus, NewCampaign};
use crate::personalize;
use crate::store::CampaignStore;

pub struct CampaignOrchestrator {
    store: Arc<CampaignStore>,
    segments: Arc<SegmentManager>,
    provider: Arc<dyn DeliveryProvider>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    config: CampaignConfig,
}

impl CampaignOrchestrator {
    pub fn new(
        store: Arc<CampaignStore>,
        segments: Arc<SegmentManager>,
        provider: Arc<dyn DeliveryProvider>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        config: CampaignConfig,
    ) -> Self {
        Self {
            store,
            segments,
            provider,
            events,
            clock,
            config,
        }
    }

    pub fn store(&self) -> &Arc<CampaignStore> {
        &self.store
    }

    /// Create a draft campaign, capturing the segment's current audience size.
    pub async fn create_campaign(&self, req: NewCampaign) -> CrmResult<Campaign> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(CrmError::InvalidState("campaign name must not be empty".into()));
        }
        if req.message_template.trim().is_empty() {
            return Err(CrmError::InvalidState("message template must not be empty".into()));
        }
        let segment = self.segments.get(req.segment_id).await?;

        let now = self.clock.now();
        let campaign = Campaign {
            id: Uuid::new_v4(),
            name: name.to_string(),
            segment_id: segment.id,
            message_template: req.message_template,
            status: CampaignStatus::Draft,
            audience_size: segment.audience_size,
            sent_count: 0,
            failed_count: 0,
            created_by: req.created_by,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };
        self.store.insert_campaign(campaign.clone());

        info!(
            campaign_id = %campaign.id,
            segment_id = %segment.id,
            audience_size = campaign.audience_size,
            "Campaign created"
        );
        self.emit(EventType::CampaignCreated, campaign.id, None);
        Ok(campaign)
    }

    /// Queue a draft campaign for execution.
    pub fn launch(&self, campaign_id: Uuid) -> CrmResult<Campaign> {
        let now = self.clock.now();
        self.store.update_campaign(campaign_id, |c| {
            if c.status != CampaignStatus::Draft {
                return Err(CrmError::InvalidState(format!(
                    "campaign {} is {}, only draft campaigns can be launched",
                    c.id, c.status
                )));
            }
            c.status = CampaignStatus::Pending;
            c.updated_at = now;
            Ok(())
        })
    }

    /// Launch and execute on a background task.
    pub fn spawn_execute(self: &Arc<Self>, campaign_id: Uuid) -> CrmResult<JoinHandle<CrmResult<Campaign>>> {
        self.launch(campaign_id)?;
        let this = Arc::clone(self);
        Ok(tokio::spawn(async move { this.execute(campaign_id).await }))
    }

    /// Run a draft or pending campaign to completion.
    ///
    /// Fails with `InvalidState` for any other status. If the audience
    /// cannot be resolved the campaign is marked FAILED and the resolution
    /// error is returned.
    pub async fn execute(&self, campaign_id: Uuid) -> CrmResult<Campaign> {
        let started = self.clock.now();
        let campaign = self.store.update_campaign(campaign_id, |c| {
            if !c.status.is_executable() {
                return Err(CrmError::InvalidState(format!(
                    "campaign {} is {}, cannot execute",
                    c.id, c.status
                )));
            }
            c.status = CampaignStatus::Processing;
            c.started_at = Some(started);
            c.updated_at = started;
            Ok(())
        })?;
        self.emit(EventType::CampaignStarted, campaign.id, None);

        let audience = match self.resolve_audience(&campaign).await {
            Ok(audience) => audience,
            Err(e) => return self.fail(campaign.id, "audience resolution", e),
        };

        let audience_size = audience.len() as u64;
        if let Err(e) = self.store.update_campaign(campaign.id, |c| {
            c.audience_size = audience_size;
            Ok(())
        }) {
            return self.fail(campaign.id, "audience snapshot", e);
        }
        info!(campaign_id = %campaign.id, audience_size, "Campaign execution started");

        let pacing = Duration::from_millis(self.config.pacing_delay_ms);
        for (i, customer) in audience.iter().enumerate() {
            if i > 0 && !pacing.is_zero() {
                tokio::time::sleep(pacing).await;
            }
            if let Err(e) = self.deliver(&campaign, customer).await {
                return self.fail(campaign.id, "delivery bookkeeping", e);
            }
        }

        let finished = self.clock.now();
        let done = self.store.update_campaign(campaign.id, |c| {
            c.status = CampaignStatus::Completed;
            c.completed_at = Some(finished);
            c.updated_at = finished;
            Ok(())
        })?;
        info!(
            campaign_id = %done.id,
            sent = done.sent_count,
            failed = done.failed_count,
            "Campaign completed"
        );
        self.emit(
            EventType::CampaignCompleted,
            done.id,
            Some(format!("sent={} failed={}", done.sent_count, done.failed_count)),
        );
        Ok(done)
    }

    /// Mark the campaign FAILED and hand back the error that stopped it.
    fn fail(&self, campaign_id: Uuid, stage: &str, e: CrmError) -> CrmResult<Campaign> {
        error!(campaign_id = %campaign_id, stage, error = %e, "Campaign execution failed");
        let at = self.clock.now();
        if let Err(mark) = self.store.update_campaign(campaign_id, |c| {
            c.status = CampaignStatus::Failed;
            c.completed_at = Some(at);
            c.updated_at = at;
            Ok(())
        }) {
            error!(campaign_id = %campaign_id, error = %mark, "Could not mark campaign as failed");
        }
        self.emit(EventType::CampaignFailed, campaign_id, Some(e.to_string()));
        Err(e)
    }

    pub fn apply_receipt(&self, receipt: &DeliveryReceipt) -> CrmResult<CommunicationLog> {
        self.store.apply_receipt(receipt, self.clock.now())
    }

    async fn resolve_audience(&self, campaign: &Campaign) -> CrmResult<Vec<Customer>> {
        let segment = self.segments.get(campaign.segment_id).await?;
        self.segments.resolver().resolve(&segment.rules).await
    }

    /// One recipient. Vendor errors end up on the log; only store errors
    /// propagate.
    async fn deliver(&self, campaign: &Campaign, customer: &Customer) -> CrmResult<()> {
        let now = self.clock.now();
        let log = CommunicationLog {
            id: Uuid::new_v4(),
            campaign_id: campaign.id,
            customer_id: customer.id,
            message: personalize::render(&campaign.message_template, customer),
            status: DeliveryStatus::Pending,
            vendor_message_id: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_log(log.clone());

        let request = DeliveryRequest {
            log_id: log.id,
            campaign_id: campaign.id,
            customer_id: customer.id,
            recipient: customer.email.clone(),
            message: log.message,
        };
        let result = self.provider.send(&request).await;
        let at = self.clock.now();

        match result {
            Ok(outcome) => {
                self.store.update_log(log.id, |l| {
                    l.status = DeliveryStatus::Sent;
                    l.vendor_message_id = Some(outcome.vendor_message_id);
                    l.updated_at = at;
                });
                self.store.update_campaign(campaign.id, |c| {
                    ensure_processing(c)?;
                    c.sent_count += 1;
                    c.updated_at = at;
                    Ok(())
                })?;
                metrics::counter!("campaigns.messages_sent").increment(1);
                self.events.emit(
                    event_bus::make_event(EventType::MessageSent)
                        .with_campaign(campaign.id)
                        .with_customer(customer.id),
                );
            }
            Err(e) => {
                warn!(
                    campaign_id = %campaign.id,
                    customer_id = %customer.id,
                    provider = self.provider.name(),
                    error = %e,
                    "Message delivery failed"
                );
                self.store.update_log(log.id, |l| {
                    l.status = DeliveryStatus::Failed;
                    l.error = Some(e.to_string());
                    l.updated_at = at;
                });
                self.store.update_campaign(campaign.id, |c| {
                    ensure_processing(c)?;
                    c.failed_count += 1;
                    c.updated_at = at;
                    Ok(())
                })?;
                metrics::counter!("campaigns.messages_failed").increment(1);
                self.events.emit(
                    event_bus::make_event(EventType::MessageFailed)
                        .with_campaign(campaign.id)
                        .with_customer(customer.id)
                        .with_detail(e.to_string()),
                );
            }
        }
        Ok(())
    }

    fn emit(&self, event_type: EventType, campaign_id: Uuid, detail: Option<String>) {
        let mut event = event_bus::make_event(event_type).with_campaign(campaign_id);
        event.timestamp = self.clock.now();
        if let Some(detail) = detail {
            event = event.with_detail(detail);
        }
        self.events.emit(event);
    }
}

/// Delivery counters only move while the run owns the campaign.
fn ensure_processing(campaign: &Campaign) -> CrmResult<()> {
    if campaign.status == CampaignStatus::Processing {
        Ok(())
    } else {
        Err(CrmError::InvalidState(format!(
            "campaign {} left PROCESSING during delivery (now {})",
            campaign.id, campaign.status
        )))
    }
}
