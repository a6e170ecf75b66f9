//! In-memory campaign store backed by DashMap.
//!
//! Holds campaigns and their communication logs, and serves successful
//! recipients to lookalike synthesis.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crm_core::{CrmError, CrmResult};
use crm_segmentation::RecipientHistory;
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::models::{Campaign, CampaignStatus, CommunicationLog, DeliveryReceipt, DeliveryStatus};

#[derive(Default)]
pub struct CampaignStore {
    campaigns: DashMap<Uuid, Campaign>,
    logs: DashMap<Uuid, CommunicationLog>,
}

impl CampaignStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ─── Campaigns ─────────────────────────────────────────────────────────

    pub fn insert_campaign(&self, campaign: Campaign) {
        self.campaigns.insert(campaign.id, campaign);
    }

    pub fn get_campaign(&self, id: Uuid) -> CrmResult<Campaign> {
        self.campaigns
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or(CrmError::CampaignNotFound(id))
    }

    /// Campaigns newest first, optionally restricted to one owner.
    pub fn list_campaigns(&self, owner: Option<Uuid>) -> Vec<Campaign> {
        let mut campaigns: Vec<Campaign> = self
            .campaigns
            .iter()
            .filter(|r| owner.map_or(true, |o| r.created_by == o))
            .map(|r| r.value().clone())
            .collect();
        campaigns.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        campaigns
    }

    /// Apply `f` to a campaign under its entry lock and return the result.
    pub fn update_campaign<F>(&self, id: Uuid, f: F) -> CrmResult<Campaign>
    where
        F: FnOnce(&mut Campaign) -> CrmResult<()>,
    {
        let mut entry = self.campaigns.get_mut(&id).ok_or(CrmError::CampaignNotFound(id))?;
        f(entry.value_mut())?;
        Ok(entry.value().clone())
    }

    // ─── Communication logs ────────────────────────────────────────────────

    pub fn insert_log(&self, log: CommunicationLog) {
        self.logs.insert(log.id, log);
    }

    pub fn get_log(&self, id: Uuid) -> Option<CommunicationLog> {
        self.logs.get(&id).map(|r| r.value().clone())
    }

    pub fn logs_for(&self, campaign_id: Uuid) -> Vec<CommunicationLog> {
        let mut logs: Vec<CommunicationLog> = self
            .logs
            .iter()
            .filter(|r| r.campaign_id == campaign_id)
            .map(|r| r.value().clone())
            .collect();
        logs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        logs
    }

    pub fn update_log<F>(&self, id: Uuid, f: F) -> Option<CommunicationLog>
    where
        F: FnOnce(&mut CommunicationLog),
    {
        self.logs.get_mut(&id).map(|mut entry| {
            f(entry.value_mut());
            entry.value().clone()
        })
    }

    /// Apply a vendor receipt to its log and move the campaign counters to
    /// match. Receipts that repeat the current status are no-ops.
    pub fn apply_receipt(&self, receipt: &DeliveryReceipt, at: DateTime<Utc>) -> CrmResult<CommunicationLog> {
        if receipt.status == DeliveryStatus::Pending {
            return Err(CrmError::InvalidState(
                "receipt cannot move a message back to PENDING".into(),
            ));
        }

        let (campaign_id, previous) = {
            let mut entry = self.logs.get_mut(&receipt.log_id).ok_or_else(|| {
                CrmError::InvalidState(format!("unknown communication log {}", receipt.log_id))
            })?;
            let log = entry.value_mut();
            let previous = log.status;
            if previous == receipt.status {
                return Ok(log.clone());
            }
            log.status = receipt.status;
            log.updated_at = at;
            if let Some(id) = &receipt.vendor_message_id {
                log.vendor_message_id = Some(id.clone());
            }
            match receipt.status {
                DeliveryStatus::Failed => {
                    if let Some(error) = &receipt.error {
                        log.error = Some(error.clone());
                    }
                }
                _ => log.error = None,
            }
            (log.campaign_id, previous)
        };

        self.update_campaign(campaign_id, |c| {
            match previous {
                DeliveryStatus::Sent => c.sent_count = c.sent_count.saturating_sub(1),
                DeliveryStatus::Failed => c.failed_count = c.failed_count.saturating_sub(1),
                DeliveryStatus::Pending => {}
            }
            match receipt.status {
                DeliveryStatus::Sent => c.sent_count += 1,
                DeliveryStatus::Failed => c.failed_count += 1,
                DeliveryStatus::Pending => {}
            }
            c.updated_at = at;
            Ok(())
        })?;

        debug!(
            log_id = %receipt.log_id,
            from = ?previous,
            to = ?receipt.status,
            "Delivery receipt applied"
        );
        self.get_log(receipt.log_id)
            .ok_or_else(|| CrmError::InvalidState(format!("communication log {} vanished", receipt.log_id)))
    }
}

#[async_trait]
impl RecipientHistory for CampaignStore {
    async fn successful_recipients(&self, limit: usize) -> CrmResult<Vec<Uuid>> {
        let completed: HashSet<Uuid> = self
            .campaigns
            .iter()
            .filter(|c| c.status == CampaignStatus::Completed)
            .map(|c| c.id)
            .collect();

        let mut sent: Vec<(DateTime<Utc>, Uuid)> = self
            .logs
            .iter()
            .filter(|l| l.status == DeliveryStatus::Sent && completed.contains(&l.campaign_id))
            .map(|l| (l.updated_at, l.customer_id))
            .collect();
        sent.sort_by(|a, b| b.0.cmp(&a.0));

        let mut seen = HashSet::new();
        Ok(sent
            .into_iter()
            .filter_map(|(_, id)| seen.insert(id).then_some(id))
            .take(limit)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn campaign(status: CampaignStatus) -> Campaign {
        let now = Utc::now();
        Campaign {
            id: Uuid::new_v4(),
            name: "Spring".into(),
            segment_id: Uuid::new_v4(),
            message_template: "Hi".into(),
            status,
            audience_size: 0,
            sent_count: 0,
            failed_count: 0,
            created_by: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    fn log(campaign_id: Uuid, customer_id: Uuid, status: DeliveryStatus, at: DateTime<Utc>) -> CommunicationLog {
        CommunicationLog {
            id: Uuid::new_v4(),
            campaign_id,
            customer_id,
            message: "Hi".into(),
            status,
            vendor_message_id: None,
            error: None,
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn test_receipt_moves_counters() {
        let store = CampaignStore::new();
        let mut c = campaign(CampaignStatus::Completed);
        c.sent_count = 1;
        store.insert_campaign(c.clone());
        let l = log(c.id, Uuid::new_v4(), DeliveryStatus::Sent, Utc::now());
        store.insert_log(l.clone());

        let receipt = DeliveryReceipt {
            log_id: l.id,
            status: DeliveryStatus::Failed,
            vendor_message_id: None,
            error: Some("bounced".into()),
        };
        let updated = store.apply_receipt(&receipt, Utc::now()).unwrap();
        assert_eq!(updated.status, DeliveryStatus::Failed);
        assert_eq!(updated.error.as_deref(), Some("bounced"));

        let c = store.get_campaign(c.id).unwrap();
        assert_eq!((c.sent_count, c.failed_count), (0, 1));

        // repeated receipt is a no-op
        store.apply_receipt(&receipt, Utc::now()).unwrap();
        let c = store.get_campaign(c.id).unwrap();
        assert_eq!((c.sent_count, c.failed_count), (0, 1));
    }

    #[test]
    fn test_receipt_rejects_pending_and_unknown() {
        let store = CampaignStore::new();
        let pending = DeliveryReceipt {
            log_id: Uuid::new_v4(),
            status: DeliveryStatus::Pending,
            vendor_message_id: None,
            error: None,
        };
        assert!(matches!(store.apply_receipt(&pending, Utc::now()), Err(CrmError::InvalidState(_))));
        let unknown = DeliveryReceipt {
            status: DeliveryStatus::Sent,
            ..pending
        };
        assert!(matches!(store.apply_receipt(&unknown, Utc::now()), Err(CrmError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_successful_recipients_only_from_completed() {
        let store = CampaignStore::new();
        let done = campaign(CampaignStatus::Completed);
        let running = campaign(CampaignStatus::Processing);
        store.insert_campaign(done.clone());
        store.insert_campaign(running.clone());

        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let t0 = Utc::now();
        store.insert_log(log(done.id, a, DeliveryStatus::Sent, t0));
        store.insert_log(log(done.id, b, DeliveryStatus::Sent, t0 + Duration::seconds(5)));
        store.insert_log(log(done.id, a, DeliveryStatus::Sent, t0 + Duration::seconds(1)));
        store.insert_log(log(done.id, c, DeliveryStatus::Failed, t0));
        store.insert_log(log(running.id, c, DeliveryStatus::Sent, t0));

        assert_eq!(store.successful_recipients(10).await.unwrap(), vec![b, a]);
        assert_eq!(store.successful_recipients(1).await.unwrap(), vec![b]);
    }

    #[test]
    fn test_list_campaigns_by_owner() {
        let store = CampaignStore::new();
        let mine = campaign(CampaignStatus::Draft);
        let owner = mine.created_by;
        store.insert_campaign(mine);
        store.insert_campaign(campaign(CampaignStatus::Draft));
        assert_eq!(store.list_campaigns(Some(owner)).len(), 1);
        assert_eq!(store.list_campaigns(None).len(), 2);
        assert!(matches!(store.get_campaign(Uuid::new_v4()), Err(CrmError::CampaignNotFound(_))));
    }
}
