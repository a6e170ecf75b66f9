//! Campaign domain types: campaigns, per-recipient communication logs and
//! vendor receipts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Campaign ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    pub segment_id: Uuid,
    pub message_template: String,
    pub status: CampaignStatus,
    /// Snapshot taken at creation, replaced with the resolved size on
    /// execution. Later segment changes do not touch it.
    pub audience_size: u64,
    pub sent_count: u64,
    pub failed_count: u64,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CampaignStatus {
    #[serde(rename = "draft")]
    Draft,
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "PROCESSING")]
    Processing,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Pending => "PENDING",
            CampaignStatus::Processing => "PROCESSING",
            CampaignStatus::Completed => "COMPLETED",
            CampaignStatus::Failed => "FAILED",
        }
    }

    /// States from which `execute` may start.
    pub fn is_executable(&self) -> bool {
        matches!(self, CampaignStatus::Draft | CampaignStatus::Pending)
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCampaign {
    pub name: String,
    pub segment_id: Uuid,
    pub message_template: String,
    pub created_by: Uuid,
}

// ─── Communication log ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

/// One delivery attempt for one customer in one campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunicationLog {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub customer_id: Uuid,
    pub message: String,
    pub status: DeliveryStatus,
    pub vendor_message_id: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Asynchronous delivery report from the vendor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub log_id: Uuid,
    pub status: DeliveryStatus,
    #[serde(default)]
    pub vendor_message_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}
