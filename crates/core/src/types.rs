use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// A CRM customer profile. Aggregates (`total_spend`, `total_visits`,
/// `last_visit_date`) only move through order processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub total_spend: f64,
    #[serde(default)]
    pub total_visits: u64,
    #[serde(default)]
    pub last_visit_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

impl Customer {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }

    /// Lowercased part after `@`, if the address has one.
    pub fn email_domain(&self) -> Option<String> {
        self.email
            .rsplit_once('@')
            .map(|(_, domain)| domain.to_lowercase())
            .filter(|d| !d.is_empty())
    }
}

/// Payload for registering a new customer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCustomer {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

/// Explicit profile edit. Aggregates and `created_at` are not editable here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomerUpdate {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub tags: Option<BTreeSet<String>>,
}

/// A completed order for a customer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEvent {
    pub order_id: Uuid,
    pub customer_id: Uuid,
    pub amount: f64,
    pub occurred_at: DateTime<Utc>,
}

/// Domain event published through the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub segment_id: Option<Uuid>,
    pub campaign_id: Option<Uuid>,
    pub customer_id: Option<Uuid>,
    pub detail: Option<String>,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SegmentCreated,
    SegmentUpdated,
    SegmentRefreshed,
    CampaignCreated,
    CampaignStarted,
    CampaignCompleted,
    CampaignFailed,
    MessageSent,
    MessageFailed,
    OrderRecorded,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn customer(email: &str) -> Customer {
        Customer {
            id: Uuid::new_v4(),
            email: email.to_string(),
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            phone: None,
            address: None,
            total_spend: 0.0,
            total_visits: 0,
            last_visit_date: None,
            tags: BTreeSet::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_email_domain() {
        assert_eq!(
            customer("ada@Example.COM").email_domain(),
            Some("example.com".to_string())
        );
        assert_eq!(customer("no-at-sign").email_domain(), None);
        assert_eq!(customer("trailing@").email_domain(), None);
    }

    #[test]
    fn test_missing_aggregates_default_to_zero() {
        let json = serde_json::json!({
            "id": Uuid::new_v4(),
            "email": "a@b.com",
            "first_name": "A",
            "last_name": "B",
            "created_at": "2024-01-01T00:00:00Z"
        });
        let c: Customer = serde_json::from_value(json).unwrap();
        assert_eq!(c.total_spend, 0.0);
        assert_eq!(c.total_visits, 0);
        assert!(c.tags.is_empty());
        assert!(c.last_visit_date.is_none());
    }
}
