//! Delivery providers: the vendor boundary for outbound messages.

use async_trait::async_trait;
use crm_core::{CrmError, CrmResult};
use rand::Rng;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryRequest {
    pub log_id: Uuid,
    pub campaign_id: Uuid,
    pub customer_id: Uuid,
    pub recipient: String,
    pub message: String,
}

/// Vendor acknowledgement for an accepted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryOutcome {
    pub vendor_message_id: String,
}

#[async_trait]
pub trait DeliveryProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Hand one message to the vendor. An error affects only this recipient.
    async fn send(&self, request: &DeliveryRequest) -> CrmResult<DeliveryOutcome>;
}

/// Vendor stand-in that accepts each message with a fixed probability.
pub struct SimulatedVendor {
    success_rate: f64,
}

impl SimulatedVendor {
    pub fn new(success_rate: f64) -> Self {
        let success_rate = if success_rate.is_finite() {
            success_rate.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self { success_rate }
    }

    pub fn success_rate(&self) -> f64 {
        self.success_rate
    }
}

#[async_trait]
impl DeliveryProvider for SimulatedVendor {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn send(&self, request: &DeliveryRequest) -> CrmResult<DeliveryOutcome> {
        let accepted = rand::thread_rng().gen_bool(self.success_rate);
        debug!(
            log_id = %request.log_id,
            recipient = %request.recipient,
            accepted,
            "Simulated vendor send"
        );
        if accepted {
            Ok(DeliveryOutcome {
                vendor_message_id: format!("sim-{}", Uuid::new_v4()),
            })
        } else {
            Err(CrmError::Delivery(format!(
                "vendor rejected message for {}",
                request.recipient
            )))
        }
    }
}
