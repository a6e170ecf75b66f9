//! Campaign orchestration: delivers a personalized message to every
//! customer in a segment and tracks per-recipient outcomes.

pub mod delivery;
pub mod models;
pub mod orchestrator;
pub mod personalize;
pub mod store;

pub use delivery::{DeliveryProvider, DeliveryRequest, SimulatedVendor};
pub use models::{Campaign, CampaignStatus, CommunicationLog, DeliveryReceipt, DeliveryStatus, NewCampaign};
pub use orchestrator::CampaignOrchestrator;
pub use store::CampaignStore;
