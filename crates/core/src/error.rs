use thiserror::Error;
use uuid::Uuid;

pub type CrmResult<T> = Result<T, CrmError>;

#[derive(Error, Debug)]
pub enum CrmError {
    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    /// A rule names an operator the evaluator cannot apply. Never downgraded
    /// to a skipped condition: that would widen the audience.
    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),

    #[error("Resolution too large: {rows} rows exceeds the in-memory budget of {limit}")]
    ResolutionTooLarge { rows: usize, limit: usize },

    #[error("Customer store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Segment not found: {0}")]
    SegmentNotFound(Uuid),

    #[error("Campaign not found: {0}")]
    CampaignNotFound(Uuid),

    #[error("Customer not found: {0}")]
    CustomerNotFound(Uuid),

    #[error("Customer email already registered: {0}")]
    DuplicateEmail(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Delivery error: {0}")]
    Delivery(String),
}

impl CrmError {
    pub fn invalid_rule(msg: impl Into<String>) -> Self {
        Self::InvalidRule(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedOperator(msg.into())
    }
}
