pub mod clock;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod types;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::AppConfig;
pub use error::{CrmError, CrmResult};
pub use event_bus::EventSink;
pub use types::Customer;
