pub mod config;
pub mod connector;
pub mod driver;
pub mod outcome;

pub use config::{DriverConfig, ModeSelection};
pub use connector::StaticConnector;
pub use driver::Driver;
pub use outcome::{EventRecord, FlowEvent, FlowOutcome, FlowState};
