pub mod config;
pub mod error;
pub mod event;
pub mod plan;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{FlowgateError, Result, ValidationError};
pub use event::{EventBus, EventEnvelope, Topic};
pub use plan::{NodeKind, Plan, PlanContext, PlanNode};
pub use types::*;
