pub mod adapters;
pub mod approval;
pub mod executor;
pub mod gate;
pub mod registry;

pub use approval::ApprovalBroker;
pub use executor::{DryRunReport, Executor, ExecutorOptions};
pub use gate::{ExecutionManager, GateOptions};
pub use registry::AdapterRegistry;
