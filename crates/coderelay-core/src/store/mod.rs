pub mod account_store;
pub mod execution_store;
pub mod log_store;
pub mod retry_store;
pub mod trigger_store;
pub mod workflow_store;

pub use account_store::AccountStore;
pub use execution_store::ExecutionStore;
pub use log_store::LogStore;
pub use retry_store::RetryStore;
pub use trigger_store::TriggerStore;
pub use workflow_store::WorkflowStore;
