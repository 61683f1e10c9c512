//! Workflow DAG execution: schema, graph validation, and the runner.

pub mod executor;
pub mod graph;
pub mod schema;

pub use executor::WorkflowRunner;
pub use graph::WorkflowGraph;
pub use schema::{EdgeDef, NodeDef, NodeKind, WorkflowDef};
