// Task management — DAG execution engine and background task registry

pub mod engine;
pub mod registry;

pub use engine::{TaskEngine, TaskPriority, TaskSpec, TaskStatus};
pub use registry::{TaskRegistry, DEFAULT_CANCEL_DEADLINE};
