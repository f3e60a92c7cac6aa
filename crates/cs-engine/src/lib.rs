// chainsearch engine: validated tasks, pipeline enumeration and execution

pub mod backend;
pub mod generator;
pub mod pipeline;
pub mod spec_text;
pub mod task;

pub use backend::{Backend, BackendRequest, CommandBackend, InvocationThrottle};
pub use generator::{ChainConstraints, PipelineGenerator};
pub use pipeline::{NodeRole, OperationSpec, Pipeline, PipelineNode};
pub use task::Task;
