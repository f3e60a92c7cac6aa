pub mod cancel;
pub mod errors;
pub mod node;
pub mod parameters;
pub mod task;

pub use cancel::*;
pub use errors::*;
pub use node::*;
pub use parameters::*;
pub use task::*;
