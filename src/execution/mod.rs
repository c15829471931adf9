//! Pipeline execution engine

pub mod engine;
pub mod executor;
pub mod fanout;
pub mod metadata;

pub use engine::{EventHandler, ExecutionEngine, ExecutionEvent};
pub use executor::StageExecutor;
pub use fanout::{FanOutReport, FanOutRunner};
