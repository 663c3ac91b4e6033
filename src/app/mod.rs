pub mod context;
pub mod errors;
pub mod handler;
pub mod ingest;
pub mod task_runner;

pub use context::AppContext;
