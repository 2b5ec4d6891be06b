pub mod bus;
pub mod config;
pub mod container;
pub mod errors;
pub mod executor;
pub mod logging;
pub mod orchestrator;
pub mod queue;
pub mod store;
pub mod terminal;

pub use orchestrator::Orchestrator;
