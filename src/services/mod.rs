pub mod export;
pub mod inference;
pub mod orchestrator;
pub mod progress;
pub mod registry;
pub mod retry;
