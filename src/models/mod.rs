pub mod api;
pub mod batch;
pub mod export;
pub mod prediction;
pub mod progress;
