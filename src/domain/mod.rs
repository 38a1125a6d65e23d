pub mod device;
pub mod scoring;
pub mod status_engine;
pub mod thresholds;
pub mod types;
pub mod vocabulary;
