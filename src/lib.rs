pub mod config;
pub mod error;
pub mod flow;
pub mod liveness;
pub mod model_download;
pub mod pipeline;
pub mod publisher;
pub mod types;
