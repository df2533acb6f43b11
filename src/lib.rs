pub mod config;
pub mod duck;
pub mod error;
pub mod fetch;
pub mod normalize;
pub mod pipeline;
pub mod source;
pub mod stage;
pub mod store;
pub mod warehouse;

pub use config::PipelineConfig;
pub use duck::DuckStore;
pub use error::{EtlError, Result};
pub use pipeline::{Pipeline, RunOptions, RunReport};
pub use store::RelationalStore;
