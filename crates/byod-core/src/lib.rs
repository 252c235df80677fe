pub mod config;
pub mod error;
pub mod output;
pub mod types;

pub use error::{BackendCategory, ByodError, ByodResult};
pub use output::OutputContext;
pub use types::JobStatus;
