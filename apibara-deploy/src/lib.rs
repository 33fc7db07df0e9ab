pub mod engine;
pub mod git;
pub mod image;
pub mod indexer;
pub mod pipeline;
pub mod report;
pub mod secret;

pub(crate) mod process;
pub(crate) mod version;

pub mod cli;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = BoxError> = std::result::Result<T, E>;
