//! Consolidates the Java bytecode of an Android firmware dump into one class
//! archive.
//!
//! Source jars, apks, dex files and APEX containers are unpacked stage by
//! stage, dex code is converted to jars with an external converter, and every
//! recovered `.class` file is merged into `framework-all.jar`.

pub mod config;
pub mod executor;
pub mod harvest;
pub mod model;
pub mod traits;

// Re-export common types for convenience
pub use config::{ConfigError, HarvestConfig, Oem, ToolPaths};
pub use executor::*;
pub use harvest::{HarvestPipeline, PipelineError, PipelineOutcome, PipelineReport};
pub use model::*;
pub use traits::*;
