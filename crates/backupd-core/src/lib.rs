//! `backupd-core`: configuration model and shared error type for backupd.

pub mod config;
pub mod error;

pub use config::{
    ArchiveConfig, BackupdConfig, BlobConfig, OutputConfig, ProfileConfig, SchedulerConfig,
    SearchDefinitionConfig,
};
pub use error::{BackupdError, Result};
