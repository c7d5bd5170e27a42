//! Flash planning
//!
//! Data model of a resolved flash, the declarative family rules, and the
//! resolver joining them with the compatibility table.

mod models;
mod resolver;
pub mod rules;
mod version;

pub use models::{
    substitute, ArchiveFormat, Artifact, ArtifactKind, CommandTemplate, ExtractStep,
    FlashOptions, FlashPlan, HostRequirements, PrepareStep, StorageClass, TemplateVars, UsbId,
    WORKDIR_VAR,
};
pub use resolver::ConfigResolver;
pub use rules::RuleSet;
pub use version::{ReleaseVersion, VersionRange};
