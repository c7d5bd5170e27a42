//! Utility functions shared across the application
//!
//! Formatting, path management, host system queries and progress tracking.

mod format;
mod path;
mod progress;
mod system;

pub use format::*;
pub use path::*;
pub use progress::*;
pub use system::*;
