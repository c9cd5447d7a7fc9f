//! Backend abstraction layer
//!
//! Provides common traits and types that the Vulkan and recording backends implement.

pub mod recording;
pub mod traits;
pub mod types;
pub mod vulkan;

pub use recording::{Command, RecordingBackend};
pub use traits::*;
pub use types::*;
