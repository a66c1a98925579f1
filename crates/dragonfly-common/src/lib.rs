//! Shared models for Dragonfly boot image management
//!
//! These types cross the boundary between the CLI, the import coordinator
//! and the resource-root lister.

pub mod boot_image;
pub mod source;

pub use boot_image::{BootImage, BootPurpose};
pub use source::{BootSourceSelection, ImportSource};
