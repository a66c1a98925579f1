//! Boot images available in the local resource root

use serde::{Deserialize, Serialize};
use std::fmt;

/// What a boot image can be used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootPurpose {
    /// Ephemeral boot used to enlist and commission hardware
    Commissioning,
    /// Installer boot (kernel + initrd)
    Install,
    /// Fast-path install that writes a root image straight to disk
    Xinstall,
}

impl BootPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            BootPurpose::Commissioning => "commissioning",
            BootPurpose::Install => "install",
            BootPurpose::Xinstall => "xinstall",
        }
    }
}

impl fmt::Display for BootPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One locally available boot image
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BootImage {
    pub architecture: String,
    pub subarchitecture: String,
    pub release: String,
    pub label: String,
    pub purpose: BootPurpose,
}
