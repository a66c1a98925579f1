//! Import sources - remote locations to fetch boot images from

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use url::{Host, Url};

/// Wildcard accepted in any selection field
pub const WILDCARD: &str = "*";

/// A remote image index plus the criteria deciding which of its products to import
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSource {
    /// URL of the source's image index
    pub url: String,
    /// Keyring used to verify the index signature; unsigned when absent
    #[serde(default)]
    pub keyring: Option<PathBuf>,
    /// Products to import. No selections means everything the index offers.
    #[serde(default)]
    pub selections: Vec<BootSourceSelection>,
}

impl ImportSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            keyring: None,
            selections: Vec::new(),
        }
    }

    pub fn with_keyring(mut self, keyring: impl Into<PathBuf>) -> Self {
        self.keyring = Some(keyring.into());
        self
    }

    pub fn with_selection(mut self, selection: BootSourceSelection) -> Self {
        self.selections.push(selection);
        self
    }

    /// Hostname of the source URL, if it has one
    ///
    /// Domains come back lower-cased and IPv6 literals without brackets, so
    /// the result can go straight into a `no_proxy` list.
    pub fn hostname(&self) -> Option<String> {
        let url = Url::parse(&self.url).ok()?;
        match url.host()? {
            Host::Domain(domain) if !domain.is_empty() => Some(domain.to_ascii_lowercase()),
            Host::Domain(_) => None,
            Host::Ipv4(addr) => Some(addr.to_string()),
            Host::Ipv6(addr) => Some(addr.to_string()),
        }
    }

    /// Whether a product passes this source's selections
    pub fn selects(&self, arch: &str, subarch: &str, release: &str, label: &str) -> bool {
        self.selections.is_empty()
            || self
                .selections
                .iter()
                .any(|s| s.matches(arch, subarch, release, label))
    }
}

/// One selection filter within a source
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BootSourceSelection {
    pub release: String,
    #[serde(default)]
    pub arches: Vec<String>,
    #[serde(default)]
    pub subarches: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl BootSourceSelection {
    pub fn new(release: impl Into<String>) -> Self {
        Self {
            release: release.into(),
            ..Default::default()
        }
    }

    pub fn with_arches<I, S>(mut self, arches: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arches = arches.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_subarches<I, S>(mut self, subarches: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subarches = subarches.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn matches(&self, arch: &str, subarch: &str, release: &str, label: &str) -> bool {
        (self.release == WILDCARD || self.release == release)
            && list_matches(&self.arches, arch)
            && list_matches(&self.subarches, subarch)
            && list_matches(&self.labels, label)
    }
}

fn list_matches(allowed: &[String], value: &str) -> bool {
    allowed.is_empty() || allowed.iter().any(|a| a == WILDCARD || a == value)
}
