//! Image synchronization engine
//!
//! [`ImageSynchronizer`] is the seam between the import coordinator and
//! whatever actually moves bytes. [`HttpSynchronizer`] is the bundled
//! implementation: it mirrors products from JSON image indexes into the
//! resource root.
//!
//! # Resource root layout
//!
//! ```text
//! <root>/
//! ├── cache/<sha256>                          content-addressed downloads
//! ├── snapshot-<timestamp>/<arch>/<subarch>/<release>/<label>/<file>
//! └── current -> snapshot-<timestamp>         switched atomically
//! ```
//!
//! Snapshot files are hard links into the cache, so unchanged files are
//! never downloaded twice and old snapshots cost nothing but directory
//! entries until they are cleaned up.

use crate::error::SyncError;
use crate::job::{ImportEnvironment, ImportPlan};
use async_trait::async_trait;
use chrono::Utc;
use dragonfly_common::ImportSource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};
use url::Url;

/// Directory holding content-addressed downloads
pub const CACHE_DIR: &str = "cache";

/// Symlink pointing at the live snapshot
pub const CURRENT_LINK: &str = "current";

/// Prefix of snapshot directory names
pub const SNAPSHOT_PREFIX: &str = "snapshot-";

/// Suffix appended to an index URL to find its detached signature
pub const SIGNATURE_SUFFIX: &str = ".gpg";

/// Performs the actual multi-source synchronization for an import
#[async_trait]
pub trait ImageSynchronizer: Send + Sync {
    async fn synchronize(&self, plan: &ImportPlan) -> Result<SyncReport, SyncError>;
}

/// What an import changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Products laid out in the new snapshot
    pub products: usize,
    /// Files fetched over the network
    pub downloaded: usize,
    /// Files satisfied from the cache
    pub reused: usize,
    /// Snapshot that `current` now points at
    pub snapshot: Option<PathBuf>,
}

/// Image index published by a source
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageIndex {
    #[serde(default)]
    pub products: Vec<IndexProduct>,
}

/// One bootable product in an index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexProduct {
    pub arch: String,
    pub subarch: String,
    pub release: String,
    pub label: String,
    #[serde(default)]
    pub files: Vec<IndexFile>,
}

impl IndexProduct {
    fn key(&self) -> (String, String, String, String) {
        (
            self.arch.clone(),
            self.subarch.clone(),
            self.release.clone(),
            self.label.clone(),
        )
    }
}

/// One file of a product
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexFile {
    /// Name inside the product directory, e.g. `boot-kernel`
    pub name: String,
    /// Location relative to the index URL, or absolute
    pub path: String,
    /// Lower-case hex SHA-256 of the content
    pub sha256: String,
    #[serde(default)]
    pub size: Option<u64>,
}

/// A product chosen for import together with where its files live
#[derive(Debug, Clone)]
struct SelectedProduct {
    index_url: Url,
    product: IndexProduct,
}

/// Mirrors products from HTTP image indexes into the resource root
#[derive(Debug, Clone)]
pub struct HttpSynchronizer {
    connect_timeout: Duration,
    gpgv: PathBuf,
}

impl Default for HttpSynchronizer {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            gpgv: PathBuf::from("gpgv"),
        }
    }
}

impl HttpSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Use a specific `gpgv` binary for signature checks
    pub fn with_gpgv(mut self, gpgv: impl Into<PathBuf>) -> Self {
        self.gpgv = gpgv.into();
        self
    }

    /// Build a client whose proxy settings come only from the import environment
    fn client(&self, env: &ImportEnvironment) -> Result<reqwest::Client, SyncError> {
        let no_proxy = env.no_proxy().and_then(reqwest::NoProxy::from_string);
        let mut builder = reqwest::Client::builder()
            .no_proxy()
            .connect_timeout(self.connect_timeout);

        if let Some(proxy_url) = env.http_proxy() {
            let proxy = reqwest::Proxy::http(proxy_url).map_err(|e| SyncError::InvalidUrl {
                url: proxy_url.to_string(),
                reason: e.to_string(),
            })?;
            builder = builder.proxy(proxy.no_proxy(no_proxy.clone()));
        }
        if let Some(proxy_url) = env.https_proxy() {
            let proxy = reqwest::Proxy::https(proxy_url).map_err(|e| SyncError::InvalidUrl {
                url: proxy_url.to_string(),
                reason: e.to_string(),
            })?;
            builder = builder.proxy(proxy.no_proxy(no_proxy));
        }

        builder.build().map_err(|source| SyncError::Client { source })
    }

    async fn get(&self, client: &reqwest::Client, url: &Url) -> Result<reqwest::Response, SyncError> {
        let response = client
            .get(url.clone())
            .send()
            .await
            .map_err(|source| SyncError::Http {
                url: url.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(SyncError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }

    async fn get_bytes(&self, client: &reqwest::Client, url: &Url) -> Result<Vec<u8>, SyncError> {
        let response = self.get(client, url).await?;
        let body = response.bytes().await.map_err(|source| SyncError::Http {
            url: url.to_string(),
            source,
        })?;
        Ok(body.to_vec())
    }

    /// Fetch, verify and decode one source's index
    async fn fetch_index(
        &self,
        client: &reqwest::Client,
        source: &ImportSource,
        plan: &ImportPlan,
    ) -> Result<(Url, ImageIndex), SyncError> {
        let index_url = Url::parse(&source.url).map_err(|e| SyncError::InvalidUrl {
            url: source.url.clone(),
            reason: e.to_string(),
        })?;

        debug!(url = %index_url, "Fetching image index");
        let body = self.get_bytes(client, &index_url).await?;

        if let Some(keyring) = &source.keyring {
            self.verify_signature(client, &index_url, &body, keyring, plan)
                .await?;
        }

        let index: ImageIndex =
            serde_json::from_slice(&body).map_err(|source| SyncError::Index {
                url: index_url.to_string(),
                source,
            })?;
        info!(url = %index_url, products = index.products.len(), "Image index fetched");
        Ok((index_url, index))
    }

    /// Check the index against its detached signature with `gpgv`
    async fn verify_signature(
        &self,
        client: &reqwest::Client,
        index_url: &Url,
        body: &[u8],
        keyring: &Path,
        plan: &ImportPlan,
    ) -> Result<(), SyncError> {
        let signature_url = signature_url(index_url);
        let signature = self.get_bytes(client, &signature_url).await?;

        fs::create_dir_all(&plan.resource_root)
            .await
            .map_err(|e| SyncError::io(&plan.resource_root, e))?;
        let staging = tempfile::tempdir_in(&plan.resource_root)
            .map_err(|e| SyncError::io(&plan.resource_root, e))?;
        let data_path = staging.path().join("index.json");
        let signature_path = staging.path().join("index.json.gpg");
        fs::write(&data_path, body)
            .await
            .map_err(|e| SyncError::io(&data_path, e))?;
        fs::write(&signature_path, &signature)
            .await
            .map_err(|e| SyncError::io(&signature_path, e))?;

        let mut command = Command::new(&self.gpgv);
        command
            .arg("--keyring")
            .arg(keyring)
            .arg(&signature_path)
            .arg(&data_path);
        plan.environment.apply_to(&mut command);

        let output = command.output().await.map_err(|e| SyncError::Signature {
            url: index_url.to_string(),
            reason: format!("failed to run {}: {}", self.gpgv.display(), e),
        })?;

        if !output.status.success() {
            return Err(SyncError::Signature {
                url: index_url.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        debug!(url = %index_url, keyring = %keyring.display(), "Index signature verified");
        Ok(())
    }

    /// Ensure `file` is in the cache, returning whether it had to be downloaded
    async fn fetch_file(
        &self,
        client: &reqwest::Client,
        index_url: &Url,
        file: &IndexFile,
        cache_dir: &Path,
    ) -> Result<bool, SyncError> {
        let sha256 = file.sha256.to_ascii_lowercase();
        let cached = cache_dir.join(&sha256);
        if fs::try_exists(&cached)
            .await
            .map_err(|e| SyncError::io(&cached, e))?
        {
            debug!(file = %file.name, sha256 = %sha256, "Cache hit");
            return Ok(false);
        }

        let url = index_url.join(&file.path).map_err(|e| SyncError::InvalidUrl {
            url: file.path.clone(),
            reason: e.to_string(),
        })?;
        info!(file = %file.name, url = %url, size = ?file.size, "Downloading");

        let partial = cache_dir.join(format!("{sha256}.partial"));
        let result = self.download(client, &url, file, &partial).await;
        let actual = match result {
            Ok(actual) => actual,
            Err(e) => {
                let _ = fs::remove_file(&partial).await;
                return Err(e);
            }
        };

        if actual != sha256 {
            let _ = fs::remove_file(&partial).await;
            return Err(SyncError::Checksum {
                name: file.name.clone(),
                expected: sha256,
                actual,
            });
        }

        fs::rename(&partial, &cached)
            .await
            .map_err(|e| SyncError::io(&cached, e))?;
        Ok(true)
    }

    /// Stream `url` into `output`, returning the hex SHA-256 of what was written
    async fn download(
        &self,
        client: &reqwest::Client,
        url: &Url,
        file: &IndexFile,
        output: &Path,
    ) -> Result<String, SyncError> {
        let response = self.get(client, url).await?;
        let mut out = fs::File::create(output)
            .await
            .map_err(|e| SyncError::io(output, e))?;
        let mut stream = response.bytes_stream();
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|source| SyncError::Http {
                url: url.to_string(),
                source,
            })?;
            hasher.update(&chunk);
            out.write_all(&chunk)
                .await
                .map_err(|e| SyncError::io(output, e))?;
            written += chunk.len() as u64;
        }
        out.flush().await.map_err(|e| SyncError::io(output, e))?;
        out.sync_all().await.map_err(|e| SyncError::io(output, e))?;

        if let Some(expected) = file.size {
            if expected != written {
                return Err(SyncError::SizeMismatch {
                    name: file.name.clone(),
                    expected,
                    actual: written,
                });
            }
        }

        Ok(format!("{:x}", hasher.finalize()))
    }
}

#[async_trait]
impl ImageSynchronizer for HttpSynchronizer {
    async fn synchronize(&self, plan: &ImportPlan) -> Result<SyncReport, SyncError> {
        if plan.sources.is_empty() {
            info!("No import sources, nothing to synchronize");
            return Ok(SyncReport::default());
        }

        let client = self.client(&plan.environment)?;

        // Earlier sources win when two offer the same product
        let mut selected: BTreeMap<(String, String, String, String), SelectedProduct> =
            BTreeMap::new();
        for source in plan.sources.iter() {
            let (index_url, index) = self.fetch_index(&client, source, plan).await?;
            for product in index.products {
                validate_product(&index_url, &product)?;
                if !source.selects(&product.arch, &product.subarch, &product.release, &product.label)
                {
                    continue;
                }
                selected.entry(product.key()).or_insert_with(|| SelectedProduct {
                    index_url: index_url.clone(),
                    product,
                });
            }
        }

        if selected.is_empty() {
            warn!("Sources selected no products, leaving current snapshot untouched");
            return Ok(SyncReport::default());
        }

        let cache_dir = plan.resource_root.join(CACHE_DIR);
        fs::create_dir_all(&cache_dir)
            .await
            .map_err(|e| SyncError::io(&cache_dir, e))?;

        let mut report = SyncReport::default();
        let mut referenced = BTreeSet::new();
        for entry in selected.values() {
            for file in &entry.product.files {
                if self
                    .fetch_file(&client, &entry.index_url, file, &cache_dir)
                    .await?
                {
                    report.downloaded += 1;
                } else {
                    report.reused += 1;
                }
                referenced.insert(file.sha256.to_ascii_lowercase());
            }
        }

        let snapshot = create_snapshot(&plan.resource_root, &cache_dir, &selected).await?;
        switch_current(&plan.resource_root, &snapshot).await?;
        cleanup(&plan.resource_root, &snapshot, &cache_dir, &referenced).await;

        report.products = selected.len();
        report.snapshot = Some(snapshot);
        info!(
            products = report.products,
            downloaded = report.downloaded,
            reused = report.reused,
            "Boot image synchronization complete"
        );
        Ok(report)
    }
}

/// Detached signature location for an index: `.gpg` appended to the path
fn signature_url(index_url: &Url) -> Url {
    let mut url = index_url.clone();
    url.set_path(&format!("{}{SIGNATURE_SUFFIX}", index_url.path()));
    url
}

/// Reject index entries that would escape their product directory or collide in it
fn validate_product(index_url: &Url, product: &IndexProduct) -> Result<(), SyncError> {
    let invalid = |reason: String| SyncError::InvalidEntry {
        url: index_url.to_string(),
        reason,
    };

    for (field, value) in [
        ("arch", &product.arch),
        ("subarch", &product.subarch),
        ("release", &product.release),
        ("label", &product.label),
    ] {
        if !is_path_component(value) {
            return Err(invalid(format!("{field} {value:?} is not a valid path component")));
        }
    }

    let mut names = BTreeSet::new();
    for file in &product.files {
        if !is_path_component(&file.name) {
            return Err(invalid(format!("file name {:?} is not a valid path component", file.name)));
        }
        if !names.insert(file.name.as_str()) {
            return Err(invalid(format!("file name {:?} appears more than once", file.name)));
        }
        if file.sha256.len() != 64 || !file.sha256.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid(format!("{} has a malformed sha256", file.name)));
        }
    }
    Ok(())
}

fn is_path_component(value: &str) -> bool {
    !value.is_empty() && value != "." && value != ".." && !value.contains(['/', '\\', '\0'])
}

/// Lay out a fresh snapshot directory of hard links into the cache
async fn create_snapshot(
    root: &Path,
    cache_dir: &Path,
    selected: &BTreeMap<(String, String, String, String), SelectedProduct>,
) -> Result<PathBuf, SyncError> {
    let stamp = Utc::now().format("%Y%m%d-%H%M%S").to_string();
    let mut snapshot = root.join(format!("{SNAPSHOT_PREFIX}{stamp}"));
    let mut attempt = 1;
    while fs::try_exists(&snapshot)
        .await
        .map_err(|e| SyncError::io(&snapshot, e))?
    {
        snapshot = root.join(format!("{SNAPSHOT_PREFIX}{stamp}-{attempt}"));
        attempt += 1;
    }

    for entry in selected.values() {
        let product = &entry.product;
        let dir = snapshot
            .join(&product.arch)
            .join(&product.subarch)
            .join(&product.release)
            .join(&product.label);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| SyncError::io(&dir, e))?;

        for file in &product.files {
            let source = cache_dir.join(file.sha256.to_ascii_lowercase());
            let target = dir.join(&file.name);
            fs::hard_link(&source, &target)
                .await
                .map_err(|e| SyncError::io(&target, e))?;
        }
    }

    debug!(snapshot = %snapshot.display(), "Snapshot created");
    Ok(snapshot)
}

/// Point `current` at `snapshot` with a single rename
async fn switch_current(root: &Path, snapshot: &Path) -> Result<(), SyncError> {
    let target = snapshot
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| snapshot.to_path_buf());
    let current = root.join(CURRENT_LINK);
    let staged = root.join(format!("{CURRENT_LINK}.new"));

    if fs::symlink_metadata(&staged).await.is_ok() {
        fs::remove_file(&staged)
            .await
            .map_err(|e| SyncError::io(&staged, e))?;
    }
    fs::symlink(&target, &staged)
        .await
        .map_err(|e| SyncError::io(&staged, e))?;

    // A plain directory cannot be replaced by rename; park it as a snapshot
    // so cleanup removes it
    if let Ok(meta) = fs::symlink_metadata(&current).await {
        if meta.is_dir() {
            let stamp = Utc::now().format("%Y%m%d-%H%M%S");
            let parked = root.join(format!("{SNAPSHOT_PREFIX}legacy-{stamp}"));
            fs::rename(&current, &parked)
                .await
                .map_err(|e| SyncError::io(&current, e))?;
            warn!(parked = %parked.display(), "Moved plain current directory aside");
        }
    }

    fs::rename(&staged, &current)
        .await
        .map_err(|e| SyncError::io(&current, e))?;

    info!(current = %current.display(), snapshot = %target.display(), "Switched current snapshot");
    Ok(())
}

/// Drop superseded snapshots and unreferenced cache entries
///
/// Failures here are logged and otherwise ignored; the new snapshot is
/// already live.
async fn cleanup(root: &Path, keep: &Path, cache_dir: &Path, referenced: &BTreeSet<String>) {
    if let Ok(mut entries) = fs::read_dir(root).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let is_snapshot = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(SNAPSHOT_PREFIX));
            if is_snapshot && path != keep {
                match fs::remove_dir_all(&path).await {
                    Ok(()) => debug!(snapshot = %path.display(), "Removed old snapshot"),
                    Err(e) => warn!(snapshot = %path.display(), error = %e, "Failed to remove old snapshot"),
                }
            }
        }
    }

    if let Ok(mut entries) = fs::read_dir(cache_dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if referenced.contains(&name) {
                continue;
            }
            let path = entry.path();
            if let Err(e) = fs::remove_file(&path).await {
                warn!(file = %path.display(), error = %e, "Failed to remove stale cache entry");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("http://images.example.com/index.json").unwrap()
    }

    fn product(arch: &str, name: &str, sha256: &str) -> IndexProduct {
        IndexProduct {
            arch: arch.to_string(),
            subarch: "generic".to_string(),
            release: "noble".to_string(),
            label: "release".to_string(),
            files: vec![IndexFile {
                name: name.to_string(),
                path: format!("noble/{arch}/{name}"),
                sha256: sha256.to_string(),
                size: None,
            }],
        }
    }

    const SHA: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    #[test]
    fn test_validate_product_accepts_normal_entry() {
        assert!(validate_product(&url(), &product("amd64", "boot-kernel", SHA)).is_ok());
    }

    #[test]
    fn test_validate_product_rejects_traversal() {
        let err = validate_product(&url(), &product("..", "boot-kernel", SHA)).unwrap_err();
        assert!(matches!(err, SyncError::InvalidEntry { .. }));

        let err = validate_product(&url(), &product("amd64", "../../etc/passwd", SHA)).unwrap_err();
        assert!(matches!(err, SyncError::InvalidEntry { .. }));
    }

    #[test]
    fn test_validate_product_rejects_duplicate_names() {
        let mut entry = product("amd64", "boot-kernel", SHA);
        entry.files.push(entry.files[0].clone());
        let err = validate_product(&url(), &entry).unwrap_err();
        assert!(matches!(err, SyncError::InvalidEntry { .. }));
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_signature_url_appends_to_path() {
        let signed = signature_url(&url());
        assert_eq!(signed.as_str(), "http://images.example.com/index.json.gpg");

        let with_query = Url::parse("http://images.example.com/streams/index.json?arch=amd64").unwrap();
        assert_eq!(
            signature_url(&with_query).as_str(),
            "http://images.example.com/streams/index.json.gpg?arch=amd64"
        );
    }

    #[test]
    fn test_validate_product_rejects_bad_digest() {
        let err = validate_product(&url(), &product("amd64", "boot-kernel", "abc123")).unwrap_err();
        assert!(err.to_string().contains("malformed sha256"));
    }

    #[test]
    fn test_index_defaults() {
        let index: ImageIndex = serde_json::from_str("{}").unwrap();
        assert!(index.products.is_empty());

        let index: ImageIndex = serde_json::from_str(
            r#"{"products":[{"arch":"amd64","subarch":"generic","release":"noble","label":"release"}]}"#,
        )
        .unwrap();
        assert!(index.products[0].files.is_empty());
    }
}
