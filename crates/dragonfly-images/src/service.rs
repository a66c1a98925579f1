//! Boot image service
//!
//! The externally callable surface: trigger an import, ask whether one is
//! running, list what is on disk.
//!
//! ```text
//!   IDLE ──import_boot_images──▶ RUNNING
//!    ▲                              │
//!    └──── job finishes (any way) ──┘
//! ```
//!
//! While RUNNING, further triggers are skipped rather than queued. Listing
//! works in either state and reads whatever is currently on disk.

use crate::config::ConfigSource;
use crate::error::{ImageError, Result};
use crate::job::{self, ImportPlan};
use crate::lock::{self, Flight, ImportGate, ImportLock};
use crate::sync::{ImageSynchronizer, SyncReport};
use crate::tftppath;
use chrono::{DateTime, Utc};
use dragonfly_common::{BootImage, ImportSource};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Result of asking for an import
#[derive(Debug)]
pub enum ImportTrigger {
    /// A new import is running in the background
    Started(ImportJob),
    /// An import was already running; these sources were not scheduled
    Skipped,
}

impl ImportTrigger {
    pub fn is_started(&self) -> bool {
        matches!(self, ImportTrigger::Started(_))
    }

    pub fn into_job(self) -> Option<ImportJob> {
        match self {
            ImportTrigger::Started(job) => Some(job),
            ImportTrigger::Skipped => None,
        }
    }
}

/// Handle on a running import
///
/// Dropping the handle does not stop the import; the outcome is still
/// logged when it finishes.
#[derive(Debug)]
pub struct ImportJob {
    started_at: DateTime<Utc>,
    handle: JoinHandle<Result<SyncReport>>,
}

impl ImportJob {
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Wait for the import to finish and return its outcome
    pub async fn wait(self) -> Result<SyncReport> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(ImageError::JobAborted(e.to_string())),
        }
    }
}

/// Coordinates boot image imports and listings for one cluster
pub struct BootImageService {
    config: Arc<dyn ConfigSource>,
    synchronizer: Arc<dyn ImageSynchronizer>,
    gate: Arc<dyn ImportGate>,
}

impl BootImageService {
    /// Create a service guarded by its own `boot_images` lock
    pub fn new(config: Arc<dyn ConfigSource>, synchronizer: Arc<dyn ImageSynchronizer>) -> Self {
        Self {
            config,
            synchronizer,
            gate: Arc::new(ImportLock::boot_images()),
        }
    }

    /// Replace the import gate
    pub fn with_gate(mut self, gate: Arc<dyn ImportGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Start importing boot images from `sources` unless an import is running
    ///
    /// Returns immediately. Configuration problems are reported here, before
    /// anything is scheduled; synchronization failures are reported through
    /// the returned [`ImportJob`]. Must be called from within a tokio runtime.
    pub fn import_boot_images(
        &self,
        sources: Vec<ImportSource>,
        http_proxy: Option<String>,
        https_proxy: Option<String>,
    ) -> Result<ImportTrigger> {
        if self.gate.locked() {
            info!(lock = %self.gate.name(), "Boot image import already running, skipping");
            return Ok(ImportTrigger::Skipped);
        }

        let config = self.config.load()?;
        let plan = ImportPlan::new(sources, &config, http_proxy, https_proxy);
        let synchronizer = self.synchronizer.clone();
        let lock_name = self.gate.name().to_string();

        let flight = lock::run(self.gate.as_ref(), move || async move {
            let result = job::run_import(synchronizer, plan).await;
            match &result {
                Ok(report) => info!(
                    lock = %lock_name,
                    products = report.products,
                    downloaded = report.downloaded,
                    reused = report.reused,
                    "Boot image import finished"
                ),
                Err(e) => error!(lock = %lock_name, error = %e, "Boot image import failed"),
            }
            result
        });

        match flight {
            Flight::Started(handle) => {
                info!(lock = %self.gate.name(), "Boot image import started");
                Ok(ImportTrigger::Started(ImportJob {
                    started_at: Utc::now(),
                    handle,
                }))
            }
            Flight::AlreadyRunning => {
                info!(lock = %self.gate.name(), "Lost race for import lock, skipping");
                Ok(ImportTrigger::Skipped)
            }
        }
    }

    /// Whether an import currently holds the lock
    pub fn is_import_boot_images_running(&self) -> bool {
        self.gate.locked()
    }

    /// Boot images currently in the resource root
    pub async fn list_boot_images(&self) -> Result<Vec<BootImage>> {
        let config = self.config.load()?;
        tftppath::list_boot_images(config.resource_root()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticConfig;
    use crate::error::{ConfigError, SyncError};
    use crate::lock::LockPermit;
    use crate::tftppath::{BOOT_INITRD, BOOT_KERNEL, image_dir};
    use async_trait::async_trait;
    use serial_test::serial;
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;
    use tokio::sync::Notify;

    /// Synchronizer that blocks until released, then succeeds or fails
    #[derive(Default)]
    struct GatedSynchronizer {
        release: Notify,
        calls: AtomicUsize,
        fail: bool,
        no_proxy_seen: Mutex<Option<String>>,
    }

    impl GatedSynchronizer {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl ImageSynchronizer for GatedSynchronizer {
        async fn synchronize(&self, _plan: &ImportPlan) -> std::result::Result<SyncReport, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.no_proxy_seen.lock().unwrap() = std::env::var("no_proxy").ok();
            self.release.notified().await;
            if self.fail {
                return Err(SyncError::Status {
                    url: "http://images.example.com/index.json".to_string(),
                    status: 500,
                });
            }
            Ok(SyncReport::default())
        }
    }

    /// Synchronizer that returns straight away
    struct InstantSynchronizer;

    #[async_trait]
    impl ImageSynchronizer for InstantSynchronizer {
        async fn synchronize(&self, _plan: &ImportPlan) -> std::result::Result<SyncReport, SyncError> {
            Ok(SyncReport::default())
        }
    }

    /// Gate that is permanently held by someone else
    struct HeldGate;

    impl ImportGate for HeldGate {
        fn name(&self) -> &str {
            "held"
        }

        fn locked(&self) -> bool {
            true
        }

        fn try_acquire(&self) -> Option<LockPermit> {
            None
        }
    }

    /// Gate that reports free but can never be acquired, as if a racing
    /// caller won between the check and the acquire
    struct RacedGate;

    impl ImportGate for RacedGate {
        fn name(&self) -> &str {
            "raced"
        }

        fn locked(&self) -> bool {
            false
        }

        fn try_acquire(&self) -> Option<LockPermit> {
            None
        }
    }

    fn service(root: &Path, synchronizer: Arc<dyn ImageSynchronizer>) -> BootImageService {
        BootImageService::new(Arc::new(StaticConfig::with_resource_root(root)), synchronizer)
    }

    fn sources() -> Vec<ImportSource> {
        vec![ImportSource::new("http://images.example.com/index.json")]
    }

    /// Let the blocking worker reach the synchronizer before releasing it
    async fn wait_for_call(synchronizer: &GatedSynchronizer) {
        while synchronizer.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn test_idle_by_default() {
        let root = tempdir().unwrap();
        let svc = service(root.path(), Arc::new(InstantSynchronizer));
        assert!(!svc.is_import_boot_images_running());

        let trigger = svc.import_boot_images(sources(), None, None).unwrap();
        assert!(trigger.is_started());
        trigger.into_job().unwrap().wait().await.unwrap();
        assert!(!svc.is_import_boot_images_running());
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn test_second_trigger_skips_while_running() {
        let root = tempdir().unwrap();
        let synchronizer = Arc::new(GatedSynchronizer::default());
        let svc = service(root.path(), synchronizer.clone());

        let job = svc
            .import_boot_images(sources(), None, None)
            .unwrap()
            .into_job()
            .expect("first import should start");
        assert!(svc.is_import_boot_images_running());

        let second = svc.import_boot_images(sources(), None, None).unwrap();
        assert!(matches!(second, ImportTrigger::Skipped));

        wait_for_call(&synchronizer).await;
        assert!(svc.is_import_boot_images_running());
        synchronizer.release.notify_one();

        job.wait().await.unwrap();
        assert!(!svc.is_import_boot_images_running());
        assert_eq!(synchronizer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn test_concurrent_triggers_single_winner() {
        let root = tempdir().unwrap();
        let synchronizer = Arc::new(GatedSynchronizer::default());
        let svc = Arc::new(service(root.path(), synchronizer.clone()));

        let triggers: Vec<_> = (0..8)
            .map(|_| {
                let svc = svc.clone();
                tokio::spawn(async move { svc.import_boot_images(sources(), None, None) })
            })
            .collect();

        let mut jobs = Vec::new();
        let mut skipped = 0;
        for trigger in triggers {
            match trigger.await.unwrap().unwrap() {
                ImportTrigger::Started(job) => jobs.push(job),
                ImportTrigger::Skipped => skipped += 1,
            }
        }
        assert_eq!(jobs.len(), 1);
        assert_eq!(skipped, 7);

        wait_for_call(&synchronizer).await;
        synchronizer.release.notify_one();
        for job in jobs {
            job.wait().await.unwrap();
        }
        assert!(!svc.is_import_boot_images_running());
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn test_failure_releases_lock() {
        let root = tempdir().unwrap();
        let synchronizer = Arc::new(GatedSynchronizer::failing());
        let svc = service(root.path(), synchronizer.clone());

        let job = svc
            .import_boot_images(sources(), None, None)
            .unwrap()
            .into_job()
            .unwrap();
        wait_for_call(&synchronizer).await;
        synchronizer.release.notify_one();

        let err = job.wait().await.unwrap_err();
        assert!(matches!(err, ImageError::Sync(SyncError::Status { status: 500, .. })));
        assert!(!svc.is_import_boot_images_running());

        // Next trigger proceeds
        let job = svc
            .import_boot_images(sources(), None, None)
            .unwrap()
            .into_job()
            .expect("import after a failure should start");
        wait_for_call(&synchronizer).await;
        synchronizer.release.notify_one();
        assert!(job.wait().await.is_err());
        assert_eq!(synchronizer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn test_empty_sources_sets_only_loopback_no_proxy() {
        let root = tempdir().unwrap();
        let before_http = std::env::var_os("http_proxy");
        let before_https = std::env::var_os("https_proxy");
        let synchronizer = Arc::new(GatedSynchronizer::default());
        let svc = service(root.path(), synchronizer.clone());

        let job = svc
            .import_boot_images(Vec::new(), None, None)
            .unwrap()
            .into_job()
            .unwrap();
        wait_for_call(&synchronizer).await;
        assert_eq!(std::env::var_os("http_proxy"), before_http);
        assert_eq!(std::env::var_os("https_proxy"), before_https);
        synchronizer.release.notify_one();
        job.wait().await.unwrap();

        assert_eq!(
            synchronizer.no_proxy_seen.lock().unwrap().as_deref(),
            Some("localhost,127.0.0.1,::1")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn test_listing_is_independent_of_running_import() {
        let root = tempdir().unwrap();
        std::fs::create_dir_all(image_dir(root.path(), "amd64", "generic", "noble", "release"))
            .unwrap();
        for name in [BOOT_KERNEL, BOOT_INITRD] {
            std::fs::write(
                image_dir(root.path(), "amd64", "generic", "noble", "release").join(name),
                b"",
            )
            .unwrap();
        }

        let synchronizer = Arc::new(GatedSynchronizer::default());
        let svc = service(root.path(), synchronizer.clone());
        assert_eq!(svc.list_boot_images().await.unwrap().len(), 2);

        let job = svc
            .import_boot_images(sources(), None, None)
            .unwrap()
            .into_job()
            .unwrap();
        assert!(svc.is_import_boot_images_running());
        assert_eq!(svc.list_boot_images().await.unwrap().len(), 2);

        wait_for_call(&synchronizer).await;
        synchronizer.release.notify_one();
        job.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_held_gate_skips_without_reading_config() {
        let svc = BootImageService::new(
            Arc::new(StaticConfig::with_resource_root("not/absolute")),
            Arc::new(InstantSynchronizer),
        )
        .with_gate(Arc::new(HeldGate));

        assert!(svc.is_import_boot_images_running());
        let trigger = svc.import_boot_images(sources(), None, None).unwrap();
        assert!(matches!(trigger, ImportTrigger::Skipped));
    }

    #[tokio::test]
    async fn test_lost_race_skips() {
        let root = tempdir().unwrap();
        let svc = service(root.path(), Arc::new(InstantSynchronizer)).with_gate(Arc::new(RacedGate));

        let trigger = svc.import_boot_images(sources(), None, None).unwrap();
        assert!(matches!(trigger, ImportTrigger::Skipped));
    }

    #[tokio::test]
    async fn test_config_error_is_synchronous() {
        let synchronizer = Arc::new(GatedSynchronizer::default());
        let svc = BootImageService::new(
            Arc::new(StaticConfig::with_resource_root("not/absolute")),
            synchronizer.clone(),
        );

        let err = svc.import_boot_images(sources(), None, None).unwrap_err();
        assert!(matches!(err, ImageError::Config(ConfigError::Invalid(_))));
        assert!(!svc.is_import_boot_images_running());
        assert_eq!(synchronizer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_listing_missing_root_errors() {
        let root = tempdir().unwrap();
        let svc = service(&root.path().join("missing"), Arc::new(InstantSynchronizer));
        assert!(matches!(
            svc.list_boot_images().await,
            Err(ImageError::Listing { .. })
        ));
    }
}
