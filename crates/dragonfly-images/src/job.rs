//! Import job runner
//!
//! Turns an import request into an [`ImportPlan`], then runs the
//! synchronization engine for it on tokio's blocking pool with the plan's
//! environment applied. Building the plan is pure and involves no runtime.

use crate::config::ClusterConfig;
use crate::env::{self, EnvScope};
use crate::error::{ImageError, Result};
use crate::sync::{ImageSynchronizer, SyncReport};
use dragonfly_common::ImportSource;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info};

/// Hosts that never go through a proxy
pub const LOOPBACK_HOSTS: [&str; 3] = ["localhost", "127.0.0.1", "::1"];

pub const GNUPGHOME: &str = "GNUPGHOME";
pub const HTTP_PROXY: &str = "http_proxy";
pub const HTTPS_PROXY: &str = "https_proxy";
pub const NO_PROXY: &str = "no_proxy";

/// Distinct hostnames named by the sources' URLs
///
/// URLs without a parseable host contribute nothing.
pub fn hosts_from_sources(sources: &[ImportSource]) -> BTreeSet<String> {
    sources.iter().filter_map(ImportSource::hostname).collect()
}

/// Proxy settings for one import
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyConfig {
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    /// Loopback hosts first, then every source host, without duplicates
    pub no_proxy: Vec<String>,
}

impl ProxyConfig {
    pub fn for_sources(
        sources: &[ImportSource],
        http_proxy: Option<String>,
        https_proxy: Option<String>,
    ) -> Self {
        let mut no_proxy: Vec<String> = LOOPBACK_HOSTS.iter().map(|h| h.to_string()).collect();
        for host in hosts_from_sources(sources) {
            if !no_proxy.contains(&host) {
                no_proxy.push(host);
            }
        }

        Self {
            http_proxy,
            https_proxy,
            no_proxy,
        }
    }

    /// `no_proxy` in the comma-separated form HTTP clients expect
    pub fn no_proxy_value(&self) -> String {
        self.no_proxy.join(",")
    }
}

/// Environment variables an import job runs with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportEnvironment {
    vars: BTreeMap<String, String>,
}

impl ImportEnvironment {
    /// `GNUPGHOME` and `no_proxy` are always set; the proxies only when given
    pub fn new(gnupg_home: &Path, proxy: &ProxyConfig) -> Self {
        let mut vars = BTreeMap::new();
        vars.insert(GNUPGHOME.to_string(), gnupg_home.display().to_string());
        if let Some(http_proxy) = &proxy.http_proxy {
            vars.insert(HTTP_PROXY.to_string(), http_proxy.clone());
        }
        if let Some(https_proxy) = &proxy.https_proxy {
            vars.insert(HTTPS_PROXY.to_string(), https_proxy.clone());
        }
        vars.insert(NO_PROXY.to_string(), proxy.no_proxy_value());
        Self { vars }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn http_proxy(&self) -> Option<&str> {
        self.get(HTTP_PROXY)
    }

    pub fn https_proxy(&self) -> Option<&str> {
        self.get(HTTPS_PROXY)
    }

    pub fn no_proxy(&self) -> Option<&str> {
        self.get(NO_PROXY)
    }

    /// Hand the variables to a child process without touching our own environment
    pub fn apply_to(&self, command: &mut tokio::process::Command) {
        command.envs(&self.vars);
    }

    /// Apply the variables to this process until the returned guard drops
    pub fn scope(&self) -> EnvScope {
        EnvScope::apply(env::overrides(&self.vars))
    }
}

/// Everything an import needs, resolved before any work is scheduled
#[derive(Debug, Clone)]
pub struct ImportPlan {
    pub sources: Arc<[ImportSource]>,
    pub resource_root: PathBuf,
    pub proxy: ProxyConfig,
    pub environment: ImportEnvironment,
}

impl ImportPlan {
    pub fn new(
        sources: Vec<ImportSource>,
        config: &ClusterConfig,
        http_proxy: Option<String>,
        https_proxy: Option<String>,
    ) -> Self {
        let proxy = ProxyConfig::for_sources(&sources, http_proxy, https_proxy);
        let environment = ImportEnvironment::new(&config.gnupg_home(), &proxy);
        Self {
            sources: sources.into(),
            resource_root: config.resource_root().to_path_buf(),
            proxy,
            environment,
        }
    }
}

/// Run the synchronization engine for `plan`
///
/// The engine is driven on a blocking-pool thread so its I/O never competes
/// with lock queries or listings. The plan's environment is applied for
/// exactly the duration of the engine call. A panic in the engine comes back
/// as [`ImageError::JobAborted`].
pub async fn run_import(
    synchronizer: Arc<dyn ImageSynchronizer>,
    plan: ImportPlan,
) -> Result<SyncReport> {
    let handle = Handle::current();
    info!(
        sources = plan.sources.len(),
        resource_root = %plan.resource_root.display(),
        "Running boot image import"
    );

    let joined = tokio::task::spawn_blocking(move || {
        let scope = plan.environment.scope();
        debug!(
            vars = ?scope.names().collect::<Vec<_>>(),
            no_proxy = ?plan.environment.no_proxy(),
            "Import environment applied"
        );
        handle.block_on(synchronizer.synchronize(&plan))
    })
    .await;

    match joined {
        Ok(result) => Ok(result?),
        Err(e) if e.is_panic() => Err(ImageError::JobAborted(panic_message(e.into_panic()))),
        Err(e) => Err(ImageError::JobAborted(e.to_string())),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic in import worker".to_string()
    }
}
