//! Dragonfly Boot Images
//!
//! This crate coordinates importing the kernels, initrds and root images
//! that managed machines network-boot from, and lists what is currently
//! available in the TFTP resource root.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              BootImageService                        │
//! │   import_boot_images | list_boot_images | running?   │
//! └─────────────────────────────────────────────────────┘
//!          │                                  │
//!          ▼                                  ▼
//! ┌──────────────────────┐        ┌──────────────────────┐
//! │  ImportLock          │        │  tftppath            │
//! │  single-flight gate  │        │  resource root scan  │
//! └──────────────────────┘        └──────────────────────┘
//!          │
//!          ▼
//! ┌─────────────────────────────────────────────────────┐
//! │  run_import (blocking pool)                          │
//! │   EnvScope { GNUPGHOME, http(s)_proxy, no_proxy }    │
//! │        └─▶ ImageSynchronizer (HttpSynchronizer)      │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use dragonfly_images::{BootImageService, ConfigFile, HttpSynchronizer, ImportTrigger};
//! use dragonfly_common::ImportSource;
//! use std::sync::Arc;
//!
//! let service = BootImageService::new(
//!     Arc::new(ConfigFile::new("/etc/dragonfly/cluster.yaml")),
//!     Arc::new(HttpSynchronizer::new()),
//! );
//!
//! let sources = vec![ImportSource::new("http://images.example.com/index.json")];
//! if let ImportTrigger::Started(job) = service.import_boot_images(sources, None, None)? {
//!     let report = job.wait().await?;
//! }
//! ```

pub mod config;
pub mod env;
pub mod error;
pub mod job;
pub mod lock;
pub mod service;
pub mod sync;
pub mod tftppath;

pub use config::{ClusterConfig, ConfigFile, ConfigSource, StaticConfig};
pub use env::EnvScope;
pub use error::*;
pub use job::{ImportEnvironment, ImportPlan, ProxyConfig, run_import};
pub use lock::{Flight, ImportGate, ImportLock, LockPermit};
pub use service::{BootImageService, ImportJob, ImportTrigger};
pub use sync::{HttpSynchronizer, ImageIndex, ImageSynchronizer, SyncReport};
