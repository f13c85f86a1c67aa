//! Background image loading, caching and atomic metadata commits for photo-tagger
//!
//! This crate keeps a large photo collection browsable without holding every
//! image in memory. Each photo is an [`ImageRecord`] that owns a memory map of
//! its file, a small thumbnail and, while somebody is looking at it, a
//! display-sized full image.
//!
//! # Features
//!
//! - **Bounded loading**: a fixed pool of at most three workers drains metadata
//!   loads before full-image loads ([`LoadScheduler`])
//! - **Sliding-expiration cache**: full images stay strongly held for a short
//!   time after their last use, then only weakly ([`ImageCache`])
//! - **Safe memory maps**: disposable mappings and views that fail cleanly
//!   instead of dangling ([`MappedFile`])
//! - **Atomic commits**: edited metadata is written to a staged file that
//!   replaces the original by rename, with a backup kept until the swap succeeds
//! - **Single-writer updates**: worker results reach records through a
//!   [`Dispatcher`], the way a UI thread would receive them

pub mod cache;
pub mod commit;
pub mod decode;
pub mod dispatch;
pub mod error;
pub mod mapped;
pub mod record;
pub mod scheduler;

pub use cache::{CacheStats, ImageCache};
pub use commit::StagedReplace;
pub use dispatch::{Completion, DispatchQueue, Dispatcher, DispatcherExt, InlineDispatcher, Job, QueueDispatcher};
pub use error::{ErrorReporter, LoadError, LoadFailure, LogReporter, MappedFileError, Operation};
pub use mapped::{MappedBytes, MappedFile, MappedStream, MappedView};
pub use record::{Field, ImageRecord, RecordEvent, RecordObserver};
pub use scheduler::{LoadScheduler, LoaderContext, PhotoList, RecordOwner, SchedulerStats};

use exif_codec::ContainerFormat;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// A decoded image shared between the cache, records and viewers.
pub type SharedImage = Arc<DynamicImage>;

/// Hard ceiling on concurrent load workers.
pub const MAX_WORKERS: usize = 3;

/// Loader settings, usually read from the tagger's JSON config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub thumbnail_height: u32,
    pub downsample_full_images: bool,
    pub display_width: u32,
    pub display_height: u32,
    pub cache_ttl_secs: u64,
    pub cache_memory_budget: usize,
    /// `None` uses the CPU count. Always capped at [`MAX_WORKERS`].
    pub max_workers: Option<usize>,
    /// Queue a full-image load as soon as metadata has loaded.
    pub eager_full_load: bool,
    /// Re-encode committed photos into this container. `None` keeps the
    /// original container and pixel data untouched.
    pub commit_format: Option<ContainerFormat>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            thumbnail_height: 48,
            downsample_full_images: true,
            display_width: 1920,
            display_height: 1080,
            cache_ttl_secs: 15,
            cache_memory_budget: 512 * 1024 * 1024, // 512MB, 0 = unbounded
            max_workers: None,
            eager_full_load: false,
            commit_format: None,
        }
    }
}

impl LoaderConfig {
    pub fn worker_count(&self) -> usize {
        self.max_workers
            .unwrap_or_else(num_cpus::get)
            .clamp(1, MAX_WORKERS)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Bounding box for full-image decodes, if downsampling is enabled.
    pub fn display_limit(&self) -> Option<(u32, u32)> {
        self.downsample_full_images
            .then_some((self.display_width.max(1), self.display_height.max(1)))
    }

    pub fn build_cache(&self) -> ImageCache {
        ImageCache::new(self.cache_ttl(), self.cache_memory_budget)
    }
}

#[cfg(test)]
pub(crate) mod testing;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = LoaderConfig::default();
        assert_eq!(config.thumbnail_height, 48);
        assert_eq!(config.cache_ttl(), Duration::from_secs(15));
        assert_eq!(config.display_limit(), Some((1920, 1080)));
        assert!(config.worker_count() >= 1 && config.worker_count() <= MAX_WORKERS);
    }

    #[test]
    fn test_worker_count_is_capped() {
        let mut config = LoaderConfig {
            max_workers: Some(16),
            ..Default::default()
        };
        assert_eq!(config.worker_count(), 3);
        config.max_workers = Some(0);
        assert_eq!(config.worker_count(), 1);
        config.max_workers = Some(2);
        assert_eq!(config.worker_count(), 2);
    }

    #[test]
    fn test_config_json_fills_missing_fields() -> anyhow::Result<()> {
        let config: LoaderConfig = serde_json::from_str(r#"{"thumbnail_height": 64, "commit_format": "png"}"#)?;
        assert_eq!(config.thumbnail_height, 64);
        assert_eq!(config.commit_format, Some(ContainerFormat::Png));
        assert_eq!(config.display_width, 1920);

        let config = LoaderConfig {
            downsample_full_images: false,
            ..Default::default()
        };
        assert_eq!(config.display_limit(), None);
        Ok(())
    }
}
