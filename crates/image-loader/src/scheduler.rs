//! Bounded background loading of photo metadata, thumbnails and full images
//!
//! A fixed pool of long-lived worker threads (never more than
//! [`MAX_WORKERS`](crate::MAX_WORKERS)) drains two queues. Metadata loads always
//! go before full-image loads so that a freshly opened folder fills in quickly
//! even while a large image is being viewed. Disposed records are torn down by
//! the same workers, ahead of any load. Workers also sweep expired
//! entries out of the image cache, at least once per TTL (capped at five
//! seconds), whether or not work is arriving.
//!
//! Failures are per photo: they are reported, the photo is disposed and taken
//! out of its owner's list, and the worker moves on.

use crate::cache::ImageCache;
use crate::commit;
use crate::decode;
use crate::dispatch::{Completion, Dispatcher, DispatcherExt, InlineDispatcher};
use crate::error::{ErrorReporter, LoadError, LoadFailure, LogReporter, Operation};
use crate::mapped::{MappedFile, MappedView};
use crate::record::{ImageRecord, RecordQueue};
use crate::LoaderConfig;
use exif_codec::{ContainerFormat, ExifCodec, MetadataCodec, MetadataSnapshot};
use image::DynamicImage;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Longest gap between cache sweeps. Shorter TTLs sweep at the TTL.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(50);

/// Collaborators shared by the scheduler and the commit pipeline.
#[derive(Clone)]
pub struct LoaderContext {
    pub config: LoaderConfig,
    pub codec: Arc<dyn MetadataCodec>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub reporter: Arc<dyn ErrorReporter>,
    pub cache: Arc<ImageCache>,
}

impl LoaderContext {
    /// EXIF codec, inline dispatch, log reporting and a cache built from `config`.
    pub fn new(config: LoaderConfig) -> Self {
        let cache = Arc::new(config.build_cache());
        Self {
            config,
            codec: Arc::new(ExifCodec),
            dispatcher: Arc::new(InlineDispatcher),
            reporter: Arc::new(LogReporter),
            cache,
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn MetadataCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_cache(mut self, cache: Arc<ImageCache>) -> Self {
        self.cache = cache;
        self
    }

    pub(crate) fn report(&self, path: &Path, operation: Operation, error: &LoadError) {
        self.reporter.report(&LoadFailure {
            path,
            operation,
            error,
        });
    }
}

/// The list a photo belongs to. Photos that fail to load remove themselves.
pub trait RecordOwner: Send + Sync {
    fn remove(&self, record: &ImageRecord);
}

/// A plain thread-safe list of records.
#[derive(Default)]
pub struct PhotoList {
    records: Mutex<Vec<Arc<ImageRecord>>>,
}

impl PhotoList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: Arc<ImageRecord>) {
        self.records.lock().push(record);
    }

    pub fn records(&self) -> Vec<Arc<ImageRecord>> {
        self.records.lock().clone()
    }

    pub fn find(&self, path: &Path) -> Option<Arc<ImageRecord>> {
        self.records.lock().iter().find(|r| r.path() == path).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecordOwner for PhotoList {
    fn remove(&self, record: &ImageRecord) {
        self.records.lock().retain(|r| !std::ptr::eq(Arc::as_ptr(r), record));
    }
}

/// Counters for tests and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub workers: usize,
    pub queued_metadata: usize,
    pub queued_full: usize,
    pub active: usize,
    pub peak_active: usize,
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
}

enum Work {
    Metadata {
        record: Arc<ImageRecord>,
        owner: Option<Arc<dyn RecordOwner>>,
    },
    Full {
        record: Arc<ImageRecord>,
        snapshot: MetadataSnapshot,
    },
    Teardown {
        record: Arc<ImageRecord>,
    },
}

struct Queues {
    teardown: VecDeque<Arc<ImageRecord>>,
    metadata: VecDeque<Work>,
    full: VecDeque<Work>,
    active: usize,
    shutdown: bool,
    last_sweep: Instant,
}

impl Queues {
    fn new() -> Self {
        Self {
            teardown: VecDeque::new(),
            metadata: VecDeque::new(),
            full: VecDeque::new(),
            active: 0,
            shutdown: false,
            last_sweep: Instant::now(),
        }
    }

    /// Claims the next sweep if one is due. Only one worker gets it.
    fn sweep_due(&mut self, interval: Duration) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_sweep) < interval {
            return false;
        }
        self.last_sweep = now;
        true
    }

    fn next(&mut self) -> Option<Work> {
        if let Some(record) = self.teardown.pop_front() {
            return Some(Work::Teardown { record });
        }
        self.metadata.pop_front().or_else(|| self.full.pop_front())
    }

    fn is_idle(&self) -> bool {
        self.teardown.is_empty() && self.metadata.is_empty() && self.full.is_empty() && self.active == 0
    }
}

struct Shared {
    context: LoaderContext,
    queues: Mutex<Queues>,
    work_available: Condvar,
    idle: Condvar,
    peak_active: AtomicUsize,
    enqueued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl Shared {
    fn push(&self, work: Work) {
        let mut queues = self.queues.lock();
        if queues.shutdown {
            drop(queues);
            match work {
                Work::Full { record, .. } => record.full_load_abandoned(),
                Work::Teardown { record } => record.teardown(),
                Work::Metadata { .. } => {}
            }
            debug!("Scheduler shut down, dropping work");
            return;
        }
        match work {
            Work::Teardown { record } => queues.teardown.push_back(record),
            Work::Metadata { .. } => {
                queues.metadata.push_back(work);
                self.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Work::Full { .. } => {
                queues.full.push_back(work);
                self.enqueued.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.work_available.notify_one();
    }

    fn sweep_interval(&self) -> Duration {
        self.context.cache.ttl().clamp(MIN_SWEEP_INTERVAL, SWEEP_INTERVAL)
    }

    fn worker_loop(&self, index: usize) {
        debug!(worker = index, "Load worker started");
        let interval = self.sweep_interval();
        let mut queues = self.queues.lock();
        loop {
            if queues.shutdown {
                break;
            }
            // due sweeps run whatever woke the worker, so steady work cannot starve them
            if queues.sweep_due(interval) {
                MutexGuard::unlocked(&mut queues, || self.context.cache.sweep());
                continue;
            }
            if let Some(work) = queues.next() {
                queues.active += 1;
                self.peak_active.fetch_max(queues.active, Ordering::SeqCst);
                MutexGuard::unlocked(&mut queues, || self.run(work));
                queues.active -= 1;
                if queues.is_idle() {
                    self.idle.notify_all();
                }
                continue;
            }
            self.work_available.wait_for(&mut queues, interval);
        }
        debug!(worker = index, "Load worker stopped");
    }

    fn run(&self, work: Work) {
        let (path, operation, result, cleanup) = match work {
            Work::Metadata { record, owner } => {
                let result = self.load_metadata(&record);
                (record.path().to_path_buf(), Operation::LoadMetadata, result, Some((record, owner)))
            }
            Work::Full { record, snapshot } => {
                let result = self.load_full(&record, &snapshot);
                if result.is_err() {
                    record.full_load_abandoned();
                }
                (record.path().to_path_buf(), Operation::LoadFullImage, result, None)
            }
            Work::Teardown { record } => {
                record.teardown();
                return;
            }
        };

        let Err(error) = result else {
            self.completed.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if error.is_disposed_race() {
            debug!(path = %path.display(), %operation, "Abandoned, photo was disposed");
            return;
        }

        self.failed.fetch_add(1, Ordering::Relaxed);
        self.context.report(&path, operation, &error);
        if let Some((record, owner)) = cleanup {
            record.dispose();
            if let Some(owner) = owner {
                owner.remove(&record);
            }
        }
    }

    fn load_metadata(&self, record: &Arc<ImageRecord>) -> Result<(), LoadError> {
        if record.is_disposed() {
            return Err(LoadError::Disposed);
        }
        let path = record.path();
        let mapping = Arc::new(MappedFile::open(path)?);
        let view = match mapping.view() {
            Ok(view) => view,
            Err(e) => {
                mapping.dispose();
                return Err(e.into());
            }
        };

        let (snapshot, thumbnail) = match self.read_metadata(&view, path) {
            Ok(loaded) => loaded,
            Err(e) => {
                view.dispose();
                mapping.dispose();
                return Err(e);
            }
        };

        {
            let _guard = record.lock();
            if record.is_disposed() {
                view.dispose();
                mapping.dispose();
                return Err(LoadError::Disposed);
            }
            if let Some(previous) = record.replace_mapping(Some(Arc::clone(&mapping))) {
                if let Some(stale) = record.take_full_view() {
                    stale.dispose();
                }
                previous.dispose();
            }
        }

        let thumbnail = Arc::new(thumbnail);
        let target = Arc::clone(record);
        let published = self
            .context
            .dispatcher
            .invoke(move || target.publish_metadata(snapshot, thumbnail))
            .wait();
        view.dispose();
        published?;

        debug!(path = %path.display(), "Metadata loaded");
        if self.context.config.eager_full_load {
            record.prefetch();
        }
        Ok(())
    }

    fn read_metadata(&self, view: &MappedView, path: &Path) -> Result<(MetadataSnapshot, DynamicImage), LoadError> {
        let bytes = view.bytes()?;
        let format = ContainerFormat::sniff(&bytes)?;
        let (width, height) = decode::read_dimensions(view.stream()?, format, path)?;

        let mut snapshot = self.context.codec.read(&bytes, format)?;
        let (width, height) = decode::oriented_dimensions(width, height, snapshot.orientation);
        snapshot.width = width;
        snapshot.height = height;

        let thumbnail = decode::decode_thumbnail(
            view.stream()?,
            format,
            snapshot.orientation,
            self.context.config.thumbnail_height,
            path,
        )?;
        Ok((snapshot, thumbnail))
    }

    fn load_full(&self, record: &Arc<ImageRecord>, snapshot: &MetadataSnapshot) -> Result<(), LoadError> {
        if record.is_disposed() {
            return Err(LoadError::Disposed);
        }

        let image = {
            let _guard = record.lock();
            if record.is_disposed() {
                return Err(LoadError::Disposed);
            }
            if record.mapping().is_none() {
                // torn down by a commit or dispose; a later access retries
                record.full_load_abandoned();
                return Ok(());
            }
            // a commit may have rewritten the file since this load was queued
            let orientation = record.metadata().map_or(snapshot.orientation, |current| current.orientation);
            let view = record.full_view()?;
            let bytes = view.bytes()?;
            let format = ContainerFormat::sniff(&bytes)?;
            decode::decode_full(
                view.stream()?,
                format,
                orientation,
                self.context.config.display_limit(),
                record.path(),
            )?
        };

        let image = Arc::new(image);
        let target = Arc::clone(record);
        self.context
            .dispatcher
            .invoke(move || target.publish_full(image))
            .wait()?;
        debug!(path = %record.path().display(), "Full image loaded");
        Ok(())
    }
}

impl RecordQueue for Shared {
    fn enqueue_full_load(&self, record: Arc<ImageRecord>, snapshot: MetadataSnapshot) {
        self.push(Work::Full { record, snapshot });
    }

    fn enqueue_teardown(&self, record: Arc<ImageRecord>) {
        self.push(Work::Teardown { record });
    }
}

/// Owns the worker pool. Dropping it stops the workers; queued loads are
/// abandoned and queued teardowns run on the dropping thread.
pub struct LoadScheduler {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl LoadScheduler {
    pub fn new(context: LoaderContext) -> std::io::Result<Self> {
        let count = context.config.worker_count();
        let shared = Arc::new(Shared {
            context,
            queues: Mutex::new(Queues::new()),
            work_available: Condvar::new(),
            idle: Condvar::new(),
            peak_active: AtomicUsize::new(0),
            enqueued: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });

        let mut scheduler = Self {
            shared,
            workers: Vec::with_capacity(count),
        };
        for index in 0..count {
            let shared = Arc::clone(&scheduler.shared);
            let handle = thread::Builder::new()
                .name(format!("image-loader-{index}"))
                .spawn(move || shared.worker_loop(index))?;
            scheduler.workers.push(handle);
        }
        info!(workers = count, "Load scheduler started");
        Ok(scheduler)
    }

    pub fn context(&self) -> &LoaderContext {
        &self.shared.context
    }

    pub fn cache(&self) -> &Arc<ImageCache> {
        &self.shared.context.cache
    }

    /// A record whose full-image requests go to this scheduler.
    pub fn create_record(&self, path: impl Into<PathBuf>) -> Arc<ImageRecord> {
        let queue = Arc::downgrade(&self.shared) as Weak<dyn RecordQueue>;
        ImageRecord::with_queue(path.into(), Arc::clone(&self.shared.context.cache), queue)
    }

    /// Queue a metadata and thumbnail load. If it fails the record is disposed
    /// and removed from `owner`.
    pub fn enqueue_load(&self, record: Arc<ImageRecord>, owner: Option<Arc<dyn RecordOwner>>) {
        self.shared.push(Work::Metadata { record, owner });
    }

    /// Queue a full-image decode. Normally reached through
    /// [`ImageRecord::prefetch`] or [`ImageRecord::full_image`], which make
    /// sure only one load per record is in flight.
    pub fn enqueue_full_load(&self, record: Arc<ImageRecord>, snapshot: MetadataSnapshot) {
        self.shared.push(Work::Full { record, snapshot });
    }

    /// Create a record for `path`, add it to `list` and queue its load.
    pub fn open(&self, path: impl Into<PathBuf>, list: &Arc<PhotoList>) -> Arc<ImageRecord> {
        let record = self.create_record(path);
        list.push(Arc::clone(&record));
        let owner: Arc<dyn RecordOwner> = list.clone();
        self.enqueue_load(Arc::clone(&record), Some(owner));
        record
    }

    /// Write the record's edited fields, in place or to a new `destination`,
    /// on a background thread.
    pub fn commit(
        &self,
        record: &Arc<ImageRecord>,
        destination: Option<PathBuf>,
    ) -> Completion<Result<MetadataSnapshot, LoadError>> {
        let context = self.shared.context.clone();
        let target = Arc::clone(record);
        let (tx, completion) = Completion::channel();
        let spawned = thread::Builder::new().name("commit".to_string()).spawn(move || {
            let _ = tx.send(commit::commit_and_report(&context, &target, destination.as_deref()));
        });
        match spawned {
            Ok(_) => completion,
            Err(e) => Completion::ready(Err(LoadError::io("spawn commit thread", record.path(), e))),
        }
    }

    /// [`commit`](Self::commit) on the calling thread. Must not run on the
    /// dispatcher's own thread.
    pub fn commit_blocking(
        &self,
        record: &Arc<ImageRecord>,
        destination: Option<&Path>,
    ) -> Result<MetadataSnapshot, LoadError> {
        commit::commit_and_report(&self.shared.context, record, destination)
    }

    /// Block until both queues are empty and no worker is busy. Returns
    /// `false` on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut queues = self.shared.queues.lock();
        while !queues.is_idle() {
            if self.shared.idle.wait_until(&mut queues, deadline).timed_out() {
                return queues.is_idle();
            }
        }
        true
    }

    pub fn stats(&self) -> SchedulerStats {
        let queues = self.shared.queues.lock();
        SchedulerStats {
            workers: self.workers.len(),
            queued_metadata: queues.metadata.len(),
            queued_full: queues.full.len(),
            active: queues.active,
            peak_active: self.shared.peak_active.load(Ordering::SeqCst),
            enqueued: self.shared.enqueued.load(Ordering::Relaxed),
            completed: self.shared.completed.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
        }
    }

    /// Stop the workers after their current item and drop queued loads.
    /// Queued teardowns still run, here.
    pub fn shutdown(&mut self) {
        let (abandoned, teardown) = {
            let mut queues = self.shared.queues.lock();
            queues.shutdown = true;
            let mut abandoned: Vec<Work> = queues.metadata.drain(..).collect();
            abandoned.extend(queues.full.drain(..));
            let teardown: Vec<_> = queues.teardown.drain(..).collect();
            (abandoned, teardown)
        };
        self.shared.work_available.notify_all();
        for work in &abandoned {
            if let Work::Full { record, .. } = work {
                record.full_load_abandoned();
            }
        }
        if !abandoned.is_empty() {
            debug!(count = abandoned.len(), "Dropped queued work on shutdown");
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        for record in teardown {
            record.teardown();
        }
        self.shared.idle.notify_all();
    }
}

impl Drop for LoadScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
