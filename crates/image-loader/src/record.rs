//! One photo: its file mapping, images, metadata and edits
//!
//! An [`ImageRecord`] is shared between the caller's photo list, the load
//! workers and the commit pipeline. All state is internally synchronized.
//! Three independent axes describe it:
//!
//! - **disposed**: one way, false to true. Once set nothing new is loaded and
//!   in-flight work abandons itself silently.
//! - **full-image residency**: absent, loading, resident, and back to absent when
//!   the last strong owner drops the image. The record itself only keeps a
//!   `Weak`; the [`ImageCache`] keeps it alive for a while after each use.
//! - **dirty**: whether the edited fields differ from the last loaded baseline.
//!
//! Load, dispose and commit never overlap on one record; they serialize on
//! the record's load lock.

use crate::cache::ImageCache;
use crate::error::LoadError;
use crate::mapped::{MappedFile, MappedView};
use crate::SharedImage;
use chrono::NaiveDateTime;
use exif_codec::{GpsLocation, MetadataSnapshot, PhotoFields};
use image::DynamicImage;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI8, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

const NOT_LOADING: i8 = 0;
const LOADING: i8 = 1;
/// Full load requested before metadata arrived.
const DEFERRED: i8 = -1;

/// Editable properties, for [`RecordEvent::FieldChanged`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Title,
    Author,
    Taken,
    Location,
    MarkedForDeletion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordEvent {
    MetadataLoaded,
    ThumbnailChanged,
    FullImageChanged,
    FieldChanged(Field),
    DirtyChanged(bool),
    Committed,
    Disposed,
}

/// Notified after a record changes, never while its state is locked.
pub trait RecordObserver: Send + Sync {
    fn on_event(&self, record: &ImageRecord, event: &RecordEvent);
}

impl<F> RecordObserver for F
where
    F: Fn(&ImageRecord, &RecordEvent) + Send + Sync,
{
    fn on_event(&self, record: &ImageRecord, event: &RecordEvent) {
        self(record, event)
    }
}

/// Where a record sends its full-image loads and its teardown.
pub(crate) trait RecordQueue: Send + Sync {
    fn enqueue_full_load(&self, record: Arc<ImageRecord>, snapshot: MetadataSnapshot);

    /// Must call [`ImageRecord::teardown`] eventually, inline if nothing else
    /// will.
    fn enqueue_teardown(&self, record: Arc<ImageRecord>);
}

#[derive(Default)]
struct RecordState {
    thumbnail: Option<SharedImage>,
    full: Weak<DynamicImage>,
    baseline: Option<MetadataSnapshot>,
    fields: PhotoFields,
    marked_for_deletion: bool,
    dirty: bool,
}

impl RecordState {
    /// Recompute the dirty flag. Returns the new value if it changed.
    fn refresh_dirty(&mut self) -> Option<bool> {
        let dirty = match &self.baseline {
            Some(baseline) => self.fields.differs_from(baseline),
            None => self.fields.differs_from(&MetadataSnapshot::default()),
        };
        if dirty == self.dirty {
            return None;
        }
        self.dirty = dirty;
        Some(dirty)
    }
}

pub struct ImageRecord {
    path: PathBuf,
    cache: Arc<ImageCache>,
    state: Mutex<RecordState>,
    mapping: Mutex<Option<Arc<MappedFile>>>,
    full_view: Mutex<Option<Arc<MappedView>>>,
    load_lock: Mutex<()>,
    disposed: AtomicBool,
    full_loading: AtomicI8,
    observers: Mutex<Vec<Arc<dyn RecordObserver>>>,
    queue: Option<Weak<dyn RecordQueue>>,
}

impl ImageRecord {
    /// A record not attached to any scheduler. Full-image requests are
    /// ignored until the record is created through one.
    pub fn new(path: impl Into<PathBuf>, cache: Arc<ImageCache>) -> Arc<Self> {
        Arc::new(Self::build(path.into(), cache, None))
    }

    pub(crate) fn with_queue(path: PathBuf, cache: Arc<ImageCache>, queue: Weak<dyn RecordQueue>) -> Arc<Self> {
        Arc::new(Self::build(path, cache, Some(queue)))
    }

    fn build(path: PathBuf, cache: Arc<ImageCache>, queue: Option<Weak<dyn RecordQueue>>) -> Self {
        Self {
            path,
            cache,
            state: Mutex::new(RecordState::default()),
            mapping: Mutex::new(None),
            full_view: Mutex::new(None),
            load_lock: Mutex::new(()),
            disposed: AtomicBool::new(false),
            full_loading: AtomicI8::new(NOT_LOADING),
            observers: Mutex::new(Vec::new()),
            queue,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self, observer: Arc<dyn RecordObserver>) {
        self.observers.lock().push(observer);
    }

    fn notify(&self, events: &[RecordEvent]) {
        if events.is_empty() {
            return;
        }
        let observers = self.observers.lock().clone();
        for event in events {
            for observer in &observers {
                observer.on_event(self, event);
            }
        }
    }

    // ----- metadata and edits -----

    /// The last loaded (or committed) metadata, if loading has finished.
    pub fn metadata(&self) -> Option<MetadataSnapshot> {
        self.state.lock().baseline.clone()
    }

    pub fn is_metadata_loaded(&self) -> bool {
        self.state.lock().baseline.is_some()
    }

    pub fn fields(&self) -> PhotoFields {
        self.state.lock().fields.clone()
    }

    pub fn title(&self) -> Option<String> {
        self.state.lock().fields.title.clone()
    }

    pub fn author(&self) -> Option<String> {
        self.state.lock().fields.author.clone()
    }

    pub fn taken(&self) -> Option<NaiveDateTime> {
        self.state.lock().fields.taken
    }

    pub fn location(&self) -> Option<GpsLocation> {
        self.state.lock().fields.location
    }

    /// Whether the edited fields differ from the file.
    pub fn is_changed(&self) -> bool {
        self.state.lock().dirty
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.state.lock().marked_for_deletion
    }

    /// First line of the title, or the file name without extension.
    pub fn short_title(&self) -> String {
        let title = self.state.lock().fields.title.clone();
        title
            .as_deref()
            .and_then(|t| t.lines().map(str::trim).find(|line| !line.is_empty()))
            .map(str::to_string)
            .unwrap_or_else(|| {
                self.path
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_default()
            })
    }

    fn edit(&self, field: Field, apply: impl FnOnce(&mut PhotoFields) -> bool) {
        let events = {
            let mut state = self.state.lock();
            if !apply(&mut state.fields) {
                return;
            }
            let mut events = vec![RecordEvent::FieldChanged(field)];
            if let Some(dirty) = state.refresh_dirty() {
                events.push(RecordEvent::DirtyChanged(dirty));
            }
            events
        };
        self.notify(&events);
    }

    pub fn set_title(&self, title: Option<String>) {
        self.edit(Field::Title, |fields| replace(&mut fields.title, title));
    }

    pub fn set_author(&self, author: Option<String>) {
        self.edit(Field::Author, |fields| replace(&mut fields.author, author));
    }

    pub fn set_taken(&self, taken: Option<NaiveDateTime>) {
        self.edit(Field::Taken, |fields| replace(&mut fields.taken, taken));
    }

    pub fn set_location(&self, location: Option<GpsLocation>) {
        self.edit(Field::Location, |fields| replace(&mut fields.location, location));
    }

    /// Deletion marks are a review decision, not an edit; they never make the
    /// record dirty.
    pub fn set_marked_for_deletion(&self, marked: bool) {
        let changed = {
            let mut state = self.state.lock();
            replace(&mut state.marked_for_deletion, marked)
        };
        if changed {
            self.notify(&[RecordEvent::FieldChanged(Field::MarkedForDeletion)]);
        }
    }

    /// Discard edits and go back to the loaded values.
    pub fn revert(&self) {
        let events = {
            let mut state = self.state.lock();
            let Some(baseline) = state.baseline.clone() else {
                return;
            };
            let before = std::mem::replace(&mut state.fields, baseline.fields());
            let mut events = changed_fields(&before, &state.fields);
            if let Some(dirty) = state.refresh_dirty() {
                events.push(RecordEvent::DirtyChanged(dirty));
            }
            events
        };
        self.notify(&events);
    }

    // ----- images -----

    pub fn thumbnail(&self) -> Option<SharedImage> {
        self.state.lock().thumbnail.clone()
    }

    /// Whether a strong owner of the full image still exists anywhere.
    pub fn is_full_resident(&self) -> bool {
        self.state.lock().full.strong_count() > 0
    }

    pub fn is_full_loading(&self) -> bool {
        self.full_loading.load(Ordering::SeqCst) == LOADING
    }

    /// The full image if it is resident, re-arming its cache lifetime.
    /// Otherwise starts loading it and returns the thumbnail. Never blocks on
    /// decoding.
    pub fn full_image(self: &Arc<Self>) -> Option<SharedImage> {
        let resident = self.state.lock().full.upgrade();
        match resident {
            Some(image) => {
                self.cache.insert(&self.path, Arc::clone(&image));
                Some(image)
            }
            None => {
                self.request_full_load();
                self.thumbnail()
            }
        }
    }

    /// Start loading the full image if it is not resident.
    pub fn prefetch(self: &Arc<Self>) {
        let resident = self.state.lock().full.upgrade();
        match resident {
            Some(image) => self.cache.insert(&self.path, image),
            None => self.request_full_load(),
        }
    }

    /// Drop the cache's hold on the full image so it can be freed early.
    pub fn uncache(&self) {
        self.cache.remove(&self.path);
    }

    fn request_full_load(self: &Arc<Self>) {
        if self.is_disposed() {
            return;
        }

        let baseline = self.state.lock().baseline.clone();
        let Some(baseline) = baseline else {
            if self
                .full_loading
                .compare_exchange(NOT_LOADING, DEFERRED, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                // metadata may have landed between the check and the swap
                self.start_deferred_load();
            }
            return;
        };

        if self.full_loading.swap(LOADING, Ordering::SeqCst) == LOADING {
            return;
        }
        // a load may have published between our residency check and the swap
        if self.is_full_resident() {
            self.full_loading.store(NOT_LOADING, Ordering::SeqCst);
            return;
        }
        self.send_full_load(baseline);
    }

    fn start_deferred_load(self: &Arc<Self>) {
        let baseline = self.state.lock().baseline.clone();
        let Some(baseline) = baseline else {
            return;
        };
        if self
            .full_loading
            .compare_exchange(DEFERRED, LOADING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.send_full_load(baseline);
        }
    }

    fn send_full_load(self: &Arc<Self>, baseline: MetadataSnapshot) {
        match self.queue.as_ref().and_then(Weak::upgrade) {
            Some(queue) => queue.enqueue_full_load(Arc::clone(self), baseline),
            None => {
                self.full_loading.store(NOT_LOADING, Ordering::SeqCst);
                debug!(path = %self.path.display(), "No scheduler for full-image load");
            }
        }
    }

    // ----- worker-facing updates -----

    /// Install freshly loaded metadata and thumbnail. Edits made before the
    /// load finished are replaced by the file's values.
    pub(crate) fn publish_metadata(self: &Arc<Self>, snapshot: MetadataSnapshot, thumbnail: SharedImage) {
        if self.is_disposed() {
            return;
        }
        let events = {
            let mut state = self.state.lock();
            let before = std::mem::replace(&mut state.fields, snapshot.fields());
            state.baseline = Some(snapshot);
            state.thumbnail = Some(thumbnail);
            let mut events = vec![RecordEvent::MetadataLoaded];
            events.extend(changed_fields(&before, &state.fields));
            if let Some(dirty) = state.refresh_dirty() {
                events.push(RecordEvent::DirtyChanged(dirty));
            }
            events.push(RecordEvent::ThumbnailChanged);
            events
        };
        self.notify(&events);

        if self.full_loading.load(Ordering::SeqCst) == DEFERRED {
            self.start_deferred_load();
        }
    }

    /// Store a decoded full image weakly and hand the strong reference to the
    /// cache.
    pub(crate) fn publish_full(&self, image: SharedImage) {
        if self.is_disposed() {
            self.full_loading.store(NOT_LOADING, Ordering::SeqCst);
            return;
        }
        self.state.lock().full = Arc::downgrade(&image);
        self.cache.insert(&self.path, image);
        self.full_loading.store(NOT_LOADING, Ordering::SeqCst);
        self.notify(&[RecordEvent::FullImageChanged]);
    }

    /// Let a later access retry.
    pub(crate) fn full_load_abandoned(&self) {
        self.full_loading.store(NOT_LOADING, Ordering::SeqCst);
    }

    /// Adopt the snapshot a commit just wrote as the new baseline. Edits made
    /// while the commit ran stay and keep the record dirty.
    pub(crate) fn apply_committed(&self, snapshot: MetadataSnapshot) {
        let events = {
            let mut state = self.state.lock();
            state.baseline = Some(snapshot);
            let mut events = vec![RecordEvent::Committed];
            if let Some(dirty) = state.refresh_dirty() {
                events.push(RecordEvent::DirtyChanged(dirty));
            }
            events
        };
        self.notify(&events);
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ()> {
        self.load_lock.lock()
    }

    pub(crate) fn mapping(&self) -> Option<Arc<MappedFile>> {
        self.mapping.lock().clone()
    }

    /// Bind a mapping, handing back the one it replaced. Call with the load
    /// lock held.
    pub(crate) fn replace_mapping(&self, mapping: Option<Arc<MappedFile>>) -> Option<Arc<MappedFile>> {
        std::mem::replace(&mut *self.mapping.lock(), mapping)
    }

    /// The full-resolution view, created from the mapping on first use.
    pub(crate) fn full_view(&self) -> Result<Arc<MappedView>, LoadError> {
        let mut slot = self.full_view.lock();
        if let Some(view) = slot.as_ref() {
            return Ok(Arc::clone(view));
        }
        let mapping = self.mapping().ok_or(LoadError::MappingClosed)?;
        let view = Arc::new(mapping.view()?);
        *slot = Some(Arc::clone(&view));
        Ok(view)
    }

    pub(crate) fn take_full_view(&self) -> Option<Arc<MappedView>> {
        self.full_view.lock().take()
    }

    // ----- disposal -----

    /// Stop using this photo. Images are released now. The file mapping is
    /// released by a load worker once in-flight work lets go of it, or right
    /// here when the record has no scheduler.
    pub fn dispose(self: &Arc<Self>) {
        if !self.begin_dispose() {
            return;
        }
        match self.queue.as_ref().and_then(Weak::upgrade) {
            Some(queue) => queue.enqueue_teardown(Arc::clone(self)),
            None => self.teardown(),
        }
    }

    /// Like [`dispose`](Self::dispose) but returns only once the file is no
    /// longer mapped, e.g. before deleting it.
    pub fn dispose_now(&self) {
        self.begin_dispose();
        self.teardown();
    }

    /// Returns `false` if the record was already disposed.
    fn begin_dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return false;
        }
        {
            let mut state = self.state.lock();
            state.thumbnail = None;
            state.full = Weak::new();
        }
        self.cache.remove(&self.path);
        self.full_loading.store(NOT_LOADING, Ordering::SeqCst);
        self.notify(&[RecordEvent::Disposed]);
        true
    }

    pub(crate) fn teardown(&self) {
        let _guard = self.load_lock.lock();
        if let Some(view) = self.take_full_view() {
            view.dispose();
        }
        if let Some(mapping) = self.replace_mapping(None) {
            mapping.dispose();
        }
    }

    #[cfg(test)]
    pub(crate) fn has_mapping(&self) -> bool {
        self.mapping.lock().is_some()
    }
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

fn changed_fields(before: &PhotoFields, after: &PhotoFields) -> Vec<RecordEvent> {
    let mut events = Vec::new();
    if before.title != after.title {
        events.push(RecordEvent::FieldChanged(Field::Title));
    }
    if before.author != after.author {
        events.push(RecordEvent::FieldChanged(Field::Author));
    }
    if before.taken != after.taken {
        events.push(RecordEvent::FieldChanged(Field::Taken));
    }
    if before.location != after.location {
        events.push(RecordEvent::FieldChanged(Field::Location));
    }
    events
}

impl fmt::Debug for ImageRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageRecord")
            .field("path", &self.path)
            .field("disposed", &self.is_disposed())
            .field("full_loading", &self.full_loading.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Drop for ImageRecord {
    fn drop(&mut self) {
        if !self.disposed.load(Ordering::SeqCst) {
            debug!(path = %self.path.display(), "Record dropped without dispose");
        }
    }
}
