//! Writing edited metadata back to disk
//!
//! A commit never writes into the photo's file. The new bytes go to a staged
//! file in the same directory, the original is set aside as a backup, and the
//! staged file is renamed over the original. At every point at least one
//! complete copy exists on disk and the original path holds either the old
//! file or the new one, never a partial write.

use crate::decode;
use crate::dispatch::DispatcherExt;
use crate::error::{LoadError, Operation};
use crate::mapped::MappedFile;
use crate::record::ImageRecord;
use crate::scheduler::LoaderContext;
use crate::SharedImage;
use exif_codec::{ContainerFormat, MetadataSnapshot};
use std::fs::{self, OpenOptions};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

static BACKUP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// An in-place replacement, one step at a time: [`stage`](Self::stage),
/// [`set_aside`](Self::set_aside), [`promote`](Self::promote).
///
/// Dropping it before promotion removes the staged file and puts the original
/// back.
pub struct StagedReplace {
    target: PathBuf,
    staged: NamedTempFile,
    aside: Option<SetAside>,
}

impl StagedReplace {
    /// Write `contents` to a new file next to `target` and flush it to disk.
    pub fn stage(target: &Path, contents: &[u8]) -> Result<Self, LoadError> {
        let dir = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut staged = tempfile::Builder::new()
            .prefix(".photo-tagger-")
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(|e| LoadError::io("create staged file", dir, e))?;
        staged
            .write_all(contents)
            .and_then(|()| staged.as_file().sync_all())
            .map_err(|e| LoadError::io("write staged file", staged.path(), e))?;

        Ok(Self {
            target: target.to_path_buf(),
            staged,
            aside: None,
        })
    }

    pub fn staged_path(&self) -> &Path {
        self.staged.path()
    }

    pub fn backup_path(&self) -> Option<&Path> {
        self.aside.as_ref().and_then(|aside| aside.backup.as_deref())
    }

    /// Keep a backup of the original: a hard link where the filesystem
    /// allows it, otherwise the original itself renamed away.
    pub fn set_aside(&mut self) -> Result<(), LoadError> {
        if self.aside.is_some() {
            return Ok(());
        }
        if !self.staged.path().exists() {
            return Err(LoadError::io(
                "set aside original",
                self.staged.path(),
                std::io::Error::new(std::io::ErrorKind::NotFound, "staged file is gone"),
            ));
        }

        let backup = backup_path(&self.target);
        let moved_away = match fs::hard_link(&self.target, &backup) {
            Ok(()) => false,
            Err(link_error) => {
                debug!(path = %self.target.display(), error = %link_error, "Hard link failed, renaming original");
                fs::rename(&self.target, &backup).map_err(|e| LoadError::io("set aside original", &self.target, e))?;
                true
            }
        };
        self.aside = Some(SetAside {
            original: self.target.clone(),
            backup: Some(backup),
            moved_away,
        });
        Ok(())
    }

    /// Atomically rename the staged file over the original.
    pub fn promote(self) -> Result<Backup, LoadError> {
        let Self { target, staged, aside } = self;
        match staged.persist(&target) {
            Ok(_) => Ok(Backup {
                path: aside.and_then(SetAside::keep),
            }),
            // `aside` drops here and restores the original
            Err(e) => Err(LoadError::io("replace original", &target, e.error)),
        }
    }
}

struct SetAside {
    original: PathBuf,
    backup: Option<PathBuf>,
    moved_away: bool,
}

impl SetAside {
    fn keep(mut self) -> Option<PathBuf> {
        self.backup.take()
    }
}

impl Drop for SetAside {
    fn drop(&mut self) {
        let Some(backup) = self.backup.take() else {
            return;
        };
        let restored = if self.moved_away {
            fs::rename(&backup, &self.original)
        } else {
            fs::remove_file(&backup)
        };
        if let Err(e) = restored {
            warn!(
                original = %self.original.display(),
                backup = %backup.display(),
                error = %e,
                "Could not restore original after failed replace"
            );
        }
    }
}

/// The original file as it was before a successful replace.
#[derive(Debug)]
pub struct Backup {
    path: Option<PathBuf>,
}

impl Backup {
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn remove(mut self) -> std::io::Result<()> {
        match self.path.take() {
            Some(path) => fs::remove_file(path),
            None => Ok(()),
        }
    }
}

fn backup_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "photo".to_string());
    loop {
        let n = BACKUP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let candidate = target.with_file_name(format!(".{name}.{}-{n}.bak", std::process::id()));
        if !candidate.exists() {
            return candidate;
        }
    }
}

/// Write `contents` to a new file, refusing to overwrite anything.
fn write_new(destination: &Path, contents: &[u8]) -> Result<(), LoadError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(destination)
        .map_err(|e| LoadError::io("create destination", destination, e))?;
    let written = file.write_all(contents).and_then(|()| file.sync_all());
    if let Err(e) = written {
        drop(file);
        let _ = fs::remove_file(destination);
        return Err(LoadError::io("write destination", destination, e));
    }
    Ok(())
}

pub(crate) fn commit_and_report(
    context: &LoaderContext,
    record: &Arc<ImageRecord>,
    destination: Option<&Path>,
) -> Result<MetadataSnapshot, LoadError> {
    let result = commit_record(context, record, destination);
    if let Err(error) = &result {
        if !error.is_disposed_race() {
            context.report(record.path(), Operation::Commit, error);
        }
    }
    result
}

fn commit_record(
    context: &LoaderContext,
    record: &Arc<ImageRecord>,
    destination: Option<&Path>,
) -> Result<MetadataSnapshot, LoadError> {
    if record.is_disposed() {
        return Err(LoadError::Disposed);
    }
    let path = record.path();
    if destination.is_none() && !record.is_changed() {
        if let Some(baseline) = record.metadata() {
            debug!(path = %path.display(), "Nothing to commit");
            return Ok(baseline);
        }
    }
    let fields = record.fields();

    let guard = record.lock();
    if record.is_disposed() {
        return Err(LoadError::Disposed);
    }
    let mapping = record.mapping().ok_or(LoadError::MappingClosed)?;
    let (mut output, format) = {
        let view = mapping.view()?;
        let bytes = view.bytes()?;
        let source_format = ContainerFormat::sniff(&bytes)?;
        let converted = match context.config.commit_format {
            Some(target) if target != source_format => {
                let orientation = context.codec.read(&bytes, source_format)?.orientation;
                (decode::transcode(&bytes, source_format, target, orientation, path)?, target)
            }
            _ => (bytes.to_vec(), source_format),
        };
        view.dispose();
        converted
    };

    let mut written = context.codec.write(&fields, &mut output, format)?;
    let (width, height) = decode::read_dimensions(Cursor::new(&output[..]), format, path)?;
    let (width, height) = decode::oriented_dimensions(width, height, written.orientation);
    written.width = width;
    written.height = height;

    if let Some(destination) = destination {
        drop(guard);
        write_new(destination, &output)?;
        info!(path = %path.display(), destination = %destination.display(), "Saved copy with metadata");
        return Ok(written);
    }

    let mut staged = StagedReplace::stage(path, &output)?;
    drop(output);
    staged.set_aside()?;
    let backup = staged.promote()?;

    if let Some(view) = record.take_full_view() {
        view.dispose();
    }
    if let Some(old) = record.replace_mapping(None) {
        old.dispose();
    }
    let reloaded = reload(context, record, &written);
    drop(guard);

    let published = {
        let target = Arc::clone(record);
        let snapshot = written.clone();
        let image = reloaded.as_ref().ok().cloned();
        context
            .dispatcher
            .invoke(move || {
                target.apply_committed(snapshot);
                if let Some(image) = image {
                    target.publish_full(image);
                }
            })
            .wait()
    };

    if let Err(e) = backup.remove() {
        warn!(path = %path.display(), error = %e, "Could not remove backup after commit");
    }
    info!(path = %path.display(), %format, "Committed metadata");
    reloaded?;
    published?;
    Ok(written)
}

/// Map the replaced file and decode its full image. Call with the record
/// lock held.
fn reload(context: &LoaderContext, record: &ImageRecord, written: &MetadataSnapshot) -> Result<SharedImage, LoadError> {
    let mapping = Arc::new(MappedFile::open(record.path())?);
    record.replace_mapping(Some(Arc::clone(&mapping)));
    let view = record.full_view()?;
    let bytes = view.bytes()?;
    let format = ContainerFormat::sniff(&bytes)?;
    let image = decode::decode_full(
        view.stream()?,
        format,
        written.orientation,
        context.config.display_limit(),
        record.path(),
    )?;
    Ok(Arc::new(image))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::QueueDispatcher;
    use crate::scheduler::{LoadScheduler, PhotoList};
    use crate::testing::{write_jpeg, CollectingReporter};
    use crate::LoaderConfig;
    use anyhow::Result;
    use exif_codec::{ExifCodec, MetadataCodec, PhotoFields};
    use std::time::Duration;
    use tempfile::tempdir;

    const WAIT: Duration = Duration::from_secs(30);

    fn loaded(
        scheduler: &LoadScheduler,
        path: &Path,
    ) -> Result<Arc<ImageRecord>> {
        let list = Arc::new(PhotoList::new());
        let record = scheduler.open(path, &list);
        anyhow::ensure!(scheduler.wait_idle(WAIT), "load did not finish");
        anyhow::ensure!(record.is_metadata_loaded(), "metadata not loaded");
        Ok(record)
    }

    fn scheduler(reporter: &Arc<CollectingReporter>, config: LoaderConfig) -> Result<LoadScheduler> {
        Ok(LoadScheduler::new(
            LoaderContext::new(config).with_reporter(reporter.clone()),
        )?)
    }

    fn files_in(dir: &Path) -> Result<Vec<String>> {
        let mut names = fs::read_dir(dir)?
            .map(|entry| Ok(entry?.file_name().to_string_lossy().into_owned()))
            .collect::<Result<Vec<_>>>()?;
        names.sort();
        Ok(names)
    }

    #[test]
    fn test_in_place_commit_rewrites_file_and_baseline() -> Result<()> {
        let temp_dir = tempdir()?;
        let path = temp_dir.path().join("harbour.jpg");
        write_jpeg(&path, 120, 80, None, &PhotoFields::default())?;

        let reporter = Arc::new(CollectingReporter::default());
        let scheduler = scheduler(&reporter, LoaderConfig::default())?;
        let record = loaded(&scheduler, &path)?;

        record.set_title(Some("Harbour at dusk".to_string()));
        record.set_location(Some("10.2S, 45.238W".parse()?));
        assert!(record.is_changed());

        let written = scheduler.commit(&record, None).wait()??;
        assert_eq!(written.title.as_deref(), Some("Harbour at dusk"));
        assert_eq!((written.width, written.height), (120, 80));
        assert!(!record.is_changed());
        assert_eq!(record.metadata(), Some(written.clone()));
        assert!(record.is_full_resident());

        // on disk, and nothing left behind
        let bytes = fs::read(&path)?;
        let reread = ExifCodec.read(&bytes, ContainerFormat::Jpeg)?;
        assert_eq!(reread.fields(), record.fields());
        assert_eq!(files_in(temp_dir.path())?, vec!["harbour.jpg".to_string()]);
        assert!(reporter.failures().is_empty());

        // the new mapping serves further commits
        record.set_author(Some("Ann".to_string()));
        scheduler.commit_blocking(&record, None)?;
        let reread = ExifCodec.read(&fs::read(&path)?, ContainerFormat::Jpeg)?;
        assert_eq!(reread.author.as_deref(), Some("Ann"));
        assert_eq!(reread.title.as_deref(), Some("Harbour at dusk"));

        record.dispose_now();
        Ok(())
    }

    #[test]
    fn test_blank_title_commit_leaves_record_clean() -> Result<()> {
        let temp_dir = tempdir()?;
        let path = temp_dir.path().join("harbour.jpg");
        let fields = PhotoFields {
            title: Some("Harbour".to_string()),
            ..Default::default()
        };
        write_jpeg(&path, 40, 30, None, &fields)?;

        let reporter = Arc::new(CollectingReporter::default());
        let scheduler = scheduler(&reporter, LoaderConfig::default())?;
        let record = loaded(&scheduler, &path)?;

        record.set_title(Some("   ".to_string()));
        assert!(record.is_changed());
        let written = scheduler.commit_blocking(&record, None)?;
        assert_eq!(written.title, None);
        assert!(!record.is_changed());

        let reread = ExifCodec.read(&fs::read(&path)?, ContainerFormat::Jpeg)?;
        assert_eq!(reread.title, None);
        assert!(!record.fields().differs_from(&reread));
        record.dispose_now();
        Ok(())
    }

    #[test]
    fn test_clean_commit_is_a_no_op() -> Result<()> {
        let temp_dir = tempdir()?;
        let path = temp_dir.path().join("harbour.jpg");
        let original = write_jpeg(&path, 32, 32, None, &PhotoFields::default())?;

        let reporter = Arc::new(CollectingReporter::default());
        let scheduler = scheduler(&reporter, LoaderConfig::default())?;
        let record = loaded(&scheduler, &path)?;
        record.set_marked_for_deletion(true);

        let snapshot = scheduler.commit_blocking(&record, None)?;
        assert_eq!(Some(snapshot), record.metadata());
        assert_eq!(fs::read(&path)?, original);
        record.dispose_now();
        Ok(())
    }

    #[test]
    fn test_commit_to_destination_leaves_original() -> Result<()> {
        let temp_dir = tempdir()?;
        let path = temp_dir.path().join("harbour.jpg");
        let original = write_jpeg(&path, 32, 32, None, &PhotoFields::default())?;
        let copy = temp_dir.path().join("copy.jpg");

        let reporter = Arc::new(CollectingReporter::default());
        let scheduler = scheduler(&reporter, LoaderConfig::default())?;
        let record = loaded(&scheduler, &path)?;
        record.set_author(Some("Ann".to_string()));

        let written = scheduler.commit_blocking(&record, Some(copy.as_path()))?;
        assert_eq!(written.author.as_deref(), Some("Ann"));
        assert_eq!(fs::read(&path)?, original);
        assert!(record.is_changed());
        let reread = ExifCodec.read(&fs::read(&copy)?, ContainerFormat::Jpeg)?;
        assert_eq!(reread.author.as_deref(), Some("Ann"));

        // never overwrites
        let err = scheduler.commit_blocking(&record, Some(copy.as_path())).unwrap_err();
        assert!(matches!(err, LoadError::Io { operation: "create destination", .. }));
        assert_eq!(reporter.failures().len(), 1);
        assert_eq!(reporter.failures()[0].1, Operation::Commit);

        record.dispose_now();
        Ok(())
    }

    #[test]
    fn test_commit_after_dispose_fails_quietly() -> Result<()> {
        let temp_dir = tempdir()?;
        let path = temp_dir.path().join("harbour.jpg");
        write_jpeg(&path, 32, 32, None, &PhotoFields::default())?;

        let reporter = Arc::new(CollectingReporter::default());
        let scheduler = scheduler(&reporter, LoaderConfig::default())?;
        let record = loaded(&scheduler, &path)?;
        record.set_title(Some("never written".to_string()));
        record.dispose_now();

        let err = scheduler.commit_blocking(&record, None).unwrap_err();
        assert!(err.is_disposed_race());
        assert!(reporter.failures().is_empty());
        Ok(())
    }

    #[test]
    fn test_commit_without_mapping_fails() -> Result<()> {
        let reporter = Arc::new(CollectingReporter::default());
        let scheduler = scheduler(&reporter, LoaderConfig::default())?;
        let record = scheduler.create_record("/photos/never-loaded.jpg");
        record.set_title(Some("orphan".to_string()));

        let err = scheduler.commit_blocking(&record, None).unwrap_err();
        assert!(matches!(err, LoadError::MappingClosed));
        assert_eq!(reporter.failures().len(), 1);
        Ok(())
    }

    #[test]
    fn test_commit_format_transcodes() -> Result<()> {
        let temp_dir = tempdir()?;
        let path = temp_dir.path().join("portrait.jpg");
        write_jpeg(&path, 60, 40, Some(6), &PhotoFields::default())?;

        let config = LoaderConfig {
            commit_format: Some(ContainerFormat::Png),
            ..Default::default()
        };
        let reporter = Arc::new(CollectingReporter::default());
        let scheduler = scheduler(&reporter, config)?;
        let record = loaded(&scheduler, &path)?;
        record.set_title(Some("Upright".to_string()));

        let written = scheduler.commit_blocking(&record, None)?;
        assert_eq!(written.orientation, exif_codec::Orientation::Normal);
        assert_eq!((written.width, written.height), (40, 60));
        let bytes = fs::read(&path)?;
        assert_eq!(ContainerFormat::sniff(&bytes)?, ContainerFormat::Png);
        record.dispose_now();
        Ok(())
    }

    #[test]
    fn test_commit_publishes_through_dispatcher() -> Result<()> {
        let temp_dir = tempdir()?;
        let path = temp_dir.path().join("harbour.jpg");
        write_jpeg(&path, 32, 32, None, &PhotoFields::default())?;

        let (dispatcher, queue) = QueueDispatcher::channel();
        let handle = queue.spawn()?;
        let reporter = Arc::new(CollectingReporter::default());
        let context = LoaderContext::new(LoaderConfig::default())
            .with_reporter(reporter.clone())
            .with_dispatcher(Arc::new(dispatcher));
        let scheduler = LoadScheduler::new(context)?;
        let record = loaded(&scheduler, &path)?;

        record.set_title(Some("via dispatcher".to_string()));
        let written = tokio::runtime::Builder::new_current_thread()
            .build()?
            .block_on(scheduler.commit(&record, None))??;
        assert_eq!(written.title.as_deref(), Some("via dispatcher"));
        assert!(!record.is_changed());

        record.dispose_now();
        drop(scheduler);
        handle.join().map_err(|_| anyhow::anyhow!("dispatch thread panicked"))?;
        Ok(())
    }

    /// Abandon a replace after each step, as a crash would, and check the
    /// original path.
    #[test]
    fn test_crash_at_any_step_leaves_whole_file() -> Result<()> {
        let old = b"old photo bytes".to_vec();
        let new = b"new photo bytes, a little longer".to_vec();

        for steps in 0..=3 {
            let temp_dir = tempdir()?;
            let target = temp_dir.path().join("photo.jpg");
            fs::write(&target, &old)?;

            let mut staged = StagedReplace::stage(&target, &new)?;
            let mut backup = None;
            if steps >= 1 {
                staged.set_aside()?;
                let kept = staged.backup_path().map(Path::to_path_buf);
                assert_eq!(kept.as_ref().map(fs::read).transpose()?, Some(old.clone()));
            }
            if steps >= 2 {
                backup = Some(staged.promote()?);
            } else {
                std::mem::forget(staged);
            }
            if steps >= 3 {
                if let Some(backup) = backup.take() {
                    backup.remove()?;
                }
            }
            std::mem::forget(backup);

            let on_disk = fs::read(&target)?;
            let expected = if steps >= 2 { &new } else { &old };
            assert_eq!(&on_disk, expected, "after {steps} steps");
        }
        Ok(())
    }

    #[test]
    fn test_abandoned_replace_restores_original() -> Result<()> {
        let temp_dir = tempdir()?;
        let target = temp_dir.path().join("photo.jpg");
        fs::write(&target, b"old")?;

        let mut staged = StagedReplace::stage(&target, b"new")?;
        staged.set_aside()?;
        let staged_path = staged.staged_path().to_path_buf();
        drop(staged);

        assert_eq!(fs::read(&target)?, b"old");
        assert!(!staged_path.exists());
        assert_eq!(files_in(temp_dir.path())?, vec!["photo.jpg".to_string()]);
        Ok(())
    }

    #[test]
    fn test_promote_failure_restores_original() -> Result<()> {
        let temp_dir = tempdir()?;
        let target = temp_dir.path().join("photo.jpg");
        fs::write(&target, b"old")?;

        let mut staged = StagedReplace::stage(&target, b"new")?;
        staged.set_aside()?;
        // a directory in the way makes the rename fail
        fs::remove_file(&target)?;
        fs::create_dir(&target)?;
        fs::write(target.join("blocker"), b"x")?;

        assert!(staged.promote().is_err());
        assert!(target.is_dir());
        let leftovers: Vec<String> = files_in(temp_dir.path())?
            .into_iter()
            .filter(|name| name.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
        Ok(())
    }
}
