//! photo-tagger: view and edit photo titles, authors, capture dates and locations

mod config;

use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDateTime;
use clap::{Args, Parser, Subcommand};
use exif_codec::{parse_exif_datetime, ContainerFormat, GpsLocation, MetadataSnapshot};
use image_loader::{ImageRecord, LoadScheduler, LoaderConfig, LoaderContext, PhotoList, QueueDispatcher};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Upper bound on waiting for a batch of photos to load.
const LOAD_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Parser)]
#[command(name = "photo-tagger")]
#[command(about = "View and edit photo titles, authors, capture dates and GPS locations")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log debug output (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Number of load workers (at most 3)
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Re-encode committed photos as jpeg, png, webp or tiff
    #[arg(long, global = true)]
    commit_format: Option<ContainerFormat>,

    /// Load full images as soon as their metadata is in
    #[arg(long, global = true)]
    eager: bool,
}

impl Cli {
    fn overrides(&self) -> config::Overrides {
        config::Overrides {
            workers: self.workers,
            commit_format: self.commit_format,
            eager_full_load: self.eager,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print the metadata of one or more photos
    Show {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Change fields of a photo and save them
    Set(SetArgs),

    /// Parse a coordinate pair and print its EXIF encoding
    Gps { text: String },

    /// Print the effective loader configuration
    Config,
}

#[derive(Args, Debug)]
struct SetArgs {
    file: PathBuf,

    #[arg(long, conflicts_with = "clear_title")]
    title: Option<String>,
    #[arg(long)]
    clear_title: bool,

    #[arg(long, conflicts_with = "clear_author")]
    author: Option<String>,
    #[arg(long)]
    clear_author: bool,

    /// Capture time, `YYYY-MM-DD HH:MM:SS` or EXIF `YYYY:MM:DD HH:MM:SS`
    #[arg(long, conflicts_with = "clear_taken")]
    taken: Option<String>,
    #[arg(long)]
    clear_taken: bool,

    /// Location such as `47.6062N, 122.3321W` or `-33.86, 151.21`
    #[arg(long, conflicts_with = "clear_gps")]
    gps: Option<String>,
    #[arg(long)]
    clear_gps: bool,

    /// Write a new file instead of replacing FILE. Never overwrites.
    #[arg(short, long)]
    output: Option<PathBuf>,
}

impl SetArgs {
    fn edits(&self) -> Result<Edits> {
        let taken = match &self.taken {
            Some(text) => Some(Some(parse_taken(text)?)),
            None => self.clear_taken.then_some(None),
        };
        let location = match &self.gps {
            Some(text) => Some(Some(
                text.parse::<GpsLocation>()
                    .with_context(|| format!("Invalid location: {text}"))?,
            )),
            None => self.clear_gps.then_some(None),
        };
        Ok(Edits {
            title: text_edit(&self.title, self.clear_title),
            author: text_edit(&self.author, self.clear_author),
            taken,
            location,
        })
    }
}

fn text_edit(value: &Option<String>, clear: bool) -> Option<Option<String>> {
    match value {
        Some(text) => Some(Some(text.clone())),
        None => clear.then_some(None),
    }
}

/// Requested changes. The outer `None` leaves a field alone, `Some(None)` clears it.
#[derive(Debug, Default, PartialEq)]
struct Edits {
    title: Option<Option<String>>,
    author: Option<Option<String>>,
    taken: Option<Option<NaiveDateTime>>,
    location: Option<Option<GpsLocation>>,
}

impl Edits {
    fn is_empty(&self) -> bool {
        *self == Edits::default()
    }

    fn apply(self, record: &ImageRecord) {
        if let Some(title) = self.title {
            record.set_title(title);
        }
        if let Some(author) = self.author {
            record.set_author(author);
        }
        if let Some(taken) = self.taken {
            record.set_taken(taken);
        }
        if let Some(location) = self.location {
            record.set_location(location);
        }
    }
}

fn parse_taken(text: &str) -> Result<NaiveDateTime> {
    const FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];
    let text = text.trim();
    if let Some(taken) = FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
    {
        return Ok(taken);
    }
    parse_exif_datetime(text, None).map_err(|_| {
        anyhow!("Invalid capture time: {text}. Valid formats: YYYY-MM-DD HH:MM:SS, YYYY:MM:DD HH:MM:SS")
    })
}

/// One photo as printed by `show`.
#[derive(Debug, Serialize)]
struct PhotoSummary {
    path: PathBuf,
    #[serde(flatten)]
    metadata: MetadataSnapshot,
}

fn print_photo(path: &Path, metadata: &MetadataSnapshot) {
    println!(
        "{}  ({}x{}, {:?})",
        path.display(),
        metadata.width,
        metadata.height,
        metadata.orientation
    );
    println!("  Title:    {}", metadata.title.as_deref().unwrap_or("-"));
    println!("  Author:   {}", metadata.author.as_deref().unwrap_or("-"));
    match &metadata.taken {
        Some(taken) => println!("  Taken:    {}", taken.format("%Y-%m-%d %H:%M:%S")),
        None => println!("  Taken:    -"),
    }
    match &metadata.location {
        Some(location) => println!("  Location: {location}"),
        None => println!("  Location: -"),
    }
}

/// A scheduler whose updates are applied on a dedicated dispatch thread.
struct Session {
    scheduler: Arc<LoadScheduler>,
    dispatch: JoinHandle<()>,
    list: Arc<PhotoList>,
}

impl Session {
    fn start(config: LoaderConfig) -> Result<Self> {
        let (dispatcher, queue) = QueueDispatcher::channel();
        let dispatch = queue.spawn().context("Failed to start dispatch thread")?;
        let context = LoaderContext::new(config).with_dispatcher(Arc::new(dispatcher));
        let scheduler = LoadScheduler::new(context).context("Failed to start load workers")?;
        Ok(Self {
            scheduler: Arc::new(scheduler),
            dispatch,
            list: Arc::new(PhotoList::new()),
        })
    }

    /// Load `files` and return the ones that succeeded, in order. Failures
    /// are logged by the scheduler's reporter.
    async fn load(&self, files: &[PathBuf]) -> Result<Vec<Arc<ImageRecord>>> {
        for file in files {
            self.scheduler.open(file, &self.list);
        }
        let scheduler = Arc::clone(&self.scheduler);
        let idle = tokio::task::spawn_blocking(move || scheduler.wait_idle(LOAD_TIMEOUT)).await?;
        if !idle {
            bail!("Timed out loading {} photos", files.len());
        }
        debug!(stats = ?self.scheduler.stats(), "Loads finished");
        Ok(self
            .list
            .records()
            .into_iter()
            .filter(|record| record.is_metadata_loaded())
            .collect())
    }

    /// Unmap every photo, stop the workers and drain the dispatcher.
    async fn finish(self) -> Result<()> {
        let Session {
            scheduler,
            dispatch,
            list,
        } = self;
        tokio::task::spawn_blocking(move || {
            for record in list.records() {
                record.dispose_now();
            }
            drop(scheduler);
            dispatch.join().map_err(|_| anyhow!("Dispatch thread panicked"))
        })
        .await?
    }
}

async fn show(config: LoaderConfig, files: Vec<PathBuf>, json: bool) -> Result<()> {
    let session = Session::start(config)?;
    let records = session.load(&files).await?;
    let photos: Vec<PhotoSummary> = records
        .iter()
        .filter_map(|record| {
            record.metadata().map(|metadata| PhotoSummary {
                path: record.path().to_path_buf(),
                metadata,
            })
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&photos).context("Failed to serialize photos")?);
    } else {
        for photo in &photos {
            print_photo(&photo.path, &photo.metadata);
        }
    }

    let failed = files.len() - photos.len();
    session.finish().await?;
    if failed > 0 {
        bail!("{failed} of {} photos could not be loaded", files.len());
    }
    Ok(())
}

async fn set(config: LoaderConfig, args: SetArgs) -> Result<MetadataSnapshot> {
    let edits = args.edits()?;
    let session = Session::start(config)?;
    let record = session
        .load(std::slice::from_ref(&args.file))
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("Could not load {}", args.file.display()))?;

    let empty = edits.is_empty();
    edits.apply(&record);
    if args.output.is_none() && !record.is_changed() {
        if empty {
            println!("Nothing to change");
        } else {
            println!("{} is already up to date", args.file.display());
        }
        let current = record.metadata().unwrap_or_default();
        session.finish().await?;
        return Ok(current);
    }

    let written = session
        .scheduler
        .commit(&record, args.output.clone())
        .await?
        .with_context(|| format!("Failed to save {}", args.file.display()))?;

    let saved_to = args.output.as_deref().unwrap_or(&args.file);
    info!(path = %saved_to.display(), "Saved");
    print_photo(saved_to, &written);
    session.finish().await?;
    Ok(written)
}

fn gps(text: &str) -> Result<()> {
    let location: GpsLocation = text.parse().with_context(|| format!("Invalid location: {text}"))?;
    println!("Location:  {location}");
    println!(
        "Latitude:  {} {}  [{}]",
        location.latitude(),
        location.latitude_ref(),
        hex(&location.latitude_bytes())
    );
    println!(
        "Longitude: {} {}  [{}]",
        location.longitude(),
        location.longitude_ref(),
        hex(&location.longitude_bytes())
    );
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(" ")
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = cli.overrides().apply(config::load(cli.config.as_deref())?);

    match cli.command {
        Commands::Show { files, json } => show(config, files, json).await,
        Commands::Set(args) => set(config, args).await.map(|_| ()),
        Commands::Gps { text } => gps(&text),
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
