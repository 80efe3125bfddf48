//! Headless command-line front end: parses arguments, drives a
//! [`SearchWorker`] over the bus and prints resolved images.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use log::{debug, error, info, warn, LevelFilter};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::TryRecvError, Receiver, Sender};

use crate::config::{Config, ServiceToggle};
use crate::models::ImageResult;
use crate::protocol::{Message, SearchCommand, SearchEvent};
use crate::retrievers::{canonical_service_name, CancelToken, HttpTimeouts};
use crate::search_worker::{SearchWorker, INITIALIZATION_SERVICE_NAME};
use crate::thumbnail_cache::{ThumbnailCache, DEFAULT_BUDGET_BYTES};

const BUS_CAPACITY: usize = 1024;
const QUERY_SEPARATOR: &str = " - ";
/// Quiet period after the last event before a concluded search counts as settled.
const SETTLE_IDLE: Duration = Duration::from_secs(2);
/// Quiet period after which outstanding batches are given up on.
const STALL_IDLE: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_millis(25);
const SHUTDOWN_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum CliError {
    #[error("an album name is required (positional query or --album)")]
    MissingAlbum,
    #[error("unknown service '{0}'")]
    UnknownService(String),
    #[error("no services selected")]
    NoServices,
    #[error("failed to start search worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("search worker failed to start: {0}")]
    WorkerInit(String),
    #[error("search worker stopped unexpectedly")]
    WorkerGone,
}

/// Finds album cover art across several online services.
#[derive(Parser, Debug)]
#[command(name = "coverfetch")]
#[command(version)]
pub struct Args {
    /// "Artist - Album", or just an album name
    #[arg(conflicts_with_all = ["artist", "album"])]
    pub query: Option<String>,

    #[arg(short = 'r', long, requires = "album")]
    pub artist: Option<String>,

    #[arg(short = 'a', long)]
    pub album: Option<String>,

    /// Only report front covers
    #[arg(long, conflicts_with = "no_front_only")]
    pub front_only: bool,

    /// Report every image type
    #[arg(long)]
    pub no_front_only: bool,

    /// Comma separated service names, e.g. "itunes,last.fm"
    #[arg(long)]
    pub services: Option<String>,

    /// Images resolved per candidate batch
    #[arg(long)]
    pub batch_size: Option<usize>,

    #[arg(long, default_value_t = 0)]
    pub min_width: u32,

    #[arg(long, default_value_t = 0)]
    pub min_height: u32,

    /// Extra batches to request from each service that has more
    #[arg(long, default_value_t = 0)]
    pub more: usize,

    /// Print one JSON object per image
    #[arg(long)]
    pub json: bool,

    /// Download thumbnail bytes for every resolved image
    #[arg(long)]
    pub fetch_thumbnails: bool,

    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long, default_value = "info", value_parser = parse_level_filter)]
    pub log_level: LevelFilter,
}

fn parse_level_filter(value: &str) -> Result<LevelFilter, String> {
    value
        .parse()
        .map_err(|_| format!("invalid log level '{value}'"))
}

impl Args {
    /// `(artist, album)` from either the positional query or the flags.
    pub fn search_terms(&self) -> Result<(String, String), CliError> {
        let (artist, album) = match &self.query {
            Some(query) => split_query(query),
            None => (
                self.artist.as_deref().unwrap_or_default().trim().to_string(),
                self.album.as_deref().unwrap_or_default().trim().to_string(),
            ),
        };
        if album.is_empty() {
            return Err(CliError::MissingAlbum);
        }
        Ok((artist, album))
    }

    /// Applies the search overrides given on the command line.
    pub fn apply_overrides(&self, config: &mut Config) -> Result<(), CliError> {
        if self.front_only {
            config.search.front_only = true;
        } else if self.no_front_only {
            config.search.front_only = false;
        }
        if let Some(batch_size) = self.batch_size {
            config.search.batch_size = batch_size;
        }
        if let Some(names) = &self.services {
            config.services = select_services(&config.services, names)?;
        }
        Ok(())
    }
}

/// Splits `"Artist - Album"` on the first separator. Without one the whole
/// query is the album.
pub fn split_query(query: &str) -> (String, String) {
    match query.split_once(QUERY_SEPARATOR) {
        Some((artist, album)) => (artist.trim().to_string(), album.trim().to_string()),
        None => (String::new(), query.trim().to_string()),
    }
}

/// Enables exactly the listed services, keeping the configured order.
pub fn select_services(
    configured: &[ServiceToggle],
    names: &str,
) -> Result<Vec<ServiceToggle>, CliError> {
    let mut wanted = HashSet::new();
    for name in names.split(',').map(str::trim).filter(|name| !name.is_empty()) {
        let canonical =
            canonical_service_name(name).ok_or_else(|| CliError::UnknownService(name.to_string()))?;
        wanted.insert(canonical);
    }
    if wanted.is_empty() {
        return Err(CliError::NoServices);
    }
    Ok(configured
        .iter()
        .map(|toggle| ServiceToggle::new(toggle.name.clone(), wanted.contains(toggle.name.as_str())))
        .collect())
}

/// Print filter and output format for resolved images.
#[derive(Debug, Clone, Copy)]
pub struct OutputOptions {
    pub min_width: u32,
    pub min_height: u32,
    pub json: bool,
}

impl OutputOptions {
    pub fn accepts(&self, image: &ImageResult) -> bool {
        image.full_width >= self.min_width && image.full_height >= self.min_height
    }

    pub fn format(&self, image: &ImageResult) -> String {
        if self.json {
            return image_json(image).to_string();
        }
        format!(
            "{}\t{}x{}\t{}\t{} / {}\t{}",
            image.source_service(),
            image.full_width,
            image.full_height,
            image.original_type.as_deref().unwrap_or("-"),
            image.artist_name().unwrap_or("?"),
            image.album_name().unwrap_or("?"),
            image.full_image_url
        )
    }
}

fn image_json(image: &ImageResult) -> serde_json::Value {
    serde_json::json!({
        "service": image.source_service(),
        "artist": image.artist_name(),
        "album": image.album_name(),
        "full_image_url": image.full_image_url,
        "thumbnail_url": image.thumbnail_url,
        "width": image.full_width,
        "height": image.full_height,
        "original_type": image.original_type,
        "is_front": image.is_front,
        "thumbnail_bytes": image.thumbnail_data.as_ref().map(|bytes| bytes.len()),
    })
}

/// Consumer-side bookkeeping for one search run.
pub struct SearchSession {
    services: Vec<ServiceToggle>,
    batch_size: Option<usize>,
    more: usize,
    outstanding: HashSet<String>,
    more_requested: HashMap<String, usize>,
    concluded: bool,
    cancelled: bool,
    last_event: Instant,
    printed: usize,
    largest: Option<(String, u64)>,
}

impl SearchSession {
    pub fn new(services: Vec<ServiceToggle>, batch_size: Option<usize>, more: usize) -> Self {
        let outstanding = services
            .iter()
            .filter(|toggle| toggle.enabled)
            .map(|toggle| toggle.name.clone())
            .collect();
        Self {
            services,
            batch_size,
            more,
            outstanding,
            more_requested: HashMap::new(),
            concluded: false,
            cancelled: false,
            last_event: Instant::now(),
            printed: 0,
            largest: None,
        }
    }

    fn record_printed(&mut self, image: &ImageResult) {
        self.printed += 1;
        let pixels = image.pixel_count();
        if self.largest.as_ref().map_or(true, |(_, best)| pixels > *best) {
            self.largest = Some((image.full_image_url.clone(), pixels));
        }
    }

    /// Stops waiting on outstanding batches and returns the cancel command.
    /// `None` when the session was already cancelled.
    pub fn cancel(&mut self, now: Instant) -> Option<SearchCommand> {
        if self.cancelled {
            return None;
        }
        self.cancelled = true;
        self.outstanding.clear();
        self.last_event = now;
        Some(SearchCommand::CancelSearch)
    }

    /// Updates state for `event` and returns any follow-up command.
    pub fn observe(&mut self, event: &SearchEvent, now: Instant) -> Option<SearchCommand> {
        self.last_event = now;
        match event {
            SearchEvent::AllSearchesConcluded => {
                self.concluded = true;
                None
            }
            SearchEvent::ServiceBatchSucceeded {
                service_name,
                has_more: true,
            } => {
                let requested = self.more_requested.entry(service_name.clone()).or_insert(0);
                if self.cancelled || *requested >= self.more {
                    self.outstanding.remove(service_name);
                    return None;
                }
                *requested += 1;
                info!(
                    "[{}] Requesting more results ({}/{})",
                    service_name, requested, self.more
                );
                Some(SearchCommand::RequestMore {
                    service_name: service_name.clone(),
                    services: self.services.clone(),
                    batch_size: self.batch_size,
                })
            }
            event if event.is_batch_outcome() => {
                if let Some(service_name) = event.service_name() {
                    self.outstanding.remove(service_name);
                }
                None
            }
            _ => None,
        }
    }

    pub fn is_settled(&self, now: Instant) -> bool {
        if !self.concluded {
            return false;
        }
        let idle = now.saturating_duration_since(self.last_event);
        if self.outstanding.is_empty() {
            return idle >= SETTLE_IDLE;
        }
        if idle >= STALL_IDLE {
            warn!(
                "Giving up on services with no batch outcome: {:?}",
                self.outstanding
            );
            return true;
        }
        false
    }
}

fn send_command(bus_producer: &Sender<Message>, command: SearchCommand) -> Result<(), CliError> {
    bus_producer
        .send(Message::Command(command))
        .map(|_| ())
        .map_err(|_| CliError::WorkerGone)
}

fn wait_for_shutdown(bus_consumer: &mut Receiver<Message>) {
    let deadline = Instant::now() + SHUTDOWN_WAIT;
    while Instant::now() < deadline {
        match bus_consumer.try_recv() {
            Ok(Message::Event(SearchEvent::WorkerShutdownComplete)) => return,
            Ok(_) | Err(TryRecvError::Lagged(_)) => {}
            Err(TryRecvError::Empty) => thread::sleep(POLL_INTERVAL),
            Err(TryRecvError::Closed) => return,
        }
    }
    warn!("Timed out waiting for the search worker to shut down");
}

/// Runs one search to completion and prints the results.
pub fn run(args: &Args, config: Config) -> Result<(), CliError> {
    let (artist, album) = args.search_terms()?;
    let services = config.services.clone();
    if !services.iter().any(|toggle| toggle.enabled) {
        return Err(CliError::NoServices);
    }
    let output = OutputOptions {
        min_width: args.min_width,
        min_height: args.min_height,
        json: args.json,
    };
    let thumbnails = args.fetch_thumbnails.then(|| {
        ThumbnailCache::new(HttpTimeouts::from_config(&config.network), DEFAULT_BUDGET_BYTES)
    });
    let batch_size = Some(config.search.batch_size);

    let (bus_producer, mut bus_consumer) = broadcast::channel(BUS_CAPACITY);
    let worker_consumer = bus_producer.subscribe();
    let worker_producer = bus_producer.clone();
    let initial_search = SearchCommand::Search {
        artist: artist.clone(),
        album: album.clone(),
        front_only: config.search.front_only,
        services: services.clone(),
        batch_size,
    };
    let worker_thread = thread::Builder::new()
        .name("search-worker".to_string())
        .spawn(move || {
            SearchWorker::new(config, worker_consumer, worker_producer)
                .with_initial_search(initial_search)
                .run();
        })?;
    info!("Searching for '{}' by '{}'", album, artist);

    let interrupted = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&interrupted);
    if let Err(err) = ctrlc::set_handler(move || handler_flag.store(true, Ordering::SeqCst)) {
        warn!("Could not install Ctrl-C handler: {}", err);
    }

    let mut session = SearchSession::new(services, batch_size, args.more);
    let outcome = loop {
        let now = Instant::now();
        if interrupted.load(Ordering::SeqCst) {
            if let Some(command) = session.cancel(now) {
                info!("Interrupted; cancelling search");
                if let Err(err) = send_command(&bus_producer, command) {
                    break Err(err);
                }
            }
        }
        match bus_consumer.try_recv() {
            Ok(Message::Event(event)) => {
                debug!("Bus event: {:?}", event);
                if let SearchEvent::ServiceError {
                    service_name,
                    message,
                } = &event
                {
                    if service_name == INITIALIZATION_SERVICE_NAME {
                        break Err(CliError::WorkerInit(message.clone()));
                    }
                    warn!("[{}] {}", service_name, message);
                }
                if let SearchEvent::ImageResolved {
                    service_name,
                    image_result,
                } = &event
                {
                    if output.accepts(image_result) {
                        let mut image = image_result.clone();
                        if let Some(cache) = &thumbnails {
                            match cache.fetch(&image.thumbnail_url, &CancelToken::default()) {
                                Ok(bytes) => image.thumbnail_data = bytes,
                                Err(err) => warn!("[{}] Thumbnail fetch failed: {}", service_name, err),
                            }
                        }
                        println!("{}", output.format(&image));
                        session.record_printed(&image);
                    }
                }
                if let Some(command) = session.observe(&event, now) {
                    if let Err(err) = send_command(&bus_producer, command) {
                        break Err(err);
                    }
                }
            }
            Ok(Message::Command(_)) => {}
            Err(TryRecvError::Lagged(skipped)) => {
                warn!("CLI bus consumer lagged by {} messages", skipped);
            }
            Err(TryRecvError::Empty) => {
                if session.is_settled(now) {
                    break Ok(());
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(TryRecvError::Closed) => break Err(CliError::WorkerGone),
        }
    };

    if send_command(&bus_producer, SearchCommand::Shutdown).is_ok() {
        wait_for_shutdown(&mut bus_consumer);
    }
    if worker_thread.join().is_err() {
        error!("Search worker thread panicked");
    }
    if let Some(cache) = &thumbnails {
        debug!(
            "Thumbnail cache holds {} images ({} bytes)",
            cache.len(),
            cache.total_bytes()
        );
    }
    info!("Printed {} images", session.printed);
    if let Some((url, pixels)) = &session.largest {
        info!("Largest image: {} ({} pixels)", url, pixels);
    }
    outcome
}

/// Runs the CLI with an already-loaded configuration.
pub fn run_with_config(args: &Args, mut config: Config) -> Result<(), CliError> {
    args.apply_overrides(&mut config)?;
    let config = crate::config::sanitize_config(config);
    run(args, config)
}
