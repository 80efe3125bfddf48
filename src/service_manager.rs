//! Search orchestration across all registered retrievers.
//!
//! Each service runs its own search → list → resolve pipeline on a shared
//! service pool, handing images to a separate resolution pool. Progress is
//! reported as [`SearchEvent`]s on the bus. Per-service state lives behind
//! its own lock; the lock is released for every network call and the
//! state is re-validated afterwards.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::broadcast::Sender;

use crate::config::{Config, ServiceToggle};
use crate::models::{AlbumCandidate, PotentialImage};
use crate::protocol::{Message, SearchEvent};
use crate::retrievers::{build_retrievers, CancelToken, ImageRetriever, RetrieverSettings};
use crate::worker_pool::{panic_payload_to_string, WorkerPool};

const LISTING_POLL_INTERVAL: Duration = Duration::from_millis(100);
const LISTING_ERROR_NAME_CHARS: usize = 30;
const BATCH_ERROR_CHARS: usize = 100;
const SERVICE_POOL_NAME: &str = "service-processor";
const RESOLUTION_POOL_NAME: &str = "image-resolver";

/// Queued work and progress for one service within the current search.
struct ServiceState {
    candidates: VecDeque<Arc<AlbumCandidate>>,
    pending_images: VecDeque<PotentialImage>,
    active_candidate: Option<Arc<AlbumCandidate>>,
    listing_in_flight: bool,
    all_candidates_listed: bool,
    images_resolved: usize,
    cancel: CancelToken,
}

impl ServiceState {
    fn new(cancel: CancelToken) -> Self {
        Self {
            candidates: VecDeque::new(),
            pending_images: VecDeque::new(),
            active_candidate: None,
            listing_in_flight: false,
            all_candidates_listed: false,
            images_resolved: 0,
            cancel,
        }
    }

    fn has_more(&self) -> bool {
        !self.pending_images.is_empty() || !self.candidates.is_empty() || self.listing_in_flight
    }

    fn is_active(&self, candidate: &Arc<AlbumCandidate>) -> bool {
        self.active_candidate
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(active, candidate))
    }
}

/// Initial searches still running for the current session.
#[derive(Debug, Default)]
struct SearchCounter {
    session_id: u64,
    in_flight: usize,
}

/// Parameters of the most recent `start_search`.
#[derive(Debug, Clone, Default)]
struct SearchContext {
    front_only: bool,
    services: Vec<ServiceToggle>,
}

/// Everything one service's initial search task needs.
struct InitialSearch {
    retriever: Arc<dyn ImageRetriever>,
    artist: String,
    album: String,
    front_only: bool,
    batch_size: usize,
    cancel: CancelToken,
    session_id: u64,
}

enum BatchOutcome {
    Completed { has_more: bool },
    Cancelled,
}

struct Shared {
    retrievers: Vec<Arc<dyn ImageRetriever>>,
    states: HashMap<&'static str, Mutex<ServiceState>>,
    counter: Mutex<SearchCounter>,
    context: Mutex<SearchContext>,
    shutdown: Arc<AtomicBool>,
    default_batch_size: usize,
    service_pool: WorkerPool,
    resolution_pool: WorkerPool,
    bus_producer: Sender<Message>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn is_enabled(services: &[ServiceToggle], service_name: &str) -> bool {
    services
        .iter()
        .any(|toggle| toggle.enabled && toggle.name == service_name)
}

/// Runs one retriever call, turning errors and panics into a message.
fn call_retriever<T>(
    call: impl FnOnce() -> Result<T, crate::retrievers::RetrieverError>,
) -> Result<T, String> {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => {
            debug!("Retriever call failed ({}): {}", err.kind_label(), err);
            Err(err.to_string())
        }
        Err(payload) => Err(format!(
            "retriever panicked: {}",
            panic_payload_to_string(payload.as_ref())
        )),
    }
}

impl Shared {
    fn emit(&self, event: SearchEvent) {
        let _ = self.bus_producer.send(Message::Event(event));
    }

    fn retriever(&self, service_name: &str) -> Option<Arc<dyn ImageRetriever>> {
        self.retrievers
            .iter()
            .find(|retriever| retriever.service_name() == service_name)
            .cloned()
    }

    fn state(&self, service_name: &str) -> Option<&Mutex<ServiceState>> {
        self.states.get(service_name)
    }

    fn effective_batch_size(&self, batch_size: Option<usize>) -> usize {
        batch_size
            .filter(|size| *size > 0)
            .unwrap_or(self.default_batch_size)
    }

    /// Marks one initial search of `session_id` as finished.
    fn finish_initial_search(&self, session_id: u64, service_name: &str) {
        let mut counter = lock(&self.counter);
        if counter.session_id != session_id {
            debug!(
                "[{}] Initial search of superseded session {} finished",
                service_name, session_id
            );
            return;
        }
        if counter.in_flight == 0 {
            return;
        }
        counter.in_flight -= 1;
        debug!(
            "[{}] Initial searches still in flight: {}",
            service_name, counter.in_flight
        );
        if counter.in_flight == 0 && !self.shutdown.load(Ordering::SeqCst) {
            info!("[ServiceManager] All initial service searches concluded");
            self.emit(SearchEvent::AllSearchesConcluded);
        }
    }

    fn run_initial_search(self: &Arc<Self>, task: InitialSearch) {
        let service_name = task.retriever.service_name();
        if !task.cancel.check(service_name, "before initial search") {
            self.search_then_fill(&task);
        }
        self.finish_initial_search(task.session_id, service_name);
    }

    fn search_then_fill(self: &Arc<Self>, task: &InitialSearch) {
        let InitialSearch {
            retriever,
            artist,
            album,
            front_only,
            batch_size,
            cancel,
            ..
        } = task;
        let service_name = retriever.service_name();
        let Some(state_lock) = self.state(service_name) else {
            return;
        };
        info!(
            "[{}] Starting initial search for '{}' by '{}'",
            service_name, album, artist
        );
        let searched = call_retriever(|| retriever.search_album_candidates(artist, album, cancel));

        let candidates = match searched {
            Ok(candidates) => candidates,
            Err(message) => {
                let _state = lock(state_lock);
                if cancel.check(service_name, "after failed initial search") {
                    return;
                }
                error!("[{}] Error during initial search: {}", service_name, message);
                self.emit(SearchEvent::ServiceError {
                    service_name: service_name.to_string(),
                    message: format!("Error searching candidates: {message}"),
                });
                self.emit(SearchEvent::ServiceBatchErrored {
                    service_name: service_name.to_string(),
                    error_message: format!("Error during initial search phase: {message}"),
                });
                return;
            }
        };

        {
            let mut state = lock(state_lock);
            if cancel.check(service_name, "after initial search") {
                return;
            }
            self.emit(SearchEvent::ServiceAlbumSearchSucceeded {
                service_name: service_name.to_string(),
                num_candidates: candidates.len(),
            });
            if candidates.is_empty() {
                state.all_candidates_listed = true;
                self.emit(SearchEvent::ServiceBatchSucceeded {
                    service_name: service_name.to_string(),
                    has_more: false,
                });
                return;
            }
            state.candidates.extend(candidates.into_iter().map(Arc::new));
        }
        self.run_batch(retriever, *batch_size, *front_only, cancel);
    }

    /// Fills one batch and emits exactly one batch outcome event.
    fn run_batch(
        self: &Arc<Self>,
        retriever: &Arc<dyn ImageRetriever>,
        batch_size: usize,
        front_only: bool,
        cancel: &CancelToken,
    ) {
        let service_name = retriever.service_name().to_string();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.fill_batch(retriever, batch_size, front_only, cancel)
        }));
        let event = match outcome {
            Ok(BatchOutcome::Completed { has_more }) => {
                info!("[{}] Batch completed, has more: {}", service_name, has_more);
                SearchEvent::ServiceBatchSucceeded {
                    service_name,
                    has_more,
                }
            }
            Ok(BatchOutcome::Cancelled) => SearchEvent::ServiceBatchCancelled { service_name },
            Err(_) if cancel.is_cancelled() => SearchEvent::ServiceBatchCancelled { service_name },
            Err(payload) => {
                let message = panic_payload_to_string(payload.as_ref());
                error!("[{}] Batch processing panicked: {}", service_name, message);
                SearchEvent::ServiceBatchErrored {
                    service_name,
                    error_message: format!(
                        "Batch processing error: {}",
                        truncate(&message, BATCH_ERROR_CHARS)
                    ),
                }
            }
        };
        self.emit(event);
    }

    fn fill_batch(
        self: &Arc<Self>,
        retriever: &Arc<dyn ImageRetriever>,
        batch_size: usize,
        front_only: bool,
        cancel: &CancelToken,
    ) -> BatchOutcome {
        let service_name = retriever.service_name();
        let Some(state_lock) = self.state(service_name) else {
            return BatchOutcome::Cancelled;
        };
        let mut state = lock(state_lock);
        if cancel.check(service_name, "at start of batch fill") {
            return BatchOutcome::Cancelled;
        }

        let mut sent = 0;
        while sent < batch_size {
            if cancel.check(service_name, "in batch fill loop") {
                break;
            }
            if state.pending_images.is_empty() {
                if state.all_candidates_listed {
                    break;
                }
                if state.listing_in_flight {
                    drop(state);
                    thread::sleep(LISTING_POLL_INTERVAL);
                    state = lock(state_lock);
                    continue;
                }
                let Some(candidate) = state.candidates.pop_front() else {
                    state.all_candidates_listed = true;
                    info!("[{}] All album candidates processed for listing", service_name);
                    break;
                };
                state.active_candidate = Some(Arc::clone(&candidate));
                state.listing_in_flight = true;
                drop(state);

                info!("[{}] Listing images for '{}'", service_name, candidate.display_name());
                let listed = call_retriever(|| retriever.list_potential_images(&candidate, cancel));

                state = lock(state_lock);
                if cancel.check(service_name, "after listing images") {
                    break;
                }
                let still_active = state.is_active(&candidate);
                if still_active || state.active_candidate.is_none() {
                    state.listing_in_flight = false;
                }
                match listed {
                    Ok(images) => {
                        let listed_count = images.len();
                        let images: Vec<PotentialImage> = if front_only {
                            images.into_iter().filter(|image| image.is_front).collect()
                        } else {
                            images
                        };
                        if front_only && listed_count > 0 {
                            info!(
                                "[{}] Front cover filter: {} -> {} images for '{}'",
                                service_name,
                                listed_count,
                                images.len(),
                                candidate.display_name()
                            );
                        }
                        if still_active {
                            state.pending_images.extend(images);
                        } else {
                            info!(
                                "[{}] Active candidate changed while listing '{}'; discarding {} images",
                                service_name,
                                candidate.display_name(),
                                images.len()
                            );
                        }
                    }
                    Err(message) => {
                        error!(
                            "[{}] Error listing images for '{}': {}",
                            service_name,
                            candidate.display_name(),
                            message
                        );
                        self.emit(SearchEvent::ServiceError {
                            service_name: service_name.to_string(),
                            message: format!(
                                "Error listing for {}.",
                                truncate(candidate.display_name(), LISTING_ERROR_NAME_CHARS)
                            ),
                        });
                    }
                }
                if state.pending_images.is_empty() {
                    debug!(
                        "[{}] No images from '{}', trying next candidate",
                        service_name,
                        candidate.display_name()
                    );
                    if still_active {
                        state.active_candidate = None;
                    }
                    continue;
                }
            }

            if let Some(image) = state.pending_images.pop_front() {
                self.emit(SearchEvent::PotentialImageFound {
                    service_name: service_name.to_string(),
                    potential_image: image.clone(),
                });
                self.submit_resolution(retriever, image, cancel);
                sent += 1;
            }
            if state.pending_images.is_empty() && state.active_candidate.is_some() {
                state.active_candidate = None;
            }
        }

        if cancel.check(service_name, "at end of batch fill") {
            return BatchOutcome::Cancelled;
        }
        BatchOutcome::Completed {
            has_more: state.has_more(),
        }
    }

    fn submit_resolution(
        self: &Arc<Self>,
        retriever: &Arc<dyn ImageRetriever>,
        image: PotentialImage,
        cancel: &CancelToken,
    ) {
        let service_name = retriever.service_name();
        let shared = Arc::clone(self);
        let retriever = Arc::clone(retriever);
        let cancel = cancel.clone();
        let submitted = self.resolution_pool.submit(move || {
            shared.resolve_image(&retriever, &image, &cancel);
        });
        if !submitted {
            debug!("[{}] Resolution pool closed; image dropped", service_name);
        }
    }

    fn resolve_image(
        &self,
        retriever: &Arc<dyn ImageRetriever>,
        image: &PotentialImage,
        cancel: &CancelToken,
    ) {
        let service_name = retriever.service_name();
        if cancel.check(service_name, "before resolving image") {
            return;
        }
        let resolved = call_retriever(|| retriever.resolve_image_details(image, cancel));
        if cancel.check(service_name, "after resolving image") {
            return;
        }
        match resolved {
            Ok(Some(image_result)) => {
                self.emit(SearchEvent::ImageResolved {
                    service_name: service_name.to_string(),
                    image_result,
                });
                if let Some(state_lock) = self.state(service_name) {
                    let mut state = lock(state_lock);
                    if !cancel.is_cancelled() {
                        state.images_resolved += 1;
                    }
                }
            }
            Ok(None) => warn!(
                "[{}] Failed to resolve image details for {}",
                service_name, image.full_image_url
            ),
            Err(message) => error!(
                "[{}] Error resolving image {}: {}",
                service_name, image.full_image_url, message
            ),
        }
    }
}

/// Owns the retrievers, the per-service state and both worker pools.
pub struct ServiceManager {
    shared: Arc<Shared>,
}

impl ServiceManager {
    pub fn new(
        retrievers: Vec<Arc<dyn ImageRetriever>>,
        max_concurrent_resolutions_per_service: usize,
        default_batch_size: usize,
        bus_producer: Sender<Message>,
    ) -> std::io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let states = retrievers
            .iter()
            .map(|retriever| {
                let state = ServiceState::new(CancelToken::new(Arc::clone(&shutdown)));
                (retriever.service_name(), Mutex::new(state))
            })
            .collect();
        let service_slots = retrievers.len().max(1);
        let resolution_slots = max_concurrent_resolutions_per_service.max(1) * service_slots;
        info!(
            "[ServiceManager] {} retrievers, {} service slots, {} resolution slots",
            retrievers.len(),
            service_slots,
            resolution_slots
        );

        Ok(Self {
            shared: Arc::new(Shared {
                retrievers,
                states,
                counter: Mutex::new(SearchCounter::default()),
                context: Mutex::new(SearchContext::default()),
                shutdown,
                default_batch_size: default_batch_size.max(1),
                service_pool: WorkerPool::new(SERVICE_POOL_NAME, service_slots)?,
                resolution_pool: WorkerPool::new(RESOLUTION_POOL_NAME, resolution_slots)?,
                bus_producer,
            }),
        })
    }

    /// Builds every registered retriever from `config`.
    pub fn from_config(config: &Config, bus_producer: Sender<Message>) -> std::io::Result<Self> {
        let retrievers = build_retrievers(&RetrieverSettings::from_config(config));
        Self::new(
            retrievers,
            config.network.max_concurrent_resolutions_per_service,
            config.search.batch_size,
            bus_producer,
        )
    }

    pub fn service_names(&self) -> Vec<&'static str> {
        self.shared
            .retrievers
            .iter()
            .map(|retriever| retriever.service_name())
            .collect()
    }

    /// Images resolved for `service_name` in the current search.
    pub fn images_resolved(&self, service_name: &str) -> usize {
        self.shared
            .state(service_name)
            .map_or(0, |state| lock(state).images_resolved)
    }

    /// Cancels any previous search and starts a new one on every enabled
    /// service that has a retriever.
    pub fn start_search(
        &self,
        artist: &str,
        album: &str,
        front_only: bool,
        services: &[ServiceToggle],
        batch_size: Option<usize>,
    ) {
        let shared = &self.shared;
        if shared.shutdown.load(Ordering::SeqCst) {
            warn!("[ServiceManager] Shutdown in progress, ignoring new search");
            shared.emit(SearchEvent::AllSearchesConcluded);
            return;
        }
        info!(
            "[ServiceManager] Starting search for '{}' by '{}' (front only: {})",
            album, artist, front_only
        );

        let mut tokens = HashMap::new();
        for (service_name, state_lock) in &shared.states {
            let mut state = lock(state_lock);
            state.cancel.cancel();
            let token = CancelToken::new(Arc::clone(&shared.shutdown));
            if !is_enabled(services, service_name) {
                token.cancel();
            }
            *state = ServiceState::new(token.clone());
            tokens.insert(*service_name, token);
        }
        *lock(&shared.context) = SearchContext {
            front_only,
            services: services.to_vec(),
        };

        let mut scheduled = Vec::new();
        for toggle in services.iter().filter(|toggle| toggle.enabled) {
            match (shared.retriever(&toggle.name), tokens.get(toggle.name.as_str())) {
                (Some(retriever), Some(token)) => scheduled.push((retriever, token.clone())),
                _ => error!(
                    "[ServiceManager] Service '{}' is enabled but has no retriever; skipping",
                    toggle.name
                ),
            }
        }

        let session_id = {
            let mut counter = lock(&shared.counter);
            counter.session_id += 1;
            counter.in_flight = scheduled.len();
            counter.session_id
        };
        if scheduled.is_empty() {
            warn!("[ServiceManager] No enabled services with retrievers; search concluded");
            shared.emit(SearchEvent::AllSearchesConcluded);
            return;
        }

        let batch_size = shared.effective_batch_size(batch_size);
        for (retriever, cancel) in scheduled {
            let service_name = retriever.service_name();
            let task = InitialSearch {
                retriever,
                artist: artist.to_string(),
                album: album.to_string(),
                front_only,
                batch_size,
                cancel,
                session_id,
            };
            let task_shared = Arc::clone(shared);
            let submitted = shared
                .service_pool
                .submit(move || task_shared.run_initial_search(task));
            if !submitted {
                shared.emit(SearchEvent::ServiceBatchCancelled {
                    service_name: service_name.to_string(),
                });
                shared.finish_initial_search(session_id, service_name);
            }
        }
    }

    /// Queues one more batch for a service of the current search.
    pub fn request_more(
        &self,
        service_name: &str,
        services: &[ServiceToggle],
        batch_size: Option<usize>,
    ) {
        let shared = &self.shared;
        let acknowledge_cancelled = |reason: &str| {
            info!("[{}] 'request_more' ignored: {}", service_name, reason);
            shared.emit(SearchEvent::ServiceBatchCancelled {
                service_name: service_name.to_string(),
            });
        };
        if shared.shutdown.load(Ordering::SeqCst) {
            acknowledge_cancelled("shutting down");
            return;
        }
        if !is_enabled(services, service_name) {
            acknowledge_cancelled("service is disabled");
            return;
        }
        let (Some(retriever), Some(state_lock)) =
            (shared.retriever(service_name), shared.state(service_name))
        else {
            acknowledge_cancelled("service is unknown");
            return;
        };
        let cancel = lock(state_lock).cancel.clone();
        if cancel.is_cancelled() {
            acknowledge_cancelled("search was cancelled");
            return;
        }

        info!("[{}] More images requested", service_name);
        let front_only = lock(&shared.context).front_only;
        let batch_size = shared.effective_batch_size(batch_size);
        let task_shared = Arc::clone(shared);
        let submitted = shared.service_pool.submit(move || {
            task_shared.run_batch(&retriever, batch_size, front_only, &cancel);
        });
        if !submitted {
            acknowledge_cancelled("service pool closed");
        }
    }

    /// Signals cancellation to every service of the most recent search.
    /// Does not wait for running tasks.
    pub fn cancel_search(&self) {
        let shared = &self.shared;
        info!("[ServiceManager] Cancellation of current search requested");
        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let services = lock(&shared.context).services.clone();
        let mut signalled = 0;
        for toggle in services.iter().filter(|toggle| toggle.enabled) {
            if let Some(state_lock) = shared.state(&toggle.name) {
                let state = lock(state_lock);
                if !state.cancel.is_cancelled() {
                    state.cancel.cancel();
                    signalled += 1;
                }
            }
        }
        debug!("[ServiceManager] Signalled {} services to cancel", signalled);

        let counter = lock(&shared.counter);
        if counter.in_flight == 0 {
            info!("[ServiceManager] No initial searches in flight; search concluded");
            shared.emit(SearchEvent::AllSearchesConcluded);
        }
    }

    /// Cancels everything, then drains and stops both pools. Idempotent.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        if shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("[ServiceManager] Shutting down");
        for state_lock in shared.states.values() {
            lock(state_lock).cancel.cancel();
        }
        shared.service_pool.shutdown();
        shared.resolution_pool.shutdown();
        info!("[ServiceManager] Shutdown complete");
    }
}

impl Drop for ServiceManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
