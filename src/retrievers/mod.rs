//! Retriever abstraction and concrete service implementations.
//!
//! Every backend implements [`ImageRetriever`], which normalizes a service's
//! search, image listing and dimension resolution into one three-stage
//! contract. Retrievers are built once per process from the static
//! [`RETRIEVER_REGISTRY`] and shared across worker threads.

pub mod bandcamp;
pub mod discogs;
pub mod error;
pub mod html;
pub mod http;
pub mod itunes;
pub mod lastfm;
pub mod musicbrainz;
pub mod vgmdb;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::config::Config;
use crate::models::{AlbumCandidate, ImageResult, PotentialImage};

pub use error::RetrieverError;
pub use http::HttpTimeouts;

/// Two-tier cooperative cancellation flag passed into every retriever call.
///
/// The process-wide shutdown flag takes priority over the per-search flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    search: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates an armed token linked to a shared shutdown flag.
    pub fn new(shutdown: Arc<AtomicBool>) -> Self {
        Self {
            search: Arc::new(AtomicBool::new(false)),
            shutdown,
        }
    }

    /// Signals cancellation for this token only.
    pub fn cancel(&self) {
        self.search.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.is_shutdown() || self.search.load(Ordering::SeqCst)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Returns true (and logs where) when the operation should stop.
    pub fn check(&self, service_name: &str, context: &str) -> bool {
        if self.is_shutdown() {
            debug!("[{}] Operation cancelled (shutdown): {}", service_name, context);
            return true;
        }
        if self.search.load(Ordering::SeqCst) {
            debug!("[{}] Operation cancelled: {}", service_name, context);
            return true;
        }
        false
    }
}

/// Three-stage contract implemented once per backend service.
///
/// Implementations must be safe to call concurrently from several pool
/// threads and must keep call-scoped state local to the call.
pub trait ImageRetriever: Send + Sync {
    /// Canonical service name used for registration and events.
    fn service_name(&self) -> &'static str;

    /// Runs a fast query for album matches. Both terms empty is an input error.
    fn search_album_candidates(
        &self,
        artist: &str,
        album: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<AlbumCandidate>, RetrieverError>;

    /// Lists images for a candidate produced by this retriever.
    fn list_potential_images(
        &self,
        candidate: &Arc<AlbumCandidate>,
        cancel: &CancelToken,
    ) -> Result<Vec<PotentialImage>, RetrieverError>;

    /// Measures an image. `Ok(None)` means the dimensions could not be determined.
    fn resolve_image_details(
        &self,
        potential_image: &PotentialImage,
        cancel: &CancelToken,
    ) -> Result<Option<ImageResult>, RetrieverError>;
}

/// Construction-time settings shared by all retriever factories.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrieverSettings {
    pub app_name: String,
    pub app_version: String,
    pub contact_email: String,
    pub discogs_token: Option<String>,
    pub timeouts: HttpTimeouts,
    pub lastfm_expand_galleries: bool,
}

impl Default for RetrieverSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl RetrieverSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            app_name: config.identity.app_name.clone(),
            app_version: config.identity.app_version.clone(),
            contact_email: config.identity.contact_email.clone(),
            discogs_token: config
                .credentials
                .discogs_token
                .clone()
                .filter(|token| !token.trim().is_empty()),
            timeouts: HttpTimeouts::from_config(&config.network),
            lastfm_expand_galleries: config.lastfm.expand_galleries,
        }
    }

    /// `"{app}/{version}"`, as sent to Discogs.
    pub fn app_user_agent(&self) -> String {
        format!("{}/{}", self.app_name, self.app_version)
    }

    /// `"{app}/{version} ( {contact} )"`, as required by MusicBrainz.
    pub fn contact_user_agent(&self) -> String {
        format!(
            "{}/{} ( {} )",
            self.app_name, self.app_version, self.contact_email
        )
    }
}

pub type RetrieverFactory =
    fn(&RetrieverSettings) -> Result<Arc<dyn ImageRetriever>, RetrieverError>;

/// Canonical service name to factory, in default display order.
pub const RETRIEVER_REGISTRY: [(&str, RetrieverFactory); 6] = [
    (itunes::SERVICE_NAME, itunes::create),
    (lastfm::SERVICE_NAME, lastfm::create),
    (musicbrainz::SERVICE_NAME, musicbrainz::create),
    (bandcamp::SERVICE_NAME, bandcamp::create),
    (discogs::SERVICE_NAME, discogs::create),
    (vgmdb::SERVICE_NAME, vgmdb::create),
];

pub fn known_service_names() -> impl Iterator<Item = &'static str> {
    RETRIEVER_REGISTRY.iter().map(|(name, _)| *name)
}

/// Case-insensitive lookup of a registered service name.
pub fn canonical_service_name(name: &str) -> Option<&'static str> {
    let wanted = name.trim();
    known_service_names().find(|known| known.eq_ignore_ascii_case(wanted))
}

/// Builds one retriever per registered service, skipping any that fail.
pub fn build_retrievers(settings: &RetrieverSettings) -> Vec<Arc<dyn ImageRetriever>> {
    let mut retrievers = Vec::new();
    for (service_name, factory) in RETRIEVER_REGISTRY {
        match factory(settings) {
            Ok(retriever) => {
                info!("Initialized retriever for service: {}", service_name);
                retrievers.push(retriever);
            }
            Err(err) => {
                error!(
                    "Failed to initialize retriever for {}: {}",
                    service_name, err
                );
            }
        }
    }
    if retrievers.is_empty() {
        warn!("No retrievers could be initialized");
    }
    retrievers
}

/// Rejects candidates that another service produced.
pub(crate) fn ensure_own_candidate(
    service_name: &str,
    candidate: &AlbumCandidate,
) -> Result<(), RetrieverError> {
    if candidate.source_service == service_name && !candidate.identifier.is_empty() {
        return Ok(());
    }
    let message = format!(
        "Invalid candidate for {} (source: {}, identifier: '{}')",
        service_name, candidate.source_service, candidate.identifier
    );
    error!("[{}] {}", service_name, message);
    Err(RetrieverError::input(message))
}

/// Logs and reports images that belong to another service.
pub(crate) fn is_foreign_image(service_name: &str, potential_image: &PotentialImage) -> bool {
    if potential_image.source_service() == service_name {
        return false;
    }
    error!(
        "[{}] Ignoring image from {} passed to resolve_image_details: {}",
        service_name,
        potential_image.source_service(),
        potential_image.full_image_url
    );
    true
}

/// Resolves an image by streaming its header bytes from the network.
pub(crate) fn resolve_by_probe(
    http: &http::HttpClient,
    potential_image: &PotentialImage,
    extra_headers: &[(String, String)],
    original_type: Option<String>,
    cancel: &CancelToken,
) -> Result<Option<ImageResult>, RetrieverError> {
    let service_name = http.service_name();
    if cancel.check(service_name, "before resolving image details") {
        return Ok(None);
    }
    let dimensions =
        http.probe_image_dimensions(&potential_image.full_image_url, extra_headers, cancel)?;
    if cancel.check(service_name, "after probing image dimensions") {
        return Ok(None);
    }
    match dimensions {
        Some((width, height)) => {
            debug!(
                "[{}] Resolved {}: {}x{}",
                service_name, potential_image.full_image_url, width, height
            );
            Ok(Some(ImageResult::from_potential_image(
                potential_image,
                width,
                height,
                original_type,
            )))
        }
        None => {
            warn!(
                "[{}] Could not get dimensions for image: {}",
                service_name, potential_image.full_image_url
            );
            Ok(None)
        }
    }
}

/// Rewrites a plain-http URL to https.
pub(crate) fn force_https(url: &str) -> String {
    match url.strip_prefix("http://") {
        Some(rest) => format!("https://{rest}"),
        None => url.to_string(),
    }
}

/// Requires at least one non-empty search term.
pub(crate) fn require_search_terms(
    service_name: &str,
    artist: &str,
    album: &str,
) -> Result<(), RetrieverError> {
    if artist.trim().is_empty() && album.trim().is_empty() {
        let message = format!(
            "Both artist and album search terms are empty for {} search.",
            service_name
        );
        warn!("[{}] {}", service_name, message);
        return Err(RetrieverError::input(message));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        canonical_service_name, force_https, known_service_names, CancelToken, RetrieverSettings,
        RETRIEVER_REGISTRY,
    };
    use crate::retrievers::RetrieverError;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_cancel_token_shutdown_takes_priority() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let token = CancelToken::new(Arc::clone(&shutdown));
        assert!(!token.is_cancelled());
        shutdown.store(true, Ordering::SeqCst);
        assert!(token.is_cancelled());
        assert!(token.is_shutdown());

        let other = CancelToken::new(Arc::new(AtomicBool::new(false)));
        let clone = other.clone();
        other.cancel();
        assert!(clone.is_cancelled());
        assert!(!clone.is_shutdown());
    }

    #[test]
    fn test_registry_lists_services_in_default_order() {
        let names: Vec<&str> = known_service_names().collect();
        assert_eq!(
            names,
            vec!["iTunes", "Last.fm", "MusicBrainz", "Bandcamp", "Discogs", "VGMdb"]
        );
        assert_eq!(canonical_service_name("Nope"), None);
        assert_eq!(canonical_service_name(" last.FM "), Some("Last.fm"));
        assert_eq!(canonical_service_name("vgmdb"), Some("VGMdb"));
    }

    #[test]
    fn test_every_retriever_rejects_empty_terms() {
        let settings = RetrieverSettings {
            discogs_token: Some("token".to_string()),
            ..RetrieverSettings::default()
        };
        let cancel = CancelToken::default();
        for (name, factory) in RETRIEVER_REGISTRY {
            let retriever = factory(&settings).expect("factory should build");
            assert_eq!(retriever.service_name(), name);
            let result = retriever.search_album_candidates("", "", &cancel);
            assert!(
                matches!(result, Err(RetrieverError::Input { .. })),
                "{name} should reject empty terms, got {result:?}"
            );
        }
    }

    #[test]
    fn test_user_agent_strings() {
        let settings = RetrieverSettings::default();
        assert_eq!(settings.app_user_agent(), "GenericArtBot/0.1");
        assert_eq!(
            settings.contact_user_agent(),
            "GenericArtBot/0.1 ( issues@example.com )"
        );
    }

    #[test]
    fn test_force_https() {
        assert_eq!(force_https("http://a/b.jpg"), "https://a/b.jpg");
        assert_eq!(force_https("https://a/b.jpg"), "https://a/b.jpg");
    }
}
