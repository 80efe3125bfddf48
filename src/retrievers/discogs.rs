//! Discogs database API retriever.
//!
//! Requires a personal access token. Candidate identifiers encode the
//! Discogs entity kind and id as `"release/{id}"` or `"master/{id}"`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde_json::Value;

use super::error::RetrieverError;
use super::http::{GetRequest, HttpClient};
use super::{
    ensure_own_candidate, is_foreign_image, require_search_terms, resolve_by_probe, CancelToken,
    ImageRetriever, RetrieverSettings,
};
use crate::models::{AlbumCandidate, ImageResult, PotentialImage};

pub const SERVICE_NAME: &str = "Discogs";

const API_BASE_URL: &str = "https://api.discogs.com";
const MAX_SEARCH_ITEMS: usize = 20;
const REQUEST_PERIOD: Duration = Duration::from_secs(1);

pub fn create(
    settings: &RetrieverSettings,
) -> Result<Arc<dyn ImageRetriever>, RetrieverError> {
    Ok(Arc::new(DiscogsRetriever::new(settings)))
}

/// Entity kind encoded in a candidate identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscogsKind {
    Release,
    Master,
}

impl DiscogsKind {
    fn as_str(self) -> &'static str {
        match self {
            DiscogsKind::Release => "release",
            DiscogsKind::Master => "master",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "release" => Some(DiscogsKind::Release),
            "master" => Some(DiscogsKind::Master),
            _ => None,
        }
    }
}

pub fn encode_identifier(kind: DiscogsKind, id: u64) -> String {
    format!("{}/{}", kind.as_str(), id)
}

/// Splits `"{kind}/{id}"`; any other shape is an input error.
pub fn decode_identifier(identifier: &str) -> Result<(DiscogsKind, u64), RetrieverError> {
    let invalid = || RetrieverError::input(format!("Invalid Discogs identifier '{identifier}'"));
    let (kind, id) = identifier.split_once('/').ok_or_else(invalid)?;
    let kind = DiscogsKind::parse(kind).ok_or_else(|| {
        RetrieverError::input(format!(
            "Unknown Discogs item type '{kind}' in identifier '{identifier}'"
        ))
    })?;
    let id = id.parse::<u64>().map_err(|_| invalid())?;
    Ok((kind, id))
}

pub struct DiscogsRetriever {
    http: HttpClient,
    token: Option<String>,
    user_agent: String,
}

impl DiscogsRetriever {
    pub fn new(settings: &RetrieverSettings) -> Self {
        if settings.discogs_token.is_none() {
            warn!(
                "[{}] No Discogs token configured; retriever will be non-functional",
                SERVICE_NAME
            );
        }
        Self {
            http: HttpClient::new(SERVICE_NAME, settings.timeouts).with_rate_limit(REQUEST_PERIOD),
            token: settings.discogs_token.clone(),
            user_agent: settings.app_user_agent(),
        }
    }

    fn require_token(&self) -> Result<&str, RetrieverError> {
        self.token.as_deref().ok_or_else(|| {
            let message = "Discogs client requires a personal access token.";
            error!("[{}] {}", SERVICE_NAME, message);
            RetrieverError::other(message, None)
        })
    }

    fn api_request(&self, path: &str, context: String) -> Result<GetRequest, RetrieverError> {
        let token = self.require_token()?;
        Ok(GetRequest::new(format!("{API_BASE_URL}{path}"), context)
            .header("User-Agent", self.user_agent.as_str())
            .header("Authorization", format!("Discogs token={token}"))
            .header("Accept", "application/json")
            .rate_limited())
    }

    fn search(
        &self,
        params: &[(&str, String)],
        context: String,
        cancel: &CancelToken,
    ) -> Result<Option<Value>, RetrieverError> {
        let mut request = self
            .api_request("/database/search", context)?
            .query("type", "release")
            .query("sort", "score")
            .query("per_page", MAX_SEARCH_ITEMS.to_string());
        for (key, value) in params {
            request = request.query(key, value.as_str());
        }
        self.http.get_json(&request, cancel)
    }

    fn fetch_release(&self, id: u64, cancel: &CancelToken) -> Result<Option<Value>, RetrieverError> {
        let request = self.api_request(&format!("/releases/{id}"), format!("release {id}"))?;
        self.http.get_json(&request, cancel)
    }
}

fn result_count(response: &Value) -> usize {
    let from_pagination = response
        .get("pagination")
        .and_then(|pagination| pagination.get("items"))
        .and_then(Value::as_u64);
    match from_pagination {
        Some(count) => usize::try_from(count).unwrap_or(usize::MAX),
        None => response
            .get("results")
            .and_then(Value::as_array)
            .map_or(0, Vec::len),
    }
}

/// Splits `"Artist - Title"` on the first separator.
fn split_title(title: &str) -> (Option<String>, String) {
    match title.split_once(" - ") {
        Some((artist, album)) => (Some(artist.trim().to_string()), album.trim().to_string()),
        None => (None, title.trim().to_string()),
    }
}

/// Turns search results into candidates, exact matches first.
fn candidates_from_search(
    response: &Value,
    artist: &str,
    album: &str,
    cancel: &CancelToken,
) -> Result<Vec<AlbumCandidate>, RetrieverError> {
    let results = match response.get("results") {
        Some(Value::Array(results)) => results,
        None if response.is_object() => return Ok(Vec::new()),
        _ => {
            return Err(RetrieverError::data(
                "Discogs search response has no 'results' array",
                Some(API_BASE_URL),
            ))
        }
    };

    let album_query = album.trim().to_lowercase();
    let artist_query = artist.trim().to_lowercase();
    let mut seen = HashSet::new();
    let mut exact = Vec::new();
    let mut others = Vec::new();
    for item in results.iter().take(MAX_SEARCH_ITEMS) {
        if cancel.check(SERVICE_NAME, "in search results loop") {
            break;
        }
        let Some(id) = item.get("id").and_then(Value::as_u64) else {
            continue;
        };
        let kind = item
            .get("type")
            .and_then(Value::as_str)
            .and_then(DiscogsKind::parse)
            .unwrap_or(DiscogsKind::Release);
        let identifier = encode_identifier(kind, id);
        if !seen.insert(identifier.clone()) {
            continue;
        }
        let Some(title) = item
            .get("title")
            .and_then(Value::as_str)
            .filter(|title| !title.is_empty())
        else {
            warn!("[{}] Result {} has no title, skipping", SERVICE_NAME, identifier);
            continue;
        };

        let (parsed_artist, parsed_album) = split_title(title);
        let album_matches = parsed_album.to_lowercase() == album_query;
        let artist_matches = artist_query.is_empty()
            || parsed_artist.as_deref().map(str::to_lowercase).as_deref()
                == Some(artist_query.as_str());

        let mut candidate =
            AlbumCandidate::new(identifier, Some(parsed_album), parsed_artist, SERVICE_NAME)
                .with_extra("discogs_stub_title", title);
        for key in ["year", "country"] {
            if let Some(value) = item.get(key).filter(|value| !value.is_null()) {
                candidate = candidate.with_extra(key, value.clone());
            }
        }
        if album_matches && artist_matches {
            exact.push(candidate);
        } else {
            others.push(candidate);
        }
    }
    info!(
        "[{}] Candidate collection: {} exact, {} other",
        SERVICE_NAME,
        exact.len(),
        others.len()
    );
    exact.extend(others);
    Ok(exact)
}

/// Builds potential images from a release body, primary and largest first.
fn images_from_release(
    release: &Value,
    candidate: &Arc<AlbumCandidate>,
    cancel: &CancelToken,
) -> Result<Vec<PotentialImage>, RetrieverError> {
    let entries = match release.get("images") {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(entries)) => entries,
        Some(_) => {
            return Err(RetrieverError::data(
                format!(
                    "Discogs images for '{}' are not a list",
                    candidate.identifier
                ),
                None,
            ))
        }
    };

    let area = |entry: &Value| {
        let side = |key: &str| entry.get(key).and_then(Value::as_u64).unwrap_or(0);
        side("width").saturating_mul(side("height"))
    };
    let is_primary = |entry: &Value| {
        entry
            .get("type")
            .and_then(Value::as_str)
            .is_some_and(|kind| kind.eq_ignore_ascii_case("primary"))
    };
    let mut sorted: Vec<&Value> = entries.iter().collect();
    sorted.sort_by_key(|entry| std::cmp::Reverse((is_primary(entry), area(entry))));

    let mut images = Vec::new();
    for entry in sorted {
        if cancel.check(SERVICE_NAME, "in image data loop") {
            break;
        }
        let non_empty = |key: &str| {
            entry
                .get(key)
                .and_then(Value::as_str)
                .filter(|value| !value.is_empty())
        };
        let (Some(full_url), Some(thumbnail_url)) = (non_empty("uri"), non_empty("uri150")) else {
            debug!(
                "[{}] Image entry missing 'uri' or 'uri150' for {}",
                SERVICE_NAME, candidate.identifier
            );
            continue;
        };
        let image_type = non_empty("type").map(str::to_string);
        let mut image = PotentialImage::new(thumbnail_url, full_url, candidate)
            .with_type(image_type.clone(), is_primary(entry));
        if let (Some(width), Some(height)) = (
            entry.get("width").and_then(Value::as_u64),
            entry.get("height").and_then(Value::as_u64),
        ) {
            image = image.with_extra("width", width).with_extra("height", height);
        }
        if let Some(image_type) = image_type {
            image = image.with_extra("discogs_image_type", image_type);
        }
        images.push(image);
    }
    Ok(images)
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

impl ImageRetriever for DiscogsRetriever {
    fn service_name(&self) -> &'static str {
        SERVICE_NAME
    }

    fn search_album_candidates(
        &self,
        artist: &str,
        album: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<AlbumCandidate>, RetrieverError> {
        require_search_terms(SERVICE_NAME, artist, album)?;
        self.require_token()?;
        if cancel.check(SERVICE_NAME, "before search") {
            return Ok(Vec::new());
        }
        info!("[{}] Searching: '{}' by '{}'", SERVICE_NAME, album, artist);

        let mut params = vec![("release_title", album.trim().to_string())];
        if !artist.trim().is_empty() {
            params.push(("artist", artist.trim().to_string()));
        }
        let Some(mut response) = self.search(
            &params,
            format!("search for '{album}' by '{artist}'"),
            cancel,
        )?
        else {
            return Ok(Vec::new());
        };

        if result_count(&response) == 0 {
            let fallback_query = if artist.trim().is_empty() {
                album.trim().to_string()
            } else {
                format!("{} - {}", artist.trim(), album.trim())
            };
            info!(
                "[{}] Primary search empty, trying title search '{}'",
                SERVICE_NAME, fallback_query
            );
            let Some(fallback) = self.search(
                &[("title", fallback_query.clone())],
                format!("fallback search for '{fallback_query}'"),
                cancel,
            )?
            else {
                return Ok(Vec::new());
            };
            if result_count(&fallback) == 0 {
                info!(
                    "[{}] No results after primary and fallback searches",
                    SERVICE_NAME
                );
                return Ok(Vec::new());
            }
            response = fallback;
        }

        candidates_from_search(&response, artist, album, cancel)
    }

    fn list_potential_images(
        &self,
        candidate: &Arc<AlbumCandidate>,
        cancel: &CancelToken,
    ) -> Result<Vec<PotentialImage>, RetrieverError> {
        ensure_own_candidate(SERVICE_NAME, candidate)?;
        self.require_token()?;
        let (kind, id) = decode_identifier(&candidate.identifier)?;
        if cancel.check(SERVICE_NAME, "before listing images") {
            return Ok(Vec::new());
        }
        info!(
            "[{}] Listing images for {} ('{}')",
            SERVICE_NAME,
            candidate.identifier,
            candidate.display_name()
        );

        let release_id = match kind {
            DiscogsKind::Release => id,
            DiscogsKind::Master => {
                let request =
                    self.api_request(&format!("/masters/{id}"), format!("master {id}"))?;
                let Some(master) = self.http.get_json(&request, cancel)? else {
                    return Ok(Vec::new());
                };
                match master.get("main_release").and_then(Value::as_u64) {
                    Some(main_release) => main_release,
                    None => {
                        info!("[{}] Master {} has no main release", SERVICE_NAME, id);
                        return Ok(Vec::new());
                    }
                }
            }
        };

        let Some(release) = self.fetch_release(release_id, cancel)? else {
            return Ok(Vec::new());
        };
        let images = images_from_release(&release, candidate, cancel)?;
        info!(
            "[{}] Found {} images for {}",
            SERVICE_NAME,
            images.len(),
            candidate.identifier
        );
        Ok(images)
    }

    fn resolve_image_details(
        &self,
        potential_image: &PotentialImage,
        cancel: &CancelToken,
    ) -> Result<Option<ImageResult>, RetrieverError> {
        if is_foreign_image(SERVICE_NAME, potential_image) {
            return Ok(None);
        }
        if cancel.check(SERVICE_NAME, "before resolving image details") {
            return Ok(None);
        }
        let original_type = potential_image
            .extra_data
            .get("discogs_image_type")
            .and_then(Value::as_str)
            .map(capitalize);

        if let Some((width, height)) = potential_image.known_dimensions() {
            debug!(
                "[{}] Using listed dimensions {}x{} for {}",
                SERVICE_NAME, width, height, potential_image.full_image_url
            );
            return Ok(Some(ImageResult::from_potential_image(
                potential_image,
                width,
                height,
                original_type,
            )));
        }
        resolve_by_probe(&self.http, potential_image, &[], original_type, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        candidates_from_search, capitalize, decode_identifier, encode_identifier,
        images_from_release, split_title, DiscogsKind, DiscogsRetriever, SERVICE_NAME,
    };
    use crate::models::{AlbumCandidate, PotentialImage};
    use crate::retrievers::{CancelToken, ImageRetriever, RetrieverError, RetrieverSettings};
    use serde_json::json;
    use std::sync::Arc;

    fn candidate(identifier: &str) -> Arc<AlbumCandidate> {
        Arc::new(AlbumCandidate::new(
            identifier,
            Some("Nevermind".into()),
            Some("Nirvana".into()),
            SERVICE_NAME,
        ))
    }

    #[test]
    fn test_identifier_round_trip_and_rejection() {
        assert_eq!(encode_identifier(DiscogsKind::Master, 42), "master/42");
        assert_eq!(
            decode_identifier("release/367084").expect("valid"),
            (DiscogsKind::Release, 367084)
        );
        assert!(matches!(
            decode_identifier("artist/1"),
            Err(RetrieverError::Input { .. })
        ));
        assert!(matches!(
            decode_identifier("release/abc"),
            Err(RetrieverError::Input { .. })
        ));
    }

    #[test]
    fn test_split_title() {
        assert_eq!(
            split_title("Nirvana - Nevermind - Deluxe"),
            (Some("Nirvana".to_string()), "Nevermind - Deluxe".to_string())
        );
        assert_eq!(split_title("Nevermind"), (None, "Nevermind".to_string()));
    }

    #[test]
    fn test_candidates_exact_matches_first_and_deduped() {
        let response = json!({
            "pagination": {"items": 4},
            "results": [
                {"id": 1, "type": "release", "title": "Nirvana - Nevermind (Remaster)"},
                {"id": 2, "type": "master", "title": "nirvana - nevermind", "year": "1991"},
                {"id": 2, "type": "master", "title": "Nirvana - Nevermind"},
                {"id": 3, "type": "release", "title": ""}
            ]
        });
        let candidates =
            candidates_from_search(&response, "Nirvana", "Nevermind", &CancelToken::default())
                .expect("parse");
        let ids: Vec<&str> = candidates.iter().map(|c| c.identifier.as_str()).collect();
        assert_eq!(ids, vec!["master/2", "release/1"]);
        assert_eq!(candidates[0].extra_data["year"], json!("1991"));
    }

    #[test]
    fn test_images_sorted_primary_then_area() {
        let release = json!({
            "images": [
                {"type": "secondary", "uri": "s-big", "uri150": "s-big-t", "width": 2000, "height": 2000},
                {"type": "primary", "uri": "p-small", "uri150": "p-small-t", "width": 300, "height": 300},
                {"type": "primary", "uri": "p-big", "uri150": "p-big-t", "width": 600, "height": 600},
                {"type": "secondary", "uri": "missing-thumb"}
            ]
        });
        let images = images_from_release(&release, &candidate("release/1"), &CancelToken::default())
            .expect("images");
        let urls: Vec<&str> = images.iter().map(|i| i.full_image_url.as_str()).collect();
        assert_eq!(urls, vec!["p-big", "p-small", "s-big"]);
        assert!(images[0].is_front && !images[2].is_front);
        assert_eq!(images[0].known_dimensions(), Some((600, 600)));

        assert!(images_from_release(&json!({}), &candidate("release/1"), &CancelToken::default())
            .expect("no images")
            .is_empty());
        assert!(matches!(
            images_from_release(&json!({"images": 3}), &candidate("release/1"), &CancelToken::default()),
            Err(RetrieverError::Data { .. })
        ));
    }

    #[test]
    fn test_resolve_uses_listed_dimensions_without_probe() {
        let retriever = DiscogsRetriever::new(&RetrieverSettings {
            discogs_token: Some("token".to_string()),
            ..RetrieverSettings::default()
        });
        let image = PotentialImage::new(
            "https://discogs.invalid/thumb.jpg",
            "https://discogs.invalid/full.jpg",
            &candidate("release/1"),
        )
        .with_type(Some("primary".to_string()), true)
        .with_extra("width", 600)
        .with_extra("height", 598)
        .with_extra("discogs_image_type", "primary");
        let result = retriever
            .resolve_image_details(&image, &CancelToken::default())
            .expect("resolve")
            .expect("known dimensions");
        assert_eq!((result.full_width, result.full_height), (600, 598));
        assert_eq!(result.original_type.as_deref(), Some("Primary"));
        assert_eq!(result.artist_name(), Some("Nirvana"));
    }

    #[test]
    fn test_missing_token_is_catch_all_error() {
        let retriever = DiscogsRetriever::new(&RetrieverSettings {
            discogs_token: None,
            ..RetrieverSettings::default()
        });
        let cancel = CancelToken::default();
        assert!(matches!(
            retriever.search_album_candidates("Nirvana", "Nevermind", &cancel),
            Err(RetrieverError::Other { .. })
        ));
        assert!(matches!(
            retriever.list_potential_images(&candidate("release/1"), &cancel),
            Err(RetrieverError::Other { .. })
        ));
    }

    #[test]
    fn test_foreign_candidate_rejected_before_token_check() {
        let retriever = DiscogsRetriever::new(&RetrieverSettings {
            discogs_token: None,
            ..RetrieverSettings::default()
        });
        let foreign = Arc::new(AlbumCandidate::new(
            "release/1",
            Some("Nevermind".into()),
            None,
            "iTunes",
        ));
        assert!(matches!(
            retriever.list_potential_images(&foreign, &CancelToken::default()),
            Err(RetrieverError::Input { .. })
        ));
    }

    #[test]
    fn test_capitalize() {
        assert_eq!(capitalize("primary"), "Primary");
        assert_eq!(capitalize("SECONDARY"), "Secondary");
        assert_eq!(capitalize(""), "");
    }
}
