//! iTunes Search API retriever.

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, info, warn};
use regex::Regex;
use serde_json::Value;

use super::error::RetrieverError;
use super::http::{GetRequest, HttpClient};
use super::{
    ensure_own_candidate, force_https, is_foreign_image, require_search_terms, resolve_by_probe,
    CancelToken, ImageRetriever, RetrieverSettings,
};
use crate::models::{AlbumCandidate, ImageResult, PotentialImage};

pub const SERVICE_NAME: &str = "iTunes";

const SEARCH_URL: &str = "https://itunes.apple.com/search";
const SEARCH_LIMIT: usize = 25;
const THUMBNAIL_DIMENSIONS: &str = "300x300";
const MAXRES_SUFFIX: &str = "999999999x0w-999.jpg";
const ARTWORK_PATTERN: &str = r"^(.*)/(\d+x\d+)([^/]*)$";

pub fn create(
    settings: &RetrieverSettings,
) -> Result<Arc<dyn ImageRetriever>, RetrieverError> {
    Ok(Arc::new(ITunesRetriever::new(settings)?))
}

pub struct ITunesRetriever {
    http: HttpClient,
    artwork_pattern: Regex,
}

impl ITunesRetriever {
    pub fn new(settings: &RetrieverSettings) -> Result<Self, RetrieverError> {
        let artwork_pattern = Regex::new(ARTWORK_PATTERN).map_err(|err| {
            RetrieverError::other("Invalid iTunes artwork pattern", Some(Box::new(err)))
        })?;
        Ok(Self {
            http: HttpClient::new(SERVICE_NAME, settings.timeouts),
            artwork_pattern,
        })
    }

    /// Rewrites a sized artwork URL into `(thumbnail, full)` URLs.
    fn derive_image_urls(&self, base_artwork_url: &str) -> (String, String) {
        let (thumbnail, full) = match self.artwork_pattern.captures(base_artwork_url) {
            Some(captures) => {
                let prefix = &captures[1];
                let suffix = &captures[3];
                (
                    format!("{prefix}/{THUMBNAIL_DIMENSIONS}{suffix}"),
                    format!("{prefix}/{MAXRES_SUFFIX}"),
                )
            }
            None => (base_artwork_url.to_string(), base_artwork_url.to_string()),
        };
        (force_https(&thumbnail), force_https(&full))
    }
}

/// Extracts album candidates from a search response body.
pub fn parse_search_results(
    response: &Value,
    search_term: &str,
    cancel: &CancelToken,
) -> Result<Vec<AlbumCandidate>, RetrieverError> {
    let Some(body) = response.as_object() else {
        return Err(RetrieverError::data(
            format!("iTunes search response for '{search_term}' was not a JSON object"),
            Some(SEARCH_URL),
        ));
    };
    let Some(results) = body.get("results") else {
        return Err(RetrieverError::data(
            format!("iTunes search response for '{search_term}' missing 'results' key"),
            Some(SEARCH_URL),
        ));
    };

    let mut seen = HashSet::new();
    let mut candidates = Vec::new();
    for item in results.as_array().into_iter().flatten() {
        if cancel.check(SERVICE_NAME, "in search results loop") {
            break;
        }
        if item.get("wrapperType").and_then(Value::as_str) != Some("collection")
            || item.get("collectionType").and_then(Value::as_str) != Some("Album")
        {
            continue;
        }
        let collection_id = match item.get("collectionId") {
            Some(Value::Number(number)) => number.to_string(),
            Some(Value::String(text)) if !text.is_empty() => text.clone(),
            _ => continue,
        };
        let non_empty = |key: &str| {
            item.get(key)
                .and_then(Value::as_str)
                .filter(|value| !value.is_empty())
        };
        let (Some(album), Some(artist)) = (non_empty("collectionName"), non_empty("artistName"))
        else {
            continue;
        };
        let Some(artwork) = non_empty("artworkUrl100").or_else(|| non_empty("artworkUrl60"))
        else {
            continue;
        };
        if !seen.insert(collection_id.clone()) {
            continue;
        }

        let mut candidate = AlbumCandidate::new(
            collection_id,
            Some(album.to_string()),
            Some(artist.to_string()),
            SERVICE_NAME,
        )
        .with_extra("base_artwork_url", artwork);
        if let Some(date) = non_empty("releaseDate") {
            candidate = candidate.with_extra("itunes_release_date", date);
        }
        if let Some(genre) = non_empty("primaryGenreName") {
            candidate = candidate.with_extra("itunes_primary_genre", genre);
        }
        candidates.push(candidate);
    }
    Ok(candidates)
}

impl ImageRetriever for ITunesRetriever {
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
        if cancel.check(SERVICE_NAME, "before search") {
            return Ok(Vec::new());
        }
        let search_term = format!("{} {}", artist.trim(), album.trim())
            .trim()
            .to_string();
        info!("[{}] Searching for albums: '{}'", SERVICE_NAME, search_term);

        let request = GetRequest::new(SEARCH_URL, format!("album search for '{search_term}'"))
            .query("term", search_term.as_str())
            .query("entity", "album")
            .query("media", "music")
            .query("limit", SEARCH_LIMIT.to_string())
            .query("country", "US");
        let Some(response) = self.http.get_json(&request, cancel)? else {
            return Ok(Vec::new());
        };

        let candidates = parse_search_results(&response, &search_term, cancel)?;
        info!(
            "[{}] Found {} album candidates for '{}'",
            SERVICE_NAME,
            candidates.len(),
            search_term
        );
        Ok(candidates)
    }

    fn list_potential_images(
        &self,
        candidate: &Arc<AlbumCandidate>,
        cancel: &CancelToken,
    ) -> Result<Vec<PotentialImage>, RetrieverError> {
        ensure_own_candidate(SERVICE_NAME, candidate)?;
        if cancel.check(SERVICE_NAME, "before listing images") {
            return Ok(Vec::new());
        }
        let Some(base_artwork_url) = candidate.extra_str("base_artwork_url") else {
            let message = format!(
                "Candidate '{}' ('{}') missing 'base_artwork_url'",
                candidate.identifier,
                candidate.display_name()
            );
            warn!("[{}] {}", SERVICE_NAME, message);
            return Err(RetrieverError::data(message, None));
        };

        let (thumbnail_url, full_url) = self.derive_image_urls(base_artwork_url);
        debug!(
            "[{}] Derived image for '{}': thumb={} full={}",
            SERVICE_NAME,
            candidate.display_name(),
            thumbnail_url,
            full_url
        );
        Ok(vec![PotentialImage::new(thumbnail_url, full_url, candidate)])
    }

    fn resolve_image_details(
        &self,
        potential_image: &PotentialImage,
        cancel: &CancelToken,
    ) -> Result<Option<ImageResult>, RetrieverError> {
        if is_foreign_image(SERVICE_NAME, potential_image) {
            return Ok(None);
        }
        resolve_by_probe(&self.http, potential_image, &[], None, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_search_results, ITunesRetriever, SERVICE_NAME};
    use crate::models::AlbumCandidate;
    use crate::retrievers::{CancelToken, ImageRetriever, RetrieverError, RetrieverSettings};
    use serde_json::json;
    use std::sync::Arc;

    fn retriever() -> ITunesRetriever {
        ITunesRetriever::new(&RetrieverSettings::default()).expect("retriever")
    }

    #[test]
    fn test_parse_search_results_filters_and_dedupes() {
        let response = json!({
            "resultCount": 4,
            "results": [
                {
                    "wrapperType": "collection", "collectionType": "Album",
                    "collectionId": 111, "collectionName": "Nevermind",
                    "artistName": "Nirvana",
                    "artworkUrl100": "http://is1.mzstatic.com/image/thumb/a/100x100bb.jpg",
                    "releaseDate": "1991-09-24T07:00:00Z", "primaryGenreName": "Rock"
                },
                {
                    "wrapperType": "collection", "collectionType": "Album",
                    "collectionId": 111, "collectionName": "Nevermind",
                    "artistName": "Nirvana", "artworkUrl100": "http://x/100x100bb.jpg"
                },
                {
                    "wrapperType": "track", "collectionType": "Album",
                    "collectionId": 222, "collectionName": "Track",
                    "artistName": "Nirvana", "artworkUrl100": "http://x/100x100bb.jpg"
                },
                {
                    "wrapperType": "collection", "collectionType": "Album",
                    "collectionId": 333, "collectionName": "No Art", "artistName": "Nirvana"
                }
            ]
        });
        let candidates =
            parse_search_results(&response, "nirvana nevermind", &CancelToken::default())
                .expect("parse");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].identifier, "111");
        assert_eq!(candidates[0].album_name.as_deref(), Some("Nevermind"));
        assert_eq!(candidates[0].extra_str("itunes_primary_genre"), Some("Rock"));
    }

    #[test]
    fn test_parse_search_results_empty_and_invalid() {
        let cancel = CancelToken::default();
        let empty = json!({"resultCount": 0, "results": []});
        assert!(parse_search_results(&empty, "x", &cancel)
            .expect("empty is fine")
            .is_empty());
        assert!(matches!(
            parse_search_results(&json!({"resultCount": 0}), "x", &cancel),
            Err(RetrieverError::Data { .. })
        ));
        assert!(matches!(
            parse_search_results(&json!([1, 2]), "x", &cancel),
            Err(RetrieverError::Data { .. })
        ));
    }

    #[test]
    fn test_derive_image_urls_rewrites_size_and_scheme() {
        let (thumb, full) = retriever()
            .derive_image_urls("http://is1.mzstatic.com/image/thumb/Music/ab/cd/100x100bb.jpg");
        assert_eq!(
            thumb,
            "https://is1.mzstatic.com/image/thumb/Music/ab/cd/300x300bb.jpg"
        );
        assert_eq!(
            full,
            "https://is1.mzstatic.com/image/thumb/Music/ab/cd/999999999x0w-999.jpg"
        );
    }

    #[test]
    fn test_list_potential_images_yields_one_front_cover() {
        let candidate = Arc::new(
            AlbumCandidate::new("1", Some("A".into()), Some("B".into()), SERVICE_NAME)
                .with_extra("base_artwork_url", "https://x/img/60x60bb.jpg"),
        );
        let images = retriever()
            .list_potential_images(&candidate, &CancelToken::default())
            .expect("list");
        assert_eq!(images.len(), 1);
        assert!(images[0].is_front);
        assert_eq!(images[0].identifier, "https://x/img/999999999x0w-999.jpg");

        let missing = Arc::new(AlbumCandidate::new("2", None, None, SERVICE_NAME));
        assert!(matches!(
            retriever().list_potential_images(&missing, &CancelToken::default()),
            Err(RetrieverError::Data { .. })
        ));
    }

    #[test]
    fn test_foreign_candidate_is_input_error() {
        let candidate = Arc::new(AlbumCandidate::new("1", None, None, "Discogs"));
        assert!(matches!(
            retriever().list_potential_images(&candidate, &CancelToken::default()),
            Err(RetrieverError::Input { .. })
        ));
    }
}
