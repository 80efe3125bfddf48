//! MusicBrainz release search plus Cover Art Archive listings.
//!
//! Searching goes through the ws/2 JSON web service with a broadening retry
//! ladder. MusicBrainz asks clients to stay at or under one request per
//! second, enforced with a `governor` limiter on the search calls only.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::Value;

use super::error::RetrieverError;
use super::http::{GetRequest, HttpClient};
use super::{
    ensure_own_candidate, force_https, is_foreign_image, require_search_terms, resolve_by_probe,
    CancelToken, ImageRetriever, RetrieverSettings,
};
use crate::models::{AlbumCandidate, ImageResult, PotentialImage};

pub const SERVICE_NAME: &str = "MusicBrainz";

const SEARCH_URL: &str = "https://musicbrainz.org/ws/2/release";
const COVER_ART_URL: &str = "https://coverartarchive.org/release";
const SEARCH_LIMIT: usize = 25;
const REQUEST_PERIOD: Duration = Duration::from_secs(1);
const PREFERRED_PRIMARY_TYPES: &str = "Album OR EP OR Single";
const LUCENE_SPECIAL_CHARS: &str = "+-&|!(){}[]^\"~*?:\\/";
const UNKNOWN_ARTIST: &str = "Unknown Artist";

pub fn create(
    settings: &RetrieverSettings,
) -> Result<Arc<dyn ImageRetriever>, RetrieverError> {
    Ok(Arc::new(MusicBrainzRetriever::new(settings)))
}

pub struct MusicBrainzRetriever {
    http: HttpClient,
    user_agent: String,
}

/// One rung of the broadening search ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SearchAttempt {
    StrictOfficial,
    OfficialPreferredTypes,
    Anything,
}

impl SearchAttempt {
    const LADDER: [SearchAttempt; 3] = [
        SearchAttempt::StrictOfficial,
        SearchAttempt::OfficialPreferredTypes,
        SearchAttempt::Anything,
    ];

    fn label(self) -> &'static str {
        match self {
            SearchAttempt::StrictOfficial => "strict, official, any type",
            SearchAttempt::OfficialPreferredTypes => "non-strict, official, Album/EP/Single",
            SearchAttempt::Anything => "non-strict, any type, any status",
        }
    }
}

fn escape_lucene(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if LUCENE_SPECIAL_CHARS.contains(ch) {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Builds the Lucene query for one attempt.
fn build_query(artist: &str, album: &str, attempt: SearchAttempt) -> String {
    let strict = attempt == SearchAttempt::StrictOfficial;
    let mut fields: Vec<(&str, String)> = Vec::new();
    if !album.trim().is_empty() {
        fields.push(("release", escape_lucene(album.trim())));
    }
    if !artist.trim().is_empty() {
        fields.push(("artist", escape_lucene(artist.trim())));
    }
    match attempt {
        SearchAttempt::StrictOfficial => fields.push(("status", "official".to_string())),
        SearchAttempt::OfficialPreferredTypes => {
            fields.push(("primarytype", PREFERRED_PRIMARY_TYPES.to_string()));
            fields.push(("status", "official".to_string()));
        }
        SearchAttempt::Anything => {}
    }

    if strict {
        fields
            .iter()
            .map(|(key, value)| format!("{key}:\"{value}\""))
            .collect::<Vec<_>>()
            .join(" AND ")
    } else {
        fields
            .iter()
            .map(|(key, value)| format!("{key}:({value})"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn primary_type_rank(release: &Value) -> u8 {
    let primary_type = release
        .get("release-group")
        .and_then(|group| group.get("primary-type").or_else(|| group.get("type")))
        .and_then(Value::as_str);
    match primary_type {
        Some("Album") => 0,
        Some("EP") => 1,
        Some("Single") => 2,
        _ => 3,
    }
}

fn release_score(release: &Value) -> i64 {
    match release.get("score") {
        Some(Value::Number(number)) => number.as_i64().unwrap_or(0),
        Some(Value::String(text)) => text.parse().unwrap_or(0),
        _ => 0,
    }
}

/// Concatenates `name` + `joinphrase` across an artist-credit array.
fn artist_credit_phrase(credit: Option<&Value>) -> Option<String> {
    let phrase: String = credit?
        .as_array()?
        .iter()
        .map(|entry| {
            let name = entry
                .get("name")
                .and_then(Value::as_str)
                .or_else(|| {
                    entry
                        .get("artist")
                        .and_then(|artist| artist.get("name"))
                        .and_then(Value::as_str)
                })
                .unwrap_or_default();
            let join = entry
                .get("joinphrase")
                .and_then(Value::as_str)
                .unwrap_or_default();
            format!("{name}{join}")
        })
        .collect();
    let trimmed = phrase.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Returns the `releases` array, or a data error when the body is malformed.
fn releases_of(response: &Value) -> Result<Vec<Value>, RetrieverError> {
    match response.get("releases") {
        Some(Value::Array(releases)) => Ok(releases.clone()),
        None if response.is_object() => Ok(Vec::new()),
        _ => Err(RetrieverError::data(
            "MusicBrainz search response has no 'releases' array",
            Some(SEARCH_URL),
        )),
    }
}

/// Sorts releases by score then type preference and turns them into candidates.
fn candidates_from_releases(
    mut releases: Vec<Value>,
    cancel: &CancelToken,
) -> Vec<AlbumCandidate> {
    releases.sort_by_key(|release| {
        (
            std::cmp::Reverse(release_score(release)),
            primary_type_rank(release),
        )
    });

    let mut seen = HashSet::new();
    let mut candidates = Vec::new();
    for release in &releases {
        if cancel.check(SERVICE_NAME, "while building candidates") {
            break;
        }
        let Some(release_id) = release
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
        else {
            continue;
        };
        if !seen.insert(release_id.to_string()) {
            continue;
        }
        let group = release.get("release-group").cloned().unwrap_or(Value::Null);
        let artist_name = artist_credit_phrase(release.get("artist-credit"))
            .or_else(|| artist_credit_phrase(group.get("artist-credit")))
            .unwrap_or_else(|| {
                debug!(
                    "[{}] No artist credit for release {}, using '{}'",
                    SERVICE_NAME, release_id, UNKNOWN_ARTIST
                );
                UNKNOWN_ARTIST.to_string()
            });
        let title = release
            .get("title")
            .and_then(Value::as_str)
            .map(str::to_string);
        let text = |value: Option<&Value>| value.cloned().unwrap_or(Value::Null);

        let candidate = AlbumCandidate::new(release_id, title, Some(artist_name), SERVICE_NAME)
            .with_extra("original_title", text(release.get("title")))
            .with_extra("release_group_id", text(group.get("id")))
            .with_extra("release_group_title", text(group.get("title")))
            .with_extra(
                "release_group_primary_type",
                text(group.get("primary-type").or_else(|| group.get("type"))),
            )
            .with_extra(
                "release_group_secondary_types",
                group
                    .get("secondary-types")
                    .cloned()
                    .unwrap_or_else(|| Value::Array(Vec::new())),
            )
            .with_extra("release_date", text(release.get("date")))
            .with_extra("release_country", text(release.get("country")))
            .with_extra("release_status", text(release.get("status")))
            .with_extra("release_packaging", text(release.get("packaging")))
            .with_extra("disambiguation", text(release.get("disambiguation")))
            .with_extra(
                "media_count",
                release
                    .get("media")
                    .and_then(Value::as_array)
                    .map_or(0, Vec::len),
            )
            .with_extra("track_count", text(release.get("track-count")))
            .with_extra("api_score", release_score(release));
        candidates.push(candidate);
    }
    candidates
}

/// Turns a Cover Art Archive listing into front-first potential images.
fn parse_cover_art_listing(
    response: &Value,
    candidate: &Arc<AlbumCandidate>,
    listing_url: &str,
    cancel: &CancelToken,
) -> Result<Vec<PotentialImage>, RetrieverError> {
    let Some(body) = response.as_object() else {
        return Err(RetrieverError::data(
            format!(
                "Cover Art Archive response for release {} was not a JSON object",
                candidate.identifier
            ),
            Some(listing_url),
        ));
    };
    if !body.contains_key("images") && body.contains_key("message") {
        info!(
            "[{}] Cover Art Archive returned message '{}' for {}",
            SERVICE_NAME,
            body.get("message").and_then(Value::as_str).unwrap_or_default(),
            candidate.identifier
        );
        return Ok(Vec::new());
    }
    let entries = match body.get("images") {
        None => return Ok(Vec::new()),
        Some(Value::Array(entries)) => entries,
        Some(_) => {
            return Err(RetrieverError::data(
                format!(
                    "Cover Art Archive 'images' for release {} is not a list",
                    candidate.identifier
                ),
                Some(listing_url),
            ))
        }
    };

    let mut images = Vec::new();
    for entry in entries {
        if cancel.check(SERVICE_NAME, "in cover art listing loop") {
            return Ok(Vec::new());
        }
        let Some(full_url) = entry
            .get("image")
            .and_then(Value::as_str)
            .filter(|url| !url.is_empty())
            .map(force_https)
        else {
            continue;
        };
        let thumbnail = |size: &str| {
            entry
                .get("thumbnails")
                .and_then(|thumbs| thumbs.get(size))
                .and_then(Value::as_str)
                .filter(|url| !url.is_empty())
                .map(force_https)
        };
        let thumbnail_url = thumbnail("small")
            .or_else(|| thumbnail("large"))
            .unwrap_or_else(|| full_url.clone());
        let types: Vec<String> = entry
            .get("types")
            .and_then(Value::as_array)
            .map(|types| {
                types
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let is_front = types.is_empty() || (types.len() == 1 && types[0] == "Front");
        let original_type = (!types.is_empty()).then(|| types.join(", "));

        images.push(
            PotentialImage::new(thumbnail_url, full_url, candidate)
                .with_type(original_type, is_front)
                .with_extra("caa_types", types),
        );
    }
    images.sort_by_key(|image| !image.is_front);
    Ok(images)
}

/// Sorted unique CAA types, else "Front" for front images, else "Unknown".
fn resolved_type_label(potential_image: &PotentialImage) -> String {
    let types: BTreeSet<&str> = potential_image
        .extra_data
        .get("caa_types")
        .and_then(Value::as_array)
        .map(|types| types.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    if !types.is_empty() {
        return types.into_iter().collect::<Vec<_>>().join(", ");
    }
    if potential_image.is_front {
        "Front".to_string()
    } else {
        "Unknown".to_string()
    }
}

impl MusicBrainzRetriever {
    pub fn new(settings: &RetrieverSettings) -> Self {
        Self {
            http: HttpClient::new(SERVICE_NAME, settings.timeouts).with_rate_limit(REQUEST_PERIOD),
            user_agent: settings.contact_user_agent(),
        }
    }

    fn identity_headers(&self) -> Vec<(String, String)> {
        vec![("User-Agent".to_string(), self.user_agent.clone())]
    }

    fn search_releases(
        &self,
        query: &str,
        cancel: &CancelToken,
    ) -> Result<Option<Vec<Value>>, RetrieverError> {
        let request = GetRequest::new(SEARCH_URL, format!("release search '{query}'"))
            .query("query", query)
            .query("fmt", "json")
            .query("limit", SEARCH_LIMIT.to_string())
            .header("Accept", "application/json")
            .headers(&self.identity_headers())
            .rate_limited();
        match self.http.get_json(&request, cancel)? {
            Some(response) => releases_of(&response).map(Some),
            None => Ok(None),
        }
    }
}

impl ImageRetriever for MusicBrainzRetriever {
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
        info!(
            "[{}] Searching releases: '{}' by '{}'",
            SERVICE_NAME, album, artist
        );

        let mut releases = Vec::new();
        for attempt in SearchAttempt::LADDER {
            if cancel.check(SERVICE_NAME, &format!("before search attempt ({})", attempt.label())) {
                return Ok(Vec::new());
            }
            let query = build_query(artist, album, attempt);
            debug!(
                "[{}] Search attempt ({}): {}",
                SERVICE_NAME,
                attempt.label(),
                query
            );
            let Some(found) = self.search_releases(&query, cancel)? else {
                return Ok(Vec::new());
            };
            if !found.is_empty() {
                releases = found;
                break;
            }
            info!(
                "[{}] No results from {} search, broadening",
                SERVICE_NAME,
                attempt.label()
            );
        }

        if releases.is_empty() {
            info!(
                "[{}] No releases found for '{}' by '{}'",
                SERVICE_NAME, album, artist
            );
            return Ok(Vec::new());
        }
        let candidates = candidates_from_releases(releases, cancel);
        info!(
            "[{}] Returning {} release candidates",
            SERVICE_NAME,
            candidates.len()
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
        let listing_url = format!("{COVER_ART_URL}/{}", candidate.identifier);
        info!(
            "[{}] Listing cover art for release {} ('{}')",
            SERVICE_NAME,
            candidate.identifier,
            candidate.display_name()
        );
        let request = GetRequest::new(
            &listing_url,
            format!("cover art listing for release {}", candidate.identifier),
        )
        .headers(&self.identity_headers());
        let response = match self.http.get_json(&request, cancel) {
            Ok(Some(response)) => response,
            Ok(None) => return Ok(Vec::new()),
            Err(err) if err.status_code() == Some(404) => {
                info!(
                    "[{}] No cover art for release {} (404)",
                    SERVICE_NAME, candidate.identifier
                );
                return Ok(Vec::new());
            }
            Err(err) => {
                warn!(
                    "[{}] Cover art listing failed for {}: {}",
                    SERVICE_NAME, candidate.identifier, err
                );
                return Err(err);
            }
        };

        let images = parse_cover_art_listing(&response, candidate, &listing_url, cancel)?;
        info!(
            "[{}] Found {} cover art images for release {}",
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
        let headers = if potential_image
            .full_image_url
            .contains("coverartarchive.org")
        {
            self.identity_headers()
        } else {
            Vec::new()
        };
        resolve_by_probe(
            &self.http,
            potential_image,
            &headers,
            Some(resolved_type_label(potential_image)),
            cancel,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{
        build_query, candidates_from_releases, parse_cover_art_listing, releases_of,
        resolved_type_label, SearchAttempt, SERVICE_NAME,
    };
    use crate::models::{AlbumCandidate, PotentialImage};
    use crate::retrievers::{CancelToken, RetrieverError};
    use serde_json::json;
    use std::sync::Arc;

    fn candidate() -> Arc<AlbumCandidate> {
        Arc::new(AlbumCandidate::new(
            "mbid-1",
            Some("Nevermind".into()),
            Some("Nirvana".into()),
            SERVICE_NAME,
        ))
    }

    #[test]
    fn test_build_query_per_attempt() {
        assert_eq!(
            build_query("Nirvana", "Nevermind", SearchAttempt::StrictOfficial),
            "release:\"Nevermind\" AND artist:\"Nirvana\" AND status:\"official\""
        );
        assert_eq!(
            build_query("", "Nevermind", SearchAttempt::OfficialPreferredTypes),
            "release:(Nevermind) primarytype:(Album OR EP OR Single) status:(official)"
        );
        assert_eq!(
            build_query("AC/DC", "Back: in Black", SearchAttempt::Anything),
            "release:(Back\\: in Black) artist:(AC\\/DC)"
        );
    }

    #[test]
    fn test_candidates_sorted_by_score_then_type() {
        let releases = vec![
            json!({"id": "single", "title": "S", "score": 90,
                   "release-group": {"primary-type": "Single"}}),
            json!({"id": "album", "title": "A", "score": 90,
                   "release-group": {"id": "rg", "primary-type": "Album"},
                   "artist-credit": [{"name": "Nirvana", "joinphrase": " & "}, {"name": "Friends"}],
                   "media": [{}, {}], "track-count": 13}),
            json!({"id": "best", "title": "B", "score": 100, "release-group": {}}),
            json!({"id": "album", "title": "dup", "score": 10}),
        ];
        let candidates = candidates_from_releases(releases, &CancelToken::default());
        let ids: Vec<&str> = candidates.iter().map(|c| c.identifier.as_str()).collect();
        assert_eq!(ids, vec!["best", "album", "single"]);
        assert_eq!(candidates[1].artist_name.as_deref(), Some("Nirvana & Friends"));
        assert_eq!(candidates[0].artist_name.as_deref(), Some("Unknown Artist"));
        assert_eq!(candidates[1].extra_data["media_count"], json!(2));
        assert_eq!(candidates[1].extra_data["api_score"], json!(90));
    }

    #[test]
    fn test_releases_of_validates_body() {
        assert!(releases_of(&json!({"count": 0})).expect("empty").is_empty());
        assert_eq!(releases_of(&json!({"releases": [{}]})).expect("one").len(), 1);
        assert!(matches!(
            releases_of(&json!("oops")),
            Err(RetrieverError::Data { .. })
        ));
    }

    #[test]
    fn test_cover_art_listing_front_first() {
        let response = json!({
            "images": [
                {"image": "http://coverartarchive.org/release/x/2.jpg",
                 "thumbnails": {"large": "http://coverartarchive.org/release/x/2-500.jpg"},
                 "types": ["Back"]},
                {"image": "http://coverartarchive.org/release/x/1.jpg",
                 "thumbnails": {"small": "http://coverartarchive.org/release/x/1-250.jpg"},
                 "types": ["Front"]},
                {"image": "https://coverartarchive.org/release/x/3.jpg", "types": []},
                {"thumbnails": {}}
            ]
        });
        let images =
            parse_cover_art_listing(&response, &candidate(), "u", &CancelToken::default())
                .expect("listing");
        assert_eq!(images.len(), 3);
        assert!(images[0].is_front && images[1].is_front && !images[2].is_front);
        assert_eq!(
            images[0].thumbnail_url,
            "https://coverartarchive.org/release/x/1-250.jpg"
        );
        assert_eq!(images[1].thumbnail_url, images[1].full_image_url);
        assert_eq!(
            images[2].thumbnail_url,
            "https://coverartarchive.org/release/x/2-500.jpg"
        );
        assert_eq!(images[2].original_type.as_deref(), Some("Back"));
    }

    #[test]
    fn test_cover_art_listing_edge_cases() {
        let cancel = CancelToken::default();
        assert!(
            parse_cover_art_listing(&json!({"message": "none"}), &candidate(), "u", &cancel)
                .expect("message")
                .is_empty()
        );
        assert!(matches!(
            parse_cover_art_listing(&json!({"images": "bad"}), &candidate(), "u", &cancel),
            Err(RetrieverError::Data { .. })
        ));
        assert!(matches!(
            parse_cover_art_listing(&json!([]), &candidate(), "u", &cancel),
            Err(RetrieverError::Data { .. })
        ));
    }

    #[test]
    fn test_resolved_type_label() {
        let source = candidate();
        let typed = PotentialImage::new("t", "f", &source)
            .with_extra("caa_types", json!(["Medium", "Back", "Medium"]));
        assert_eq!(resolved_type_label(&typed), "Back, Medium");
        let front = PotentialImage::new("t", "f", &source).with_extra("caa_types", json!([]));
        assert_eq!(resolved_type_label(&front), "Front");
        let other = front.clone().with_type(None, false);
        assert_eq!(resolved_type_label(&other), "Unknown");
    }
}
