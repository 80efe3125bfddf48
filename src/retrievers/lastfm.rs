//! Last.fm album search scraper.
//!
//! Search results are scraped from `last.fm/search/albums`. By default each
//! candidate carries the Fastly-hosted thumbnail from the results page and
//! listing derives the original-size URL from it without another request.
//! With `expand_galleries` enabled the album's `+images` gallery is scraped
//! instead.

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, info, warn};
use regex::Regex;
use scraper::Html;

use super::error::RetrieverError;
use super::html::{attr, element_text, selector};
use super::http::{GetRequest, HttpClient};
use super::{
    ensure_own_candidate, is_foreign_image, require_search_terms, resolve_by_probe, CancelToken,
    ImageRetriever, RetrieverSettings,
};
use crate::models::{AlbumCandidate, ImageResult, PotentialImage};

pub const SERVICE_NAME: &str = "Last.fm";

const BASE_URL: &str = "https://www.last.fm";
const PLACEHOLDER_IMAGE_HASH: &str = "c6f59c1e5e7240a4c0d427abd71f3dbb";
const FASTLY_PATTERN: &str = r"^(https://lastfm\.freetls\.fastly\.net/i/u/)[^/]+/(.+)$";
const URL_DIMENSIONS_PATTERN: &str = r"/(\d+x\d+|\d+x0|0x\d+)/";
const NO_RESULTS_MARKERS: [&str; 2] = ["No albums found", "No results for"];
const UNKNOWN_ARTIST: &str = "N/A";

pub fn create(
    settings: &RetrieverSettings,
) -> Result<Arc<dyn ImageRetriever>, RetrieverError> {
    Ok(Arc::new(LastFmRetriever::new(settings)?))
}

pub struct LastFmRetriever {
    http: HttpClient,
    expand_galleries: bool,
    fastly_pattern: Regex,
    url_dimensions_pattern: Regex,
}

/// One usable row from the search results page.
#[derive(Debug, Clone, PartialEq)]
struct SearchRow {
    link: String,
    album: String,
    artist: String,
    thumbnail_url: Option<String>,
}

impl SearchRow {
    fn into_candidate(self) -> AlbumCandidate {
        let mut candidate = AlbumCandidate::new(
            self.link,
            Some(self.album.clone()),
            Some(self.artist.clone()),
            SERVICE_NAME,
        )
        .with_extra("original_album_text", self.album)
        .with_extra("original_artist_text", self.artist);
        if let Some(thumbnail_url) = self.thumbnail_url {
            candidate = candidate.with_extra("search_thumb_url", thumbnail_url);
        }
        candidate
    }
}

impl LastFmRetriever {
    pub fn new(settings: &RetrieverSettings) -> Result<Self, RetrieverError> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|err| {
                RetrieverError::other(
                    format!("Invalid Last.fm pattern '{pattern}'"),
                    Some(Box::new(err)),
                )
            })
        };
        Ok(Self {
            http: HttpClient::new(SERVICE_NAME, settings.timeouts),
            expand_galleries: settings.lastfm_expand_galleries,
            fastly_pattern: compile(FASTLY_PATTERN)?,
            url_dimensions_pattern: compile(URL_DIMENSIONS_PATTERN)?,
        })
    }

    /// Splits a Fastly image URL into `(base, "hash.ext")`.
    fn split_fastly_url<'a>(&self, url: &'a str) -> Option<(&'a str, &'a str)> {
        let captures = self.fastly_pattern.captures(url)?;
        Some((captures.get(1)?.as_str(), captures.get(2)?.as_str()))
    }

    fn is_placeholder(file_name: &str) -> bool {
        file_name.split('.').next() == Some(PLACEHOLDER_IMAGE_HASH)
    }

    /// Keeps a search thumbnail unless it is the placeholder image.
    fn usable_search_thumbnail(&self, url: &str, album: &str) -> Option<String> {
        match self.split_fastly_url(url) {
            Some((_, file_name)) if Self::is_placeholder(file_name) => {
                debug!(
                    "[{}] Search result '{}' has placeholder image, ignoring",
                    SERVICE_NAME, album
                );
                None
            }
            Some(_) => Some(url.to_string()),
            None => {
                warn!(
                    "[{}] Search thumbnail {} for '{}' did not match Fastly pattern, keeping as is",
                    SERVICE_NAME, url, album
                );
                Some(url.to_string())
            }
        }
    }

    /// Parses the search results page into relevance-ordered candidates.
    fn parse_search_page(
        &self,
        body: &str,
        artist: &str,
        album: &str,
        page_url: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<AlbumCandidate>, RetrieverError> {
        let document = Html::parse_document(body);
        let message_selector = selector("p.message")?;
        let no_results = document.select(&message_selector).any(|message| {
            let text = element_text(&message);
            NO_RESULTS_MARKERS.iter().any(|marker| text.contains(marker))
        });
        if no_results {
            info!(
                "[{}] Search explicitly indicated no results: {}",
                SERVICE_NAME, page_url
            );
            return Ok(Vec::new());
        }

        let item_selector = selector("div.album-result-inner")?;
        let link_selector = selector("h4.album-result-heading a.link-block-target")?;
        let artist_selector = selector("p.album-result-artist a")?;
        let image_selector = selector("img.album-result-image")?;

        let items: Vec<_> = document.select(&item_selector).collect();
        if items.is_empty() {
            return Err(RetrieverError::data(
                "Last.fm search page has no 'no results' message and no album result items; \
                 page structure may have changed",
                Some(page_url),
            ));
        }

        let mut rows = Vec::new();
        for item in &items {
            if cancel.check(SERVICE_NAME, "in search results loop") {
                return Ok(Vec::new());
            }
            let Some(link_element) = item.select(&link_selector).next() else {
                continue;
            };
            let Some(link) = attr(&link_element, "href").filter(|href| href.starts_with("/music/"))
            else {
                continue;
            };
            let album_text = element_text(&link_element);
            let artist_text = item
                .select(&artist_selector)
                .next()
                .map(|element| element_text(&element))
                .unwrap_or_else(|| UNKNOWN_ARTIST.to_string());
            let thumbnail_url = if self.expand_galleries {
                None
            } else {
                item.select(&image_selector)
                    .next()
                    .and_then(|image| attr(&image, "src"))
                    .and_then(|src| self.usable_search_thumbnail(src, &album_text))
            };
            rows.push(SearchRow {
                link: link.to_string(),
                album: album_text,
                artist: artist_text,
                thumbnail_url,
            });
        }

        if rows.is_empty() {
            return Err(RetrieverError::data(
                format!(
                    "Last.fm search found {} result items but none had usable album data",
                    items.len()
                ),
                Some(page_url),
            ));
        }
        Ok(order_by_relevance(rows, artist, album)
            .into_iter()
            .map(SearchRow::into_candidate)
            .collect())
    }

    fn images_from_search_thumbnail(
        &self,
        candidate: &Arc<AlbumCandidate>,
    ) -> Result<Vec<PotentialImage>, RetrieverError> {
        let Some(search_thumb_url) = candidate.extra_str("search_thumb_url") else {
            info!(
                "[{}] No usable search thumbnail for '{}'",
                SERVICE_NAME,
                candidate.display_name()
            );
            return Ok(Vec::new());
        };
        let Some((base, file_name)) = self.split_fastly_url(search_thumb_url) else {
            let message = format!(
                "Could not parse search thumbnail '{}' for '{}'",
                search_thumb_url,
                candidate.display_name()
            );
            warn!("[{}] {}", SERVICE_NAME, message);
            return Err(RetrieverError::data(message, None));
        };
        if Self::is_placeholder(file_name) {
            warn!(
                "[{}] Search thumbnail for '{}' is a placeholder, skipping",
                SERVICE_NAME,
                candidate.display_name()
            );
            return Ok(Vec::new());
        }

        let full_url = format!("{base}o/{file_name}");
        let image = PotentialImage::new(format!("{base}174s/{file_name}"), full_url, candidate)
            .with_extra("derived_from_search_thumb", true)
            .with_extra("original_search_thumb", search_thumb_url)
            .with_extra(
                "gallery_page_url",
                format!("{BASE_URL}{}/+images", candidate.identifier),
            );
        Ok(vec![image])
    }

    fn parse_gallery_page(
        &self,
        body: &str,
        candidate: &Arc<AlbumCandidate>,
        gallery_url: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<PotentialImage>, RetrieverError> {
        let document = Html::parse_document(body);
        let item_selector = selector("a.image-list-item")?;
        let image_selector = selector("img")?;

        let items: Vec<_> = document.select(&item_selector).collect();
        if items.is_empty() {
            return Err(RetrieverError::data(
                format!(
                    "Last.fm gallery page for '{}' has no image items; page structure may have changed",
                    candidate.display_name()
                ),
                Some(gallery_url),
            ));
        }

        let mut seen = HashSet::new();
        let mut images = Vec::new();
        for item in items {
            if cancel.check(SERVICE_NAME, "in gallery items loop") {
                return Ok(Vec::new());
            }
            let Some(thumbnail_url) = item
                .select(&image_selector)
                .next()
                .and_then(|image| attr(&image, "src"))
            else {
                continue;
            };
            let Some((base, file_name)) = self.split_fastly_url(thumbnail_url) else {
                warn!(
                    "[{}] Gallery thumbnail {} did not match Fastly pattern, skipping",
                    SERVICE_NAME, thumbnail_url
                );
                continue;
            };
            if Self::is_placeholder(file_name) {
                continue;
            }
            let full_url = format!("{base}o/{file_name}");
            if !seen.insert(full_url.clone()) {
                continue;
            }
            images.push(
                PotentialImage::new(thumbnail_url, full_url, candidate)
                    .with_extra("gallery_page_url", gallery_url)
                    .with_extra("derived_from_gallery", true),
            );
        }
        info!(
            "[{}] Found {} gallery images for '{}'",
            SERVICE_NAME,
            images.len(),
            candidate.display_name()
        );
        Ok(images)
    }

    /// Reads `WxH` from a sized image URL. A zero side mirrors the other.
    fn dimensions_from_url(&self, url: &str) -> Option<(u32, u32)> {
        let captures = self.url_dimensions_pattern.captures(url)?;
        let (width, height) = captures.get(1)?.as_str().split_once('x')?;
        match (width.parse::<u32>().ok()?, height.parse::<u32>().ok()?) {
            (0, 0) => None,
            (width, 0) => Some((width, width)),
            (0, height) => Some((height, height)),
            dimensions => Some(dimensions),
        }
    }
}

/// Orders rows: exact album+artist, then exact album, then the rest.
fn order_by_relevance(rows: Vec<SearchRow>, artist: &str, album: &str) -> Vec<SearchRow> {
    let album_query = album.trim().to_lowercase();
    let artist_query = artist.trim().to_lowercase();
    let album_matches = |row: &SearchRow| row.album.to_lowercase() == album_query;
    let artist_matches = |row: &SearchRow| row.artist.to_lowercase() == artist_query;

    let tier = |row: &SearchRow| {
        if album_query.is_empty() || !album_matches(row) {
            return 2;
        }
        if !artist_query.is_empty() && artist_matches(row) {
            return 0;
        }
        if artist_query.is_empty() {
            return 1;
        }
        2
    };

    let mut seen = HashSet::new();
    let mut tiered: Vec<(u8, SearchRow)> = rows
        .into_iter()
        .filter(|row| seen.insert(row.link.clone()))
        .map(|row| (tier(&row), row))
        .collect();
    tiered.sort_by_key(|(tier, _)| *tier);
    tiered.into_iter().map(|(_, row)| row).collect()
}

fn build_search_query(artist: &str, album: &str) -> String {
    format!("{artist} {album}")
        .replace(['.', ':', '-'], " ")
        .trim()
        .to_string()
}

impl ImageRetriever for LastFmRetriever {
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
        let query = build_search_query(artist, album);
        if query.is_empty() {
            return Err(RetrieverError::input(
                "Search terms are empty after Last.fm query cleaning",
            ));
        }
        if cancel.check(SERVICE_NAME, "before search") {
            return Ok(Vec::new());
        }

        let search_url = format!(
            "{BASE_URL}/search/albums?q={}",
            urlencoding::encode(&query)
        );
        info!("[{}] Searching: {}", SERVICE_NAME, search_url);
        let request = GetRequest::new(&search_url, format!("album search for '{query}'"));
        let Some(page) = self.http.get_html(&request, cancel)? else {
            return Ok(Vec::new());
        };

        let candidates = self.parse_search_page(&page.body, artist, album, &search_url, cancel)?;
        if cancel.check(SERVICE_NAME, "after parsing search results") {
            return Ok(Vec::new());
        }
        info!(
            "[{}] Found {} album candidates for '{}'",
            SERVICE_NAME,
            candidates.len(),
            query
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
        if !self.expand_galleries {
            return self.images_from_search_thumbnail(candidate);
        }

        let gallery_url = format!("{BASE_URL}{}/+images", candidate.identifier);
        info!(
            "[{}] Listing gallery images for '{}' from {}",
            SERVICE_NAME,
            candidate.display_name(),
            gallery_url
        );
        let request = GetRequest::new(
            &gallery_url,
            format!("gallery page for '{}'", candidate.display_name()),
        );
        let Some(page) = self.http.get_html(&request, cancel)? else {
            return Ok(Vec::new());
        };
        self.parse_gallery_page(&page.body, candidate, &gallery_url, cancel)
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
        if let Some((width, height)) = self.dimensions_from_url(&potential_image.full_image_url) {
            return Ok(Some(ImageResult::from_potential_image(
                potential_image,
                width,
                height,
                None,
            )));
        }
        resolve_by_probe(&self.http, potential_image, &[], None, cancel)
    }
}
