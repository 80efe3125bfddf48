//! Bandcamp album search scraper.

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, info, warn};
use regex::{Regex, RegexBuilder};
use scraper::{ElementRef, Html};

use super::error::RetrieverError;
use super::html::{attr, element_text, join_url, selector, strip_query_and_fragment};
use super::http::{GetRequest, HttpClient};
use super::{
    ensure_own_candidate, is_foreign_image, resolve_by_probe, CancelToken, ImageRetriever,
    RetrieverSettings,
};
use crate::models::{AlbumCandidate, ImageResult, PotentialImage};

pub const SERVICE_NAME: &str = "Bandcamp";

const BASE_URL: &str = "https://bandcamp.com";
const BCBITS_PATTERN: &str =
    r"^(https://[^/]+\.bcbits\.com/img/[a-zA-Z0-9]+)(_[0-9]+)?\.(jpg|png|gif|jpeg)$";
const QUERY_CLEAN_PATTERN: &str = r"[^\w\s-]";
const THUMBNAIL_SIZE_SUFFIX: &str = "_7";
const FULL_SIZE_SUFFIX: &str = "_0";

pub fn create(
    settings: &RetrieverSettings,
) -> Result<Arc<dyn ImageRetriever>, RetrieverError> {
    Ok(Arc::new(BandcampRetriever::new(settings)?))
}

pub struct BandcampRetriever {
    http: HttpClient,
    bcbits_pattern: Regex,
    query_clean_pattern: Regex,
}

impl BandcampRetriever {
    pub fn new(settings: &RetrieverSettings) -> Result<Self, RetrieverError> {
        let bcbits_pattern = RegexBuilder::new(BCBITS_PATTERN)
            .case_insensitive(true)
            .build()
            .map_err(|err| {
                RetrieverError::other("Invalid Bandcamp image pattern", Some(Box::new(err)))
            })?;
        let query_clean_pattern = Regex::new(QUERY_CLEAN_PATTERN).map_err(|err| {
            RetrieverError::other("Invalid Bandcamp query pattern", Some(Box::new(err)))
        })?;
        Ok(Self {
            http: HttpClient::new(SERVICE_NAME, settings.timeouts),
            bcbits_pattern,
            query_clean_pattern,
        })
    }

    fn clean_term(&self, term: &str) -> String {
        self.query_clean_pattern
            .replace_all(term.trim(), " ")
            .trim()
            .to_string()
    }

    /// Album first, then artist, each cleaned of punctuation.
    fn build_search_query(&self, artist: &str, album: &str) -> String {
        [album, artist]
            .iter()
            .map(|term| self.clean_term(term))
            .filter(|term| !term.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Rewrites a bcbits image URL into `(thumbnail, full)` size variants.
    fn derive_image_urls(&self, image_url: &str) -> Option<(String, String)> {
        let Some(captures) = self.bcbits_pattern.captures(image_url) else {
            warn!("[{}] Could not parse bcbits URL: {}", SERVICE_NAME, image_url);
            return None;
        };
        let base = captures.get(1)?.as_str();
        let extension = captures.get(3)?.as_str();
        Some((
            format!("{base}{THUMBNAIL_SIZE_SUFFIX}.{extension}"),
            format!("{base}{FULL_SIZE_SUFFIX}.{extension}"),
        ))
    }

    fn parse_search_page(
        &self,
        body: &str,
        page_url: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<AlbumCandidate>, RetrieverError> {
        let document = Html::parse_document(body);
        if document
            .select(&selector("div#search-no-results")?)
            .next()
            .is_some()
        {
            info!(
                "[{}] Search explicitly indicated no results: {}",
                SERVICE_NAME, page_url
            );
            return Ok(Vec::new());
        }

        let result_selector = selector("li.searchresult[data-search]")?;
        let item_type_selector = selector("div.itemtype")?;
        let heading_selector = selector("div.heading a")?;
        let subhead_selector = selector("div.subhead")?;
        let image_selector = selector("a.artcont img")?;

        let items: Vec<ElementRef<'_>> = document
            .select(&result_selector)
            .filter(|item| {
                item.select(&item_type_selector)
                    .any(|kind| element_text(&kind) == "ALBUM")
            })
            .collect();
        if items.is_empty() {
            return Err(RetrieverError::data(
                "Bandcamp search page has no 'no results' marker and no album result items; \
                 page structure may have changed",
                Some(page_url),
            ));
        }

        let mut seen_links = HashSet::new();
        let mut any_image_found = false;
        let mut candidates = Vec::new();
        for item in &items {
            if cancel.check(SERVICE_NAME, "in search results loop") {
                return Ok(Vec::new());
            }
            let Some(heading) = item.select(&heading_selector).next() else {
                warn!(
                    "[{}] Skipping search result without album link",
                    SERVICE_NAME
                );
                continue;
            };
            let Some(href) = attr(&heading, "href") else {
                continue;
            };
            let link = join_url(BASE_URL, strip_query_and_fragment(href));
            if !seen_links.insert(link.clone()) {
                continue;
            }

            let album_name = element_text(&heading);
            let artist_name = item
                .select(&subhead_selector)
                .next()
                .map(|subhead| strip_by_prefix(&direct_text(&subhead)))
                .unwrap_or_default();

            let mut candidate = AlbumCandidate::new(
                link,
                Some(album_name.clone()),
                Some(artist_name.clone()),
                SERVICE_NAME,
            )
            .with_extra("search_result_artist_text", artist_name)
            .with_extra("search_result_album_text", album_name.as_str());

            match item
                .select(&image_selector)
                .next()
                .and_then(|image| attr(&image, "src"))
            {
                Some(src) => {
                    any_image_found = true;
                    if let Some((thumbnail_url, full_url)) = self.derive_image_urls(src) {
                        candidate = candidate
                            .with_extra("direct_thumbnail_url", thumbnail_url)
                            .with_extra("direct_full_image_url", full_url);
                    }
                }
                None => debug!(
                    "[{}] No image in search result for '{}'",
                    SERVICE_NAME, album_name
                ),
            }
            candidates.push(candidate);
        }

        if candidates.is_empty() {
            return Err(RetrieverError::data(
                format!(
                    "Bandcamp search found {} result items but none had an album link",
                    items.len()
                ),
                Some(page_url),
            ));
        }
        if !any_image_found {
            return Err(RetrieverError::data(
                format!(
                    "Bandcamp search yielded {} candidates but no image sources",
                    candidates.len()
                ),
                Some(page_url),
            ));
        }
        Ok(candidates)
    }
}

/// Text nodes directly under `element`, excluding nested elements.
fn direct_text(element: &ElementRef<'_>) -> String {
    element
        .children()
        .filter_map(|node| node.value().as_text())
        .map(|text| text.trim())
        .collect::<String>()
        .trim()
        .to_string()
}

fn strip_by_prefix(text: &str) -> String {
    match text.get(..3) {
        Some(prefix) if prefix.eq_ignore_ascii_case("by ") => text[3..].trim().to_string(),
        _ => text.to_string(),
    }
}

impl ImageRetriever for BandcampRetriever {
    fn service_name(&self) -> &'static str {
        SERVICE_NAME
    }

    fn search_album_candidates(
        &self,
        artist: &str,
        album: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<AlbumCandidate>, RetrieverError> {
        let query = self.build_search_query(artist, album);
        if query.is_empty() {
            let message = "Both artist and album search terms are empty for Bandcamp search.";
            warn!("[{}] {}", SERVICE_NAME, message);
            return Err(RetrieverError::input(message));
        }
        if cancel.check(SERVICE_NAME, "before search") {
            return Ok(Vec::new());
        }

        let search_url = format!(
            "{BASE_URL}/search?q={}&item_type=a",
            urlencoding::encode(&query)
        );
        info!("[{}] Searching: {}", SERVICE_NAME, search_url);
        let request = GetRequest::new(&search_url, format!("album search for '{query}'"));
        let Some(page) = self.http.get_html(&request, cancel)? else {
            return Ok(Vec::new());
        };

        let candidates = self.parse_search_page(&page.body, &search_url, cancel)?;
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
        let (Some(thumbnail_url), Some(full_url)) = (
            candidate.extra_str("direct_thumbnail_url"),
            candidate.extra_str("direct_full_image_url"),
        ) else {
            let message = format!(
                "Candidate '{}' ({}) has no image URLs from search results",
                candidate.display_name(),
                candidate.identifier
            );
            warn!("[{}] {}", SERVICE_NAME, message);
            return Err(RetrieverError::data(message, None));
        };

        let image = PotentialImage::new(thumbnail_url, full_url, candidate)
            .with_extra("album_page_url", candidate.identifier.as_str());
        Ok(vec![image])
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
    use super::{BandcampRetriever, SERVICE_NAME};
    use crate::models::AlbumCandidate;
    use crate::retrievers::{CancelToken, ImageRetriever, RetrieverError, RetrieverSettings};
    use std::sync::Arc;

    fn retriever() -> BandcampRetriever {
        BandcampRetriever::new(&RetrieverSettings::default()).expect("retriever")
    }

    fn result(kind: &str, href: &str, album: &str, artist: &str, image: Option<&str>) -> String {
        let art = image
            .map(|src| format!("<a class=\"artcont\" href=\"{href}\"><div class=\"art\"><img src=\"{src}\"></div></a>"))
            .unwrap_or_default();
        format!(
            "<li class=\"searchresult data-search\" data-search=\"{{}}\">\
               {art}\
               <div class=\"result-info\">\
                 <div class=\"itemtype\">\n  {kind}\n</div>\
                 <div class=\"heading\"><a href=\"{href}\">\n {album} \n</a></div>\
                 <div class=\"subhead\">\n by {artist}\n </div>\
               </div>\
             </li>"
        )
    }

    fn page(items: &[String]) -> String {
        format!("<html><body><ul class=\"result-items\">{}</ul></body></html>", items.join(""))
    }

    #[test]
    fn test_build_search_query_cleans_terms() {
        let bandcamp = retriever();
        assert_eq!(bandcamp.build_search_query("Artist!", "Album: Part-2"), "Album  Part-2 Artist");
        assert_eq!(bandcamp.build_search_query("", "?!"), "");
    }

    #[test]
    fn test_derive_image_urls() {
        let bandcamp = retriever();
        assert_eq!(
            bandcamp.derive_image_urls("https://f4.bcbits.com/img/a1234567890_10.jpg"),
            Some((
                "https://f4.bcbits.com/img/a1234567890_7.jpg".to_string(),
                "https://f4.bcbits.com/img/a1234567890_0.jpg".to_string()
            ))
        );
        assert_eq!(
            bandcamp.derive_image_urls("https://f4.bcbits.com/img/0012345.PNG"),
            Some((
                "https://f4.bcbits.com/img/0012345_7.PNG".to_string(),
                "https://f4.bcbits.com/img/0012345_0.PNG".to_string()
            ))
        );
        assert_eq!(bandcamp.derive_image_urls("https://example.com/x.jpg"), None);
    }

    #[test]
    fn test_parse_search_page_collects_albums() {
        let body = page(&[
            result(
                "ALBUM",
                "https://artist.bandcamp.com/album/one?from=search&search_item_id=1",
                "One",
                "Artist",
                Some("https://f4.bcbits.com/img/a111_7.jpg"),
            ),
            result(
                "TRACK",
                "https://artist.bandcamp.com/track/t",
                "Track",
                "Artist",
                Some("https://f4.bcbits.com/img/a222_7.jpg"),
            ),
            result(
                "ALBUM",
                "https://artist.bandcamp.com/album/one?from=search&search_item_id=2",
                "One again",
                "Artist",
                Some("https://f4.bcbits.com/img/a111_7.jpg"),
            ),
            result("ALBUM", "/album/two", "Two", "Other", None),
        ]);
        let candidates = retriever()
            .parse_search_page(&body, "u", &CancelToken::default())
            .expect("parse");
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].identifier, "https://artist.bandcamp.com/album/one");
        assert_eq!(candidates[0].album_name.as_deref(), Some("One"));
        assert_eq!(candidates[0].artist_name.as_deref(), Some("Artist"));
        assert_eq!(
            candidates[0].extra_str("direct_full_image_url"),
            Some("https://f4.bcbits.com/img/a111_0.jpg")
        );
        assert_eq!(candidates[1].identifier, "https://bandcamp.com/album/two");
        assert_eq!(candidates[1].extra_str("direct_full_image_url"), None);
    }

    #[test]
    fn test_parse_search_page_no_results_and_errors() {
        let cancel = CancelToken::default();
        let none = "<html><body><div id=\"search-no-results\">none</div></body></html>";
        assert!(retriever()
            .parse_search_page(none, "u", &cancel)
            .expect("no results")
            .is_empty());

        let tracks_only = page(&[result("TRACK", "/t", "T", "A", None)]);
        assert!(matches!(
            retriever().parse_search_page(&tracks_only, "u", &cancel),
            Err(RetrieverError::Data { .. })
        ));

        let no_images = page(&[result("ALBUM", "/album/x", "X", "A", None)]);
        assert!(matches!(
            retriever().parse_search_page(&no_images, "u", &cancel),
            Err(RetrieverError::Data { .. })
        ));
    }

    #[test]
    fn test_list_requires_direct_urls() {
        let with_urls = Arc::new(
            AlbumCandidate::new("https://a.bandcamp.com/album/x", None, None, SERVICE_NAME)
                .with_extra("direct_thumbnail_url", "https://f4.bcbits.com/img/a1_7.jpg")
                .with_extra("direct_full_image_url", "https://f4.bcbits.com/img/a1_0.jpg"),
        );
        let images = retriever()
            .list_potential_images(&with_urls, &CancelToken::default())
            .expect("list");
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].identifier, "https://f4.bcbits.com/img/a1_0.jpg");

        let without = Arc::new(AlbumCandidate::new("https://a/b", None, None, SERVICE_NAME));
        assert!(matches!(
            retriever().list_potential_images(&without, &CancelToken::default()),
            Err(RetrieverError::Data { .. })
        ));
    }
}
