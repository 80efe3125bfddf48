//! VGMdb album database scraper.
//!
//! VGMdb search does not match on artist names, so the artist term is
//! ignored for the query and only carried through to candidates.

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, info, warn};
use regex::{Regex, RegexBuilder};
use scraper::Html;

use super::error::RetrieverError;
use super::html::{attr, element_text, join_url, selector};
use super::http::{GetRequest, HttpClient};
use super::{
    ensure_own_candidate, is_foreign_image, resolve_by_probe, CancelToken, ImageRetriever,
    RetrieverSettings,
};
use crate::models::{AlbumCandidate, ImageResult, PotentialImage};

pub const SERVICE_NAME: &str = "VGMdb";

const BASE_URL: &str = "https://vgmdb.net";
const COVER_ASSET_PREFIX: &str = "https://vgmdb.net/db/assets/covers/";
const MEDIA_URL_PATTERN: &str = r"^(https?://)(medium-)?(media\.vgm\.io/albums/.*)$";
const BACKGROUND_IMAGE_PATTERN: &str = r#"background-image:\s*url\(['"]?([^'"]+)['"]?\)"#;
const ALBUM_PAGE_PATTERN: &str = r"^https://vgmdb\.net/album/(\d+)";
const TITLE_SUFFIX_PATTERN: &str = r"(?i)(\s*\[[^\]]+\])?\s*-\s*VGMdb$";
const QUERY_CLEAN_PATTERN: &str = r"[^\w\s\-.:()]";
const COVER_ART_TYPE: &str = "Cover Art";
const NO_RESULT_PHRASES: [&str; 3] = [
    "your search query was too short",
    "must be at least 3 characters",
    "no results found",
];

pub fn create(
    settings: &RetrieverSettings,
) -> Result<Arc<dyn ImageRetriever>, RetrieverError> {
    Ok(Arc::new(VgmdbRetriever::new(settings)?))
}

fn compile(pattern: &str, what: &str) -> Result<Regex, RetrieverError> {
    Regex::new(pattern).map_err(|err| {
        RetrieverError::other(format!("Invalid VGMdb {what} pattern"), Some(Box::new(err)))
    })
}

pub struct VgmdbRetriever {
    http: HttpClient,
    media_url_pattern: Regex,
    background_image_pattern: Regex,
    album_page_pattern: Regex,
    title_suffix_pattern: Regex,
    query_clean_pattern: Regex,
}

impl VgmdbRetriever {
    pub fn new(settings: &RetrieverSettings) -> Result<Self, RetrieverError> {
        let media_url_pattern = RegexBuilder::new(MEDIA_URL_PATTERN)
            .case_insensitive(true)
            .build()
            .map_err(|err| {
                RetrieverError::other("Invalid VGMdb media pattern", Some(Box::new(err)))
            })?;
        Ok(Self {
            http: HttpClient::new(SERVICE_NAME, settings.timeouts),
            media_url_pattern,
            background_image_pattern: compile(BACKGROUND_IMAGE_PATTERN, "background")?,
            album_page_pattern: compile(ALBUM_PAGE_PATTERN, "album page")?,
            title_suffix_pattern: compile(TITLE_SUFFIX_PATTERN, "title")?,
            query_clean_pattern: compile(QUERY_CLEAN_PATTERN, "query")?,
        })
    }

    fn clean_query(&self, album: &str) -> String {
        self.query_clean_pattern
            .replace_all(album.trim(), " ")
            .trim()
            .to_string()
    }

    /// Maps a `media.vgm.io` URL (either size) to `(thumbnail, full)`.
    fn derive_image_urls(&self, image_url: &str) -> Option<(String, String)> {
        let cleaned = image_url.split('?').next().unwrap_or(image_url);
        match self.media_url_pattern.captures(cleaned) {
            Some(captures) => {
                let scheme = captures.get(1)?.as_str();
                let path = captures.get(3)?.as_str();
                Some((format!("{scheme}medium-{path}"), format!("{scheme}{path}")))
            }
            None if cleaned.starts_with(COVER_ASSET_PREFIX) => {
                Some((cleaned.to_string(), cleaned.to_string()))
            }
            None => {
                warn!(
                    "[{}] Image URL '{}' does not match the media pattern",
                    SERVICE_NAME, cleaned
                );
                None
            }
        }
    }

    fn redirected_album_title(&self, document: &Html) -> Result<Option<String>, RetrieverError> {
        let english_title = document
            .select(&selector("div#innermain h1 span.albumtitle[lang=en]")?)
            .next()
            .map(|title| element_text(&title))
            .filter(|title| !title.is_empty());
        if english_title.is_some() {
            return Ok(english_title);
        }
        Ok(document
            .select(&selector("title")?)
            .next()
            .map(|title| {
                self.title_suffix_pattern
                    .replace(element_text(&title).trim(), "")
                    .trim()
                    .to_string()
            })
            .filter(|title| !title.is_empty()))
    }

    /// Parses a search response, which is either a result table or the
    /// album page VGMdb redirected a unique match to.
    fn parse_search_page(
        &self,
        body: &str,
        final_url: &str,
        artist: &str,
        album: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<AlbumCandidate>, RetrieverError> {
        let document = Html::parse_document(body);
        let artist_name = Some(artist.trim().to_string()).filter(|name| !name.is_empty());

        if let Some(captures) = self.album_page_pattern.captures(final_url) {
            info!(
                "[{}] Search redirected to album page: {}",
                SERVICE_NAME, final_url
            );
            let album_id = captures.get(1).map_or("", |id| id.as_str()).to_string();
            let title = match self.redirected_album_title(&document)? {
                Some(title) => title,
                None => {
                    warn!(
                        "[{}] No album title on {}, using query '{}'",
                        SERVICE_NAME, final_url, album
                    );
                    album.to_string()
                }
            };
            let candidate =
                AlbumCandidate::new(final_url, Some(title), artist_name, SERVICE_NAME)
                    .with_extra("vgmdb_id", album_id)
                    .with_extra("search_redirected", true);
            return Ok(vec![candidate]);
        }

        let zero_results = document
            .select(&selector("h3.label")?)
            .any(|heading| element_text(&heading).starts_with("0 album results for"));
        if zero_results {
            info!("[{}] Search reported 0 album results", SERVICE_NAME);
            return Ok(Vec::new());
        }

        let row_selector = selector("table tbody tr")?;
        let link_selector = selector("td:nth-child(3) > a.albumtitle")?;
        let links: Vec<_> = document
            .select(&row_selector)
            .filter_map(|row| row.select(&link_selector).next())
            .collect();
        if links.is_empty() {
            let lowered = body.to_lowercase();
            if let Some(phrase) = NO_RESULT_PHRASES
                .iter()
                .find(|phrase| lowered.contains(**phrase))
            {
                info!("[{}] Search page says '{}'", SERVICE_NAME, phrase);
                return Ok(Vec::new());
            }
            warn!(
                "[{}] Search page had no redirect, no results header and no album rows: {}",
                SERVICE_NAME, final_url
            );
            return Err(RetrieverError::data(
                "VGMdb search page structure not recognised",
                Some(final_url),
            ));
        }

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for link in links {
            if cancel.check(SERVICE_NAME, "in search results loop") {
                return Ok(Vec::new());
            }
            let (Some(href), Some(title)) = (attr(&link, "href"), attr(&link, "title")) else {
                debug!("[{}] Skipping result row without href/title", SERVICE_NAME);
                continue;
            };
            let page_url = join_url(BASE_URL, href);
            if !seen.insert(page_url.clone()) {
                continue;
            }
            candidates.push(
                AlbumCandidate::new(page_url, Some(title.to_string()), artist_name.clone(), SERVICE_NAME)
                    .with_extra("search_result_album_text", title),
            );
        }
        Ok(candidates)
    }

    /// Collects gallery images from an album page, falling back to the
    /// single `#coverart` background image.
    fn parse_album_page(
        &self,
        body: &str,
        candidate: &Arc<AlbumCandidate>,
        cancel: &CancelToken,
    ) -> Result<Vec<PotentialImage>, RetrieverError> {
        let document = Html::parse_document(body);
        let page_url = candidate.identifier.as_str();
        let mut seen = HashSet::new();
        let mut images = Vec::new();

        let label_selector = selector("h4.label")?;
        for link in document.select(&selector("div#cover_gallery table a.highslide[href]")?) {
            if cancel.check(SERVICE_NAME, "in gallery loop") {
                return Ok(Vec::new());
            }
            let Some(href) = attr(&link, "href") else {
                continue;
            };
            let Some((thumbnail_url, full_url)) = self.derive_image_urls(&join_url(page_url, href))
            else {
                continue;
            };
            if !seen.insert(full_url.clone()) {
                continue;
            }
            let image_type = link
                .select(&label_selector)
                .next()
                .map(|label| element_text(&label))
                .unwrap_or_default();
            let lowered = image_type.to_lowercase();
            let is_front = lowered.starts_with("front") || lowered.starts_with("cover");
            images.push(
                PotentialImage::new(thumbnail_url, full_url, candidate)
                    .with_type(Some(image_type.clone()), is_front)
                    .with_extra("vgmdb_image_type", image_type),
            );
        }

        if images.is_empty() {
            debug!(
                "[{}] No gallery images for '{}', trying #coverart",
                SERVICE_NAME,
                candidate.display_name()
            );
            let style = document
                .select(&selector("div#coverart")?)
                .next()
                .and_then(|cover| attr(&cover, "style"));
            let background = style.and_then(|style| {
                self.background_image_pattern
                    .captures(style)
                    .and_then(|captures| captures.get(1))
                    .map(|url| join_url(page_url, url.as_str()))
            });
            match background.and_then(|url| self.derive_image_urls(&url)) {
                Some((thumbnail_url, full_url)) => images.push(
                    PotentialImage::new(thumbnail_url, full_url, candidate)
                        .with_type(Some(COVER_ART_TYPE.to_string()), true)
                        .with_extra("vgmdb_image_type", COVER_ART_TYPE),
                ),
                None => warn!(
                    "[{}] No images found for '{}' in gallery or #coverart",
                    SERVICE_NAME,
                    candidate.display_name()
                ),
            }
        }

        images.sort_by_key(|image| !image.is_front);
        Ok(images)
    }
}

impl ImageRetriever for VgmdbRetriever {
    fn service_name(&self) -> &'static str {
        SERVICE_NAME
    }

    fn search_album_candidates(
        &self,
        artist: &str,
        album: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<AlbumCandidate>, RetrieverError> {
        if !artist.trim().is_empty() {
            info!(
                "[{}] Artist terms are not searchable; ignoring '{}'",
                SERVICE_NAME, artist
            );
        }
        let query = self.clean_query(album);
        if query.is_empty() {
            let message = "Album search term is effectively empty for VGMdb search.";
            warn!("[{}] {}", SERVICE_NAME, message);
            return Err(RetrieverError::input(message));
        }
        if cancel.check(SERVICE_NAME, "before search") {
            return Ok(Vec::new());
        }

        let search_url = format!(
            "{BASE_URL}/search?q={}&type=",
            urlencoding::encode(&query)
        );
        info!("[{}] Searching: {}", SERVICE_NAME, search_url);
        let request = GetRequest::new(&search_url, format!("album search for '{query}'"));
        let Some(page) = self.http.get_html(&request, cancel)? else {
            return Ok(Vec::new());
        };
        if cancel.check(SERVICE_NAME, "after search request") {
            return Ok(Vec::new());
        }

        let candidates = self.parse_search_page(&page.body, &page.final_url, artist, album, cancel)?;
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
        info!(
            "[{}] Listing images for '{}' from {}",
            SERVICE_NAME,
            candidate.display_name(),
            candidate.identifier
        );
        let request = GetRequest::new(
            candidate.identifier.as_str(),
            format!("album page for '{}'", candidate.display_name()),
        );
        let Some(page) = self.http.get_html(&request, cancel)? else {
            return Ok(Vec::new());
        };
        self.parse_album_page(&page.body, candidate, cancel)
    }

    fn resolve_image_details(
        &self,
        potential_image: &PotentialImage,
        cancel: &CancelToken,
    ) -> Result<Option<ImageResult>, RetrieverError> {
        if is_foreign_image(SERVICE_NAME, potential_image) {
            return Ok(None);
        }
        resolve_by_probe(
            &self.http,
            potential_image,
            &[],
            potential_image.original_type.clone(),
            cancel,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{VgmdbRetriever, SERVICE_NAME};
    use crate::models::AlbumCandidate;
    use crate::retrievers::{CancelToken, ImageRetriever, RetrieverError, RetrieverSettings};
    use std::sync::Arc;

    fn retriever() -> VgmdbRetriever {
        VgmdbRetriever::new(&RetrieverSettings::default()).expect("retriever")
    }

    fn candidate() -> Arc<AlbumCandidate> {
        Arc::new(AlbumCandidate::new(
            "https://vgmdb.net/album/79",
            Some("Chrono Trigger OST".into()),
            None,
            SERVICE_NAME,
        ))
    }

    #[test]
    fn test_derive_image_urls_from_either_size() {
        let retriever = retriever();
        let expected = (
            "https://medium-media.vgm.io/albums/97/79/79-1264618929.jpg".to_string(),
            "https://media.vgm.io/albums/97/79/79-1264618929.jpg".to_string(),
        );
        assert_eq!(
            retriever.derive_image_urls("https://media.vgm.io/albums/97/79/79-1264618929.jpg?x=1"),
            Some(expected.clone())
        );
        assert_eq!(
            retriever.derive_image_urls("https://Medium-Media.vgm.io/albums/97/79/79-1264618929.jpg"),
            Some((
                "https://medium-Media.vgm.io/albums/97/79/79-1264618929.jpg".to_string(),
                "https://Media.vgm.io/albums/97/79/79-1264618929.jpg".to_string(),
            ))
        );
        assert_eq!(retriever.derive_image_urls("https://example.com/a.jpg"), None);
    }

    #[test]
    fn test_search_results_table() {
        let body = r#"<html><body><table><tbody>
            <tr><td>SQEX-1</td><td>icon</td>
                <td><a class="albumtitle album-game" href="/album/79" title="Chrono Trigger OST">Chrono</a></td></tr>
            <tr><td>SQEX-2</td><td>icon</td>
                <td><a class="albumtitle" href="https://vgmdb.net/album/79" title="Duplicate">Dup</a></td></tr>
            <tr><td>x</td><td>y</td><td><span>no link</span></td></tr>
        </tbody></table></body></html>"#;
        let candidates = retriever()
            .parse_search_page(
                body,
                "https://vgmdb.net/search?q=chrono&type=",
                "Mitsuda",
                "chrono",
                &CancelToken::default(),
            )
            .expect("parse");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].identifier, "https://vgmdb.net/album/79");
        assert_eq!(candidates[0].album_name.as_deref(), Some("Chrono Trigger OST"));
        assert_eq!(candidates[0].artist_name.as_deref(), Some("Mitsuda"));
    }

    #[test]
    fn test_search_redirect_to_album_page() {
        let body = r#"<html><head><title>Chrono Trigger OST [PSCN-5021] - VGMdb</title></head>
            <body><div id="innermain"><h1><span class="albumtitle" lang="ja">クロノ</span></h1></div></body></html>"#;
        let candidates = retriever()
            .parse_search_page(
                body,
                "https://vgmdb.net/album/79",
                "",
                "chrono trigger",
                &CancelToken::default(),
            )
            .expect("parse");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].album_name.as_deref(), Some("Chrono Trigger OST"));
        assert_eq!(candidates[0].extra_str("vgmdb_id"), Some("79"));
        assert_eq!(candidates[0].artist_name, None);
    }

    #[test]
    fn test_search_no_results_variants() {
        let retriever = retriever();
        let cancel = CancelToken::default();
        for body in [
            r#"<html><body><h3 class="label">0 album results for "zzz"</h3></body></html>"#,
            "<html><body><p>Your search query was too short.</p></body></html>",
        ] {
            let candidates = retriever
                .parse_search_page(body, "https://vgmdb.net/search?q=zzz&type=", "", "zzz", &cancel)
                .expect("parse");
            assert!(candidates.is_empty());
        }
    }

    #[test]
    fn test_unrecognised_search_page_is_data_error() {
        let result = retriever().parse_search_page(
            "<html><body><div>Nothing recognisable</div></body></html>",
            "https://vgmdb.net/search?q=zzz&type=",
            "",
            "zzz",
            &CancelToken::default(),
        );
        match result {
            Err(RetrieverError::Data { url, .. }) => {
                assert_eq!(url.as_deref(), Some("https://vgmdb.net/search?q=zzz&type="))
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_album_page_gallery_front_first() {
        let body = r#"<html><body><div id="cover_gallery"><table><tr>
            <td><a class="highslide" href="https://media.vgm.io/albums/97/79/back.jpg"><h4 class="label">Back</h4></a></td>
            <td><a class="highslide" href="https://medium-media.vgm.io/albums/97/79/front.jpg"><h4 class="label">Front</h4></a></td>
            <td><a class="highslide" href="https://media.vgm.io/albums/97/79/front.jpg"><h4 class="label">Front dup</h4></a></td>
        </tr></table></div></body></html>"#;
        let images = retriever()
            .parse_album_page(body, &candidate(), &CancelToken::default())
            .expect("images");
        assert_eq!(images.len(), 2);
        assert!(images[0].is_front);
        assert_eq!(images[0].full_image_url, "https://media.vgm.io/albums/97/79/front.jpg");
        assert_eq!(
            images[0].thumbnail_url,
            "https://medium-media.vgm.io/albums/97/79/front.jpg"
        );
        assert_eq!(images[1].original_type.as_deref(), Some("Back"));
    }

    #[test]
    fn test_album_page_coverart_fallback() {
        let body = r#"<html><body><div id="coverart"
            style="background-image: url('https://medium-media.vgm.io/albums/97/79/cover.jpg')"></div></body></html>"#;
        let images = retriever()
            .parse_album_page(body, &candidate(), &CancelToken::default())
            .expect("images");
        assert_eq!(images.len(), 1);
        assert!(images[0].is_front);
        assert_eq!(images[0].original_type.as_deref(), Some("Cover Art"));
        assert_eq!(images[0].full_image_url, "https://media.vgm.io/albums/97/79/cover.jpg");
    }

    #[test]
    fn test_artist_only_search_is_input_error() {
        assert!(matches!(
            retriever().search_album_candidates("Mitsuda", "  ", &CancelToken::default()),
            Err(RetrieverError::Input { .. })
        ));
    }
}
