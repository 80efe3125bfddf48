//! Small helpers over `scraper` for the HTML-scraped services.

use scraper::{ElementRef, Selector};

use super::error::RetrieverError;

/// Parses a CSS selector, mapping failures into the retriever taxonomy.
pub fn selector(css: &str) -> Result<Selector, RetrieverError> {
    Selector::parse(css)
        .map_err(|err| RetrieverError::other(format!("Invalid selector '{css}': {err}"), None))
}

/// Whitespace-normalized text content of an element.
pub fn element_text(element: &ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Trimmed, non-empty attribute value.
pub fn attr<'a>(element: &ElementRef<'a>, name: &str) -> Option<&'a str> {
    element
        .value()
        .attr(name)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Resolves `href` against the page it was found on.
pub fn join_url(base: &str, href: &str) -> String {
    if href.starts_with("https://") || href.starts_with("http://") {
        return href.to_string();
    }
    if let Some(rest) = href.strip_prefix("//") {
        return format!("https://{rest}");
    }
    let (scheme, remainder) = base.split_once("://").unwrap_or(("https", base));
    let host = remainder.split('/').next().unwrap_or(remainder);
    if href.starts_with('/') {
        return format!("{scheme}://{host}{href}");
    }
    let path = remainder
        .split(['?', '#'])
        .next()
        .unwrap_or(remainder);
    let directory = match path.rfind('/') {
        Some(index) => &path[..=index],
        None => "",
    };
    if directory.is_empty() {
        format!("{scheme}://{host}/{href}")
    } else {
        format!("{scheme}://{directory}{href}")
    }
}

/// Drops the query string and fragment from a URL.
pub fn strip_query_and_fragment(url: &str) -> &str {
    url.split(['?', '#']).next().unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::{element_text, join_url, selector, strip_query_and_fragment};
    use scraper::Html;

    #[test]
    fn test_join_url_variants() {
        let base = "https://bandcamp.com/search?q=x";
        assert_eq!(
            join_url(base, "https://a.bandcamp.com/album/x"),
            "https://a.bandcamp.com/album/x"
        );
        assert_eq!(join_url(base, "//cdn.example/img.jpg"), "https://cdn.example/img.jpg");
        assert_eq!(join_url(base, "/album/y"), "https://bandcamp.com/album/y");
        assert_eq!(
            join_url("https://vgmdb.net/db/list.php", "album/3"),
            "https://vgmdb.net/db/album/3"
        );
        assert_eq!(join_url("https://vgmdb.net", "album/3"), "https://vgmdb.net/album/3");
    }

    #[test]
    fn test_strip_query_and_fragment() {
        assert_eq!(
            strip_query_and_fragment("https://a.b/album/x?from=search#top"),
            "https://a.b/album/x"
        );
    }

    #[test]
    fn test_element_text_collapses_whitespace() {
        let document = Html::parse_fragment("<div class=\"x\">  by\n   Some <b>Artist</b> </div>");
        let div = selector("div.x").expect("selector");
        let element = document.select(&div).next().expect("element");
        assert_eq!(element_text(&element), "by Some Artist");
    }

    #[test]
    fn test_invalid_selector_is_error() {
        assert!(selector("div[").is_err());
    }
}
