//! Domain records flowing through the search → list → resolve pipeline.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

/// Service-specific context attached to candidates and images.
pub type ExtraData = BTreeMap<String, Value>;

/// A possible album match returned by a retriever search.
#[derive(Debug, Clone, PartialEq)]
pub struct AlbumCandidate {
    /// Opaque key unique within `source_service`, used to re-fetch details.
    pub identifier: String,
    pub album_name: Option<String>,
    pub artist_name: Option<String>,
    pub source_service: String,
    pub extra_data: ExtraData,
}

impl AlbumCandidate {
    pub fn new(
        identifier: impl Into<String>,
        album_name: Option<String>,
        artist_name: Option<String>,
        source_service: &str,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            album_name,
            artist_name,
            source_service: source_service.to_string(),
            extra_data: ExtraData::new(),
        }
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra_data.insert(key.to_string(), value.into());
        self
    }

    /// Returns a string value from `extra_data`, ignoring empty strings.
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        extra_str(&self.extra_data, key)
    }

    /// Display label used in log lines.
    pub fn display_name(&self) -> &str {
        self.album_name.as_deref().unwrap_or(&self.identifier)
    }
}

/// An image found for a candidate whose pixel dimensions are not yet known.
#[derive(Debug, Clone, PartialEq)]
pub struct PotentialImage {
    pub identifier: String,
    pub thumbnail_url: String,
    pub full_image_url: String,
    /// Shared back-reference to the candidate this image was listed for.
    pub source_candidate: Arc<AlbumCandidate>,
    pub original_type: Option<String>,
    pub is_front: bool,
    pub extra_data: ExtraData,
}

impl PotentialImage {
    /// Creates a front-classified image keyed by its full-size URL.
    pub fn new(
        thumbnail_url: impl Into<String>,
        full_image_url: impl Into<String>,
        source_candidate: &Arc<AlbumCandidate>,
    ) -> Self {
        let full_image_url = full_image_url.into();
        Self {
            identifier: full_image_url.clone(),
            thumbnail_url: thumbnail_url.into(),
            full_image_url,
            source_candidate: Arc::clone(source_candidate),
            original_type: None,
            is_front: true,
            extra_data: ExtraData::new(),
        }
    }

    pub fn with_type(mut self, original_type: Option<String>, is_front: bool) -> Self {
        self.original_type = original_type;
        self.is_front = is_front;
        self
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra_data.insert(key.to_string(), value.into());
        self
    }

    pub fn source_service(&self) -> &str {
        &self.source_candidate.source_service
    }

    /// Positive width/height supplied by the backend at listing time, if any.
    pub fn known_dimensions(&self) -> Option<(u32, u32)> {
        let width = positive_dimension(self.extra_data.get("width")?)?;
        let height = positive_dimension(self.extra_data.get("height")?)?;
        Some((width, height))
    }
}

fn positive_dimension(value: &Value) -> Option<u32> {
    let number = value.as_u64()?;
    if number == 0 {
        return None;
    }
    u32::try_from(number).ok()
}

/// A fully resolved image with measured pixel dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageResult {
    pub thumbnail_url: String,
    pub full_image_url: String,
    pub full_width: u32,
    pub full_height: u32,
    source_candidate: Arc<AlbumCandidate>,
    pub thumbnail_data: Option<Arc<[u8]>>,
    pub original_type: Option<String>,
    pub source_potential_image_identifier: String,
    pub is_front: bool,
}

impl ImageResult {
    /// Builds a result from a listed image plus measured dimensions.
    ///
    /// `original_type` replaces the image's own classification when given.
    pub fn from_potential_image(
        potential_image: &PotentialImage,
        full_width: u32,
        full_height: u32,
        original_type: Option<String>,
    ) -> Self {
        Self {
            thumbnail_url: potential_image.thumbnail_url.clone(),
            full_image_url: potential_image.full_image_url.clone(),
            full_width,
            full_height,
            source_candidate: Arc::clone(&potential_image.source_candidate),
            thumbnail_data: None,
            original_type: original_type.or_else(|| potential_image.original_type.clone()),
            source_potential_image_identifier: potential_image.identifier.clone(),
            is_front: potential_image.is_front,
        }
    }

    pub fn album_name(&self) -> Option<&str> {
        self.source_candidate.album_name.as_deref()
    }

    pub fn artist_name(&self) -> Option<&str> {
        self.source_candidate.artist_name.as_deref()
    }

    pub fn source_service(&self) -> &str {
        &self.source_candidate.source_service
    }

    pub fn pixel_count(&self) -> u64 {
        u64::from(self.full_width) * u64::from(self.full_height)
    }
}

pub fn extra_str<'a>(extra: &'a ExtraData, key: &str) -> Option<&'a str> {
    extra
        .get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
}
