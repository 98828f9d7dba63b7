//! Query parsing and validation into an immutable [`RenderRequest`]

use crate::ValidationError;
use serde::Deserialize;
use url::Url;

pub const DEFAULT_WIDTH: u32 = 1280;
pub const DEFAULT_HEIGHT: u32 = 720;
pub const DEFAULT_QUALITY: u8 = 85;

pub const MIN_DIMENSION: u32 = 100;
pub const MAX_DIMENSION: u32 = 4096;
pub const MIN_QUALITY: u32 = 1;
pub const MAX_QUALITY: u32 = 100;

/// Raw query parameters as received on the wire.
///
/// Every field is kept as a string so that malformed numbers surface as
/// [`ValidationError`]s with our own messages instead of extractor rejections.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScreenshotQuery {
    pub url: Option<String>,
    pub width: Option<String>,
    pub height: Option<String>,
    pub quality: Option<String>,
    /// Combined `WxH` size, overrides `width`/`height` when well formed
    pub size: Option<String>,
}

impl ScreenshotQuery {
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }
}

/// A validated screenshot request
///
/// Width, height and quality are always within bounds and the URL is an
/// absolute http(s) URL in its normalized serialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderRequest {
    url: Url,
    width: u32,
    height: u32,
    quality: u8,
}

impl RenderRequest {
    pub fn new(url: &str, width: u32, height: u32, quality: u32) -> Result<Self, ValidationError> {
        let url = parse_target_url(url)?;
        let width = check_range("width", width as u64, MIN_DIMENSION, MAX_DIMENSION)?;
        let height = check_range("height", height as u64, MIN_DIMENSION, MAX_DIMENSION)?;
        let quality = check_range("quality", quality as u64, MIN_QUALITY, MAX_QUALITY)?;

        Ok(Self {
            url,
            width,
            height,
            quality: quality as u8,
        })
    }

    pub fn from_query(query: &ScreenshotQuery) -> Result<Self, ValidationError> {
        let raw_url = query
            .url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or(ValidationError::MissingUrl)?;

        let mut width = parse_number("width", query.width.as_deref())?.unwrap_or(DEFAULT_WIDTH as u64);
        let mut height =
            parse_number("height", query.height.as_deref())?.unwrap_or(DEFAULT_HEIGHT as u64);
        let quality =
            parse_number("quality", query.quality.as_deref())?.unwrap_or(DEFAULT_QUALITY as u64);

        // A size that does not match the strict pattern is ignored.
        if let Some((w, h)) = query.size.as_deref().and_then(parse_size) {
            width = w;
            height = h;
        }

        let url = parse_target_url(raw_url)?;
        let width = check_range("width", width, MIN_DIMENSION, MAX_DIMENSION)?;
        let height = check_range("height", height, MIN_DIMENSION, MAX_DIMENSION)?;
        let quality = check_range("quality", quality, MIN_QUALITY, MAX_QUALITY)?;

        Ok(Self {
            url,
            width,
            height,
            quality: quality as u8,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }
}

/// Parses a strict `<digits>x<digits>` size.
pub fn parse_size(size: &str) -> Option<(u64, u64)> {
    let (w, h) = size.split_once('x')?;
    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(w) || !all_digits(h) {
        return None;
    }
    // Digit strings too long for u64 are far out of range anyway.
    Some((w.parse().unwrap_or(u64::MAX), h.parse().unwrap_or(u64::MAX)))
}

fn parse_target_url(raw: &str) -> Result<Url, ValidationError> {
    let url = Url::parse(raw.trim()).map_err(|e| ValidationError::InvalidUrl(format!("{raw}: {e}")))?;
    match url.scheme() {
        "http" | "https" if url.has_host() => Ok(url),
        "http" | "https" => Err(ValidationError::InvalidUrl(raw.to_string())),
        other => Err(ValidationError::UnsupportedScheme(other.to_string())),
    }
}

fn parse_number(param: &'static str, raw: Option<&str>) -> Result<Option<u64>, ValidationError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ValidationError::NotANumber {
            param,
            value: raw.to_string(),
        });
    }
    Ok(Some(trimmed.parse().unwrap_or(u64::MAX)))
}

fn check_range(param: &'static str, value: u64, min: u32, max: u32) -> Result<u32, ValidationError> {
    if value < min as u64 || value > max as u64 {
        return Err(ValidationError::OutOfRange {
            param,
            value,
            min,
            max,
        });
    }
    Ok(value as u32)
}
