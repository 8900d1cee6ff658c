use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub const DEFAULT_DIMENSION: u32 = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GenerateOptions {
    #[serde(default)]
    pub size: String,
    pub aspect_ratio: Option<String>,
    pub style: Option<String>,
    pub negative_prompt: Option<String>,
    pub seed: Option<i64>,
}

impl GenerateOptions {
    pub fn aspect_ratio(&self) -> Option<&str> {
        non_empty(self.aspect_ratio.as_deref())
    }

    pub fn style(&self) -> Option<&str> {
        non_empty(self.style.as_deref())
    }

    pub fn negative_prompt(&self) -> Option<&str> {
        non_empty(self.negative_prompt.as_deref())
    }
}

/// A single caller-side generation request. Backends never mutate it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub model: Option<String>,
    #[serde(default, flatten)]
    pub options: GenerateOptions,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: None,
            options: GenerateOptions::default(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_size(mut self, size: impl Into<String>) -> Self {
        self.options.size = size.into();
        self
    }

    pub fn with_aspect_ratio(mut self, aspect_ratio: impl Into<String>) -> Self {
        self.options.aspect_ratio = Some(aspect_ratio.into());
        self
    }

    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.options.style = Some(style.into());
        self
    }

    pub fn with_negative_prompt(mut self, negative_prompt: impl Into<String>) -> Self {
        self.options.negative_prompt = Some(negative_prompt.into());
        self
    }

    pub fn with_seed(mut self, seed: i64) -> Self {
        self.options.seed = Some(seed);
        self
    }

    pub fn model(&self) -> Option<&str> {
        non_empty(self.model.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpg,
    Webp,
    Gif,
}

impl ImageFormat {
    /// Maps a declared content type to a format tag. Anything unrecognised is PNG.
    pub fn from_mime(mime: Option<&str>) -> Self {
        let Some(mime) = mime else {
            return Self::Png;
        };
        let lowered = mime.trim().to_ascii_lowercase();
        if lowered.contains("jpeg") || lowered.contains("jpg") {
            return Self::Jpg;
        }
        if lowered.contains("webp") {
            return Self::Webp;
        }
        if lowered.contains("gif") {
            return Self::Gif;
        }
        Self::Png
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpg => "jpg",
            Self::Webp => "webp",
            Self::Gif => "gif",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpg => "image/jpeg",
            Self::Webp => "image/webp",
            Self::Gif => "image/gif",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub data: Vec<u8>,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub metadata: BTreeMap<String, String>,
}

impl GeneratedImage {
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

impl fmt::Debug for GeneratedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratedImage")
            .field("bytes", &self.data.len())
            .field("format", &self.format)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Strict `WIDTHxHEIGHT` parse. Both sides must be positive integers.
pub fn parse_size(size: &str) -> Option<(u32, u32)> {
    let raw = size.trim().to_ascii_lowercase();
    let (w, h) = raw.split_once('x')?;
    let width = w.trim().parse::<u32>().ok().filter(|value| *value > 0)?;
    let height = h.trim().parse::<u32>().ok().filter(|value| *value > 0)?;
    Some((width, height))
}

/// Lenient parse: each side that is missing, unparseable or non-positive falls
/// back to 1024 on its own.
pub fn parse_size_or_default(size: &str) -> (u32, u32) {
    let raw = size.trim().to_ascii_lowercase();
    let Some((w, h)) = raw.split_once('x') else {
        return (DEFAULT_DIMENSION, DEFAULT_DIMENSION);
    };
    (dimension_or_default(w), dimension_or_default(h))
}

fn dimension_or_default(raw: &str) -> u32 {
    raw.trim()
        .parse::<u32>()
        .ok()
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_DIMENSION)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lenient_size_parse_falls_back_per_dimension() {
        assert_eq!(parse_size_or_default("800x600"), (800, 600));
        assert_eq!(parse_size_or_default("garbage"), (1024, 1024));
        assert_eq!(parse_size_or_default(""), (1024, 1024));
        assert_eq!(parse_size_or_default("800xabc"), (800, 1024));
        assert_eq!(parse_size_or_default("0x-5"), (1024, 1024));
        assert_eq!(parse_size_or_default(" 640 X 480 "), (640, 480));
    }

    #[test]
    fn strict_size_parse_rejects_partial_values() {
        assert_eq!(parse_size("1024x768"), Some((1024, 768)));
        assert_eq!(parse_size("1024x"), None);
        assert_eq!(parse_size("0x512"), None);
        assert_eq!(parse_size("square"), None);
    }

    #[test]
    fn image_format_defaults_to_png() {
        assert_eq!(ImageFormat::from_mime(Some("image/jpeg")), ImageFormat::Jpg);
        assert_eq!(ImageFormat::from_mime(Some("IMAGE/WEBP")), ImageFormat::Webp);
        assert_eq!(ImageFormat::from_mime(Some("image/gif")), ImageFormat::Gif);
        assert_eq!(ImageFormat::from_mime(Some("application/octet-stream")), ImageFormat::Png);
        assert_eq!(ImageFormat::from_mime(None), ImageFormat::Png);
    }

    #[test]
    fn request_deserializes_flattened_options() -> anyhow::Result<()> {
        let request: GenerationRequest = serde_json::from_str(
            r#"{"prompt":"a red fox","model":"nova-canvas","size":"1024x1024","seed":42}"#,
        )?;
        assert_eq!(request.model(), Some("nova-canvas"));
        assert_eq!(request.options.size, "1024x1024");
        assert_eq!(request.options.seed, Some(42));
        assert_eq!(request.options.style(), None);
        Ok(())
    }

    #[test]
    fn blank_option_strings_read_as_absent() {
        let request = GenerationRequest::new("boat")
            .with_style("  ")
            .with_negative_prompt("");
        assert_eq!(request.options.style(), None);
        assert_eq!(request.options.negative_prompt(), None);
    }
}
