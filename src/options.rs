use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Output format, including the `auto` sentinel the detector resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Auto,
    Webp,
    Avif,
    Jpeg,
    Png,
    Gif,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Format::Auto => "auto",
            Format::Webp => "webp",
            Format::Avif => "avif",
            Format::Jpeg => "jpeg",
            Format::Png => "png",
            Format::Gif => "gif",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Format {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Format::Auto),
            "webp" => Ok(Format::Webp),
            "avif" => Ok(Format::Avif),
            "jpeg" | "jpg" => Ok(Format::Jpeg),
            "png" => Ok(Format::Png),
            "gif" => Ok(Format::Gif),
            other => Err(format!("unknown format `{other}`")),
        }
    }
}

impl Format {
    pub fn content_type(self) -> &'static str {
        match self {
            Format::Auto => "application/octet-stream",
            Format::Webp => "image/webp",
            Format::Avif => "image/avif",
            Format::Jpeg => "image/jpeg",
            Format::Png => "image/png",
            Format::Gif => "image/gif",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Fit {
    ScaleDown,
    Contain,
    Cover,
    Crop,
    Pad,
}

impl FromStr for Fit {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "scale-down" => Ok(Fit::ScaleDown),
            "contain" => Ok(Fit::Contain),
            "cover" => Ok(Fit::Cover),
            "crop" => Ok(Fit::Crop),
            "pad" => Ok(Fit::Pad),
            other => Err(format!("unknown fit `{other}`")),
        }
    }
}

impl fmt::Display for Fit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Fit::ScaleDown => "scale-down",
            Fit::Contain => "contain",
            Fit::Cover => "cover",
            Fit::Crop => "crop",
            Fit::Pad => "pad",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Gravity {
    Named(NamedGravity),
    Point { x: f32, y: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamedGravity {
    Center,
    North,
    South,
    East,
    West,
    Auto,
}

impl FromStr for Gravity {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((x, y)) = s.split_once(',') {
            let x: f32 = x.parse().map_err(|_| "invalid gravity x".to_string())?;
            let y: f32 = y.parse().map_err(|_| "invalid gravity y".to_string())?;
            return Ok(Gravity::Point { x, y });
        }
        let named = match s.to_lowercase().as_str() {
            "center" => NamedGravity::Center,
            "north" => NamedGravity::North,
            "south" => NamedGravity::South,
            "east" => NamedGravity::East,
            "west" => NamedGravity::West,
            "auto" => NamedGravity::Auto,
            other => return Err(format!("unknown gravity `{other}`")),
        };
        Ok(Gravity::Named(named))
    }
}

/// A single overlay/watermark entry in the draw-list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawItem {
    pub url: String,
    #[serde(default)]
    pub opacity: Option<f32>,
    #[serde(default)]
    pub gravity: Option<Gravity>,
}

/// Which side of the user/detector boundary set a given option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamSource {
    User,
    Detector,
    Derivative,
}

/// Smart-mode inputs, resolved once metadata (§4.9) is available.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmartInputs {
    pub smart: bool,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub aspect: Option<String>,
    #[serde(default)]
    pub focal: Option<String>,
    #[serde(default)]
    pub allow_expansion: bool,
}

/// Ordered set of transform knobs (spec.md §3 "TransformOptions").
#[derive(Debug, Clone, Default)]
pub struct TransformOptions {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fit: Option<Fit>,
    pub gravity: Option<Gravity>,
    pub quality: Option<u8>,
    pub format: Option<Format>,
    pub dpr: Option<f32>,
    pub background: Option<String>,
    pub sharpen: Option<f32>,
    pub blur: Option<u16>,
    pub rotate: Option<u16>,
    pub flip: bool,
    pub flop: bool,
    pub trim: bool,
    pub brightness: Option<f32>,
    pub contrast: Option<f32>,
    pub saturation: Option<f32>,
    pub gamma: Option<f32>,
    pub border: Option<String>,
    pub draw: Vec<DrawItem>,
    pub metadata_strip: bool,
    pub derivative_name: Option<String>,
    pub smart: SmartInputs,
    pub cache: Option<bool>,
    pub ttl: Option<u32>,
    /// Unrecognized query parameters, preserved verbatim for the transform
    /// primitive (spec.md §9 "Dynamic option bag").
    pub extras: BTreeMap<String, String>,
    /// Which side set each recognized field, used by the resolver's
    /// merge-user-wins rule.
    pub provenance: BTreeMap<String, ParamSource>,
}

#[derive(Debug, thiserror::Error)]
pub enum OptionsError {
    #[error("quality must be in [1, 100], got {0}")]
    InvalidQuality(u8),
    #[error("blur must be in [1, 250], got {0}")]
    InvalidBlur(u16),
    #[error("rotate must be one of 90, 180, 270, got {0}")]
    InvalidRotate(u16),
    #[error("invalid gravity: {0}")]
    InvalidGravity(String),
    #[error("invalid value for `{0}`: {1}")]
    InvalidValue(String, String),
}

impl TransformOptions {
    /// Bounds validation per spec.md §4.4.
    pub fn validate(&self) -> Result<(), OptionsError> {
        if let Some(q) = self.quality {
            if q == 0 || q > 100 {
                return Err(OptionsError::InvalidQuality(q));
            }
        }
        if let Some(b) = self.blur {
            if b == 0 || b > 250 {
                return Err(OptionsError::InvalidBlur(b));
            }
        }
        if let Some(r) = self.rotate {
            if !matches!(r, 90 | 180 | 270) {
                return Err(OptionsError::InvalidRotate(r));
            }
        }
        Ok(())
    }

    /// True when every "dynamic-looking" field is either unset or
    /// user-set-but-variable-width/height, used by the bypass scorer.
    pub fn has_effects(&self) -> bool {
        self.blur.is_some() || self.sharpen.is_some() || self.rotate.is_some() || self.flip || self.flop || self.trim
    }

    pub fn set(&mut self, key: &str, value: &str, source: ParamSource) -> Result<(), OptionsError> {
        macro_rules! mark {
            () => {
                self.provenance.insert(key.to_string(), source)
            };
        }
        match key {
            "width" | "w" => {
                self.width = Some(value.parse().map_err(|_| invalid(key, value))?);
                mark!();
            }
            "height" | "h" => {
                self.height = Some(value.parse().map_err(|_| invalid(key, value))?);
                mark!();
            }
            "fit" => {
                self.fit = Some(value.parse().map_err(|_| invalid(key, value))?);
                mark!();
            }
            "gravity" => {
                self.gravity = Some(
                    Gravity::from_str(value).map_err(OptionsError::InvalidGravity)?,
                );
                mark!();
            }
            "quality" | "q" => {
                self.quality = Some(value.parse().map_err(|_| invalid(key, value))?);
                mark!();
            }
            "format" | "f" => {
                self.format = Some(value.parse().map_err(|_| invalid(key, value))?);
                mark!();
            }
            "dpr" => {
                self.dpr = Some(value.parse().map_err(|_| invalid(key, value))?);
                mark!();
            }
            "background" => {
                self.background = Some(value.to_string());
                mark!();
            }
            "sharpen" => {
                self.sharpen = Some(value.parse().map_err(|_| invalid(key, value))?);
                mark!();
            }
            "blur" => {
                self.blur = Some(value.parse().map_err(|_| invalid(key, value))?);
                mark!();
            }
            "rotate" => {
                self.rotate = Some(value.parse().map_err(|_| invalid(key, value))?);
                mark!();
            }
            "flip" => {
                self.flip = parse_bool(value);
                mark!();
            }
            "flop" => {
                self.flop = parse_bool(value);
                mark!();
            }
            "trim" => {
                self.trim = parse_bool(value);
                mark!();
            }
            "brightness" => {
                self.brightness = Some(value.parse().map_err(|_| invalid(key, value))?);
                mark!();
            }
            "contrast" => {
                self.contrast = Some(value.parse().map_err(|_| invalid(key, value))?);
                mark!();
            }
            "saturation" => {
                self.saturation = Some(value.parse().map_err(|_| invalid(key, value))?);
                mark!();
            }
            "gamma" => {
                self.gamma = Some(value.parse().map_err(|_| invalid(key, value))?);
                mark!();
            }
            "border" => {
                self.border = Some(value.to_string());
                mark!();
            }
            "metadata" => {
                self.metadata_strip = value == "none" || value == "strip";
                mark!();
            }
            "smart" => {
                self.smart.smart = parse_bool(value);
                mark!();
            }
            "aspect" => {
                self.smart.aspect = Some(value.to_string());
                mark!();
            }
            "focal" => {
                self.smart.focal = Some(value.to_string());
                mark!();
            }
            "platform" => {
                self.smart.platform = Some(value.to_string());
                mark!();
            }
            "content-type" | "content_type" => {
                self.smart.content_type = Some(value.to_string());
                mark!();
            }
            "device" => {
                self.smart.device = Some(value.to_string());
                mark!();
            }
            "allow-expansion" | "allow_expansion" => {
                self.smart.allow_expansion = parse_bool(value);
                mark!();
            }
            "cache" => {
                self.cache = Some(parse_bool(value));
                mark!();
            }
            "ttl" => {
                self.ttl = Some(value.parse().map_err(|_| invalid(key, value))?);
                mark!();
            }
            _ => {
                self.extras.insert(key.to_string(), value.to_string());
            }
        }
        Ok(())
    }
}

fn invalid(key: &str, value: &str) -> OptionsError {
    OptionsError::InvalidValue(key.to_string(), value.to_string())
}

fn parse_bool(v: &str) -> bool {
    matches!(v, "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_quality() {
        let mut o = TransformOptions::default();
        o.quality = Some(0);
        assert!(o.validate().is_err());
        o.quality = Some(101);
        assert!(o.validate().is_err());
        o.quality = Some(80);
        assert!(o.validate().is_ok());
    }

    #[test]
    fn rejects_bad_rotate() {
        let mut o = TransformOptions::default();
        o.rotate = Some(45);
        assert!(o.validate().is_err());
        o.rotate = Some(90);
        assert!(o.validate().is_ok());
    }

    #[test]
    fn unknown_params_land_in_extras() {
        let mut o = TransformOptions::default();
        o.set("weird", "value", ParamSource::User).unwrap();
        assert_eq!(o.extras.get("weird"), Some(&"value".to_string()));
    }

    #[test]
    fn gravity_point_parses() {
        let g: Gravity = "0.3,0.7".parse().unwrap();
        assert_eq!(g, Gravity::Point { x: 0.3, y: 0.7 });
    }

    #[test]
    fn smart_mode_query_params_populate_smart_inputs() {
        let mut o = TransformOptions::default();
        o.set("smart", "true", ParamSource::User).unwrap();
        o.set("aspect", "16:9", ParamSource::User).unwrap();
        o.set("focal", "north", ParamSource::User).unwrap();
        o.set("platform", "ios", ParamSource::User).unwrap();
        o.set("device", "mobile", ParamSource::User).unwrap();
        o.set("allow-expansion", "true", ParamSource::User).unwrap();
        assert!(o.smart.smart);
        assert_eq!(o.smart.aspect.as_deref(), Some("16:9"));
        assert_eq!(o.smart.focal.as_deref(), Some("north"));
        assert_eq!(o.smart.platform.as_deref(), Some("ios"));
        assert_eq!(o.smart.device.as_deref(), Some("mobile"));
        assert!(o.smart.allow_expansion);
    }
}
