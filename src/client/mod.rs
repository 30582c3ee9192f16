mod cache;
mod hints;

use crate::config::DetectionThresholds;
use crate::options::{Format, ParamSource, TransformOptions};
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

pub use cache::DetectorCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Mobile,
    Tablet,
    Desktop,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    Fast,
    Medium,
    Slow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceClass {
    HighEnd,
    MidRange,
    LowEnd,
}

/// Capability summary derived from request headers (spec.md §3
/// "ClientInfo").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub viewport_width: Option<u32>,
    pub dpr: f32,
    pub save_data: bool,
    pub accepts_webp: bool,
    pub accepts_avif: bool,
    pub device_type: DeviceType,
    pub network_quality: NetworkQuality,
    pub preferred_formats: Vec<Format>,
    pub device_class: DeviceClass,
    pub memory_constrained: bool,
    pub processor_constrained: bool,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn header_f32(headers: &HeaderMap, name: &str) -> Option<f32> {
    header_str(headers, name).and_then(|v| v.trim_end_matches('w').parse().ok())
}

fn header_u32(headers: &HeaderMap, name: &str) -> Option<u32> {
    header_str(headers, name).and_then(|v| v.trim_end_matches('w').parse().ok())
}

/// Pure classification over already-extracted header values. Kept
/// separate from `detect` so it stays trivially unit-testable and
/// deterministic per spec.md §8 "Detector determinism".
pub fn classify(
    ua: Option<&str>,
    accept: Option<&str>,
    viewport_width: Option<u32>,
    dpr: Option<f32>,
    save_data: bool,
    ect: Option<&str>,
    rtt: Option<u32>,
    downlink: Option<f32>,
    device_memory: Option<f32>,
    hardware_concurrency: Option<u32>,
    thresholds: &DetectionThresholds,
) -> ClientInfo {
    let device_type = hints::device_type_from_ua(ua);
    let (accepts_webp, accepts_avif, preferred_formats) = hints::format_support(accept, ua);

    let network_quality = if save_data {
        NetworkQuality::Slow
    } else if let Some(ect) = ect {
        match ect {
            "4g" => NetworkQuality::Fast,
            "3g" => NetworkQuality::Medium,
            "2g" | "slow-2g" => NetworkQuality::Slow,
            _ => NetworkQuality::Medium,
        }
    } else {
        match (rtt, downlink) {
            (Some(rtt), Some(dl)) if rtt < 100 && dl > 5.0 => NetworkQuality::Fast,
            (Some(rtt), _) if rtt > 500 => NetworkQuality::Slow,
            (_, Some(dl)) if dl < 1.0 => NetworkQuality::Slow,
            _ => NetworkQuality::Medium,
        }
    };

    let score = device_class_score(device_memory, hardware_concurrency);
    let device_class = if score <= thresholds.device_class_low_max as f32 {
        DeviceClass::LowEnd
    } else if score >= thresholds.device_class_high_min as f32 {
        DeviceClass::HighEnd
    } else {
        DeviceClass::MidRange
    };

    ClientInfo {
        viewport_width,
        dpr: dpr.unwrap_or(1.0),
        save_data,
        accepts_webp,
        accepts_avif,
        device_type,
        network_quality,
        preferred_formats,
        device_class,
        memory_constrained: device_memory.map(|m| m < 2.0).unwrap_or(false),
        processor_constrained: hardware_concurrency.map(|c| c <= 2).unwrap_or(false),
    }
}

/// Memory + core count combine into a 0-100 score; thresholds are
/// configurable (spec.md §4.5).
fn device_class_score(device_memory: Option<f32>, hardware_concurrency: Option<u32>) -> f32 {
    let mem_score = device_memory.map(|m| (m / 8.0 * 100.0).clamp(0.0, 100.0)).unwrap_or(50.0);
    let core_score = hardware_concurrency
        .map(|c| (c as f32 / 8.0 * 100.0).clamp(0.0, 100.0))
        .unwrap_or(50.0);
    (mem_score + core_score) / 2.0
}

/// `detect(request) -> ClientInfo`, backed by the process-local LRU
/// described in spec.md §4.5.
pub fn detect(headers: &HeaderMap, thresholds: &DetectionThresholds, cache: &DetectorCache) -> ClientInfo {
    let cache_key = cache::hash_headers(headers);
    if let Some(hit) = cache.get(&cache_key) {
        return hit;
    }

    let ua = header_str(headers, "user-agent");
    let accept = header_str(headers, "accept");
    let viewport_width = header_u32(headers, "sec-ch-viewport-width").or_else(|| header_u32(headers, "viewport-width"));
    let dpr = header_f32(headers, "sec-ch-dpr").or_else(|| header_f32(headers, "dpr"));
    let save_data = header_str(headers, "save-data").map(|v| v.eq_ignore_ascii_case("on")).unwrap_or(false);
    let ect = header_str(headers, "ect");
    let rtt = header_str(headers, "rtt").and_then(|v| v.parse().ok());
    let downlink = header_str(headers, "downlink").and_then(|v| v.parse().ok());
    let device_memory = header_f32(headers, "device-memory");
    let hardware_concurrency = header_str(headers, "hardware-concurrency").and_then(|v| v.parse().ok());

    let info = classify(
        ua,
        accept,
        viewport_width,
        dpr,
        save_data,
        ect,
        rtt,
        downlink,
        device_memory,
        hardware_concurrency,
        thresholds,
    );

    cache.put(cache_key, info.clone());
    info
}

/// `optimize(request, base) -> TransformOptions`: adaptive rules applied
/// only where the user did not already set the value (spec.md §4.5).
pub fn optimize(client: &ClientInfo, base: TransformOptions) -> TransformOptions {
    let mut opts = base;

    if opts.format.is_none() || opts.format == Some(Format::Auto) {
        let chosen = if client.accepts_avif {
            Format::Avif
        } else if client.accepts_webp {
            Format::Webp
        } else {
            Format::Jpeg
        };
        opts.format = Some(chosen);
        opts.provenance.insert("format".into(), ParamSource::Detector);
    }

    if opts.quality.is_none() {
        let mut q = match (client.device_class, client.network_quality) {
            (DeviceClass::HighEnd, NetworkQuality::Fast) => 90,
            (DeviceClass::HighEnd, _) => 85,
            (DeviceClass::MidRange, NetworkQuality::Fast) => 82,
            (DeviceClass::MidRange, _) => 75,
            (DeviceClass::LowEnd, NetworkQuality::Fast) => 75,
            (DeviceClass::LowEnd, _) => 65,
        };
        if client.save_data {
            q = q.min(70);
        }
        opts.quality = Some(q);
        opts.provenance.insert("quality".into(), ParamSource::Detector);
    }

    if opts.width.is_none() {
        if let Some(vw) = client.viewport_width {
            let raw = (vw as f32 * client.dpr).ceil();
            let rounded = (((raw / 100.0).ceil()) * 100.0) as u32;
            let cap = match client.device_class {
                DeviceClass::HighEnd => 2500,
                DeviceClass::MidRange => 1800,
                DeviceClass::LowEnd => 1200,
            };
            opts.width = Some(rounded.min(cap));
            opts.provenance.insert("width".into(), ParamSource::Detector);
        }
    }

    if client.save_data {
        opts.extras.entry("compression".to_string()).or_insert_with(|| "fast".to_string());
        if let Some(q) = opts.quality {
            opts.quality = Some(q.min(70));
        }
    }

    opts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> DetectionThresholds {
        DetectionThresholds::default()
    }

    #[test]
    fn save_data_forces_slow_network() {
        let info = classify(None, None, None, None, true, None, None, None, None, None, &thresholds());
        assert_eq!(info.network_quality, NetworkQuality::Slow);
    }

    #[test]
    fn ect_4g_is_fast() {
        let info = classify(None, None, None, None, false, Some("4g"), None, None, None, None, &thresholds());
        assert_eq!(info.network_quality, NetworkQuality::Fast);
    }

    #[test]
    fn rtt_and_downlink_fallback() {
        let info = classify(None, None, None, None, false, None, Some(50), Some(10.0), None, None, &thresholds());
        assert_eq!(info.network_quality, NetworkQuality::Fast);
        let info = classify(None, None, None, None, false, None, Some(600), Some(10.0), None, None, &thresholds());
        assert_eq!(info.network_quality, NetworkQuality::Slow);
    }

    #[test]
    fn high_memory_and_cores_is_high_end() {
        let info = classify(None, None, None, None, false, None, None, None, Some(8.0), Some(8), &thresholds());
        assert_eq!(info.device_class, DeviceClass::HighEnd);
    }

    #[test]
    fn optimize_picks_avif_then_webp_then_jpeg() {
        let mut client = classify(None, None, None, None, false, None, None, None, None, None, &thresholds());
        client.accepts_avif = true;
        client.accepts_webp = true;
        let opts = optimize(&client, TransformOptions::default());
        assert_eq!(opts.format, Some(Format::Avif));

        client.accepts_avif = false;
        let opts = optimize(&client, TransformOptions::default());
        assert_eq!(opts.format, Some(Format::Webp));

        client.accepts_webp = false;
        let opts = optimize(&client, TransformOptions::default());
        assert_eq!(opts.format, Some(Format::Jpeg));
    }

    #[test]
    fn optimize_never_overrides_user_set_fields() {
        let client = classify(None, None, None, None, false, None, None, None, None, None, &thresholds());
        let mut base = TransformOptions::default();
        base.format = Some(Format::Png);
        base.quality = Some(42);
        let opts = optimize(&client, base);
        assert_eq!(opts.format, Some(Format::Png));
        assert_eq!(opts.quality, Some(42));
    }

    #[test]
    fn save_data_caps_quality_at_70() {
        let mut client = classify(None, None, None, None, true, None, None, None, Some(8.0), Some(8), &thresholds());
        client.save_data = true;
        let opts = optimize(&client, TransformOptions::default());
        assert!(opts.quality.unwrap() <= 70);
    }
}
