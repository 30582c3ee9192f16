use super::DeviceType;
use crate::options::Format;

/// Browser-family version lookup used when `Accept` is absent or
/// unparseable (spec.md §4.5 "else browser-family version lookup
/// table"). Modern releases of every major engine support both formats,
/// so the table only needs to gate out genuinely old UAs.
pub fn format_support(accept: Option<&str>, ua: Option<&str>) -> (bool, bool, Vec<Format>) {
    if let Some(accept) = accept {
        let accepts_webp = accept.contains("image/webp");
        let accepts_avif = accept.contains("image/avif");
        let mut preferred = Vec::new();
        if accepts_avif {
            preferred.push(Format::Avif);
        }
        if accepts_webp {
            preferred.push(Format::Webp);
        }
        preferred.push(Format::Jpeg);
        return (accepts_webp, accepts_avif, preferred);
    }

    let ua = ua.unwrap_or_default();
    let (webp, avif) = browser_table(ua);
    let mut preferred = Vec::new();
    if avif {
        preferred.push(Format::Avif);
    }
    if webp {
        preferred.push(Format::Webp);
    }
    preferred.push(Format::Jpeg);
    (webp, avif, preferred)
}

fn browser_table(ua: &str) -> (bool, bool) {
    if let Some(v) = chrome_version(ua) {
        return (v >= 32, v >= 85);
    }
    if let Some(v) = firefox_version(ua) {
        return (v >= 65, v >= 93);
    }
    if let Some(v) = safari_version(ua) {
        return (v >= 14, v >= 16);
    }
    // Unknown engines: assume no modern format support.
    (false, false)
}

fn version_after<'a>(ua: &'a str, marker: &str) -> Option<u32> {
    let idx = ua.find(marker)?;
    let rest = &ua[idx + marker.len()..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

fn chrome_version(ua: &str) -> Option<u32> {
    if ua.contains("Edg/") || ua.contains("OPR/") {
        // Edge/Opera also carry a Chrome token but have their own
        // release cadence; treat conservatively as Chrome-compatible.
    }
    version_after(ua, "Chrome/")
}

fn firefox_version(ua: &str) -> Option<u32> {
    version_after(ua, "Firefox/")
}

fn safari_version(ua: &str) -> Option<u32> {
    if ua.contains("Chrome/") {
        return None; // Chrome-on-iOS etc. carries "Safari/" too; Chrome wins.
    }
    version_after(ua, "Version/")
}

pub fn device_type_from_ua(ua: Option<&str>) -> DeviceType {
    let ua = match ua {
        Some(ua) => ua,
        None => return DeviceType::Unknown,
    };
    let lower = ua.to_lowercase();
    if lower.contains("ipad") || lower.contains("tablet") || (lower.contains("android") && !lower.contains("mobile")) {
        DeviceType::Tablet
    } else if lower.contains("mobi") || lower.contains("iphone") || lower.contains("android") {
        DeviceType::Mobile
    } else if lower.contains("mozilla") || lower.contains("windows") || lower.contains("macintosh") || lower.contains("linux") {
        DeviceType::Desktop
    } else {
        DeviceType::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_header_takes_precedence() {
        let (webp, avif, _) = format_support(Some("image/avif,image/webp,*/*"), Some("Firefox/40"));
        assert!(webp);
        assert!(avif);
    }

    #[test]
    fn old_chrome_has_no_avif() {
        let (webp, avif) = browser_table("Mozilla/5.0 Chrome/40.0");
        assert!(webp);
        assert!(!avif);
    }

    #[test]
    fn device_type_detects_mobile() {
        assert_eq!(device_type_from_ua(Some("Mozilla/5.0 (iPhone; CPU iPhone OS 16_0)")), DeviceType::Mobile);
    }

    #[test]
    fn device_type_detects_tablet() {
        assert_eq!(device_type_from_ua(Some("Mozilla/5.0 (iPad; CPU OS 16_0)")), DeviceType::Tablet);
    }
}
