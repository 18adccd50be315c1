//! Geo-aware egress selection: static point-of-presence tables and the
//! keyword heuristic for picking an egress candidate near the caller.
//!
//! The point-of-presence code is the opaque short code the hosting
//! environment reports for the location that accepted the connection
//! (e.g. `SIN`, `FRA`). Pure lookups, no state.

/// Coarse region a point of presence belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Jp,
    Eu,
    As,
    Us,
    Hk,
    Kr,
}

const JP_POPS: &[&str] = &["FUK", "ICN", "KIX", "NRT", "OKA"];

const EU_POPS: &[&str] = &[
    "AMS", "CDG", "FRA", "LHR", "DUB", "MAD", "MXP", "ZRH", "VIE", "WAW", "PRG", "BRU", "CPH",
    "HEL", "OSL", "ARN", "IST", "ATH",
];

const AS_POPS: &[&str] = &[
    "HKG", "SIN", "BKK", "KUL", "SGN", "MNL", "CGK", "DEL", "BOM", "SYD", "MEL", "TPE", "SEL",
];

/// Region of a point-of-presence code, if the code is known.
pub fn region_of(pop: &str) -> Option<Region> {
    if JP_POPS.contains(&pop) {
        Some(Region::Jp)
    } else if EU_POPS.contains(&pop) {
        Some(Region::Eu)
    } else if AS_POPS.contains(&pop) {
        Some(Region::As)
    } else {
        None
    }
}

/// Canonical egress address per region. Deployment defaults — the
/// upstream-configured candidate list takes precedence when present.
pub fn default_egress(region: Region) -> &'static str {
    match region {
        Region::Jp => "egress-jp.edgetun.net",
        Region::Eu => "egress-de.edgetun.net",
        Region::As => "egress-sg.edgetun.net",
        Region::Us => "egress-us.edgetun.net",
        Region::Hk => "egress-hk.edgetun.net",
        Region::Kr => "egress-kr.edgetun.net",
    }
}

/// Default egress for a point-of-presence code; unrecognized codes fall
/// back to the US region.
pub fn default_egress_for(pop: &str) -> &'static str {
    default_egress(region_of(pop).unwrap_or(Region::Us))
}

/// Substrings that mark an egress candidate as local to a region.
fn keywords(region: Region) -> &'static [&'static str] {
    match region {
        Region::Jp => &["jp"],
        Region::As => &["sg", "hk", "kr", "tw"],
        Region::Eu => &["de", "eu", "uk"],
        Region::Us => &["us"],
        Region::Hk => &["hk"],
        Region::Kr => &["kr"],
    }
}

/// Pick the best egress candidate for a caller at `pop`.
///
/// Scans the candidates in order and returns the first whose lowercase
/// form contains one of the caller region's keywords; with no known
/// region or no keyword match, the first candidate wins (deterministic,
/// never a random pick). Empty candidate lists yield `None`.
pub fn select_egress<'a>(candidates: &'a [String], pop: &str) -> Option<&'a str> {
    let first = candidates.first()?;
    if let Some(region) = region_of(pop) {
        for candidate in candidates {
            let lower = candidate.to_lowercase();
            if keywords(region).iter().any(|kw| lower.contains(kw)) {
                return Some(candidate.as_str());
            }
        }
    }
    Some(first.as_str())
}
