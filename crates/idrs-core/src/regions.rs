//! Built-in region catalog used for profile generation and geo affinity.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Continent {
    NorthAmerica,
    SouthAmerica,
    Europe,
    Asia,
    Oceania,
}

#[derive(Debug)]
pub struct RegionInfo {
    pub code: &'static str,
    pub continent: Continent,
    pub timezones: &'static [&'static str],
    pub locale: &'static str,
    pub languages: &'static [&'static str],
    pub latitude: f64,
    pub longitude: f64,
}

const REGIONS: &[RegionInfo] = &[
    RegionInfo {
        code: "US",
        continent: Continent::NorthAmerica,
        timezones: &["America/New_York", "America/Chicago", "America/Los_Angeles"],
        locale: "en-US",
        languages: &["en-US", "en"],
        latitude: 39.8283,
        longitude: -98.5795,
    },
    RegionInfo {
        code: "CA",
        continent: Continent::NorthAmerica,
        timezones: &["America/Toronto", "America/Vancouver"],
        locale: "en-CA",
        languages: &["en-CA", "en", "fr-CA"],
        latitude: 45.4215,
        longitude: -75.6972,
    },
    RegionInfo {
        code: "BR",
        continent: Continent::SouthAmerica,
        timezones: &["America/Sao_Paulo"],
        locale: "pt-BR",
        languages: &["pt-BR", "pt", "en"],
        latitude: -23.5505,
        longitude: -46.6333,
    },
    RegionInfo {
        code: "GB",
        continent: Continent::Europe,
        timezones: &["Europe/London"],
        locale: "en-GB",
        languages: &["en-GB", "en"],
        latitude: 51.5074,
        longitude: -0.1278,
    },
    RegionInfo {
        code: "DE",
        continent: Continent::Europe,
        timezones: &["Europe/Berlin"],
        locale: "de-DE",
        languages: &["de-DE", "de", "en"],
        latitude: 50.1109,
        longitude: 8.6821,
    },
    RegionInfo {
        code: "FR",
        continent: Continent::Europe,
        timezones: &["Europe/Paris"],
        locale: "fr-FR",
        languages: &["fr-FR", "fr", "en"],
        latitude: 48.8566,
        longitude: 2.3522,
    },
    RegionInfo {
        code: "NL",
        continent: Continent::Europe,
        timezones: &["Europe/Amsterdam"],
        locale: "nl-NL",
        languages: &["nl-NL", "nl", "en"],
        latitude: 52.3676,
        longitude: 4.9041,
    },
    RegionInfo {
        code: "JP",
        continent: Continent::Asia,
        timezones: &["Asia/Tokyo"],
        locale: "ja-JP",
        languages: &["ja-JP", "ja", "en"],
        latitude: 35.6762,
        longitude: 139.6503,
    },
    RegionInfo {
        code: "SG",
        continent: Continent::Asia,
        timezones: &["Asia/Singapore"],
        locale: "en-SG",
        languages: &["en-SG", "en", "zh-SG"],
        latitude: 1.3521,
        longitude: 103.8198,
    },
    RegionInfo {
        code: "IN",
        continent: Continent::Asia,
        timezones: &["Asia/Kolkata"],
        locale: "en-IN",
        languages: &["en-IN", "en", "hi"],
        latitude: 19.0760,
        longitude: 72.8777,
    },
    RegionInfo {
        code: "AU",
        continent: Continent::Oceania,
        timezones: &["Australia/Sydney", "Australia/Melbourne"],
        locale: "en-AU",
        languages: &["en-AU", "en"],
        latitude: -33.8688,
        longitude: 151.2093,
    },
];

/// Case-insensitive lookup by ISO 3166-1 alpha-2 code.
pub fn lookup(code: &str) -> Option<&'static RegionInfo> {
    REGIONS.iter().find(|r| r.code.eq_ignore_ascii_case(code))
}

pub fn all() -> &'static [RegionInfo] {
    REGIONS
}

/// Affinity between two regions: 1.0 same region, 0.5 same continent, else 0.
pub fn geo_affinity(a: &str, b: &str) -> f64 {
    if a.eq_ignore_ascii_case(b) {
        return 1.0;
    }
    match (lookup(a), lookup(b)) {
        (Some(ra), Some(rb)) if ra.continent == rb.continent => 0.5,
        _ => 0.0,
    }
}
