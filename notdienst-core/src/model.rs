use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use crate::geo::Coordinate;

/// One on-duty pharmacy as produced by a single pipeline run.
///
/// Fields missing from older snapshot files fall back to their defaults, so a
/// file holding only `name`/`phone`/`address`/`service_time`/`distance_text`/
/// `distance` still loads.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PharmacyRecord {
    pub id: Option<String>,
    pub name: String,
    pub phone: String,
    pub street: String,
    pub zip_code: String,
    pub locality: String,
    pub sub_locality: Option<String>,
    /// Single-line postal address, `"{street}, {zip}, {locality}"`.
    pub address: String,
    pub on_duty_from: Option<DateTime<FixedOffset>>,
    pub on_duty_to: Option<DateTime<FixedOffset>>,
    /// Human-readable duty window as shown on the signage page.
    pub service_time: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Kilometers from the reference location.
    pub distance: f64,
    pub distance_text: String,
}

impl PharmacyRecord {
    pub fn coordinate(&self) -> Option<Coordinate> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some(Coordinate::new(lat, lon)),
            _ => None,
        }
    }
}

pub fn compose_address(street: &str, zip_code: &str, locality: &str) -> String {
    format!("{street}, {zip_code}, {locality}")
}

/// Formats kilometers the way the portal prints them, e.g. `"3,4 km"`.
pub fn format_distance(km: f64) -> String {
    format!("{km:.1} km").replace('.', ",")
}

/// Parses the portal's distance text (`"1,2 km"`) back into kilometers.
/// Non-finite values such as `NaN` or `inf` are rejected.
pub fn parse_distance(text: &str) -> Option<f64> {
    text.trim()
        .trim_end_matches("km")
        .trim()
        .replace(',', ".")
        .parse()
        .ok()
        .filter(|km: &f64| km.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_text_uses_decimal_comma() {
        assert_eq!(format_distance(3.44), "3,4 km");
        assert_eq!(format_distance(12.0), "12,0 km");
    }

    #[test]
    fn parses_portal_distance_text() {
        assert_eq!(parse_distance("1,2 km"), Some(1.2));
        assert_eq!(parse_distance(" 10 km "), Some(10.0));
        assert_eq!(parse_distance("n/a"), None);
    }

    #[test]
    fn non_finite_distance_text_is_rejected() {
        assert_eq!(parse_distance("NaN km"), None);
        assert_eq!(parse_distance("inf km"), None);
        assert_eq!(parse_distance("-infinity"), None);
    }

    #[test]
    fn legacy_snapshot_entry_deserializes() {
        let json = r#"{
            "name": "Linden-Apotheke",
            "phone": "089 123",
            "address": "Hauptstr. 1, 80331, München",
            "service_time": "08:30 - 08:30",
            "distance_text": "1,2 km",
            "distance": 1.2
        }"#;

        let record: PharmacyRecord = serde_json::from_str(json).expect("legacy entry");
        assert_eq!(record.name, "Linden-Apotheke");
        assert_eq!(record.distance, 1.2);
        assert!(record.id.is_none());
        assert!(record.coordinate().is_none());
    }
}
