//! Mapping of provider-specific features onto one record schema.
//!
//! Every provider describes its payload with a [`FieldMap`]: for each canonical
//! field, one or more JSON pointers into the raw feature and the formatter to
//! apply. [`normalize`] is the only place values are converted.
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use wkt::TryFromWkt;

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];
const OFFSET_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Identifier,
    Geometry,
    AcquisitionDate,
    PublicationDate,
    Platform,
    Sensor,
    Resolution,
    Constellation,
    CloudCover,
    IncidenceAngle,
    AzimuthAngle,
    ThumbnailUrl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Strings kept, numbers and booleans stringified.
    Text,
    Timestamp,
    /// Two decimal places.
    Decimal,
    GeoJson,
    Wkt,
}

#[derive(Debug, Clone)]
struct FieldEntry {
    field: Field,
    pointer: &'static str,
    format: Format,
}

/// Canonical field to JSON pointer table of one provider.
///
/// A field may be mapped more than once; the first pointer that resolves to a
/// non-null value wins.
#[derive(Debug, Clone, Default)]
pub struct FieldMap {
    entries: Vec<FieldEntry>,
}

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(mut self, field: Field, pointer: &'static str, format: Format) -> Self {
        self.entries.push(FieldEntry {
            field,
            pointer,
            format,
        });
        self
    }

    fn lookup<'a>(&self, raw: &'a Value, field: Field) -> Option<(&'a Value, Format)> {
        self.entries
            .iter()
            .filter(|e| e.field == field)
            .find_map(|e| match raw.pointer(e.pointer) {
                Some(Value::Null) | None => None,
                Some(v) => Some((v, e.format)),
            })
    }

    fn text(&self, raw: &Value, field: Field) -> Option<String> {
        self.lookup(raw, field).and_then(|(v, format)| match format {
            Format::Text => scalar(v),
            Format::Timestamp => scalar(v).map(|s| format_timestamp(&s)),
            Format::Decimal => decimal(v),
            Format::GeoJson | Format::Wkt => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Withhold {
    pub readable: String,
    pub hours: i64,
}

impl Withhold {
    pub fn from_hours(hours: i64) -> Self {
        Self {
            readable: format!("{} days {} hours", hours / 24, hours % 24),
            hours,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub provider: String,
    pub identifier: Option<String>,
    pub geometry: Option<geojson::Geometry>,
    pub acquisition_date: Option<String>,
    pub publication_date: Option<String>,
    pub platform: Option<String>,
    pub sensor: Option<String>,
    pub resolution: Option<String>,
    pub constellation: Option<String>,
    pub cloud_cover: Option<String>,
    pub incidence_angle: Option<String>,
    pub azimuth_angle: Option<String>,
    pub withhold: Option<Withhold>,
    pub thumbnail_url: Option<String>,
}

impl NormalizedRecord {
    /// Calendar day of the acquisition, as used in raster filenames.
    pub fn acquisition_day(&self) -> Option<&str> {
        self.acquisition_date
            .as_deref()
            .and_then(|d| d.get(..10))
            .filter(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").is_ok())
    }
}

pub fn normalize(provider: &str, raw: &Value, map: &FieldMap) -> NormalizedRecord {
    let acquired = map
        .lookup(raw, Field::AcquisitionDate)
        .and_then(|(v, _)| scalar(v));
    let published = map
        .lookup(raw, Field::PublicationDate)
        .and_then(|(v, _)| scalar(v));
    let withhold = match (&acquired, &published) {
        (Some(a), Some(p)) => withhold(a, p),
        _ => None,
    };

    NormalizedRecord {
        provider: provider.to_string(),
        identifier: map.text(raw, Field::Identifier),
        geometry: map
            .lookup(raw, Field::Geometry)
            .and_then(|(v, format)| geometry(v, format)),
        acquisition_date: acquired.as_deref().map(format_timestamp),
        publication_date: published.as_deref().map(format_timestamp),
        platform: map.text(raw, Field::Platform),
        sensor: map.text(raw, Field::Sensor),
        resolution: map.text(raw, Field::Resolution),
        constellation: map.text(raw, Field::Constellation),
        cloud_cover: map.text(raw, Field::CloudCover),
        incidence_angle: map.text(raw, Field::IncidenceAngle),
        azimuth_angle: map.text(raw, Field::AzimuthAngle),
        withhold,
        thumbnail_url: map.text(raw, Field::ThumbnailUrl),
    }
}

pub fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

pub fn decimal(value: &Value) -> Option<String> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    number.is_finite().then(|| format!("{number:.2}"))
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(value) {
        return Some(t.with_timezone(&Utc));
    }
    for format in OFFSET_FORMATS {
        if let Ok(t) = DateTime::parse_from_str(value, format) {
            return Some(t.with_timezone(&Utc));
        }
    }
    for format in NAIVE_FORMATS {
        if let Ok(t) = NaiveDateTime::parse_from_str(value, format) {
            return Some(t.and_utc());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .map(|d| d.and_time(NaiveTime::MIN).and_utc())
}

/// `YYYY-MM-DD HH:MM:SS.cc` with the fraction truncated to hundredths.
/// Unparsable input is returned unchanged.
pub fn format_timestamp(value: &str) -> String {
    match parse_timestamp(value) {
        Some(t) => {
            let centis = (t.timestamp_subsec_nanos() / 10_000_000).min(99);
            format!("{}.{centis:02}", t.format("%Y-%m-%d %H:%M:%S"))
        }
        None => value.to_string(),
    }
}

/// Delay between acquisition and publication. Negative delays are treated as
/// unavailable.
pub fn withhold(acquired: &str, published: &str) -> Option<Withhold> {
    let acquired = parse_timestamp(acquired)?;
    let published = parse_timestamp(published)?;
    let seconds = (published - acquired).num_seconds();
    if seconds < 0 {
        debug!("publication {published} precedes acquisition {acquired}");
        return None;
    }
    Some(Withhold::from_hours(seconds / 3600))
}

fn geometry(value: &Value, format: Format) -> Option<geojson::Geometry> {
    let parsed = match format {
        Format::GeoJson => serde_json::from_value::<geojson::Geometry>(value.clone())
            .map_err(|e| e.to_string()),
        Format::Wkt => match value.as_str() {
            Some(text) => geo_types::Geometry::<f64>::try_from_wkt_str(text)
                .map(|g| geojson::Geometry::new(geojson::Value::from(&g)))
                .map_err(|e| e.to_string()),
            None => Err("WKT footprint is not a string".to_string()),
        },
        _ => Err(format!("{format:?} is not a geometry format")),
    };
    match parsed {
        Ok(geometry) => Some(geometry),
        Err(e) => {
            debug!("dropping invalid geometry: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_map() -> FieldMap {
        FieldMap::new()
            .map(Field::Identifier, "/id", Format::Text)
            .map(Field::Geometry, "/geometry", Format::GeoJson)
            .map(Field::AcquisitionDate, "/properties/acquired", Format::Timestamp)
            .map(Field::PublicationDate, "/properties/published", Format::Timestamp)
            .map(Field::Platform, "/properties/platform", Format::Text)
            .map(Field::Resolution, "/properties/gsd", Format::Decimal)
            .map(Field::Resolution, "/properties/resolution", Format::Decimal)
            .map(Field::CloudCover, "/properties/cloud", Format::Text)
            .map(Field::IncidenceAngle, "/properties/incidence", Format::Decimal)
    }

    fn sample_feature() -> Value {
        json!({
            "id": "IMG_001",
            "geometry": {"type": "Point", "coordinates": [1.5, 2.5]},
            "properties": {
                "acquired": "2020-08-29T10:00:00.123456Z",
                "published": "2020-09-01T12:30:00Z",
                "platform": "PHR1A",
                "resolution": "0.5",
                "cloud": 12,
                "incidence": 17.456
            }
        })
    }

    #[test]
    fn test_withhold_hours() {
        let w = withhold("2020-08-29T10:00:00Z", "2020-09-01T12:30:00Z").unwrap();
        assert_eq!(w.hours, 74);
        assert_eq!(w.readable, "3 days 2 hours");

        let w = withhold("2020-08-29T10:00:00Z", "2020-08-29T10:59:59Z").unwrap();
        assert_eq!(w.hours, 0);
        assert_eq!(w.readable, "0 days 0 hours");

        assert_eq!(withhold("2020-09-01T00:00:00Z", "2020-08-29T00:00:00Z"), None);
        assert_eq!(withhold("not a date", "2020-08-29T00:00:00Z"), None);
    }

    #[test]
    fn test_timestamp_formats() {
        assert_eq!(
            format_timestamp("2020-08-29T10:00:00.123456Z"),
            "2020-08-29 10:00:00.12"
        );
        assert_eq!(
            format_timestamp("2020-08-29T12:00:00+0200"),
            "2020-08-29 10:00:00.00"
        );
        assert_eq!(format_timestamp("2020-08-29T10:00:00"), "2020-08-29 10:00:00.00");
        assert_eq!(format_timestamp("2020-08-29"), "2020-08-29 00:00:00.00");
        assert_eq!(format_timestamp("yesterday"), "yesterday");

        let once = format_timestamp("2021-01-02T03:04:05.987Z");
        assert_eq!(format_timestamp(&once), once);
    }

    #[test]
    fn test_decimal_and_scalar() {
        assert_eq!(decimal(&json!(17.456)), Some("17.46".into()));
        assert_eq!(decimal(&json!("3")), Some("3.00".into()));
        assert_eq!(decimal(&json!("n/a")), None);
        assert_eq!(decimal(&json!(null)), None);
        assert_eq!(scalar(&json!(12)), Some("12".into()));
        assert_eq!(scalar(&json!("")), Some("".into()));
        assert_eq!(scalar(&json!(null)), None);
    }

    #[test]
    fn test_normalize_feature() {
        let record = normalize("airbus", &sample_feature(), &sample_map());
        assert_eq!(record.identifier.as_deref(), Some("IMG_001"));
        assert_eq!(record.acquisition_date.as_deref(), Some("2020-08-29 10:00:00.12"));
        assert_eq!(record.acquisition_day(), Some("2020-08-29"));
        assert_eq!(record.resolution.as_deref(), Some("0.50"));
        assert_eq!(record.cloud_cover.as_deref(), Some("12"));
        assert_eq!(record.incidence_angle.as_deref(), Some("17.46"));
        assert_eq!(record.azimuth_angle, None);
        assert_eq!(record.withhold.as_ref().map(|w| w.hours), Some(74));
        assert!(record.geometry.is_some());
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let map = sample_map();
        let raw = sample_feature();
        assert_eq!(normalize("planet", &raw, &map), normalize("planet", &raw, &map));
    }

    #[test]
    fn test_wkt_footprint() {
        let map = FieldMap::new().map(Field::Geometry, "/footprint", Format::Wkt);
        let raw = json!({"footprint": "POLYGON((0 0, 1 0, 1 1, 0 1, 0 0))"});
        let record = normalize("skyfi", &raw, &map);
        let value = serde_json::to_value(record.geometry.unwrap()).unwrap();
        assert_eq!(value["type"], "Polygon");
        assert_eq!(value["coordinates"][0][2], json!([1.0, 1.0]));

        let raw = json!({"footprint": "POLYGON((0 0, 1"});
        assert_eq!(normalize("skyfi", &raw, &map).geometry, None);
    }

    #[test]
    fn test_invalid_geojson_is_dropped() {
        let raw = json!({"geometry": {"type": "Polygon", "coordinates": "oops"}});
        let record = normalize("maxar", &raw, &sample_map());
        assert_eq!(record.geometry, None);
        assert_eq!(record.identifier, None);
    }
}
