//! CSV and GeoJSON output of one provider run.
//!
//! Layout: `<output_dir>/<provider>/<start>_<end>/output_<provider>.{csv,geojson}`
//! next to `thumbnails/` and `geotiffs/`. A run that ends without a single data
//! row has its directory renamed to `0_<start>_<end>`.
use crate::date_window::DateWindow;
use crate::error::{IngestError, Result};
use crate::normalize::NormalizedRecord;
use csv::{QuoteStyle, WriterBuilder};
use geojson::{Feature, FeatureCollection, GeoJson, JsonObject};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

pub const CSV_COLUMNS: [&str; 13] = [
    "acquisitionIdentifier",
    "geometry",
    "acquisitionDate",
    "publicationDate",
    "productPlatform",
    "sensorType",
    "resolution",
    "constellation",
    "cloudCover",
    "incidenceAngle",
    "azimuthAngle",
    "withholdReadable",
    "withholdHours",
];

pub const NOT_AVAILABLE: &str = "N/A";

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SinkMode {
    /// Records are written once, when the run finishes.
    #[default]
    Batch,
    /// Records are appended as each date unit completes.
    Append,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Records { count: usize, dir: PathBuf },
    Empty(PathBuf),
    /// Interrupted run. Whatever was written stays under the regular name.
    Cancelled { count: usize, dir: PathBuf },
}

#[derive(Debug, Clone)]
pub struct RunDirs {
    pub root: PathBuf,
    pub csv: PathBuf,
    pub geojson: PathBuf,
    pub thumbnails: PathBuf,
    pub geotiffs: PathBuf,
}

impl RunDirs {
    fn new(root: PathBuf, provider: &str) -> Self {
        Self {
            csv: root.join(format!("output_{provider}.csv")),
            geojson: root.join(format!("output_{provider}.geojson")),
            thumbnails: root.join("thumbnails"),
            geotiffs: root.join("geotiffs"),
            root,
        }
    }
}

/// Output files of one provider run. Only the run that created it writes to it.
pub struct RecordSink {
    provider_dir: PathBuf,
    window: String,
    dirs: RunDirs,
    mode: SinkMode,
}

impl RecordSink {
    pub fn create(
        output_dir: &Path,
        provider: &str,
        window: &DateWindow,
        mode: SinkMode,
    ) -> Result<Self> {
        let provider_dir = output_dir.join(provider);
        let root = provider_dir.join(window.to_string());
        fs::create_dir_all(&root)?;
        debug!("{provider}: writing to {}", root.display());
        Ok(Self {
            provider_dir,
            window: window.to_string(),
            dirs: RunDirs::new(root, provider),
            mode,
        })
    }

    pub fn dirs(&self) -> &RunDirs {
        &self.dirs
    }

    pub fn mode(&self) -> SinkMode {
        self.mode
    }

    /// Replaces both files with `records`.
    pub fn write_all(&mut self, records: &[NormalizedRecord]) -> Result<()> {
        let mut writer = WriterBuilder::new()
            .quote_style(QuoteStyle::Always)
            .from_path(&self.dirs.csv)?;
        writer.write_record(CSV_COLUMNS)?;
        for record in records {
            writer.write_record(csv_row(record))?;
        }
        writer.flush()?;

        write_collection(&self.dirs.geojson, records.iter().map(feature).collect())
    }

    /// Adds `records` to whatever earlier units or runs already wrote.
    pub fn append(&mut self, records: &[NormalizedRecord]) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.dirs.csv)?;
        let needs_header = file.metadata()?.len() == 0;
        let mut writer = WriterBuilder::new()
            .quote_style(QuoteStyle::Always)
            .from_writer(file);
        if needs_header {
            writer.write_record(CSV_COLUMNS)?;
        }
        for record in records {
            writer.write_record(csv_row(record))?;
        }
        writer.flush()?;

        let mut features = read_features(&self.dirs.geojson)?;
        features.extend(records.iter().map(feature));
        write_collection(&self.dirs.geojson, features)
    }

    /// Closes an interrupted run. The directory keeps its name even with no rows.
    pub fn abandon(self) -> Result<RunOutcome> {
        let count = count_rows(&self.dirs.csv)?;
        info!(
            "run cancelled with {count} records in {}",
            self.dirs.root.display()
        );
        Ok(RunOutcome::Cancelled {
            count,
            dir: self.dirs.root,
        })
    }

    pub fn finish(self) -> Result<RunOutcome> {
        let rows = count_rows(&self.dirs.csv)?;
        if rows > 0 {
            return Ok(RunOutcome::Records {
                count: rows,
                dir: self.dirs.root,
            });
        }

        let target = vacant_path(&self.provider_dir, &format!("0_{}", self.window));
        fs::rename(&self.dirs.root, &target)?;
        info!(
            "no records, output moved to {}",
            target.display()
        );
        Ok(RunOutcome::Empty(target))
    }
}

fn or_empty(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

fn or_na(value: &Option<String>) -> String {
    value.clone().unwrap_or_else(|| NOT_AVAILABLE.to_string())
}

pub fn csv_row(record: &NormalizedRecord) -> [String; 13] {
    let geometry = record
        .geometry
        .as_ref()
        .and_then(|g| serde_json::to_string(g).ok())
        .unwrap_or_default();
    let (readable, hours) = match &record.withhold {
        Some(w) => (w.readable.clone(), w.hours.to_string()),
        None => (NOT_AVAILABLE.to_string(), NOT_AVAILABLE.to_string()),
    };
    [
        or_empty(&record.identifier),
        geometry,
        or_empty(&record.acquisition_date),
        or_empty(&record.publication_date),
        or_empty(&record.platform),
        or_empty(&record.sensor),
        or_na(&record.resolution),
        or_empty(&record.constellation),
        or_empty(&record.cloud_cover),
        or_na(&record.incidence_angle),
        or_na(&record.azimuth_angle),
        readable,
        hours,
    ]
}

pub fn feature(record: &NormalizedRecord) -> Feature {
    let text = |v: &Option<String>| v.as_ref().map_or(Value::Null, |s| json!(s));
    let mut properties = JsonObject::new();
    properties.insert("acquisitionIdentifier".into(), text(&record.identifier));
    properties.insert("acquisitionDate".into(), text(&record.acquisition_date));
    properties.insert("publicationDate".into(), text(&record.publication_date));
    properties.insert("productPlatform".into(), text(&record.platform));
    properties.insert("sensorType".into(), text(&record.sensor));
    properties.insert("resolution".into(), text(&record.resolution));
    properties.insert("constellation".into(), text(&record.constellation));
    properties.insert("cloudCover".into(), text(&record.cloud_cover));
    properties.insert("incidenceAngle".into(), text(&record.incidence_angle));
    properties.insert("azimuthAngle".into(), text(&record.azimuth_angle));
    properties.insert(
        "withholdReadable".into(),
        record
            .withhold
            .as_ref()
            .map_or(Value::Null, |w| json!(w.readable)),
    );
    properties.insert(
        "withholdHours".into(),
        record.withhold.as_ref().map_or(Value::Null, |w| json!(w.hours)),
    );

    Feature {
        bbox: None,
        geometry: record.geometry.clone(),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    }
}

fn write_collection(path: &Path, features: Vec<Feature>) -> Result<()> {
    let collection = FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    };
    fs::write(path, serde_json::to_string_pretty(&collection)?)?;
    Ok(())
}

fn read_features(path: &Path) -> Result<Vec<Feature>> {
    if !path.exists() {
        return Ok(vec![]);
    }
    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(vec![]);
    }
    let collection = GeoJson::from_str(&content)
        .and_then(FeatureCollection::try_from)
        .map_err(|e| IngestError::Parse {
            field: path.display().to_string(),
            value: e.to_string(),
        })?;
    Ok(collection.features)
}

/// Data rows of a CSV file written by this module; a missing file has none.
pub fn count_rows(path: &Path) -> Result<usize> {
    if !path.exists() {
        return Ok(0);
    }
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = 0;
    for record in reader.records() {
        record?;
        rows += 1;
    }
    Ok(rows)
}

fn vacant_path(parent: &Path, name: &str) -> PathBuf {
    let candidate = parent.join(name);
    if !candidate.exists() {
        return candidate;
    }
    (1..)
        .map(|n| parent.join(format!("{name}_{n}")))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::Withhold;

    fn window() -> DateWindow {
        DateWindow::parse("2024-05-01", "2024-05-03").unwrap()
    }

    fn record(id: &str) -> NormalizedRecord {
        NormalizedRecord {
            provider: "airbus".into(),
            identifier: Some(id.into()),
            geometry: Some(geojson::Geometry::new(geojson::Value::Polygon(vec![vec![
                vec![0.0, 0.0],
                vec![1.5, 0.0],
                vec![1.5, 1.25],
                vec![0.0, 0.0],
            ]]))),
            acquisition_date: Some("2024-05-01 10:00:00.00".into()),
            publication_date: Some("2024-05-02 12:00:00.00".into()),
            platform: Some("PHR1A".into()),
            sensor: None,
            resolution: Some("0.50".into()),
            constellation: None,
            cloud_cover: Some("3".into()),
            incidence_angle: None,
            azimuth_angle: Some("12.00".into()),
            withhold: Some(Withhold::from_hours(26)),
            thumbnail_url: None,
        }
    }

    #[test]
    fn test_csv_geometry_matches_geojson() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = RecordSink::create(dir.path(), "airbus", &window(), SinkMode::Batch).unwrap();
        let records = vec![record("a"), record("b")];
        sink.write_all(&records).unwrap();
        let dirs = sink.dirs().clone();

        let mut reader = csv::Reader::from_path(&dirs.csv).unwrap();
        assert_eq!(reader.headers().unwrap().iter().collect::<Vec<_>>(), CSV_COLUMNS);
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);

        let content = fs::read_to_string(&dirs.geojson).unwrap();
        let collection = FeatureCollection::try_from(GeoJson::from_str(&content).unwrap()).unwrap();
        for (row, feature) in rows.iter().zip(&collection.features) {
            let from_csv: geojson::Geometry = serde_json::from_str(&row[1]).unwrap();
            assert_eq!(Some(&from_csv), feature.geometry.as_ref());
        }
        assert_eq!(
            collection.features[0].property("withholdHours"),
            Some(&json!(26))
        );
        assert_eq!(&rows[0][9], NOT_AVAILABLE);
        assert_eq!(&rows[0][5], "");
        assert_eq!(&rows[0][11], "1 days 2 hours");

        let raw = fs::read_to_string(&dirs.csv).unwrap();
        assert!(raw.starts_with("\"acquisitionIdentifier\",\"geometry\""));
    }

    #[test]
    fn test_non_empty_run_keeps_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = RecordSink::create(dir.path(), "planet", &window(), SinkMode::Batch).unwrap();
        sink.write_all(&[record("a")]).unwrap();

        let outcome = sink.finish().unwrap();
        let expected = dir.path().join("planet").join("2024-05-01_2024-05-03");
        assert_eq!(
            outcome,
            RunOutcome::Records {
                count: 1,
                dir: expected.clone()
            }
        );
        assert!(expected.join("output_planet.csv").exists());
    }

    #[test]
    fn test_empty_run_is_renamed() {
        let dir = tempfile::tempdir().unwrap();
        let provider_dir = dir.path().join("maxar");

        let mut sink = RecordSink::create(dir.path(), "maxar", &window(), SinkMode::Batch).unwrap();
        sink.write_all(&[]).unwrap();
        let outcome = sink.finish().unwrap();
        let renamed = provider_dir.join("0_2024-05-01_2024-05-03");
        assert_eq!(outcome, RunOutcome::Empty(renamed.clone()));
        assert!(renamed.join("output_maxar.csv").exists());
        assert!(!provider_dir.join("2024-05-01_2024-05-03").exists());

        let sink = RecordSink::create(dir.path(), "maxar", &window(), SinkMode::Batch).unwrap();
        let outcome = sink.finish().unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Empty(provider_dir.join("0_2024-05-01_2024-05-03_1"))
        );
    }

    #[test]
    fn test_abandoned_run_is_not_marked_empty() {
        let dir = tempfile::tempdir().unwrap();
        let sink = RecordSink::create(dir.path(), "skyfi", &window(), SinkMode::Batch).unwrap();
        let expected = dir.path().join("skyfi").join("2024-05-01_2024-05-03");

        let outcome = sink.abandon().unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Cancelled {
                count: 0,
                dir: expected.clone()
            }
        );
        assert!(expected.exists());
        assert!(!dir.path().join("skyfi/0_2024-05-01_2024-05-03").exists());
    }

    #[test]
    fn test_append_writes_header_once_and_merges_features() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink =
            RecordSink::create(dir.path(), "umbra", &window(), SinkMode::Append).unwrap();
        sink.append(&[record("a")]).unwrap();
        sink.append(&[]).unwrap();
        sink.append(&[record("b"), record("c")]).unwrap();
        let dirs = sink.dirs().clone();

        let raw = fs::read_to_string(&dirs.csv).unwrap();
        assert_eq!(raw.matches("acquisitionIdentifier").count(), 1);
        assert_eq!(count_rows(&dirs.csv).unwrap(), 3);

        let features = read_features(&dirs.geojson).unwrap();
        let ids: Vec<&Value> = features
            .iter()
            .filter_map(|f| f.property("acquisitionIdentifier"))
            .collect();
        assert_eq!(ids, vec![&json!("a"), &json!("b"), &json!("c")]);
        assert!(matches!(sink.finish().unwrap(), RunOutcome::Records { count: 3, .. }));
    }
}
