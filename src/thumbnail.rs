//! Thumbnail download and georectification for providers that serve previews.
use crate::error::{IngestError, Result};
use crate::geo_area::BoundingBox;
use crate::georectify::{rectify, write_geotiff, RectifyOptions};
use crate::http::{ApiRequest, Throttle, Transport};
use crate::normalize::NormalizedRecord;
use crate::output::RunDirs;
use crate::retry::{RetryError, RetryPolicy};
use futures_util::stream::{self, StreamExt};
use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Default)]
pub struct ThumbnailSummary {
    pub written: Vec<PathBuf>,
    pub failures: Vec<IngestError>,
}

/// `<provider>_<YYYY-MM-DD>_<identifier>` restricted to filename-safe characters.
pub fn raster_basename(record: &NormalizedRecord) -> String {
    let re = Regex::new(r"[^A-Za-z0-9._-]").expect("Regex pattern should always compile");
    let name = format!(
        "{}_{}_{}",
        record.provider,
        record.acquisition_day().unwrap_or("unknown-date"),
        record.identifier.as_deref().unwrap_or("unidentified")
    );
    re.replace_all(&name, "_").into_owned()
}

fn collect_positions(value: &geojson::Value, out: &mut Vec<[f64; 2]>) {
    use geojson::Value::*;
    let mut push = |p: &Vec<f64>| {
        if p.len() >= 2 {
            out.push([p[0], p[1]]);
        }
    };
    match value {
        Point(p) => push(p),
        MultiPoint(ps) | LineString(ps) => ps.iter().for_each(push),
        MultiLineString(lines) | Polygon(lines) => lines.iter().flatten().for_each(push),
        MultiPolygon(polygons) => polygons.iter().flatten().flatten().for_each(push),
        GeometryCollection(geometries) => geometries
            .iter()
            .for_each(|g| collect_positions(&g.value, out)),
    }
}

/// Envelope of a footprint, the extent a thumbnail is stretched over.
pub fn footprint_bbox(geometry: &geojson::Geometry) -> Option<BoundingBox> {
    let mut positions = vec![];
    collect_positions(&geometry.value, &mut positions);
    let first = positions.first()?;
    let init = (first[0], first[1], first[0], first[1]);
    let (xmin, ymin, xmax, ymax) = positions.iter().fold(init, |(x0, y0, x1, y1), [x, y]| {
        (x0.min(*x), y0.min(*y), x1.max(*x), y1.max(*y))
    });
    BoundingBox::new(xmin, ymin, xmax, ymax).ok()
}

async fn process_one<T: Transport>(
    transport: &T,
    policy: &RetryPolicy,
    throttle: &Throttle,
    record: &NormalizedRecord,
    dirs: &RunDirs,
    options: RectifyOptions,
    cancel: &CancellationToken,
) -> Result<Option<PathBuf>> {
    if cancel.is_cancelled() {
        return Ok(None);
    }
    let name = raster_basename(record);
    let href = match &record.thumbnail_url {
        Some(href) => href,
        None => return Ok(None),
    };
    let url = Url::parse(href).map_err(|e| IngestError::skipped(&name, e))?;
    let bbox = record
        .geometry
        .as_ref()
        .and_then(footprint_bbox)
        .ok_or_else(|| IngestError::skipped(&name, "no usable footprint"))?;

    let request = ApiRequest::get(url);
    let response = match policy
        .execute(throttle, cancel, || transport.send(&request))
        .await
    {
        Ok(response) => response,
        Err(RetryError::Cancelled) => return Ok(None),
        Err(e) => return Err(IngestError::skipped(&name, e)),
    };

    tokio::fs::write(dirs.thumbnails.join(format!("{name}.jpg")), &response.body).await?;

    let target = dirs.geotiffs.join(format!("{name}.tif"));
    let destination = target.clone();
    let bytes = response.body;
    tokio::task::spawn_blocking(move || -> Result<()> {
        let image = image::load_from_memory(&bytes)?;
        let artifact = rectify(&image, &bbox, &options)?;
        write_geotiff(&artifact, &destination)
    })
    .await
    .map_err(|e| IngestError::Raster(format!("rectify task for {name} failed: {e}")))??;

    debug!("georectified {name}");
    Ok(Some(target))
}

/// Downloads and rectifies the thumbnails of `records`, at most `pool_width` at a time.
/// Failures are collected per image and never stop the batch.
pub async fn process_thumbnails<T: Transport>(
    transport: &T,
    policy: &RetryPolicy,
    records: &[NormalizedRecord],
    dirs: &RunDirs,
    options: &RectifyOptions,
    pool_width: usize,
    cancel: &CancellationToken,
) -> ThumbnailSummary {
    let mut summary = ThumbnailSummary::default();
    let candidates: Vec<&NormalizedRecord> = records
        .iter()
        .filter(|r| r.thumbnail_url.is_some())
        .collect();
    if candidates.is_empty() {
        return summary;
    }

    for dir in [&dirs.thumbnails, &dirs.geotiffs] {
        if let Err(e) = std::fs::create_dir_all(dir) {
            summary.failures.push(e.into());
            return summary;
        }
    }

    let throttle = Throttle::new(Duration::ZERO);
    let options = *options;
    let results: Vec<Result<Option<PathBuf>>> = stream::iter(candidates)
        .map(|record| process_one(transport, policy, &throttle, record, dirs, options, cancel))
        .buffer_unordered(pool_width.max(1))
        .collect()
        .await;

    for result in results {
        match result {
            Ok(Some(path)) => summary.written.push(path),
            Ok(None) => {}
            Err(e) => {
                warn!("thumbnail: {e}");
                summary.failures.push(e);
            }
        }
    }
    summary.written.sort();
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::georectify::BandMode;
    use crate::http::stub::{status, StubTransport};
    use crate::http::HttpResponse;
    use crate::retry::{Backoff, RetryConfig};
    use image::{DynamicImage, GrayImage, ImageFormat, Luma};
    use std::io::Cursor;

    fn record(id: &str, thumbnail: Option<&str>) -> NormalizedRecord {
        NormalizedRecord {
            provider: "skyfi".into(),
            identifier: Some(id.into()),
            geometry: Some(geojson::Geometry::new(geojson::Value::Polygon(vec![vec![
                vec![139.5, 35.5],
                vec![139.7, 35.5],
                vec![139.7, 35.7],
                vec![139.5, 35.7],
                vec![139.5, 35.5],
            ]]))),
            acquisition_date: Some("2024-05-04 12:00:00.00".into()),
            publication_date: None,
            platform: None,
            sensor: None,
            resolution: None,
            constellation: None,
            cloud_cover: None,
            incidence_angle: None,
            azimuth_angle: None,
            withhold: None,
            thumbnail_url: thumbnail.map(String::from),
        }
    }

    fn png_bytes() -> Vec<u8> {
        let image = GrayImage::from_fn(30, 30, |x, y| {
            if x >= 10 && y >= 10 {
                Luma([200])
            } else {
                Luma([0])
            }
        });
        let mut bytes = Cursor::new(vec![]);
        DynamicImage::ImageLuma8(image)
            .write_to(&mut bytes, ImageFormat::Png)
            .unwrap();
        bytes.into_inner()
    }

    fn dirs(root: &std::path::Path) -> RunDirs {
        RunDirs {
            root: root.to_path_buf(),
            csv: root.join("output_skyfi.csv"),
            geojson: root.join("output_skyfi.geojson"),
            thumbnails: root.join("thumbnails"),
            geotiffs: root.join("geotiffs"),
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_attempts: 1,
            backoff: Backoff::Fixed,
            base_delay_ms: 1,
            max_delay_ms: 1,
            rate_limit_step_ms: 1,
            max_rate_limit_retries: 1,
        })
    }

    fn options() -> RectifyOptions {
        RectifyOptions {
            width: 16,
            height: 16,
            band_mode: BandMode::Intensity,
            output_bands: 2,
        }
    }

    #[test]
    fn test_basename_is_sanitized() {
        let name = raster_basename(&record("a/b c:d", None));
        assert_eq!(name, "skyfi_2024-05-04_a_b_c_d");
    }

    #[test]
    fn test_footprint_bbox() {
        let bbox = footprint_bbox(record("x", None).geometry.as_ref().unwrap()).unwrap();
        assert_eq!(bbox.to_array(), [139.5, 35.5, 139.7, 35.7]);
        let empty = geojson::Geometry::new(geojson::Value::MultiPoint(vec![]));
        assert!(footprint_bbox(&empty).is_none());
    }

    #[tokio::test]
    async fn test_thumbnails_are_rectified_and_failures_collected() {
        let dir = tempfile::tempdir().unwrap();
        let dirs = dirs(dir.path());
        let transport = StubTransport::new(vec![
            Ok(HttpResponse {
                status: 200,
                body: png_bytes(),
            }),
            status(404),
        ]);
        let records = vec![
            record("ok", Some("https://thumbs.test/ok.png")),
            record("none", None),
            record("missing", Some("https://thumbs.test/missing.png")),
        ];

        let summary = process_thumbnails(
            &transport,
            &policy(),
            &records,
            &dirs,
            &options(),
            1,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(
            summary.written,
            vec![dirs.geotiffs.join("skyfi_2024-05-04_ok.tif")]
        );
        assert_eq!(summary.failures.len(), 1);
        assert!(dirs.thumbnails.join("skyfi_2024-05-04_ok.jpg").exists());
        assert_eq!(transport.request_count(), 2);
    }
}
