//! Area-of-interest derivation from a center point and a search radius.
//!
//! The radius is mapped onto a geohash precision; the tile containing the center is
//! the area of interest. Providers consume the tile as a bbox string, a GeoJSON
//! polygon, a WKT polygon or a plain bbox array.
use crate::error::{IngestError, Result};
use geohash::Coord;
use serde::Serialize;
use wkt::ToWkt;

const BASE32: &[u8] = b"0123456789bcdefghjkmnpqrstuvwxyz";
const MAX_PRECISION: usize = 12;
const MAX_SUB_TILE_DEPTH: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

impl BoundingBox {
    pub fn new(xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> Result<Self> {
        let valid = [xmin, ymin, xmax, ymax].iter().all(|v| v.is_finite())
            && xmin <= xmax
            && ymin <= ymax
            && (-180.0..=180.0).contains(&xmin)
            && (-180.0..=180.0).contains(&xmax)
            && (-90.0..=90.0).contains(&ymin)
            && (-90.0..=90.0).contains(&ymax);
        if !valid {
            return Err(IngestError::InvalidInput(format!(
                "bounding box ({xmin}, {ymin}, {xmax}, {ymax}) is not a valid lon/lat envelope"
            )));
        }
        Ok(Self { xmin, ymin, xmax, ymax })
    }

    /// `xmin,ymin,xmax,ymax`, the form used in query strings.
    pub fn to_bbox_string(&self) -> String {
        format!("{},{},{},{}", self.xmin, self.ymin, self.xmax, self.ymax)
    }

    pub fn to_array(&self) -> [f64; 4] {
        [self.xmin, self.ymin, self.xmax, self.ymax]
    }

    /// Closed counter-clockwise ring SW, SE, NE, NW, SW as `[lon, lat]` pairs,
    /// the exterior winding RFC 7946 asks for.
    pub fn ring(&self) -> Vec<[f64; 2]> {
        vec![
            [self.xmin, self.ymin],
            [self.xmax, self.ymin],
            [self.xmax, self.ymax],
            [self.xmin, self.ymax],
            [self.xmin, self.ymin],
        ]
    }

    pub fn to_polygon(&self) -> geo_types::Polygon<f64> {
        let exterior: Vec<geo_types::Coord<f64>> = self
            .ring()
            .into_iter()
            .map(|[x, y]| geo_types::Coord { x, y })
            .collect();
        geo_types::Polygon::new(geo_types::LineString::from(exterior), vec![])
    }

    pub fn to_geojson(&self) -> geojson::Geometry {
        let ring = self.ring().into_iter().map(|p| p.to_vec()).collect();
        geojson::Geometry::new(geojson::Value::Polygon(vec![ring]))
    }

    pub fn to_wkt(&self) -> String {
        self.to_polygon().wkt_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AreaOfInterest {
    geohash: String,
    bbox: BoundingBox,
}

impl AreaOfInterest {
    pub fn from_geohash(hash: &str) -> Result<Self> {
        let (center, lon_err, lat_err) = geohash::decode(hash)
            .map_err(|e| IngestError::InvalidInput(format!("geohash '{hash}': {e}")))?;

        let bbox = BoundingBox::new(
            (center.x - lon_err).max(-180.0),
            (center.y - lat_err).max(-90.0),
            (center.x + lon_err).min(180.0),
            (center.y + lat_err).min(90.0),
        )?;

        Ok(Self {
            geohash: hash.to_owned(),
            bbox,
        })
    }

    pub fn geohash(&self) -> &str {
        &self.geohash
    }

    pub fn bbox(&self) -> &BoundingBox {
        &self.bbox
    }

    /// All child tiles `depth` characters below this one, in base32 order.
    pub fn sub_tiles(&self, depth: usize) -> Result<Vec<AreaOfInterest>> {
        if depth == 0 {
            return Ok(vec![self.clone()]);
        }
        if depth > MAX_SUB_TILE_DEPTH || self.geohash.len() + depth > MAX_PRECISION {
            return Err(IngestError::InvalidInput(format!(
                "sub-tile depth {depth} is too deep for geohash '{}'",
                self.geohash
            )));
        }

        let mut hashes = vec![self.geohash.clone()];
        for _ in 0..depth {
            hashes = hashes
                .iter()
                .flat_map(|h| {
                    BASE32.iter().map(move |c| {
                        let mut child = h.clone();
                        child.push(*c as char);
                        child
                    })
                })
                .collect();
        }

        hashes.iter().map(|h| Self::from_geohash(h)).collect()
    }
}

/// Larger radii get coarser tiles so the number of requests stays bounded.
pub fn precision_for_radius(radius_km: f64) -> usize {
    if radius_km > 100.0 {
        2
    } else if radius_km > 20.0 {
        4
    } else if radius_km > 5.0 {
        6
    } else if radius_km > 1.0 {
        8
    } else {
        10
    }
}

pub fn resolve(center_lat: f64, center_lon: f64, radius_km: f64) -> Result<AreaOfInterest> {
    if !radius_km.is_finite() || radius_km <= 0.0 {
        return Err(IngestError::InvalidInput(format!(
            "search radius must be positive, got {radius_km}"
        )));
    }
    if !(-90.0..=90.0).contains(&center_lat) || !(-180.0..=180.0).contains(&center_lon) {
        return Err(IngestError::InvalidInput(format!(
            "center ({center_lat}, {center_lon}) is outside the valid lat/lon range"
        )));
    }

    let precision = precision_for_radius(radius_km);
    let hash = geohash::encode(
        Coord {
            x: center_lon,
            y: center_lat,
        },
        precision,
    )
    .map_err(|e| IngestError::InvalidInput(e.to_string()))?;

    AreaOfInterest::from_geohash(&hash)
}
