//! Thumbnail georectification into GeoTIFF rasters.
//!
//! A thumbnail is converted to intensity (or kept as is), stripped of the uniform
//! border around the footprint, resampled to the target grid and written with the
//! GeoTIFF tags that place it on its bounding box in EPSG:4326.
use crate::error::{IngestError, Result};
use crate::geo_area::BoundingBox;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageBuffer, Pixel};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Seek, Write};
use std::path::Path;
use tiff::encoder::colortype::{self, ColorType};
use tiff::encoder::TiffEncoder;
use tiff::tags::{PhotometricInterpretation, SampleFormat, Tag};

pub const EPSG_WGS84: u16 = 4326;

const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const GEO_KEY_DIRECTORY: u16 = 34735;
const GEO_ASCII_PARAMS: u16 = 34737;
const EXTRA_SAMPLES: u16 = 338;
const CITATION: &str = "WGS 84|";

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BandMode {
    /// Single intensity channel replicated into `output_bands` bands.
    Intensity,
    /// Keep the thumbnail's own channels.
    Preserve,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RectifyOptions {
    pub width: u32,
    pub height: u32,
    pub band_mode: BandMode,
    pub output_bands: u16,
}

/// Affine pixel to lon/lat mapping, GDAL coefficient order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform(pub [f64; 6]);

impl GeoTransform {
    pub fn from_bounds(bbox: &BoundingBox, width: u32, height: u32) -> Self {
        let BoundingBox {
            xmin: left,
            ymin: bottom,
            xmax: right,
            ymax: top,
        } = *bbox;
        Self([
            left,
            (right - left) / width as f64,
            0.0,
            top,
            0.0,
            -(top - bottom) / height as f64,
        ])
    }

    pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        let t = &self.0;
        (t[0] + col * t[1] + row * t[2], t[3] + col * t[4] + row * t[5])
    }

    pub fn pixel_size(&self) -> (f64, f64) {
        (self.0[1], -self.0[5])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RasterArtifact {
    pub width: u32,
    pub height: u32,
    pub bands: u16,
    /// Band-interleaved, row-major.
    pub pixels: Vec<u8>,
    pub transform: GeoTransform,
    pub epsg: u16,
}

/// Rectangle `(x, y, width, height)` of all pixels that differ from the top-left one.
pub fn content_bounds<P>(image: &ImageBuffer<P, Vec<P::Subpixel>>) -> Option<(u32, u32, u32, u32)>
where
    P: Pixel + PartialEq,
{
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return None;
    }
    let background = *image.get_pixel(0, 0);
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (width, height, 0, 0);
    for (x, y, pixel) in image.enumerate_pixels() {
        if *pixel != background {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
    }
    (min_x <= max_x).then(|| (min_x, min_y, max_x - min_x + 1, max_y - min_y + 1))
}

pub fn trim_borders<P>(image: &ImageBuffer<P, Vec<P::Subpixel>>) -> ImageBuffer<P, Vec<P::Subpixel>>
where
    P: Pixel + PartialEq + 'static,
{
    match content_bounds(image) {
        Some((x, y, w, h)) => imageops::crop_imm(image, x, y, w, h).to_image(),
        None => image.clone(),
    }
}

fn trim_and_resize<P>(image: &ImageBuffer<P, Vec<u8>>, width: u32, height: u32) -> Vec<u8>
where
    P: Pixel<Subpixel = u8> + PartialEq + 'static,
{
    let trimmed = trim_borders(image);
    imageops::resize(&trimmed, width, height, FilterType::Lanczos3).into_raw()
}

pub fn rectify(
    image: &DynamicImage,
    bbox: &BoundingBox,
    options: &RectifyOptions,
) -> Result<RasterArtifact> {
    let RectifyOptions {
        width,
        height,
        band_mode,
        output_bands,
    } = *options;
    if width == 0 || height == 0 {
        return Err(IngestError::InvalidInput(format!(
            "target raster size {width}x{height} is empty"
        )));
    }
    if bbox.xmax <= bbox.xmin || bbox.ymax <= bbox.ymin {
        return Err(IngestError::Raster(format!(
            "bounding box {} has no area",
            bbox.to_bbox_string()
        )));
    }

    let (bands, pixels) = match band_mode {
        BandMode::Intensity => {
            if !(1..=4).contains(&output_bands) {
                return Err(IngestError::InvalidInput(format!(
                    "cannot write {output_bands} bands"
                )));
            }
            let intensity = trim_and_resize(&image.to_luma8(), width, height);
            let pixels = intensity
                .iter()
                .flat_map(|v| std::iter::repeat(*v).take(output_bands as usize))
                .collect();
            (output_bands, pixels)
        }
        BandMode::Preserve => match image.color().channel_count() {
            1 => (1, trim_and_resize(&image.to_luma8(), width, height)),
            2 => (2, trim_and_resize(&image.to_luma_alpha8(), width, height)),
            3 => (3, trim_and_resize(&image.to_rgb8(), width, height)),
            _ => (4, trim_and_resize(&image.to_rgba8(), width, height)),
        },
    };

    Ok(RasterArtifact {
        width,
        height,
        bands,
        pixels,
        transform: GeoTransform::from_bounds(bbox, width, height),
        epsg: EPSG_WGS84,
    })
}

/// Two 8-bit intensity samples per pixel, as GDAL writes a two-band byte raster.
struct DualGray8;

impl ColorType for DualGray8 {
    type Inner = u8;
    const TIFF_VALUE: PhotometricInterpretation = PhotometricInterpretation::BlackIsZero;
    const BITS_PER_SAMPLE: &'static [u16] = &[8, 8];
    const SAMPLE_FORMAT: &'static [SampleFormat] = &[SampleFormat::Uint, SampleFormat::Uint];

    fn horizontal_predict(row: &[u8], result: &mut Vec<u8>) {
        let samples = Self::SAMPLE_FORMAT.len();
        result.extend(row.iter().enumerate().map(|(i, v)| {
            if i < samples {
                *v
            } else {
                v.wrapping_sub(row[i - samples])
            }
        }));
    }
}

fn encode<C, W>(encoder: &mut TiffEncoder<W>, artifact: &RasterArtifact) -> Result<()>
where
    C: ColorType<Inner = u8>,
    W: Write + Seek,
{
    let (scale_x, scale_y) = artifact.transform.pixel_size();
    let [left, _, _, top, _, _] = artifact.transform.0;

    let mut image = encoder.new_image::<C>(artifact.width, artifact.height)?;
    let directory = image.encoder();
    directory.write_tag(Tag::Unknown(MODEL_PIXEL_SCALE), &[scale_x, scale_y, 0.0][..])?;
    directory.write_tag(
        Tag::Unknown(MODEL_TIEPOINT),
        &[0.0, 0.0, 0.0, left, top, 0.0][..],
    )?;
    directory.write_tag(
        Tag::Unknown(GEO_KEY_DIRECTORY),
        &[
            1, 1, 0, 4, // header, 4 keys
            1024, 0, 1, 2, // model type geographic
            1025, 0, 1, 1, // raster pixel is area
            2048, 0, 1, artifact.epsg, // geographic CRS
            2049, GEO_ASCII_PARAMS, CITATION.len() as u16, 0, // citation
        ][..],
    )?;
    directory.write_tag(Tag::Unknown(GEO_ASCII_PARAMS), CITATION)?;
    if artifact.bands == 2 {
        directory.write_tag(Tag::Unknown(EXTRA_SAMPLES), &[0u16][..])?;
    }
    image.write_data(&artifact.pixels)?;
    Ok(())
}

pub fn write_geotiff<P: AsRef<Path>>(artifact: &RasterArtifact, path: P) -> Result<()> {
    let expected = artifact.width as usize * artifact.height as usize * artifact.bands as usize;
    if artifact.pixels.len() != expected {
        return Err(IngestError::Raster(format!(
            "{} pixel values for a {}x{}x{} raster",
            artifact.pixels.len(),
            artifact.width,
            artifact.height,
            artifact.bands
        )));
    }

    let file = BufWriter::new(File::create(path.as_ref())?);
    let mut encoder = TiffEncoder::new(file)?;
    match artifact.bands {
        1 => encode::<colortype::Gray8, _>(&mut encoder, artifact),
        2 => encode::<DualGray8, _>(&mut encoder, artifact),
        3 => encode::<colortype::RGB8, _>(&mut encoder, artifact),
        4 => encode::<colortype::RGBA8, _>(&mut encoder, artifact),
        n => Err(IngestError::Raster(format!("cannot write {n} bands"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbImage};
    use tiff::decoder::Decoder;

    fn unit_box() -> BoundingBox {
        BoundingBox::new(-1.0, -1.0, 1.0, 1.0).unwrap()
    }

    /// 300x300 black with a 100x100 white square in the bottom-right corner.
    fn fixture() -> GrayImage {
        GrayImage::from_fn(300, 300, |x, y| {
            if x >= 200 && y >= 200 {
                Luma([255])
            } else {
                Luma([0])
            }
        })
    }

    fn options(band_mode: BandMode, output_bands: u16) -> RectifyOptions {
        RectifyOptions {
            width: 50,
            height: 50,
            band_mode,
            output_bands,
        }
    }

    #[test]
    fn test_trim_crops_to_content() {
        let image = fixture();
        assert_eq!(content_bounds(&image), Some((200, 200, 100, 100)));
        assert_eq!(trim_borders(&image).dimensions(), (100, 100));
    }

    #[test]
    fn test_uniform_image_is_not_cropped() {
        let image = GrayImage::from_pixel(40, 30, Luma([7]));
        assert_eq!(content_bounds(&image), None);
        assert_eq!(trim_borders(&image).dimensions(), (40, 30));
    }

    #[test]
    fn test_rectify_fixture() {
        let image = DynamicImage::ImageLuma8(fixture());
        let artifact = rectify(&image, &unit_box(), &options(BandMode::Intensity, 2)).unwrap();

        assert_eq!((artifact.width, artifact.height, artifact.bands), (50, 50, 2));
        assert_eq!(artifact.pixels.len(), 50 * 50 * 2);
        assert!(artifact.pixels.iter().all(|v| *v > 250));
        assert_eq!(artifact.transform.apply(0.0, 0.0), (-1.0, 1.0));
        let (x, y) = artifact.transform.apply(50.0, 50.0);
        assert!((x - 1.0).abs() < 1e-12 && (y + 1.0).abs() < 1e-12);
        assert_eq!(artifact.transform.pixel_size(), (0.04, 0.04));
        assert_eq!(artifact.epsg, 4326);
    }

    #[test]
    fn test_preserve_keeps_colour_bands() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(20, 20, Rgb([10, 20, 30])));
        let artifact = rectify(&image, &unit_box(), &options(BandMode::Preserve, 2)).unwrap();
        assert_eq!(artifact.bands, 3);
        assert_eq!(artifact.pixels.len(), 50 * 50 * 3);
    }

    #[test]
    fn test_degenerate_inputs_are_rejected() {
        let image = DynamicImage::ImageLuma8(fixture());
        let flat = BoundingBox::new(1.0, -1.0, 1.0, 1.0).unwrap();
        assert!(rectify(&image, &flat, &options(BandMode::Intensity, 2)).is_err());
        let mut empty = options(BandMode::Intensity, 2);
        empty.width = 0;
        assert!(rectify(&image, &unit_box(), &empty).is_err());
    }

    #[test]
    fn test_geotiff_tags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixture.tif");
        let image = DynamicImage::ImageLuma8(fixture());
        let artifact = rectify(&image, &unit_box(), &options(BandMode::Intensity, 2)).unwrap();
        write_geotiff(&artifact, &path).unwrap();

        let mut decoder = Decoder::new(File::open(&path).unwrap()).unwrap();
        assert_eq!(decoder.dimensions().unwrap(), (50, 50));
        let scale = decoder.get_tag_f64_vec(Tag::Unknown(MODEL_PIXEL_SCALE)).unwrap();
        assert_eq!(scale, vec![0.04, 0.04, 0.0]);
        let tiepoint = decoder.get_tag_f64_vec(Tag::Unknown(MODEL_TIEPOINT)).unwrap();
        assert_eq!(&tiepoint[3..5], &[-1.0, 1.0]);
        let keys = decoder.get_tag_u16_vec(Tag::Unknown(GEO_KEY_DIRECTORY)).unwrap();
        assert!(keys.chunks(4).any(|k| k == [2048, 0, 1, 4326]));
    }

    #[test]
    fn test_pixel_count_mismatch_is_rejected() {
        let artifact = RasterArtifact {
            width: 2,
            height: 2,
            bands: 2,
            pixels: vec![0; 3],
            transform: GeoTransform::from_bounds(&unit_box(), 2, 2),
            epsg: EPSG_WGS84,
        };
        let dir = tempfile::tempdir().unwrap();
        assert!(write_geotiff(&artifact, dir.path().join("bad.tif")).is_err());
    }
}
