//! Image → PDF rasterisation.
//!
//! An image becomes a single PDF page sized to the tablet screen: the page
//! canvas is exactly `page_width_px × page_height_px` pixels, and the PDF
//! page is `px × 72 / dpi` points on each side, so the device shows it at
//! 1:1 without resampling. Images larger than the canvas are downscaled to
//! fit; smaller ones keep their size. Either way the image is centred on
//! white, and transparency is flattened onto that white.
//!
//! Decoding and encoding are CPU-bound and run in `spawn_blocking`.

use crate::config::DeliveryConfig;
use crate::error::ToolError;
use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader, Rgb, RgbImage};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use std::path::Path;
use tracing::{debug, info};

/// Extensions rasterised before delivery.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp"];

/// JPEG quality of the embedded page image.
const PAGE_JPEG_QUALITY: u8 = 90;

pub fn is_image_extension(ext: &str) -> bool {
    IMAGE_EXTENSIONS.contains(&ext)
}

/// Target page: pixel canvas plus the density that maps it to paper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageGeometry {
    pub width_px: u32,
    pub height_px: u32,
    pub dpi: u32,
}

impl PageGeometry {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            width_px: config.page_width_px,
            height_px: config.page_height_px,
            dpi: config.dpi,
        }
    }

    /// PDF page size in points.
    pub fn page_size_pt(&self) -> (f32, f32) {
        let scale = 72.0 / self.dpi.max(1) as f32;
        (self.width_px as f32 * scale, self.height_px as f32 * scale)
    }

    /// Size an image takes on the canvas: scaled down to fit, never up.
    pub fn fit(&self, img_w: u32, img_h: u32) -> (u32, u32) {
        if img_w == 0 || img_h == 0 {
            return (0, 0);
        }
        if img_w <= self.width_px && img_h <= self.height_px {
            return (img_w, img_h);
        }
        let ratio = f64::min(
            self.width_px as f64 / img_w as f64,
            self.height_px as f64 / img_h as f64,
        );
        let w = ((img_w as f64 * ratio).round() as u32).clamp(1, self.width_px);
        let h = ((img_h as f64 * ratio).round() as u32).clamp(1, self.height_px);
        (w, h)
    }
}

/// Turns one image file into a one-page PDF.
#[async_trait]
pub trait Rasterizer: Send + Sync {
    async fn rasterize(
        &self,
        input: &Path,
        output: &Path,
        geometry: &PageGeometry,
    ) -> Result<(), ToolError>;
}

/// In-process rasteriser built on `image` and `lopdf`.
pub struct NativeRasterizer;

#[async_trait]
impl Rasterizer for NativeRasterizer {
    async fn rasterize(
        &self,
        input: &Path,
        output: &Path,
        geometry: &PageGeometry,
    ) -> Result<(), ToolError> {
        let input = input.to_path_buf();
        let output = output.to_path_buf();
        let geometry = *geometry;
        tokio::task::spawn_blocking(move || rasterize_blocking(&input, &output, &geometry))
            .await
            .map_err(|e| ToolError::Pdf(format!("rasterise task panicked: {e}")))?
    }
}

fn rasterize_blocking(input: &Path, output: &Path, geometry: &PageGeometry) -> Result<(), ToolError> {
    let img = ImageReader::open(input)?.with_guessed_format()?.decode()?;
    info!(
        "Rasterising {} ({}x{}) onto {}x{} @ {} dpi",
        input.display(),
        img.width(),
        img.height(),
        geometry.width_px,
        geometry.height_px,
        geometry.dpi
    );

    let canvas = compose_page(&img, geometry);

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, PAGE_JPEG_QUALITY).encode_image(&canvas)?;
    debug!("Page image encoded → {} bytes", jpeg.len());

    write_image_pdf(output, jpeg, geometry)
}

/// The white page canvas with the fitted image centred on it.
pub fn compose_page(img: &DynamicImage, geometry: &PageGeometry) -> RgbImage {
    let (w, h) = geometry.fit(img.width(), img.height());
    let scaled = if (w, h) == (img.width(), img.height()) {
        img.to_rgba8()
    } else {
        img.resize_exact(w, h, FilterType::Lanczos3).to_rgba8()
    };

    let mut canvas = RgbImage::from_pixel(geometry.width_px, geometry.height_px, Rgb([255, 255, 255]));
    let x0 = (geometry.width_px - w) / 2;
    let y0 = (geometry.height_px - h) / 2;
    for (x, y, px) in scaled.enumerate_pixels() {
        let a = u32::from(px[3]);
        let blend = |c: u8| ((u32::from(c) * a + 255 * (255 - a)) / 255) as u8;
        canvas.put_pixel(x0 + x, y0 + y, Rgb([blend(px[0]), blend(px[1]), blend(px[2])]));
    }
    canvas
}

/// Write a single-page PDF whose page is exactly covered by `jpeg`.
fn write_image_pdf(output: &Path, jpeg: Vec<u8>, geometry: &PageGeometry) -> Result<(), ToolError> {
    let pdf_err = |e: lopdf::Error| ToolError::Pdf(e.to_string());
    let (page_w, page_h) = geometry.page_size_pt();

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let image_id = doc.add_object(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => i64::from(geometry.width_px),
            "Height" => i64::from(geometry.height_px),
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8,
            "Filter" => "DCTDecode",
        },
        jpeg,
    ));

    let content = Content {
        operations: vec![
            Operation::new("q", vec![]),
            Operation::new(
                "cm",
                vec![
                    page_w.into(),
                    0.into(),
                    0.into(),
                    page_h.into(),
                    0.into(),
                    0.into(),
                ],
            ),
            Operation::new("Do", vec!["Im0".into()]),
            Operation::new("Q", vec![]),
        ],
    };
    let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().map_err(pdf_err)?));

    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "MediaBox" => vec![0.into(), 0.into(), page_w.into(), page_h.into()],
        "Contents" => content_id,
        "Resources" => dictionary! {
            "XObject" => dictionary! { "Im0" => image_id },
        },
    });

    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    doc.save(output).map_err(|e| ToolError::Pdf(e.to_string()))?;
    Ok(())
}

/// File name for a converted image: same stem, `.pdf`.
pub fn pdf_name_for(input: &Path) -> String {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    format!("{stem}.pdf")
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn geometry() -> PageGeometry {
        PageGeometry {
            width_px: 1404,
            height_px: 1872,
            dpi: 226,
        }
    }

    #[test]
    fn page_size_matches_density() {
        let (w, h) = geometry().page_size_pt();
        assert!((w - 1404.0 * 72.0 / 226.0).abs() < 0.01);
        assert!((h - 1872.0 * 72.0 / 226.0).abs() < 0.01);
    }

    #[test]
    fn fit_never_upscales() {
        assert_eq!(geometry().fit(100, 50), (100, 50));
        assert_eq!(geometry().fit(1404, 1872), (1404, 1872));
    }

    #[test]
    fn fit_downscales_preserving_aspect() {
        assert_eq!(geometry().fit(2808, 3744), (1404, 1872));
        let (w, h) = geometry().fit(4000, 1000);
        assert_eq!(w, 1404);
        assert_eq!(h, 351);
    }

    #[test]
    fn compose_centres_on_white() {
        let g = PageGeometry {
            width_px: 10,
            height_px: 10,
            dpi: 72,
        };
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(2, 2, Rgba([0, 0, 0, 255])));
        let page = compose_page(&img, &g);
        assert_eq!(page.dimensions(), (10, 10));
        assert_eq!(page.get_pixel(0, 0), &Rgb([255, 255, 255]));
        assert_eq!(page.get_pixel(4, 4), &Rgb([0, 0, 0]));
        assert_eq!(page.get_pixel(5, 5), &Rgb([0, 0, 0]));
        assert_eq!(page.get_pixel(6, 6), &Rgb([255, 255, 255]));
    }

    #[test]
    fn transparency_flattens_to_white() {
        let g = PageGeometry {
            width_px: 4,
            height_px: 4,
            dpi: 72,
        };
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 4, Rgba([0, 0, 0, 0])));
        assert_eq!(compose_page(&img, &g).get_pixel(1, 1), &Rgb([255, 255, 255]));
    }

    #[tokio::test]
    async fn native_rasterizer_writes_pdf() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("photo.png");
        RgbaImage::from_pixel(300, 200, Rgba([200, 10, 10, 255]))
            .save(&input)
            .unwrap();
        assert_eq!(pdf_name_for(&input), "photo.pdf");
        let output = dir.path().join(pdf_name_for(&input));

        let g = PageGeometry {
            width_px: 140,
            height_px: 187,
            dpi: 226,
        };
        NativeRasterizer.rasterize(&input, &output, &g).await.unwrap();

        let bytes = std::fs::read(&output).unwrap();
        assert!(bytes.starts_with(b"%PDF"));
        let doc = Document::load(&output).unwrap();
        assert_eq!(doc.get_pages().len(), 1);
    }

    #[tokio::test]
    async fn undecodable_image_fails() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("broken.jpg");
        std::fs::write(&input, b"not an image").unwrap();
        let out = dir.path().join("broken.pdf");
        assert!(NativeRasterizer.rasterize(&input, &out, &geometry()).await.is_err());
    }

    #[test]
    fn image_extensions() {
        assert!(is_image_extension("jpeg"));
        assert!(!is_image_extension("pdf"));
    }
}
