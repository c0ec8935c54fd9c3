//! Media upload service.
//!
//! Validates uploads, writes originals and resize variants to storage, and
//! owns the media records plus their owner index.

use std::io::Cursor;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use serde_json::json;
use sqlx::PgPool;
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{Config, ImageSize};
use crate::models::MediaImage;
use crate::models::media_image::NewMediaImage;

use super::reconcile::{MediaPersistence, PendingUpload, SavedMedia};
use super::storage::{self, MediaStorage};

/// Maximum size for a single media file (50 MB).
pub const MAX_MEDIA_SIZE: usize = 50 * 1024 * 1024;

/// MIME types accepted for media upload.
pub const ALLOWED_MEDIA_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "image/avif",
    "image/svg+xml",
];

/// Maximum concurrent variant generation jobs.
/// Prevents CPU exhaustion from many simultaneous uploads.
const MAX_CONCURRENT_PROCESSING: usize = 4;

/// Encode format for resized variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VariantFormat {
    /// Keep the upload's own format.
    Original,
    Jpeg,
    Webp,
}

impl VariantFormat {
    fn parse(raw: &str) -> Self {
        match raw {
            "original" => VariantFormat::Original,
            "jpeg" | "jpg" => VariantFormat::Jpeg,
            "webp" => VariantFormat::Webp,
            other => {
                warn!(format = %other, "unknown media output format, keeping originals");
                VariantFormat::Original
            }
        }
    }
}

/// Outcome of a media delete request.
#[derive(Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
    /// Refused: this many documents still reference the image.
    StillInUse(i64),
}

/// Media service for uploads and the owner index.
pub struct MediaService {
    pool: PgPool,
    storage: Arc<dyn MediaStorage>,
    image_sizes: Vec<ImageSize>,
    variant_format: VariantFormat,
    variant_quality: u8,
    /// Semaphore limiting concurrent image processing to prevent CPU
    /// exhaustion.
    processing_semaphore: Arc<Semaphore>,
}

impl MediaService {
    /// Create a new media service.
    pub fn new(pool: PgPool, storage: Arc<dyn MediaStorage>, config: &Config) -> Self {
        Self {
            pool,
            storage,
            image_sizes: config.image_sizes.clone(),
            variant_format: VariantFormat::parse(&config.media_output_format),
            variant_quality: config.media_output_quality.clamp(1, 100),
            processing_semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_PROCESSING)),
        }
    }

    /// Persist an uploaded media file.
    ///
    /// Validates size and type against the sniffed content, writes the
    /// original and any configured resize variants to storage, then inserts
    /// the media record. Returns the record and its public URL.
    pub async fn save_media(
        &self,
        uploaded_by: Uuid,
        filename: &str,
        declared_type: &str,
        data: Vec<u8>,
    ) -> Result<(MediaImage, String)> {
        if filename.is_empty() {
            bail!("uploaded file has no filename");
        }
        if data.is_empty() {
            bail!("uploaded file is empty");
        }
        if data.len() > MAX_MEDIA_SIZE {
            bail!(
                "file too large: {} bytes (max {} bytes)",
                data.len(),
                MAX_MEDIA_SIZE
            );
        }

        let mime_type = detect_mime(declared_type, &data)?;

        let uri = match self.storage.scheme() {
            "local" => storage::generate_uri(filename),
            scheme => bail!("unsupported storage scheme: {scheme}"),
        };

        self.storage
            .write(&uri, &data)
            .await
            .context("failed to write media file")?;

        let (dimensions, variants) = if is_resizable(&mime_type) {
            self.generate_variants(&uri, &mime_type, &data).await?
        } else {
            debug!(mime_type = %mime_type, "variant generation skipped for this type");
            (None, json!({}))
        };

        let record = MediaImage::create(
            &self.pool,
            NewMediaImage {
                id: Uuid::now_v7(),
                filename: filename.to_string(),
                uri: uri.clone(),
                mime_type,
                filesize: data.len() as i64,
                width: dimensions.map(|(w, _)| w as i32),
                height: dimensions.map(|(_, h)| h as i32),
                variants,
                uploaded_by,
            },
        )
        .await?;

        let url = self.storage.public_url(&uri);

        debug!(
            media_id = %record.id,
            filename = %filename,
            uri = %uri,
            size = data.len(),
            "media file saved"
        );

        Ok((record, url))
    }

    /// Decode the upload and write one resized rendition per configured
    /// size, bounded by the processing semaphore.
    async fn generate_variants(
        &self,
        original_uri: &str,
        mime_type: &str,
        data: &[u8],
    ) -> Result<(Option<(u32, u32)>, serde_json::Value)> {
        // Dimensions come from the image header; a full decode only happens
        // when variants are configured.
        let dimensions = read_dimensions(data);

        if self.image_sizes.is_empty() {
            return Ok((dimensions, json!({})));
        }

        let _permit = self
            .processing_semaphore
            .acquire()
            .await
            .map_err(|_| anyhow::anyhow!("media processing semaphore closed"))?;

        // Resize on a blocking thread to avoid starving the Tokio runtime
        // with CPU-intensive decoding/encoding.
        let sizes = self.image_sizes.clone();
        let format = self.variant_format;
        let quality = self.variant_quality;
        let source_mime = mime_type.to_string();
        let bytes = data.to_vec();
        let rendered = tokio::task::spawn_blocking(move || {
            render_variants(&bytes, &source_mime, &sizes, format, quality)
        })
        .await
        .context("variant generation task panicked")??;

        let mut variants = serde_json::Map::new();
        for variant in rendered {
            let uri = variant_uri(original_uri, &variant.size_name, variant.extension);
            self.storage
                .write(&uri, &variant.data)
                .await
                .context("failed to write media variant")?;

            variants.insert(
                variant.size_name,
                json!({
                    "uri": uri,
                    "width": variant.width,
                    "height": variant.height,
                }),
            );
        }

        Ok((dimensions, serde_json::Value::Object(variants)))
    }

    /// Delete a media record and its stored files.
    ///
    /// Refused while any document still references the image.
    pub async fn delete_media(&self, id: Uuid) -> Result<DeleteOutcome> {
        let Some(image) = MediaImage::find_by_id(&self.pool, id).await? else {
            return Ok(DeleteOutcome::NotFound);
        };

        let used_by = MediaImage::usage_count(&self.pool, id).await?;
        if used_by > 0 {
            return Ok(DeleteOutcome::StillInUse(used_by));
        }

        // Storage failures are logged, not fatal: the record is the source
        // of truth and must go away regardless.
        if let Err(e) = self.storage.delete(&image.uri).await {
            warn!(error = %e, uri = %image.uri, "failed to delete media file from storage");
        }
        for uri in variant_uris(&image.variants) {
            if let Err(e) = self.storage.delete(&uri).await {
                warn!(error = %e, uri = %uri, "failed to delete media variant from storage");
            }
        }

        MediaImage::delete(&self.pool, id).await?;

        debug!(media_id = %id, "media image deleted");
        Ok(DeleteOutcome::Deleted)
    }

    /// Remove one document from one image's owner set.
    pub async fn remove_usage(&self, media_id: Uuid, document_id: Uuid) -> Result<bool> {
        MediaImage::remove_usage(&self.pool, media_id, document_id).await
    }

    /// The storage backend.
    pub fn storage(&self) -> &Arc<dyn MediaStorage> {
        &self.storage
    }
}

#[async_trait]
impl MediaPersistence for MediaService {
    async fn save(&self, upload: PendingUpload, owner: Uuid) -> Result<SavedMedia> {
        let (record, url) = self
            .save_media(owner, &upload.filename, &upload.content_type, upload.data)
            .await?;
        Ok(SavedMedia {
            id: record.id,
            url,
        })
    }

    async fn add_usage(&self, media_id: Uuid, document_id: Uuid) -> Result<bool> {
        MediaImage::add_usage(&self.pool, media_id, document_id).await
    }

    async fn detach_owner(&self, document_id: Uuid) -> Result<u64> {
        MediaImage::detach_document(&self.pool, document_id).await
    }
}

impl std::fmt::Debug for MediaService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaService")
            .field("image_sizes", &self.image_sizes)
            .field("variant_format", &self.variant_format)
            .finish()
    }
}

/// One resized rendition produced on the blocking thread.
struct RenderedVariant {
    size_name: String,
    data: Vec<u8>,
    extension: &'static str,
    width: u32,
    height: u32,
}

/// Decode once and produce every configured rendition narrower than the
/// source. Upscaling is never done.
fn render_variants(
    data: &[u8],
    source_mime: &str,
    sizes: &[ImageSize],
    format: VariantFormat,
    quality: u8,
) -> Result<Vec<RenderedVariant>> {
    let img = image::load_from_memory(data).context("failed to decode image")?;

    let (target_format, extension) = match format {
        VariantFormat::Jpeg => (ImageFormat::Jpeg, "jpg"),
        VariantFormat::Webp => (ImageFormat::WebP, "webp"),
        VariantFormat::Original => source_format(source_mime)?,
    };

    let mut rendered = Vec::new();
    for size in sizes {
        if size.width >= img.width() {
            debug!(size = %size.name, "source narrower than variant, skipping");
            continue;
        }

        let resized = img.resize(
            size.width,
            scaled_height(&img, size.width),
            FilterType::Lanczos3,
        );
        let data = encode(&resized, target_format, quality)?;

        rendered.push(RenderedVariant {
            size_name: size.name.clone(),
            data,
            extension,
            width: resized.width(),
            height: resized.height(),
        });
    }

    Ok(rendered)
}

/// Proportional height for a target width.
fn scaled_height(img: &DynamicImage, width: u32) -> u32 {
    let ratio = width as f64 / img.width().max(1) as f64;
    (img.height() as f64 * ratio) as u32
}

/// Storage format matching a sniffed MIME type.
fn source_format(mime_type: &str) -> Result<(ImageFormat, &'static str)> {
    match mime_type {
        "image/jpeg" => Ok((ImageFormat::Jpeg, "jpg")),
        "image/png" => Ok((ImageFormat::Png, "png")),
        "image/webp" => Ok((ImageFormat::WebP, "webp")),
        other => bail!("no variant format for {other}"),
    }
}

/// Encode a rendition, honoring quality for lossy formats.
fn encode(img: &DynamicImage, format: ImageFormat, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    match format {
        ImageFormat::Jpeg => {
            // JPEG has no alpha channel.
            let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
            let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality);
            rgb.write_with_encoder(encoder)
                .context("failed to encode jpeg variant")?;
        }
        _ => {
            img.write_to(&mut buf, format)
                .context("failed to encode variant")?;
        }
    }
    Ok(buf.into_inner())
}

/// Image dimensions from the header, without a full decode.
fn read_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    image::ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

/// Types that go through variant generation. SVG and animated formats are
/// stored as uploaded.
fn is_resizable(mime_type: &str) -> bool {
    matches!(mime_type, "image/jpeg" | "image/png" | "image/webp")
}

/// Determine the effective MIME type of an upload.
///
/// Content sniffing wins over the declared type; the declared type is only
/// trusted for SVG, which has no magic bytes.
fn detect_mime(declared: &str, data: &[u8]) -> Result<String> {
    let detected = infer::get(data).map(|kind| kind.mime_type());

    let mime_type = match detected {
        Some(sniffed) => sniffed.to_string(),
        None if declared == "image/svg+xml" && looks_like_svg(data) => declared.to_string(),
        None => bail!("could not determine file type"),
    };

    if !ALLOWED_MEDIA_TYPES.contains(&mime_type.as_str()) {
        bail!("file type not allowed: {mime_type}");
    }

    Ok(mime_type)
}

/// Cheap structural check that a text upload is actually SVG.
fn looks_like_svg(data: &[u8]) -> bool {
    let head = &data[..data.len().min(1024)];
    let Ok(text) = std::str::from_utf8(head) else {
        return false;
    };

    let trimmed = text.trim_start();
    trimmed.starts_with("<svg") || (trimmed.starts_with("<?xml") && text.contains("<svg"))
}

/// Derive a variant URI from the original: `.../abcd_photo.png` with size
/// `sm` becomes `.../abcd_photo_sm.<ext>`.
fn variant_uri(original: &str, size_name: &str, extension: &str) -> String {
    match original.rsplit_once('.') {
        Some((stem, _)) => format!("{stem}_{size_name}.{extension}"),
        None => format!("{original}_{size_name}.{extension}"),
    }
}

/// Storage URIs recorded in a variants map.
fn variant_uris(variants: &serde_json::Value) -> Vec<String> {
    variants
        .as_object()
        .map(|map| {
            map.values()
                .filter_map(|v| v.get("uri").and_then(|u| u.as_str()))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    /// Minimal 1x1 PNG, enough for sniffing and decoding.
    fn tiny_png() -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(1, 1, image::Rgba([10, 20, 30, 255]));
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    #[test]
    fn detect_mime_prefers_sniffed_type() {
        // Declared type lies; magic bytes say PNG.
        let mime = detect_mime("image/jpeg", &tiny_png()).unwrap();
        assert_eq!(mime, "image/png");
    }

    #[test]
    fn detect_mime_rejects_disallowed_type() {
        let pdf = b"%PDF-1.4 trailing bytes beyond the magic";
        let err = detect_mime("image/png", pdf).unwrap_err();
        assert!(err.to_string().contains("not allowed"), "{err}");
    }

    #[test]
    fn detect_mime_rejects_unidentifiable_data() {
        assert!(detect_mime("image/png", b"just some text").is_err());
    }

    #[test]
    fn detect_mime_trusts_declared_svg() {
        let svg = br#"<svg xmlns="http://www.w3.org/2000/svg"><rect/></svg>"#;
        let mime = detect_mime("image/svg+xml", svg).unwrap();
        assert_eq!(mime, "image/svg+xml");

        // Plain text declared as SVG is not SVG.
        assert!(detect_mime("image/svg+xml", b"hello world").is_err());
    }

    #[test]
    fn variant_format_parsing() {
        assert_eq!(VariantFormat::parse("original"), VariantFormat::Original);
        assert_eq!(VariantFormat::parse("jpeg"), VariantFormat::Jpeg);
        assert_eq!(VariantFormat::parse("jpg"), VariantFormat::Jpeg);
        assert_eq!(VariantFormat::parse("webp"), VariantFormat::Webp);
        assert_eq!(VariantFormat::parse("tiff"), VariantFormat::Original);
    }

    #[test]
    fn variant_uri_replaces_extension() {
        assert_eq!(
            variant_uri("local://2026/08/abcd_photo.png", "sm", "webp"),
            "local://2026/08/abcd_photo_sm.webp"
        );
        assert_eq!(
            variant_uri("local://2026/08/abcd_photo", "sm", "jpg"),
            "local://2026/08/abcd_photo_sm.jpg"
        );
    }

    #[test]
    fn variant_uris_extraction() {
        let variants = json!({
            "sm": {"uri": "local://a_sm.webp", "width": 600, "height": 400},
            "md": {"uri": "local://a_md.webp", "width": 900, "height": 600},
        });
        let mut uris = variant_uris(&variants);
        uris.sort();
        assert_eq!(uris, vec!["local://a_md.webp", "local://a_sm.webp"]);

        assert!(variant_uris(&json!({})).is_empty());
        assert!(variant_uris(&json!(null)).is_empty());
    }

    #[test]
    fn render_variants_skips_upscales() {
        let img = image::RgbaImage::from_pixel(100, 50, image::Rgba([1, 2, 3, 255]));
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();

        let sizes = vec![
            ImageSize {
                name: "sm".to_string(),
                width: 40,
            },
            ImageSize {
                name: "lg".to_string(),
                width: 200,
            },
        ];

        let rendered =
            render_variants(&buf.into_inner(), "image/png", &sizes, VariantFormat::Jpeg, 80)
                .unwrap();

        // Only the downscale is produced, proportionally.
        assert_eq!(rendered.len(), 1);
        assert_eq!(rendered[0].size_name, "sm");
        assert_eq!(rendered[0].extension, "jpg");
        assert_eq!((rendered[0].width, rendered[0].height), (40, 20));
        assert!(!rendered[0].data.is_empty());
    }

    #[test]
    fn encode_jpeg_drops_alpha() {
        let img = DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(
            4,
            4,
            image::Rgba([255, 0, 0, 128]),
        ));
        let data = encode(&img, ImageFormat::Jpeg, 80).unwrap();
        assert_eq!(infer::get(&data).map(|k| k.mime_type()), Some("image/jpeg"));
    }

    #[test]
    fn read_dimensions_from_header() {
        assert_eq!(read_dimensions(&tiny_png()), Some((1, 1)));
        assert_eq!(read_dimensions(b"not an image"), None);
    }
}
