//! Attachment cache and uploader.
//!
//! `enrich` turns raw attachment refs into payload descriptors without
//! touching the network. `upload` normalizes heavy or oversized images to a
//! JPEG within the size/edge bounds, ships the bytes to the orchestrator's
//! photo endpoint, and caches the guid → photo id mapping so retries never
//! re-upload.
//!
//! Transcoding is CPU work; it runs on the blocking pool.

use crate::context::ContextRecord;
use crate::storage::{StateStore, StorageError};
use crate::tailer::AttachmentRef;
use crate::telemetry::{Telemetry, TelemetryEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use edge_protocol::{AttachmentDescriptor, PhotoUploadResponse};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use rusqlite::{OptionalExtension, params};
use tracing::{debug, warn};

/// Upload size ceiling after normalization.
pub const MAX_UPLOAD_BYTES: u64 = 5 * 1024 * 1024;

/// JPEG quality rungs tried in order until the size target is met.
const JPEG_QUALITY_LADDER: &[u8] = &[85, 70, 55, 40];

/// Container formats always normalized regardless of size.
const HEAVY_MIME_TYPES: &[&str] = &["image/heic", "image/heif", "image/tiff"];

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A successful upload, as cached.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedAttachment {
    pub guid: String,
    pub remote_photo_id: String,
    pub uploaded_at: DateTime<Utc>,
    pub transcoded: bool,
    pub normalized_bytes: u64,
    pub context_snapshot: Option<serde_json::Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// Transient network failure; the orchestrator may command a retry.
    #[error("upload failed: {0}")]
    UploadFailed(String),
    /// Transcoding cannot reach the size target. Terminal.
    #[error("attachment {0} exceeds the upload ceiling after transcoding")]
    AttachmentTooLarge(String),
    /// The guid no longer resolves to a readable file.
    #[error("attachment {0} is not resolvable")]
    Unresolvable(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

// ---------------------------------------------------------------------------
// Capability seams
// ---------------------------------------------------------------------------

/// Look up an attachment ref by guid. Implemented by the chat source so the
/// tailer keeps exclusive ownership of the external-store read path.
pub trait AttachmentResolver: Send + Sync {
    fn resolve_guid(&self, guid: &str) -> Option<AttachmentRef>;
}

/// Ship normalized bytes to the orchestrator's photo endpoint.
#[async_trait]
pub trait PhotoUpload: Send + Sync {
    async fn upload_photo(
        &self,
        guid: &str,
        bytes: Vec<u8>,
        mime_type: &str,
    ) -> Result<PhotoUploadResponse, String>;
}

// ---------------------------------------------------------------------------
// Uploader
// ---------------------------------------------------------------------------

pub struct AttachmentUploader {
    store: StateStore,
    resolver: std::sync::Arc<dyn AttachmentResolver>,
    photos: std::sync::Arc<dyn PhotoUpload>,
    telemetry: Telemetry,
    max_edge_px: u32,
}

impl AttachmentUploader {
    pub fn new(
        store: StateStore,
        resolver: std::sync::Arc<dyn AttachmentResolver>,
        photos: std::sync::Arc<dyn PhotoUpload>,
        telemetry: Telemetry,
        max_edge_px: u32,
    ) -> Self {
        AttachmentUploader {
            store,
            resolver,
            photos,
            telemetry,
            max_edge_px,
        }
    }

    /// Describe attachments for an ingest payload without uploading.
    ///
    /// Sizes come from the filesystem when the file is readable; an
    /// unreadable file keeps the store-claimed size and carries a skip
    /// reason.
    pub fn enrich(&self, attachments: &[AttachmentRef]) -> Vec<AttachmentDescriptor> {
        attachments
            .iter()
            .map(|a| {
                let (size_bytes, skip_reason) = match std::fs::metadata(&a.absolute_path) {
                    Ok(meta) => (meta.len(), None),
                    Err(e) => (a.size_bytes, Some(format!("unreadable: {e}"))),
                };
                AttachmentDescriptor {
                    guid: a.guid.clone(),
                    mime_type: a.mime_type.clone(),
                    size_bytes,
                    remote_photo_id: None,
                    skip_reason,
                }
            })
            .collect()
    }

    /// Upload one attachment, idempotent by guid: a cached success row is
    /// returned as-is without touching the file or the network.
    pub async fn upload(
        &self,
        attachment: &AttachmentRef,
        context_snapshot: Option<&ContextRecord>,
    ) -> Result<UploadedAttachment, UploadError> {
        if let Some(cached) = self.cached(&attachment.guid).await? {
            debug!(guid = %attachment.guid, "upload cache hit");
            return Ok(cached);
        }

        self.telemetry.emit(TelemetryEvent::PhotoUploadStarted {
            guid: attachment.guid.clone(),
        });
        let result = self.upload_uncached(attachment, context_snapshot).await;
        match &result {
            Ok(uploaded) => self.telemetry.emit(TelemetryEvent::PhotoUploadCompleted {
                guid: uploaded.guid.clone(),
            }),
            Err(e) => self.telemetry.emit(TelemetryEvent::PhotoUploadFailed {
                guid: attachment.guid.clone(),
                error: e.to_string(),
            }),
        }
        result
    }

    /// Re-run a failed upload. A cached success short-circuits; a guid that
    /// no longer resolves is terminal.
    pub async fn retry(&self, guid: &str) -> Result<UploadedAttachment, UploadError> {
        if let Some(cached) = self.cached(guid).await? {
            return Ok(cached);
        }
        let attachment = self
            .resolver
            .resolve_guid(guid)
            .ok_or_else(|| UploadError::Unresolvable(guid.to_owned()))?;
        self.upload(&attachment, None).await
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn upload_uncached(
        &self,
        attachment: &AttachmentRef,
        context_snapshot: Option<&ContextRecord>,
    ) -> Result<UploadedAttachment, UploadError> {
        let raw = std::fs::read(&attachment.absolute_path)
            .map_err(|_| UploadError::Unresolvable(attachment.guid.clone()))?;

        let needs_normalizing = raw.len() as u64 > MAX_UPLOAD_BYTES
            || HEAVY_MIME_TYPES.contains(&attachment.mime_type.as_str());

        let (bytes, mime_type, transcoded) = if needs_normalizing {
            let max_edge = self.max_edge_px;
            let guid = attachment.guid.clone();
            let normalized =
                tokio::task::spawn_blocking(move || normalize_image(&raw, max_edge, &guid))
                    .await
                    .map_err(|e| UploadError::UploadFailed(format!("transcode task: {e}")))??;
            (normalized, "image/jpeg".to_owned(), true)
        } else {
            (raw, attachment.mime_type.clone(), false)
        };

        let normalized_bytes = bytes.len() as u64;
        let response = self
            .photos
            .upload_photo(&attachment.guid, bytes, &mime_type)
            .await
            .map_err(UploadError::UploadFailed)?;

        let uploaded = UploadedAttachment {
            guid: attachment.guid.clone(),
            remote_photo_id: response.photo_id,
            uploaded_at: Utc::now(),
            transcoded,
            normalized_bytes,
            context_snapshot: context_snapshot
                .map(serde_json::to_value)
                .transpose()
                .unwrap_or(None),
        };
        self.insert_cache(&uploaded).await?;
        Ok(uploaded)
    }

    async fn cached(&self, guid: &str) -> Result<Option<UploadedAttachment>, StorageError> {
        let guid = guid.to_owned();
        let row: Option<(String, String, String, bool, i64, Option<String>)> = self
            .store
            .call(move |conn| {
                conn.query_row(
                    "SELECT guid, remote_photo_id, uploaded_at, transcoded,
                            normalized_bytes, context_snapshot
                     FROM attachment_cache WHERE guid = ?1",
                    params![guid],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                        ))
                    },
                )
                .optional()
            })
            .await?;

        let Some((guid, remote_photo_id, uploaded_at, transcoded, normalized_bytes, snapshot)) = row
        else {
            return Ok(None);
        };
        let context_snapshot = match snapshot {
            Some(blob) => {
                let json = self.store.decrypt(&blob)?;
                Some(serde_json::from_str(&json).map_err(|e| {
                    StorageError::Corrupt(format!("attachment context snapshot: {e}"))
                })?)
            }
            None => None,
        };
        Ok(Some(UploadedAttachment {
            guid,
            remote_photo_id,
            uploaded_at: DateTime::parse_from_rfc3339(&uploaded_at)
                .map_err(|e| StorageError::Corrupt(format!("bad uploaded_at: {e}")))?
                .with_timezone(&Utc),
            transcoded,
            normalized_bytes: u64::try_from(normalized_bytes).unwrap_or(0),
            context_snapshot,
        }))
    }

    async fn insert_cache(&self, uploaded: &UploadedAttachment) -> Result<(), StorageError> {
        let snapshot_blob = uploaded
            .context_snapshot
            .as_ref()
            .map(|v| self.store.encrypt(&v.to_string()));
        let guid = uploaded.guid.clone();
        let photo_id = uploaded.remote_photo_id.clone();
        let uploaded_at = uploaded.uploaded_at.to_rfc3339();
        let transcoded = uploaded.transcoded;
        let normalized_bytes = i64::try_from(uploaded.normalized_bytes).unwrap_or(i64::MAX);
        self.store
            .call(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO attachment_cache
                         (guid, remote_photo_id, uploaded_at, transcoded,
                          normalized_bytes, context_snapshot)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        guid,
                        photo_id,
                        uploaded_at,
                        transcoded,
                        normalized_bytes,
                        snapshot_blob
                    ],
                )
            })
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Image normalization (blocking)
// ---------------------------------------------------------------------------

/// Decode, bound the longest edge, and re-encode as JPEG within the size
/// ceiling, walking down the quality ladder. An undecodable payload passes
/// through unchanged when already small enough.
fn normalize_image(raw: &[u8], max_edge_px: u32, guid: &str) -> Result<Vec<u8>, UploadError> {
    let decoded = match image::load_from_memory(raw) {
        Ok(img) => img,
        Err(e) => {
            if raw.len() as u64 <= MAX_UPLOAD_BYTES {
                warn!(guid, error = %e, "attachment not decodable, uploading original bytes");
                return Ok(raw.to_vec());
            }
            return Err(UploadError::AttachmentTooLarge(guid.to_owned()));
        }
    };

    let bounded = if decoded.width() > max_edge_px || decoded.height() > max_edge_px {
        decoded.resize(max_edge_px, max_edge_px, FilterType::Lanczos3)
    } else {
        decoded
    };
    let rgb = bounded.to_rgb8();

    for &quality in JPEG_QUALITY_LADDER {
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, quality)
            .encode_image(&rgb)
            .map_err(|e| UploadError::UploadFailed(format!("jpeg encode: {e}")))?;
        if out.len() as u64 <= MAX_UPLOAD_BYTES {
            return Ok(out);
        }
    }
    Err(UploadError::AttachmentTooLarge(guid.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::StateKey;
    use crate::storage::APP_SCHEMA;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeResolver {
        known: Vec<AttachmentRef>,
    }

    impl AttachmentResolver for FakeResolver {
        fn resolve_guid(&self, guid: &str) -> Option<AttachmentRef> {
            self.known.iter().find(|a| a.guid == guid).cloned()
        }
    }

    struct FakePhotos {
        uploads: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl PhotoUpload for FakePhotos {
        async fn upload_photo(
            &self,
            guid: &str,
            bytes: Vec<u8>,
            _mime_type: &str,
        ) -> Result<PhotoUploadResponse, String> {
            if self.fail {
                return Err("connection reset".to_owned());
            }
            assert!(bytes.len() as u64 <= MAX_UPLOAD_BYTES);
            let n = self.uploads.fetch_add(1, Ordering::SeqCst);
            Ok(PhotoUploadResponse {
                photo_id: format!("photo-{guid}-{n}"),
                photo_url: format!("https://photos.example.com/{guid}"),
                analysis: None,
            })
        }
    }

    fn write_png(path: &Path, width: u32, height: u32) {
        let img = image::RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 251) as u8, (y % 241) as u8, ((x + y) % 253) as u8])
        });
        img.save(path).unwrap();
    }

    fn uploader(known: Vec<AttachmentRef>, fail: bool) -> (AttachmentUploader, Arc<FakePhotos>) {
        let store = StateStore::open_in_memory(&StateKey([4u8; 32]), APP_SCHEMA).unwrap();
        let photos = Arc::new(FakePhotos {
            uploads: AtomicUsize::new(0),
            fail,
        });
        let uploader = AttachmentUploader::new(
            store,
            Arc::new(FakeResolver { known }),
            photos.clone(),
            Telemetry::capturing().0,
            2048,
        );
        (uploader, photos)
    }

    fn attachment(path: PathBuf, guid: &str, mime: &str) -> AttachmentRef {
        let size_bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        AttachmentRef {
            guid: guid.to_owned(),
            mime_type: mime.to_owned(),
            size_bytes,
            absolute_path: path,
        }
    }

    #[tokio::test]
    async fn enrich_reports_size_without_uploading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pic.png");
        write_png(&path, 64, 64);
        let (uploader, photos) = uploader(vec![], false);

        let descriptors = uploader.enrich(&[attachment(path.clone(), "G-1", "image/png")]);
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].guid, "G-1");
        assert_eq!(
            descriptors[0].size_bytes,
            std::fs::metadata(&path).unwrap().len()
        );
        assert!(descriptors[0].skip_reason.is_none());
        assert_eq!(photos.uploads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn enrich_marks_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let (uploader, _photos) = uploader(vec![], false);
        let gone = attachment(dir.path().join("gone.png"), "G-404", "image/png");
        let descriptors = uploader.enrich(&[gone]);
        assert!(descriptors[0].skip_reason.as_deref().unwrap().starts_with("unreadable"));
    }

    #[tokio::test]
    async fn heavy_mime_is_transcoded_and_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.png");
        write_png(&path, 4000, 2500);
        // Declared HEIC: the decoder sniffs real content, the mime forces
        // the normalization path either way.
        let att = attachment(path, "G-heic", "image/heic");
        let (uploader, _photos) = uploader(vec![], false);

        let uploaded = uploader.upload(&att, None).await.unwrap();
        assert!(uploaded.transcoded);
        assert!(uploaded.normalized_bytes <= MAX_UPLOAD_BYTES);
        assert!(uploaded.remote_photo_id.starts_with("photo-G-heic"));
    }

    #[tokio::test]
    async fn upload_is_idempotent_by_guid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pic.png");
        write_png(&path, 100, 60);
        let att = attachment(path, "G-1", "image/png");
        let (uploader, photos) = uploader(vec![att.clone()], false);

        let first = uploader.upload(&att, None).await.unwrap();
        let second = uploader.upload(&att, None).await.unwrap();
        assert_eq!(first.remote_photo_id, second.remote_photo_id);
        assert_eq!(photos.uploads.load(Ordering::SeqCst), 1, "one real upload");

        // retry on a succeeded guid returns the cached row unchanged.
        let retried = uploader.retry("G-1").await.unwrap();
        assert_eq!(retried.remote_photo_id, first.remote_photo_id);
        assert_eq!(photos.uploads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_after_transient_failure_uploads_again() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pic.png");
        write_png(&path, 100, 60);
        let att = attachment(path, "G-2", "image/png");

        let (failing, _photos) = uploader(vec![att.clone()], true);
        let err = failing.upload(&att, None).await.unwrap_err();
        assert!(matches!(err, UploadError::UploadFailed(_)));

        let (working, photos) = uploader(vec![att.clone()], false);
        let uploaded = working.retry("G-2").await.unwrap();
        assert!(uploaded.remote_photo_id.starts_with("photo-G-2"));
        assert_eq!(photos.uploads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_of_unknown_guid_is_unresolvable() {
        let dir = tempfile::tempdir().unwrap();
        let (uploader, _photos) = uploader(vec![], false);
        let err = uploader.retry("G-nope").await.unwrap_err();
        assert!(matches!(err, UploadError::Unresolvable(_)));
    }

    #[test]
    fn undecodable_oversized_payload_is_terminal() {
        let garbage = vec![0u8; (MAX_UPLOAD_BYTES + 1) as usize];
        let err = normalize_image(&garbage, 2048, "G-big").unwrap_err();
        assert!(matches!(err, UploadError::AttachmentTooLarge(_)));
    }

    #[test]
    fn undecodable_small_payload_passes_through() {
        let garbage = vec![0u8; 128];
        let out = normalize_image(&garbage, 2048, "G-small").unwrap();
        assert_eq!(out, garbage);
    }
}
