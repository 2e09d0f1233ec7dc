//! Image replacement pipeline.
//!
//! `validate -> compress -> upload -> persist reference -> caption`. The
//! caller's replaced callback fires as soon as the reference is persisted;
//! captioning continues in a spawned task whose handle is returned.

pub mod assets;
pub mod compress;
pub mod stage;

use std::sync::Arc;

use chrono::Utc;
use folio_common::perf::StageTimer;
use folio_common::{CacheConfig, ImageConfig};
use smol_str::SmolStr;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use assets::{AssetCache, ImageAsset};
pub use compress::{CompressionPlan, Compressor, ImageFile, JpegCompressor, SUPPORTED_TYPES};
pub use stage::{UploadStage, allowed_transitions, validate_transition};

use crate::client::ChangeStore;
use crate::error::{CaptionError, DraftError, PipelineFailure, UploadError};
use crate::events::DraftEvent;
use crate::model::caption_key;
use crate::notify::Notifier;
use crate::store::{BlobStore, CaptionContext, CaptionService, DraftStore};
use stage::UploadRun;

/// Caption used when generation fails and the asset had none before.
pub const FALLBACK_CAPTION: &str = "Project image";

/// Passed to the replaced callback.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplacedImage {
    pub original_src: SmolStr,
    pub stored_url: String,
}

/// Pending caption generation for one upload.
#[derive(Debug)]
pub struct CaptionHandle {
    task: JoinHandle<Option<String>>,
}

impl CaptionHandle {
    /// The generated caption, or `None` if generation failed or was discarded.
    pub async fn wait(self) -> Option<String> {
        self.task.await.ok().flatten()
    }
}

#[derive(Debug)]
pub struct ReplaceOutcome {
    pub asset: ImageAsset,
    /// The same bytes were already uploaded for this source.
    pub reused: bool,
    pub caption: Option<CaptionHandle>,
}

pub struct ImagePipeline<S, B, C> {
    store: ChangeStore<S>,
    blobs: Arc<B>,
    captions: Arc<C>,
    compressor: Arc<dyn Compressor>,
    config: ImageConfig,
    assets: AssetCache,
    notifier: Notifier,
    cancel: CancellationToken,
}

impl<S, B, C> Clone for ImagePipeline<S, B, C> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            blobs: self.blobs.clone(),
            captions: self.captions.clone(),
            compressor: self.compressor.clone(),
            config: self.config.clone(),
            assets: self.assets.clone(),
            notifier: self.notifier.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<S, B, C> ImagePipeline<S, B, C>
where
    S: DraftStore + 'static,
    B: BlobStore + 'static,
    C: CaptionService + 'static,
{
    pub fn new(
        store: ChangeStore<S>,
        blobs: Arc<B>,
        captions: Arc<C>,
        config: ImageConfig,
        cache: &CacheConfig,
        notifier: Notifier,
    ) -> Self {
        Self {
            store,
            blobs,
            captions,
            compressor: Arc::new(JpegCompressor),
            config,
            assets: AssetCache::new(cache),
            notifier,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_compressor(mut self, compressor: impl Compressor) -> Self {
        self.compressor = Arc::new(compressor);
        self
    }

    pub fn assets(&self) -> &AssetCache {
        &self.assets
    }

    /// Results of captioning still in flight are discarded from now on.
    pub fn teardown(&self) {
        self.cancel.cancel();
    }

    /// Replace `original_src` with `file`.
    ///
    /// On success `on_replaced` has already run when this returns; the caption
    /// may still be pending. Errors carry the stage that failed, and nothing is
    /// persisted for a run that fails before `PersistingReference`.
    pub async fn replace_image<F>(
        &self,
        original_src: &str,
        file: ImageFile,
        on_replaced: F,
    ) -> Result<ReplaceOutcome, DraftError>
    where
        F: FnOnce(&ReplacedImage),
    {
        let src = SmolStr::new(original_src);
        let hash = file.content_hash().to_hex().to_string();
        let _turn = self.assets.turn(original_src).await;

        let existing = self.assets.get(original_src);
        if let Some(asset) = existing.as_ref().filter(|a| a.satisfies(&hash)) {
            debug!(src = original_src, "reusing uploaded asset");
            metrics::counter!("folio_uploads_total", "outcome" => "reused").increment(1);
            if let Some(stored_url) = &asset.stored_url {
                on_replaced(&ReplacedImage {
                    original_src: src,
                    stored_url: stored_url.clone(),
                });
            }
            return Ok(ReplaceOutcome {
                asset: asset.clone(),
                reused: true,
                caption: None,
            });
        }

        let prior_caption = existing.as_ref().and_then(|a| a.caption.clone());
        // The last good URL and the hash of its bytes stay until a new upload
        // is stored, so a failed or abandoned run never loses them.
        self.assets.insert(match existing {
            Some(prior) => ImageAsset {
                is_processing: true,
                error: None,
                ..prior
            },
            None => ImageAsset::processing(src.clone(), String::new(), None),
        });

        let mut run = UploadRun::new(
            self.store.project().clone(),
            src.clone(),
            self.store.events().clone(),
        );
        let stored_url = match self.upload(&mut run, &src, file).await {
            Ok(url) => url,
            Err(err) => {
                let reason = err.to_string();
                let stage = run.fail(&reason);
                self.assets.update(original_src, |a| {
                    a.is_processing = false;
                    a.error = Some(reason.clone());
                });
                metrics::counter!("folio_uploads_total", "outcome" => "failed").increment(1);
                warn!(src = original_src, %stage, error = %reason, "image pipeline failed");
                self.notifier
                    .error(Some(original_src), format!("Image upload failed: {reason}"));
                return Err(PipelineFailure::new(stage, err).into());
            }
        };

        let asset = self
            .assets
            .update(original_src, |a| {
                a.stored_url = Some(stored_url.clone());
                a.content_hash = hash.clone();
            })
            .unwrap_or_else(|| ImageAsset {
                stored_url: Some(stored_url.clone()),
                ..ImageAsset::processing(src.clone(), hash.clone(), prior_caption.clone())
            });
        metrics::counter!("folio_uploads_total", "outcome" => "uploaded").increment(1);
        info!(src = original_src, url = %stored_url, "image replaced");

        if self.cancel.is_cancelled() {
            debug!(src = original_src, "pipeline torn down, skipping replaced callback");
        } else {
            on_replaced(&ReplacedImage {
                original_src: src.clone(),
                stored_url: stored_url.clone(),
            });
        }

        run.advance(UploadStage::CaptionPending, Some(&stored_url))?;
        let caption = self.spawn_caption(run, src, stored_url, prior_caption);

        Ok(ReplaceOutcome {
            asset,
            reused: false,
            caption: Some(caption),
        })
    }

    async fn upload(
        &self,
        run: &mut UploadRun,
        src: &SmolStr,
        file: ImageFile,
    ) -> Result<String, DraftError> {
        run.advance(UploadStage::Validating, None)?;
        let mime_type = file.validate(self.config.max_upload_bytes)?;

        run.advance(UploadStage::Compressing, None)?;
        let compressor = self.compressor.clone();
        let budget = self.config.target_bytes;
        let compressed = tokio::task::spawn_blocking(move || {
            let _timer = StageTimer::start("image_compress");
            compressor.compress(&file, &mime_type, budget)
        })
        .await
        .map_err(|e| UploadError::Task(e.to_string()))??;

        run.advance(UploadStage::Uploading, None)?;
        let uploaded = {
            let _timer = StageTimer::start("image_upload");
            self.blobs
                .upload_image(&compressed, self.store.project(), src)
                .await
        };
        let stored_url = uploaded
            .map_err(|source| UploadError::Store {
                original_src: src.clone(),
                source,
            })?
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| UploadError::NoUrl {
                original_src: src.clone(),
            })?;

        run.advance(UploadStage::PersistingReference, Some(&stored_url))?;
        self.store.save_image(src, stored_url.as_str()).await?;
        Ok(stored_url)
    }

    fn spawn_caption(
        &self,
        mut run: UploadRun,
        src: SmolStr,
        stored_url: String,
        prior_caption: Option<String>,
    ) -> CaptionHandle {
        let captions = self.captions.clone();
        let store = self.store.clone();
        let assets = self.assets.clone();
        let cancel = self.cancel.clone();

        let task = tokio::spawn(async move {
            let generated = {
                let _timer = StageTimer::start("image_caption");
                captions
                    .generate_caption(&stored_url, CaptionContext::ProjectImage)
                    .await
            };
            if cancel.is_cancelled() {
                debug!(src = %src, "pipeline torn down, discarding caption");
                return None;
            }

            let generated = generated.and_then(|caption| {
                let caption = caption.trim();
                if caption.is_empty() {
                    Err(CaptionError::Empty)
                } else {
                    Ok(caption.to_string())
                }
            });

            let caption = match generated {
                Ok(caption) => {
                    assets.update(&src, |a| {
                        a.caption = Some(caption.clone());
                        a.is_processing = false;
                    });
                    if let Err(e) = store
                        .save_text(&caption_key(&src), caption.clone(), None)
                        .await
                    {
                        warn!(src = %src, error = %e, "failed to persist generated caption");
                    }
                    store.events().emit(DraftEvent::CaptionGenerated {
                        project_id: store.project().clone(),
                        original_src: src.clone(),
                        caption: caption.clone(),
                        timestamp: Utc::now(),
                    });
                    metrics::counter!("folio_captions_total", "outcome" => "generated").increment(1);
                    Some(caption)
                }
                Err(e) => {
                    warn!(src = %src, error = %e, "caption generation failed, keeping prior caption");
                    let fallback = prior_caption.unwrap_or_else(|| FALLBACK_CAPTION.to_string());
                    assets.update(&src, |a| {
                        a.caption = Some(fallback);
                        a.is_processing = false;
                    });
                    metrics::counter!("folio_captions_total", "outcome" => "failed").increment(1);
                    None
                }
            };

            if let Err(e) = run.advance(UploadStage::Done, Some(&stored_url)) {
                warn!(src = %src, error = %e, "could not finish image pipeline run");
            }
            caption
        });

        CaptionHandle { task }
    }
}
