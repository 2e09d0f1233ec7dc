//! Instrumented collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use folio_common::FolioConfig;
use folio_drafts::store::MemoryPublishedStore;
use folio_drafts::{
    CaptionContext, CaptionError, CaptionService, ChangeRecord, Collaborators, DraftChanges,
    DraftStore, ProjectId, ProjectWorkspace, PublishedSnapshot, PublishedStore, StoreError,
    UploadImage,
};
use folio_drafts::store::{BlobStore, MemoryDraftStore};
use image::{DynamicImage, ImageFormat, RgbImage};
use tokio::sync::Semaphore;

pub const PROJECT: &str = "proj-1";

pub fn project() -> ProjectId {
    ProjectId::new(PROJECT)
}

/// Draft store that records every write it applies and can be slowed down,
/// made to fail, or made to hang.
#[derive(Default)]
pub struct RecordingDraftStore {
    inner: MemoryDraftStore,
    saves: Mutex<Vec<ChangeRecord>>,
    delays: Mutex<VecDeque<Duration>>,
    attempts: AtomicUsize,
    fail: AtomicBool,
    hang: AtomicBool,
}

impl RecordingDraftStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records applied to the backend, in the order they landed.
    pub fn saves(&self) -> Vec<ChangeRecord> {
        self.saves.lock().unwrap().clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.lock().unwrap().len()
    }

    /// Calls to `save_change`, including failed and hanging ones.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Delay the next `save_change` calls, one entry per call.
    pub fn delay_next(&self, delays: impl IntoIterator<Item = Duration>) {
        self.delays.lock().unwrap().extend(delays);
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_hanging(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub async fn records(&self) -> Vec<ChangeRecord> {
        self.inner.records(&project()).await
    }
}

impl DraftStore for RecordingDraftStore {
    async fn get_all_changes(&self, project: &ProjectId) -> Result<DraftChanges, StoreError> {
        self.inner.get_all_changes(project).await
    }

    async fn list_changes(&self, project: &ProjectId) -> Result<Vec<ChangeRecord>, StoreError> {
        self.inner.list_changes(project).await
    }

    async fn save_change(&self, record: &ChangeRecord) -> Result<(), StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let delay = self.delays.lock().unwrap().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("draft store offline".into()));
        }
        self.saves.lock().unwrap().push(record.clone());
        self.inner.save_change(record).await
    }

    async fn remove_changes(
        &self,
        project: &ProjectId,
        records: &[ChangeRecord],
    ) -> Result<usize, StoreError> {
        self.inner.remove_changes(project, records).await
    }

    async fn clear_changes(&self, project: &ProjectId) -> Result<(), StoreError> {
        self.inner.clear_changes(project).await
    }
}

/// Published store whose `store_published` takes a fixed time to land.
pub struct SlowPublishedStore {
    inner: MemoryPublishedStore,
    delay: Duration,
}

impl SlowPublishedStore {
    pub fn new(inner: MemoryPublishedStore, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

impl PublishedStore for SlowPublishedStore {
    async fn load_published(
        &self,
        project: &ProjectId,
    ) -> Result<Option<PublishedSnapshot>, StoreError> {
        self.inner.load_published(project).await
    }

    async fn store_published(
        &self,
        project: &ProjectId,
        snapshot: &PublishedSnapshot,
    ) -> Result<(), StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.store_published(project, snapshot).await
    }
}

/// Blob store returning predictable URLs, or no URL at all.
#[derive(Default)]
pub struct StubBlobStore {
    uploads: AtomicUsize,
    no_url: AtomicBool,
    fail: AtomicBool,
    received: Mutex<Vec<UploadImage>>,
}

impl StubBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_url() -> Self {
        let store = Self::default();
        store.no_url.store(true, Ordering::SeqCst);
        store
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<UploadImage> {
        self.received.lock().unwrap().clone()
    }
}

impl BlobStore for StubBlobStore {
    async fn upload_image(
        &self,
        image: &UploadImage,
        project: &ProjectId,
        _original_ref: &str,
    ) -> Result<Option<String>, StoreError> {
        let n = self.uploads.fetch_add(1, Ordering::SeqCst) + 1;
        self.received.lock().unwrap().push(image.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("blob store offline".into()));
        }
        if self.no_url.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(format!("https://blobs.test/{project}/{n}.jpg")))
    }
}

/// Caption service with optional gating, failures and a call log.
pub struct SlowCaptionService {
    delay: Duration,
    gate: Option<Semaphore>,
    failing: Mutex<HashSet<String>>,
    fail_all: AtomicBool,
    calls: Mutex<Vec<(String, CaptionContext, tokio::time::Instant)>>,
}

impl SlowCaptionService {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            gate: None,
            failing: Mutex::new(HashSet::new()),
            fail_all: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn instant() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Every call blocks until [`release`](Self::release) hands out a permit.
    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::instant()
        }
    }

    pub fn release(&self, calls: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(calls);
        }
    }

    pub fn fail_for(&self, url: &str) {
        self.failing.lock().unwrap().insert(url.to_string());
    }

    pub fn recover(&self, url: &str) {
        self.failing.lock().unwrap().remove(url);
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(url, _, _)| url.clone())
            .collect()
    }

    pub fn call_times(&self) -> Vec<tokio::time::Instant> {
        self.calls.lock().unwrap().iter().map(|(_, _, at)| *at).collect()
    }

    pub fn contexts(&self) -> Vec<CaptionContext> {
        self.calls.lock().unwrap().iter().map(|(_, c, _)| *c).collect()
    }
}

pub fn caption_for(url: &str) -> String {
    format!("A detailed description of {url}")
}

impl CaptionService for SlowCaptionService {
    async fn generate_caption(
        &self,
        image_url: &str,
        context: CaptionContext,
    ) -> Result<String, CaptionError> {
        self.calls.lock().unwrap().push((
            image_url.to_string(),
            context,
            tokio::time::Instant::now(),
        ));
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| CaptionError::service(e.to_string()))?
                .forget();
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail_all.load(Ordering::SeqCst) || self.failing.lock().unwrap().contains(image_url)
        {
            return Err(CaptionError::service("model overloaded"));
        }
        Ok(caption_for(image_url))
    }
}

pub type TestWorkspace =
    ProjectWorkspace<RecordingDraftStore, MemoryPublishedStore, StubBlobStore, SlowCaptionService>;

pub struct Harness {
    pub drafts: Arc<RecordingDraftStore>,
    pub published: Arc<MemoryPublishedStore>,
    pub blobs: Arc<StubBlobStore>,
    pub captions: Arc<SlowCaptionService>,
    pub workspace: TestWorkspace,
}

pub fn test_config() -> FolioConfig {
    let mut config = FolioConfig::default();
    config.drafts.debounce_ms = 1000;
    config.drafts.watchdog_secs = 30;
    config.captions.delay_ms = 1500;
    config
}

pub fn harness_with(published: MemoryPublishedStore, config: FolioConfig) -> Harness {
    let drafts = Arc::new(RecordingDraftStore::new());
    let published = Arc::new(published);
    let blobs = Arc::new(StubBlobStore::new());
    let captions = Arc::new(SlowCaptionService::instant());
    let workspace = ProjectWorkspace::new(
        project(),
        Collaborators {
            drafts: drafts.clone(),
            published: published.clone(),
            blobs: blobs.clone(),
            captions: captions.clone(),
        },
        config,
    );
    Harness {
        drafts,
        published,
        blobs,
        captions,
        workspace,
    }
}

pub type SlowPublishWorkspace =
    ProjectWorkspace<RecordingDraftStore, SlowPublishedStore, StubBlobStore, SlowCaptionService>;

/// A workspace whose publishes take `delay` to store the snapshot.
pub fn slow_publish_workspace(
    published: MemoryPublishedStore,
    delay: Duration,
) -> (Arc<RecordingDraftStore>, SlowPublishWorkspace) {
    let drafts = Arc::new(RecordingDraftStore::new());
    let workspace = ProjectWorkspace::new(
        project(),
        Collaborators {
            drafts: drafts.clone(),
            published: Arc::new(SlowPublishedStore::new(published, delay)),
            blobs: Arc::new(StubBlobStore::new()),
            captions: Arc::new(SlowCaptionService::instant()),
        },
        test_config(),
    );
    (drafts, workspace)
}

pub fn harness() -> Harness {
    harness_with(MemoryPublishedStore::new(), test_config())
}

/// A small PNG with uniform noise, so it does not compress away.
pub fn noise_png(side: u32, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_add(0x9E37_79B9);
    let img = RgbImage::from_fn(side, side, |_, _| {
        let mut next = || {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 24) as u8
        };
        image::Rgb([next(), next(), next()])
    });
    let mut out = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .unwrap();
    out
}

/// Let spawned tasks run without moving the paused clock.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
