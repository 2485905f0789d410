//! Comparison orchestrator.
//!
//! One request gets one browsing context. Page A is rendered and then page B in
//! that same context, so fonts, scrollbars and zoom are identical for both. The
//! context is released on every path; artifacts are written only once the
//! whole pipeline has succeeded.

use crate::capture::{self, PageDriver, RenderSettings};
use crate::rendering::diff::{self, DiffOptions};
use crate::rendering::normalize::normalize;
use crate::rendering::RenderedImage;
use crate::store::{ArtifactRef, ArtifactStore};
use crate::{ArtifactRole, CaptureRequest, CompareConfig, Error, Result, Viewport};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Source of isolated browsing contexts
#[async_trait]
pub trait BrowserBackend: Send + Sync {
    type Page: PageDriver + 'static;

    /// Open a fresh context sized to `viewport`.
    async fn open_context(&self, viewport: Viewport) -> Result<Self::Page>;

    /// Destroy a context. Dropping the page must release it as well.
    async fn close_context(&self, page: Self::Page) -> Result<()>;
}

#[async_trait]
impl<B: BrowserBackend + ?Sized> BrowserBackend for Arc<B> {
    type Page = B::Page;

    async fn open_context(&self, viewport: Viewport) -> Result<Self::Page> {
        (**self).open_context(viewport).await
    }

    async fn close_context(&self, page: Self::Page) -> Result<()> {
        (**self).close_context(page).await
    }
}

/// Result of one comparison; serialized as the public JSON summary
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonSummary {
    pub url_a: String,
    pub url_b: String,
    /// Dimensions of the compared region (after normalization)
    pub viewport: Viewport,
    pub mismatch_pixels: u64,
    pub total_pixels: u64,
    pub mismatch_percentage: f64,
    pub similarity_percentage: f64,
    pub screenshot_a_path: ArtifactRef,
    pub screenshot_b_path: ArtifactRef,
    pub diff_image_path: ArtifactRef,
}

/// Runs comparisons against a browser backend and an artifact store
pub struct Comparator<B> {
    backend: B,
    store: Arc<dyn ArtifactStore>,
    render: RenderSettings,
    diff: DiffOptions,
}

impl<B: BrowserBackend> Comparator<B> {
    pub fn new(backend: B, store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            backend,
            store,
            render: RenderSettings::default(),
            diff: DiffOptions::default(),
        }
    }

    pub fn from_config(backend: B, store: Arc<dyn ArtifactStore>, config: &CompareConfig) -> Self {
        Self::new(backend, store)
            .with_render_settings(config.render.clone())
            .with_diff_options(config.diff)
    }

    pub fn with_render_settings(mut self, render: RenderSettings) -> Self {
        self.render = render;
        self
    }

    pub fn with_diff_options(mut self, diff: DiffOptions) -> Self {
        self.diff = diff;
        self
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// Capture both pages, diff them, and store the three images.
    ///
    /// Invalid requests fail before any browser resource is touched. A failed
    /// render surfaces as [`Error::CaptureFailed`], a zero-area common region as
    /// [`Error::EmptyRegion`]. Nothing is stored unless every step succeeds.
    pub async fn compare(&self, request: &CaptureRequest) -> Result<ComparisonSummary> {
        request.validate()?;
        let started = Instant::now();
        info!(
            "Comparing {} with {} at {}",
            request.url_a, request.url_b, request.viewport
        );

        let page = self.backend.open_context(request.viewport).await?;
        let captured = self.capture_both(&page, request).await;
        if let Err(e) = self.backend.close_context(page).await {
            warn!("Failed to release browsing context: {}", e);
        }
        let (image_a, image_b) = captured?;

        let store = Arc::clone(&self.store);
        let options = self.diff;
        let (viewport, result, refs) = tokio::task::spawn_blocking(move || {
            let (viewport, result) = analyze(&image_a, &image_b, &options)?;
            let refs = store_all(
                store.as_ref(),
                [
                    (ArtifactRole::A, &image_a),
                    (ArtifactRole::B, &image_b),
                    (ArtifactRole::Diff, &result.image),
                ],
            )?;
            Ok::<_, Error>((viewport, result, refs))
        })
        .await??;
        let [screenshot_a_path, screenshot_b_path, diff_image_path] = refs;

        info!(
            "Compared {} with {}: {} of {} pixels differ ({:.2}% similar) in {:?}",
            request.url_a,
            request.url_b,
            result.mismatch_pixels,
            result.total_pixels,
            result.similarity_percentage,
            started.elapsed()
        );

        Ok(ComparisonSummary {
            url_a: request.url_a.clone(),
            url_b: request.url_b.clone(),
            viewport,
            mismatch_pixels: result.mismatch_pixels,
            total_pixels: result.total_pixels,
            mismatch_percentage: result.mismatch_percentage,
            similarity_percentage: result.similarity_percentage,
            screenshot_a_path,
            screenshot_b_path,
            diff_image_path,
        })
    }

    // A strictly before B: one context loads one page at a time.
    async fn capture_both(&self, page: &B::Page, request: &CaptureRequest) -> Result<(RenderedImage, RenderedImage)> {
        let a = capture::render(page, &request.url_a, request.viewport, &self.render)
            .await
            .map_err(|e| Error::capture(ArtifactRole::A, e))?;
        let b = capture::render(page, &request.url_b, request.viewport, &self.render)
            .await
            .map_err(|e| Error::capture(ArtifactRole::B, e))?;
        Ok((a, b))
    }
}

/// Normalize and diff two captures. Returns the compared region and the diff.
pub fn analyze(a: &RenderedImage, b: &RenderedImage, options: &DiffOptions) -> Result<(Viewport, diff::DiffResult)> {
    let pair = normalize(a, b);
    let region = Viewport::new(pair.width(), pair.height());
    if pair.is_empty() {
        return Err(Error::EmptyRegion {
            width: region.width,
            height: region.height,
        });
    }
    debug!(
        "Normalized {}x{} and {}x{} to {}",
        a.width(),
        a.height(),
        b.width(),
        b.height(),
        region
    );
    let result = diff::diff(&pair.a, &pair.b, options)?;
    Ok((region, result))
}

// All or nothing: on failure, whatever was already written is removed again.
fn store_all<const N: usize>(store: &dyn ArtifactStore, items: [(ArtifactRole, &RenderedImage); N]) -> Result<[ArtifactRef; N]> {
    let mut stored = Vec::with_capacity(N);
    for (role, image) in items {
        match store.store(role, image) {
            Ok(reference) => stored.push(reference),
            Err(e) => {
                for reference in &stored {
                    if let Err(cleanup) = store.remove(reference) {
                        warn!("Failed to remove partial artifact {}: {}", reference, cleanup);
                    }
                }
                return Err(e);
            }
        }
    }
    stored
        .try_into()
        .map_err(|_| Error::InternalError("artifact count mismatch".into()))
}
