//! Page renderer: turn a URL into a settled, full-page raster.
//!
//! Dynamic pages keep changing after the load event: lazy images appear as
//! they scroll into view, layouts grow, and scroll handlers fire. The renderer
//! walks every page through the same sequence before capturing it:
//!
//! 1. navigate and wait for network idle (bounded by the navigation timeout)
//! 2. settle delay
//! 3. scroll to the bottom in fixed steps, re-reading the height each step
//! 4. wait for every incomplete image, each with its own deadline, concurrently
//! 5. scroll back to the top and pause
//! 6. capture the full page
//!
//! Every wait is an async timer; nothing here blocks a runtime worker.

use crate::rendering::RenderedImage;
use crate::{Error, Result, Viewport};
use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, warn};
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

/// Timing knobs for the renderer
#[derive(Debug, Clone, PartialEq)]
pub struct RenderSettings {
    /// Upper bound for navigation plus network idle
    pub navigation_timeout: Duration,
    /// How long the resource count must stay unchanged to count as idle
    pub idle_window: Duration,
    /// Poll interval while waiting for network idle
    pub idle_poll_interval: Duration,
    /// Pause after network idle for post-load scripts
    pub settle_delay: Duration,
    /// Pixels scrolled per step
    pub scroll_step: u32,
    /// Pause between scroll steps
    pub scroll_interval: Duration,
    /// Scrolling stops after this long even if the bottom was not reached
    pub max_scroll_duration: Duration,
    /// Pause after the last scroll step
    pub post_scroll_delay: Duration,
    /// Deadline for each incomplete image
    pub image_timeout: Duration,
    /// Pause after returning to the top, before capture
    pub top_settle_delay: Duration,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            navigation_timeout: Duration::from_secs(30),
            idle_window: Duration::from_millis(500),
            idle_poll_interval: Duration::from_millis(100),
            settle_delay: Duration::from_millis(1000),
            scroll_step: 100,
            scroll_interval: Duration::from_millis(100),
            max_scroll_duration: Duration::from_secs(30),
            post_scroll_delay: Duration::from_millis(1500),
            image_timeout: Duration::from_secs(5),
            top_settle_delay: Duration::from_millis(500),
        }
    }
}

impl RenderSettings {
    pub fn validate(&self) -> Result<()> {
        if self.scroll_step == 0 {
            return Err(Error::ConfigError("scroll step must be positive".into()));
        }
        if self.navigation_timeout.is_zero() || self.image_timeout.is_zero() {
            return Err(Error::ConfigError(
                "navigation and image timeouts must be positive".into(),
            ));
        }
        if self.idle_poll_interval.is_zero() || self.idle_poll_interval > self.idle_window {
            return Err(Error::ConfigError(format!(
                "idle poll interval ({:?}) must be positive and not exceed the idle window ({:?})",
                self.idle_poll_interval, self.idle_window
            )));
        }
        if self.scroll_interval.is_zero() || self.scroll_interval >= self.max_scroll_duration {
            return Err(Error::ConfigError(format!(
                "scroll interval ({:?}) must be positive and below the scroll cap ({:?})",
                self.scroll_interval, self.max_scroll_duration
            )));
        }
        Ok(())
    }
}

/// How a single image wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageStatus {
    Loaded,
    Failed,
    TimedOut,
}

/// Primitive page operations the renderer is built from
///
/// One value drives one browsing context; the viewport is fixed when the
/// context is opened. Implementations must make every call cancellable by
/// dropping the future.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Load `url` and wait for the load event.
    async fn navigate(&self, url: &str) -> Result<()>;

    /// Number of resources the document has fetched so far.
    async fn loaded_resource_count(&self) -> Result<u64>;

    /// Current scrollable height of the document body.
    async fn scroll_height(&self) -> Result<u64>;

    async fn scroll_by(&self, dy: u32) -> Result<()>;

    async fn scroll_to_top(&self) -> Result<()>;

    /// Indices (into `document.images`) of images that are not complete yet.
    async fn pending_images(&self) -> Result<Vec<usize>>;

    /// Resolve once image `index` loads or errors, or after `limit`.
    async fn wait_for_image(&self, index: usize, limit: Duration) -> Result<ImageStatus>;

    /// PNG of the whole document at the viewport's width.
    async fn capture_full_page(&self, viewport: Viewport) -> Result<Vec<u8>>;
}

/// What the lazy-content scroll did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollOutcome {
    pub steps: u32,
    pub distance: u64,
    /// The scroll cap stopped the walk before the bottom was reached
    pub capped: bool,
}

/// Tally of the image waits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageWaitOutcome {
    pub loaded: usize,
    pub failed: usize,
    pub timed_out: usize,
}

/// Render `url` to a settled full-page image.
///
/// Fails with [`Error::NavigationError`] when the page does not load and go
/// idle within `settings.navigation_timeout`; driver failures after that are
/// passed through (normally [`Error::RenderError`]).
pub async fn render<D>(page: &D, url: &str, viewport: Viewport, settings: &RenderSettings) -> Result<RenderedImage>
where
    D: PageDriver + ?Sized,
{
    let started = Instant::now();
    debug!("Rendering {} at {}", url, viewport);

    navigate_until_idle(page, url, settings).await?;
    sleep(settings.settle_delay).await;

    let scroll = scroll_through(page, settings).await?;
    debug!(
        "Scrolled {} in {} steps (capped: {})",
        url, scroll.steps, scroll.capped
    );
    sleep(settings.post_scroll_delay).await;

    let images = await_images(page, settings).await?;
    if images.timed_out > 0 || images.failed > 0 {
        warn!(
            "{}: {} image(s) timed out, {} failed to load",
            url, images.timed_out, images.failed
        );
    }

    page.scroll_to_top().await?;
    sleep(settings.top_settle_delay).await;

    let png = page.capture_full_page(viewport).await?;
    let image = tokio::task::spawn_blocking(move || RenderedImage::from_png(&png)).await??;
    debug!(
        "Captured {} as {}x{} in {:?}",
        url,
        image.width(),
        image.height(),
        started.elapsed()
    );
    Ok(image)
}

/// Navigate, then wait until the resource count stays unchanged for the idle window.
///
/// One deadline covers both phases, including page evaluations that stall.
pub async fn navigate_until_idle<D>(page: &D, url: &str, settings: &RenderSettings) -> Result<()>
where
    D: PageDriver + ?Sized,
{
    let settled = async {
        page.navigate(url).await?;
        wait_for_network_idle(page, settings).await
    };
    match timeout(settings.navigation_timeout, settled).await {
        Ok(result) => result,
        Err(_) => Err(Error::NavigationError(format!(
            "{} did not load and go idle within {}ms",
            url,
            settings.navigation_timeout.as_millis()
        ))),
    }
}

async fn wait_for_network_idle<D>(page: &D, settings: &RenderSettings) -> Result<()>
where
    D: PageDriver + ?Sized,
{
    let mut last = page.loaded_resource_count().await?;
    let mut quiet_since = Instant::now();
    while quiet_since.elapsed() < settings.idle_window {
        sleep(settings.idle_poll_interval).await;
        let count = page.loaded_resource_count().await?;
        if count != last {
            last = count;
            quiet_since = Instant::now();
        }
    }
    Ok(())
}

/// Scroll to the bottom in fixed steps so lazy content materializes.
///
/// The height is re-read before every step because loading content can grow
/// the document. Walking stops at the bottom or at the scroll cap.
pub async fn scroll_through<D>(page: &D, settings: &RenderSettings) -> Result<ScrollOutcome>
where
    D: PageDriver + ?Sized,
{
    let started = Instant::now();
    let step = u64::from(settings.scroll_step);
    let mut outcome = ScrollOutcome {
        steps: 0,
        distance: 0,
        capped: false,
    };

    loop {
        let height = page.scroll_height().await?;
        page.scroll_by(settings.scroll_step).await?;
        outcome.steps += 1;
        outcome.distance += step;

        if outcome.distance >= height {
            return Ok(outcome);
        }
        if started.elapsed() >= settings.max_scroll_duration {
            warn!(
                "Stopped scrolling after {:?} at {}px of {}px",
                settings.max_scroll_duration, outcome.distance, height
            );
            outcome.capped = true;
            return Ok(outcome);
        }
        sleep(settings.scroll_interval).await;
    }
}

/// Wait for all incomplete images at once, each bounded by `image_timeout`.
///
/// A broken or slow image never fails the render; total wait time is bounded
/// by the slowest single image.
pub async fn await_images<D>(page: &D, settings: &RenderSettings) -> Result<ImageWaitOutcome>
where
    D: PageDriver + ?Sized,
{
    let pending = page.pending_images().await?;
    if pending.is_empty() {
        return Ok(ImageWaitOutcome::default());
    }
    debug!("Waiting for {} pending image(s)", pending.len());

    let limit = settings.image_timeout;
    let waits = pending.into_iter().map(|index| async move {
        match timeout(limit, page.wait_for_image(index, limit)).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                debug!("Wait for image {} failed: {}", index, e);
                ImageStatus::Failed
            }
            Err(_) => ImageStatus::TimedOut,
        }
    });

    let mut outcome = ImageWaitOutcome::default();
    for status in join_all(waits).await {
        match status {
            ImageStatus::Loaded => outcome.loaded += 1,
            ImageStatus::Failed => outcome.failed += 1,
            ImageStatus::TimedOut => outcome.timed_out += 1,
        }
    }
    Ok(outcome)
}
