//! Scripted browser backend shared by the integration suites

#![allow(dead_code)]

use async_trait::async_trait;
use pagediff::capture::{ImageStatus, PageDriver, RenderSettings};
use pagediff::compare::BrowserBackend;
use pagediff::{Error, RenderedImage, Result, Viewport};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What a fake URL renders as
#[derive(Debug, Clone)]
pub struct Site {
    pub width: u32,
    pub height: u32,
    pub color: [u8; 4],
    /// Initial document scroll height
    pub scroll_height: u64,
    /// Height added per scroll step (lazy content), up to `max_scroll_height`
    pub growth_per_step: u64,
    pub max_scroll_height: u64,
    /// Navigation never completes
    pub hang: bool,
    /// Resource count keeps changing on every poll
    pub busy_network: bool,
    /// Resource counts reported by successive polls; the last one repeats
    pub resource_counts: Vec<u64>,
    /// How long each resource count query takes to answer
    pub resource_delay: Duration,
    /// One pending image per entry, loading after the given delay
    pub image_delays: Vec<Duration>,
}

impl Site {
    pub fn new(width: u32, height: u32, color: [u8; 4]) -> Self {
        Self {
            width,
            height,
            color,
            scroll_height: u64::from(height),
            growth_per_step: 0,
            max_scroll_height: u64::from(height),
            hang: false,
            busy_network: false,
            resource_counts: vec![3],
            resource_delay: Duration::ZERO,
            image_delays: Vec::new(),
        }
    }

    pub fn white(width: u32, height: u32) -> Self {
        Self::new(width, height, [255, 255, 255, 255])
    }
}

/// Counters observed by the tests
#[derive(Debug, Default)]
pub struct Counters {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    /// Pages dropped without an explicit close (cancellation)
    pub dropped_open: AtomicUsize,
    pub navigations: AtomicUsize,
    pub active_image_waits: AtomicUsize,
    pub max_image_waits: AtomicUsize,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub struct FakeBackend {
    sites: HashMap<String, Site>,
    pub counters: Arc<Counters>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_site(mut self, url: &str, site: Site) -> Self {
        self.sites.insert(url.to_string(), site);
        self
    }

    /// A page driver not tied to a comparison, for renderer tests.
    pub fn page(&self, viewport: Viewport) -> FakePage {
        FakePage::new(self.sites.clone(), Arc::clone(&self.counters), viewport)
    }

    pub fn opened(&self) -> usize {
        Counters::get(&self.counters.opened)
    }

    pub fn closed(&self) -> usize {
        Counters::get(&self.counters.closed)
    }

    pub fn dropped_open(&self) -> usize {
        Counters::get(&self.counters.dropped_open)
    }
}

#[async_trait]
impl BrowserBackend for FakeBackend {
    type Page = FakePage;

    async fn open_context(&self, viewport: Viewport) -> Result<FakePage> {
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(self.page(viewport))
    }

    async fn close_context(&self, page: FakePage) -> Result<()> {
        page.closed.store(true, Ordering::SeqCst);
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakePage {
    sites: HashMap<String, Site>,
    counters: Arc<Counters>,
    viewport: Viewport,
    current: Mutex<Option<Site>>,
    scrolled: AtomicU64,
    steps: AtomicU64,
    polls: AtomicUsize,
    closed: AtomicBool,
}

impl FakePage {
    fn new(sites: HashMap<String, Site>, counters: Arc<Counters>, viewport: Viewport) -> Self {
        Self {
            sites,
            counters,
            viewport,
            current: Mutex::new(None),
            scrolled: AtomicU64::new(0),
            steps: AtomicU64::new(0),
            polls: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn site(&self) -> Result<Site> {
        self.current
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::RenderError("no document loaded".into()))
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }
}

impl Drop for FakePage {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            self.counters.dropped_open.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Decrements the active wait gauge even when the wait is cancelled.
struct WaitGuard<'a>(&'a Counters);

impl<'a> WaitGuard<'a> {
    fn enter(counters: &'a Counters) -> Self {
        let now = counters.active_image_waits.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_image_waits.fetch_max(now, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.active_image_waits.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl PageDriver for FakePage {
    async fn navigate(&self, url: &str) -> Result<()> {
        self.counters.navigations.fetch_add(1, Ordering::SeqCst);
        let site = self
            .sites
            .get(url)
            .cloned()
            .ok_or_else(|| Error::NavigationError(format!("net::ERR_NAME_NOT_RESOLVED at {}", url)))?;
        if site.hang {
            std::future::pending::<()>().await;
        }
        *self.current.lock().unwrap() = Some(site);
        self.scrolled.store(0, Ordering::SeqCst);
        self.steps.store(0, Ordering::SeqCst);
        self.polls.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn loaded_resource_count(&self) -> Result<u64> {
        let site = self.site()?;
        if !site.resource_delay.is_zero() {
            tokio::time::sleep(site.resource_delay).await;
        }
        let poll = self.polls.fetch_add(1, Ordering::SeqCst);
        if site.busy_network {
            return Ok(poll as u64);
        }
        let count = site
            .resource_counts
            .get(poll)
            .or(site.resource_counts.last())
            .copied()
            .unwrap_or(0);
        Ok(count)
    }

    async fn scroll_height(&self) -> Result<u64> {
        let site = self.site()?;
        let grown = site.scroll_height + self.steps.load(Ordering::SeqCst) * site.growth_per_step;
        Ok(grown.min(site.max_scroll_height.max(site.scroll_height)))
    }

    async fn scroll_by(&self, dy: u32) -> Result<()> {
        self.scrolled.fetch_add(u64::from(dy), Ordering::SeqCst);
        self.steps.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn scroll_to_top(&self) -> Result<()> {
        self.scrolled.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn pending_images(&self) -> Result<Vec<usize>> {
        Ok((0..self.site()?.image_delays.len()).collect())
    }

    async fn wait_for_image(&self, index: usize, _limit: Duration) -> Result<ImageStatus> {
        let delay = self.site()?.image_delays[index];
        let _guard = WaitGuard::enter(&self.counters);
        tokio::time::sleep(delay).await;
        Ok(ImageStatus::Loaded)
    }

    async fn capture_full_page(&self, viewport: Viewport) -> Result<Vec<u8>> {
        let site = self.site()?;
        assert_eq!(viewport, self.viewport, "capture must use the context viewport");
        RenderedImage::filled(site.width, site.height, site.color).to_png()
    }
}

/// Settings with every delay shrunk to a few milliseconds, for real-time tests.
pub fn fast_settings() -> RenderSettings {
    RenderSettings {
        navigation_timeout: Duration::from_millis(500),
        idle_window: Duration::from_millis(5),
        idle_poll_interval: Duration::from_millis(1),
        settle_delay: Duration::from_millis(1),
        scroll_step: 100,
        scroll_interval: Duration::from_millis(1),
        max_scroll_duration: Duration::from_millis(200),
        post_scroll_delay: Duration::from_millis(1),
        image_timeout: Duration::from_millis(200),
        top_settle_delay: Duration::from_millis(1),
    }
}
