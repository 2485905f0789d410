//! pagediff
//!
//! Full-page visual comparison of two web pages. Both pages are rendered by
//! headless Chrome inside one browsing context under the same viewport, the
//! captures are cropped to a common region, and a pixel-level diff produces a
//! similarity score plus a highlighted diff image.
//!
//! # Features
//!
//! - **CDP Backend** (`cdp`, default): process-wide headless Chrome via the
//!   Chrome DevTools Protocol, one isolated browser context per comparison
//! - **HTTP Server** (`server`, default): `POST /api/compare` and artifact serving
//! - **Swappable seams**: the renderer runs against [`capture::PageDriver`] and the
//!   orchestrator against [`compare::BrowserBackend`], so both can be driven
//!   without a browser
//!
//! # Example
//!
//! ```no_run
//! # #[cfg(feature = "cdp")]
//! # async fn run() -> pagediff::Result<()> {
//! use std::sync::Arc;
//! use pagediff::{async_api::SharedBrowser, compare::Comparator, store::DirStore};
//! use pagediff::{CaptureRequest, CompareConfig, Viewport};
//!
//! let config = CompareConfig::default();
//! let browser = SharedBrowser::new(config.launch.clone(), config.render.navigation_timeout)?;
//! let store = Arc::new(DirStore::open(&config.artifact_dir, &config.public_prefix)?);
//! let comparator = Comparator::from_config(browser.clone(), store, &config);
//!
//! let request = CaptureRequest::new("https://example.com", "https://example.org", Viewport::new(800, 600));
//! let summary = comparator.compare(&request).await?;
//! println!("similarity: {:.2}%", summary.similarity_percentage);
//! browser.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub mod error;
pub use error::{Error, Result};

// Raster types, normalization and the diff kernel
pub mod rendering;
pub use rendering::RenderedImage;

// Page renderer: navigation, lazy-content scrolling, full-page capture
pub mod capture;

// Orchestrator: render A then B, normalize, diff, store
pub mod compare;

// Artifact persistence
pub mod store;

// CDP backend (feature-gated)
#[cfg(feature = "cdp")]
pub mod cdp;

// Async-friendly browser API (worker-backed process-wide browser)
#[cfg(feature = "cdp")]
pub mod async_api;

// HTTP surface
#[cfg(feature = "server")]
pub mod server;

pub use capture::RenderSettings;
pub use compare::{Comparator, ComparisonSummary};
pub use rendering::diff::DiffOptions;

/// Viewport dimensions shared by both captures of a comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of pixels covered by the viewport.
    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

impl fmt::Display for Viewport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Which image of a comparison an artifact (or a failure) belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactRole {
    /// Capture of `urlA`
    A,
    /// Capture of `urlB`
    B,
    /// Diff image
    Diff,
}

impl ArtifactRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactRole::A => "a",
            ArtifactRole::B => "b",
            ArtifactRole::Diff => "diff",
        }
    }
}

impl fmt::Display for ArtifactRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to compare two pages
///
/// Construct it with [`CaptureRequest::new`]; the orchestrator validates it
/// before any browser resource is acquired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRequest {
    pub url_a: String,
    pub url_b: String,
    pub viewport: Viewport,
}

impl CaptureRequest {
    pub fn new(url_a: impl Into<String>, url_b: impl Into<String>, viewport: Viewport) -> Self {
        Self {
            url_a: url_a.into(),
            url_b: url_b.into(),
            viewport,
        }
    }

    /// Reject missing or malformed fields.
    ///
    /// Both URLs must be present and parse as absolute URLs, and the viewport
    /// must have a positive area.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("urlA", &self.url_a), ("urlB", &self.url_b)] {
            let value = value.trim();
            if value.is_empty() {
                return Err(Error::ValidationError(format!("{} is missing", name)));
            }
            url::Url::parse(value)
                .map_err(|e| Error::ValidationError(format!("{} is not a valid URL: {}", name, e)))?;
        }
        if self.viewport.is_empty() {
            return Err(Error::ValidationError(format!(
                "viewport must be positive, got {}",
                self.viewport
            )));
        }
        Ok(())
    }
}

/// Options for launching the shared headless browser
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Explicit Chrome/Chromium binary; auto-detected when `None`
    pub chrome_path: Option<PathBuf>,
    /// Whether to keep Chrome's sandbox enabled (disable inside containers)
    pub sandbox: bool,
    /// How long the DevTools connection may stay silent before it is dropped
    pub idle_browser_timeout: Duration,
    /// Optional user agent override applied to every page
    pub user_agent: Option<String>,
    /// Additional command-line switches for Chrome
    pub extra_args: Vec<String>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            chrome_path: None,
            sandbox: true,
            idle_browser_timeout: Duration::from_secs(600),
            user_agent: None,
            extra_args: Vec::new(),
        }
    }
}

/// Top-level configuration for a comparison service
///
/// The defaults mirror the timings used by the renderer and a threshold of
/// `0.1` for the diff kernel.
///
/// # Examples
///
/// ```
/// let cfg = pagediff::CompareConfig::default();
/// assert!(cfg.validate().is_ok());
/// assert_eq!(cfg.public_prefix, "/screenshots");
/// ```
#[derive(Debug, Clone)]
pub struct CompareConfig {
    pub launch: LaunchConfig,
    pub render: RenderSettings,
    pub diff: DiffOptions,
    /// Directory where screenshots and diff images are written
    pub artifact_dir: PathBuf,
    /// URL path prefix under which stored artifacts are referenced
    pub public_prefix: String,
}

impl Default for CompareConfig {
    fn default() -> Self {
        Self {
            launch: LaunchConfig::default(),
            render: RenderSettings::default(),
            diff: DiffOptions::default(),
            artifact_dir: PathBuf::from("screenshots"),
            public_prefix: "/screenshots".to_string(),
        }
    }
}

impl CompareConfig {
    pub fn validate(&self) -> Result<()> {
        self.render.validate()?;
        self.diff.validate()?;
        if !self.public_prefix.starts_with('/') {
            return Err(Error::ConfigError(format!(
                "public prefix must start with '/', got {:?}",
                self.public_prefix
            )));
        }
        Ok(())
    }
}
