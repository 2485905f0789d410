//! Chrome DevTools Protocol adapter implementation

use crate::capture::ImageStatus;
use crate::{Error, LaunchConfig, Result, Viewport};
use base64::Engine as Base64Engine;
use headless_chrome::browser::tab::Tab;
use headless_chrome::protocol::cdp::{Page, Target};
use headless_chrome::types::Bounds;
use headless_chrome::{Browser, LaunchOptions};
use log::{debug, warn};
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;

/// Switches that keep captures reproducible across machines
const DEFAULT_ARGS: &[&str] = &[
    "--force-device-scale-factor=1",
    "--hide-scrollbars",
    "--force-color-profile=sRGB",
    "--disable-gpu",
    "--disable-dev-shm-usage",
    "--disable-extensions",
];

/// Chrome refuses to rasterize surfaces taller than this
const MAX_CAPTURE_HEIGHT: u32 = 16_384;

/// Launch a headless Chrome process.
pub fn launch_browser(config: &LaunchConfig) -> Result<Browser> {
    let args: Vec<&OsStr> = DEFAULT_ARGS
        .iter()
        .copied()
        .map(OsStr::new)
        .chain(config.extra_args.iter().map(OsStr::new))
        .collect();

    let default_viewport = Viewport::default();
    let launch_options = LaunchOptions::default_builder()
        .headless(true)
        .sandbox(config.sandbox)
        .window_size(Some((default_viewport.width, default_viewport.height)))
        .idle_browser_timeout(config.idle_browser_timeout)
        .path(config.chrome_path.clone())
        .args(args)
        .build()
        .map_err(|e| Error::InitializationError(format!("Failed to build launch options: {}", e)))?;

    Browser::new(launch_options)
        .map_err(|e| Error::InitializationError(format!("Failed to launch browser: {}", e)))
}

/// A running Chrome plus a tab in its default context.
///
/// Browser-level commands such as context disposal are not exposed on
/// `Browser`, so they are sent through the control tab.
pub struct Chrome {
    browser: Browser,
    control: Arc<Tab>,
}

impl Chrome {
    pub fn launch(config: &LaunchConfig) -> Result<Self> {
        let browser = launch_browser(config)?;
        let control = browser
            .new_tab()
            .map_err(|e| Error::InitializationError(format!("Failed to open control tab: {}", e)))?;
        Ok(Self { browser, control })
    }

    pub fn browser(&self) -> &Browser {
        &self.browser
    }

    /// Whether the DevTools connection still answers.
    pub fn is_alive(&self) -> bool {
        self.browser.get_version().is_ok()
    }

    /// Destroy a browser context and every tab in it.
    pub fn dispose_context(&self, context_id: &str) -> Result<()> {
        self.control
            .call_method(Target::DisposeBrowserContext {
                browser_context_id: context_id.to_string(),
            })
            .map_err(|e| Error::RenderError(format!("Failed to dispose browser context {}: {}", context_id, e)))?;
        debug!("Disposed browser context {}", context_id);
        Ok(())
    }
}

/// One isolated browser context with a single tab
///
/// All methods block on the DevTools connection; the async facade in
/// [`crate::async_api`] runs them on blocking threads.
pub struct CdpSession {
    tab: Arc<Tab>,
    context_id: String,
    viewport: Viewport,
}

impl CdpSession {
    /// Create a fresh context on `chrome` and open a tab sized to `viewport`.
    pub fn open(chrome: &Chrome, viewport: Viewport, config: &LaunchConfig, navigation_timeout: Duration) -> Result<Self> {
        let context = chrome
            .browser()
            .new_context()
            .map_err(|e| Error::InitializationError(format!("Failed to create browser context: {}", e)))?;
        let context_id = context.get_id().to_string();

        let tab = match context.new_tab() {
            Ok(tab) => tab,
            Err(e) => {
                if let Err(cleanup) = chrome.dispose_context(&context_id) {
                    warn!("{}", cleanup);
                }
                return Err(Error::InitializationError(format!("Failed to create tab: {}", e)));
            }
        };

        let session = Self {
            tab,
            context_id,
            viewport,
        };
        if let Err(e) = session.configure(config, navigation_timeout) {
            session.dispose(chrome);
            return Err(e);
        }
        debug!("Opened browser context {} at {}", session.context_id, viewport);
        Ok(session)
    }

    fn configure(&self, config: &LaunchConfig, navigation_timeout: Duration) -> Result<()> {
        self.tab.set_default_timeout(navigation_timeout);

        if let Some(user_agent) = &config.user_agent {
            self.tab
                .set_user_agent(user_agent, None, None)
                .map_err(|e| Error::InitializationError(format!("Failed to set user agent: {}", e)))?;
        }

        // Runs before any page script, so every resource of every document is counted.
        self.tab
            .call_method(Page::AddScriptToEvaluateOnNewDocument {
                source: RESOURCE_COUNTER_SCRIPT.to_string(),
                world_name: None,
                include_command_line_api: None,
                run_immediately: None,
            })
            .map_err(|e| Error::InitializationError(format!("Failed to install resource counter: {}", e)))?;

        self.tab
            .set_bounds(Bounds::Normal {
                left: Some(0),
                top: Some(0),
                width: Some(f64::from(self.viewport.width)),
                height: Some(f64::from(self.viewport.height)),
            })
            .map_err(|e| Error::InitializationError(format!("Failed to size viewport: {}", e)))?;
        Ok(())
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    /// Navigate and wait for the load event.
    pub fn navigate(&self, url: &str) -> Result<()> {
        self.tab
            .navigate_to(url)
            .map_err(|e| Error::NavigationError(format!("Navigation to {} failed: {}", url, e)))?;

        self.tab
            .wait_until_navigated()
            .map_err(|e| Error::NavigationError(format!("Wait for navigation to {} failed: {}", url, e)))?;
        Ok(())
    }

    /// Evaluate `script` in the page and return its primitive value.
    ///
    /// Objects are not returned by value over CDP; scripts that produce
    /// structured data must `JSON.stringify` it.
    pub fn evaluate(&self, script: &str, await_promise: bool) -> Result<serde_json::Value> {
        let result = self
            .tab
            .evaluate(script, await_promise)
            .map_err(|e| Error::RenderError(format!("Evaluation failed: {}", e)))?;
        Ok(result.value.unwrap_or(serde_json::Value::Null))
    }

    fn evaluate_u64(&self, script: &str) -> Result<u64> {
        let value = self.evaluate(script, false)?;
        value
            .as_f64()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(|v| v as u64)
            .ok_or_else(|| Error::RenderError(format!("Expected a number from page, got {}", value)))
    }

    /// Resources fetched by the current document, not limited by the
    /// resource timing buffer.
    pub fn loaded_resource_count(&self) -> Result<u64> {
        self.evaluate_u64(RESOURCE_COUNT_SCRIPT)
    }

    pub fn scroll_height(&self) -> Result<u64> {
        self.evaluate_u64("(document.body || document.documentElement).scrollHeight")
    }

    /// Full document height, whichever of body and root is taller.
    pub fn document_height(&self) -> Result<u64> {
        self.evaluate_u64(
            "Math.max(document.documentElement.scrollHeight, document.body ? document.body.scrollHeight : 0)",
        )
    }

    pub fn scroll_by(&self, dy: u32) -> Result<()> {
        self.evaluate(&format!("window.scrollBy(0, {})", dy), false)?;
        Ok(())
    }

    pub fn scroll_to_top(&self) -> Result<()> {
        self.evaluate("window.scrollTo(0, 0)", false)?;
        Ok(())
    }

    pub fn pending_images(&self) -> Result<Vec<usize>> {
        let value = self.evaluate(
            "JSON.stringify(Array.from(document.images).map((img, i) => img.complete ? -1 : i).filter(i => i >= 0))",
            false,
        )?;
        let json = value
            .as_str()
            .ok_or_else(|| Error::RenderError(format!("Expected image list, got {}", value)))?;
        serde_json::from_str(json).map_err(|e| Error::RenderError(format!("Malformed image list: {}", e)))
    }

    /// Block until image `index` settles; the page-side timer bounds the wait.
    pub fn wait_for_image(&self, index: usize, limit: Duration) -> Result<ImageStatus> {
        let script = IMAGE_WAIT_TEMPLATE
            .replace("{{INDEX}}", &index.to_string())
            .replace("{{LIMIT_MS}}", &limit.as_millis().to_string());
        let value = self.evaluate(&script, true)?;
        Ok(match value.as_str() {
            Some("loaded") => ImageStatus::Loaded,
            Some("timeout") => ImageStatus::TimedOut,
            _ => ImageStatus::Failed,
        })
    }

    /// Capture the whole document as PNG at `viewport`'s width.
    ///
    /// The window keeps its size: Chrome renders beyond the viewport into the
    /// clip, so `vh` units and resize handlers see the settled layout.
    pub fn capture_full_page(&self, viewport: Viewport) -> Result<Vec<u8>> {
        let document_height = u32::try_from(self.document_height()?).unwrap_or(u32::MAX);
        let height = capture_height(document_height, viewport.height);

        let shot = self
            .tab
            .call_method(Page::CaptureScreenshot {
                format: Some(Page::CaptureScreenshotFormatOption::Png),
                quality: None,
                clip: Some(Page::Viewport {
                    x: 0.0,
                    y: 0.0,
                    width: f64::from(viewport.width),
                    height: f64::from(height),
                    scale: 1.0,
                }),
                from_surface: Some(true),
                capture_beyond_viewport: Some(true),
                optimize_for_speed: None,
            })
            .map_err(|e| Error::RenderError(format!("Screenshot failed: {}", e)))?;

        base64::engine::general_purpose::STANDARD
            .decode(shot.data)
            .map_err(|e| Error::RenderError(format!("Screenshot payload is not base64: {}", e)))
    }

    /// Close the tab and destroy the context. Failures are logged, not returned.
    pub fn dispose(&self, chrome: &Chrome) {
        if let Err(e) = self.tab.close(false) {
            debug!("Closing tab of context {} failed: {}", self.context_id, e);
        }
        if let Err(e) = chrome.dispose_context(&self.context_id) {
            warn!("{}", e);
        }
    }
}

/// Height of a full-page capture: the document, at least the viewport, at most the raster limit.
fn capture_height(document_height: u32, viewport_height: u32) -> u32 {
    let height = document_height.max(viewport_height);
    if height > MAX_CAPTURE_HEIGHT {
        warn!(
            "Document is {}px tall; capturing the first {}px",
            height, MAX_CAPTURE_HEIGHT
        );
        return MAX_CAPTURE_HEIGHT;
    }
    height
}

// Installed on every new document. The timing buffer only holds 250 entries
// by default; the observer keeps counting past it.
const RESOURCE_COUNTER_SCRIPT: &str = r#"(function(){
    if (window.__pagediffResources) return;
    var state = window.__pagediffResources = { count: 0, observing: false };
    try { performance.setResourceTimingBufferSize(1000000); } catch (e) {}
    try {
        new PerformanceObserver(function(list){ state.count += list.getEntries().length; })
            .observe({ type: 'resource', buffered: true });
        state.observing = true;
    } catch (e) {}
})()"#;

const RESOURCE_COUNT_SCRIPT: &str = r#"(function(){
    var state = window.__pagediffResources;
    var buffered = performance.getEntriesByType('resource').length;
    return state && state.observing ? Math.max(state.count, buffered) : buffered;
})()"#;

const IMAGE_WAIT_TEMPLATE: &str = r#"(function(){
    const img = document.images[{{INDEX}}];
    if (!img || img.complete) return Promise.resolve('loaded');
    return new Promise(function(resolve){
        img.addEventListener('load', function(){ resolve('loaded'); }, { once: true });
        img.addEventListener('error', function(){ resolve('failed'); }, { once: true });
        setTimeout(function(){ resolve('timeout'); }, {{LIMIT_MS}});
    });
})()"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_wait_script_substitutes_index_and_limit() {
        let script = IMAGE_WAIT_TEMPLATE
            .replace("{{INDEX}}", "3")
            .replace("{{LIMIT_MS}}", "5000");
        assert!(script.contains("document.images[3]"));
        assert!(script.contains("}, 5000);"));
        assert!(!script.contains("{{"));
    }

    #[test]
    fn resource_counter_outlives_timing_buffer() {
        assert!(RESOURCE_COUNTER_SCRIPT.contains("setResourceTimingBufferSize"));
        assert!(RESOURCE_COUNTER_SCRIPT.contains("PerformanceObserver"));
        assert!(RESOURCE_COUNT_SCRIPT.contains("__pagediffResources"));
    }

    #[test]
    fn capture_height_is_clamped() {
        assert_eq!(capture_height(300, 600), 600);
        assert_eq!(capture_height(2400, 600), 2400);
        assert_eq!(capture_height(100_000, 600), MAX_CAPTURE_HEIGHT);
    }

    fn launch_or_skip(config: &LaunchConfig) -> Option<Chrome> {
        match Chrome::launch(config) {
            Ok(chrome) => Some(chrome),
            Err(e) => {
                eprintln!("Skipping CDP test because Chrome is not available or failed to launch: {}", e);
                None
            }
        }
    }

    #[test]
    #[ignore = "requires a local Chrome"]
    fn test_cdp_session_creation() {
        let config = LaunchConfig::default();
        let Some(chrome) = launch_or_skip(&config) else {
            return;
        };
        let viewport = Viewport::new(640, 480);
        let session = CdpSession::open(&chrome, viewport, &config, Duration::from_secs(10))
            .expect("context on a running browser");
        assert_eq!(session.viewport(), viewport);
        assert!(!session.context_id().is_empty());
        session.dispose(&chrome);
    }

    #[test]
    #[ignore = "requires a local Chrome"]
    fn test_disposed_context_is_gone() {
        let config = LaunchConfig::default();
        let Some(chrome) = launch_or_skip(&config) else {
            return;
        };
        let session = CdpSession::open(&chrome, Viewport::new(640, 480), &config, Duration::from_secs(10))
            .expect("context on a running browser");
        let id = session.context_id().to_string();
        session.dispose(&chrome);

        // Chrome no longer knows the context, so a second disposal is refused.
        assert!(chrome.dispose_context(&id).is_err());
        assert!(chrome.is_alive());
    }
}
