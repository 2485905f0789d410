use crate::capture::{ImageStatus, PageDriver};
use crate::cdp::{CdpSession, Chrome};
use crate::compare::BrowserBackend;
use crate::{Error, LaunchConfig, Result, Viewport};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;

enum Command {
    Open(Viewport, oneshot::Sender<Result<Arc<CdpSession>>>),
    Dispose(Arc<CdpSession>, Option<oneshot::Sender<()>>),
    Shutdown(oneshot::Sender<()>),
}

/// A process-wide headless browser backed by a dedicated worker thread.
///
/// The worker thread owns the Chrome process and launches it on the first
/// request, so a server starts even when Chrome is slow to boot. A process
/// that has exited since the last request is relaunched before use.
/// Contexts are created and destroyed on the worker; page operations run on
/// tokio's blocking pool so concurrent comparisons do not queue behind each
/// other.
#[derive(Clone)]
pub struct SharedBrowser {
    cmd_tx: Sender<Command>,
}

/// One browsing context opened by [`SharedBrowser`].
///
/// Dropping the page disposes its context, which covers cancelled comparisons.
pub struct ContextPage {
    session: Option<Arc<CdpSession>>,
    cmd_tx: Sender<Command>,
}

impl SharedBrowser {
    /// Spawn the worker thread. Chrome itself is launched lazily.
    pub fn new(config: LaunchConfig, navigation_timeout: Duration) -> Result<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>();
        thread::Builder::new()
            .name("pagediff-browser".into())
            .spawn(move || run_worker(config, navigation_timeout, cmd_rx))?;
        Ok(Self { cmd_tx })
    }

    /// Dispose remaining contexts and close the browser process.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Shutdown(tx)).is_err() {
            // worker already gone
            return Ok(());
        }
        rx.await
            .map_err(|e| Error::InternalError(format!("Shutdown canceled: {}", e)))
    }
}

fn run_worker(config: LaunchConfig, navigation_timeout: Duration, cmd_rx: Receiver<Command>) {
    let mut chrome: Option<Chrome> = None;

    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            Command::Open(viewport, resp) => {
                let current = match ensure_running(&mut chrome, &config) {
                    Ok(current) => current,
                    Err(err) => {
                        let _ = resp.send(Err(err));
                        continue;
                    }
                };
                let res = CdpSession::open(current, viewport, &config, navigation_timeout).map(Arc::new);
                let failed = res.is_err();
                // The caller may have been cancelled while the context was being created.
                deliver(resp, res, |session| {
                    debug!("Open of context {} was abandoned; disposing", session.context_id());
                    session.dispose(current);
                });
                if failed && !current.is_alive() {
                    warn!("Headless browser stopped responding; it will be relaunched");
                    chrome = None;
                }
            }
            Command::Dispose(session, resp) => {
                match chrome.as_ref() {
                    Some(current) => session.dispose(current),
                    None => debug!("Browser gone; context {} already released", session.context_id()),
                }
                if let Some(resp) = resp {
                    let _ = resp.send(());
                }
            }
            Command::Shutdown(resp) => {
                if chrome.take().is_some() {
                    info!("Closed headless browser");
                }
                let _ = resp.send(());
                break;
            }
        }
    }
}

/// Return a responsive browser, launching or relaunching it as needed.
///
/// Chrome exits on its own after `idle_browser_timeout`, so a handle kept
/// across quiet periods may point at a dead process.
fn ensure_running<'a>(chrome: &'a mut Option<Chrome>, config: &LaunchConfig) -> Result<&'a Chrome> {
    if chrome.as_ref().is_some_and(|current| !current.is_alive()) {
        warn!("Headless browser is no longer running; relaunching");
        *chrome = None;
    }
    if chrome.is_none() {
        let launched = Chrome::launch(config)?;
        info!("Launched headless browser");
        *chrome = Some(launched);
    }
    chrome
        .as_ref()
        .ok_or_else(|| Error::InternalError("browser missing after launch".into()))
}

/// Send `res` to the waiting caller, or hand a success nobody will receive to `orphan`.
fn deliver<T>(resp: oneshot::Sender<Result<T>>, res: Result<T>, orphan: impl FnOnce(T)) {
    if let Err(Ok(value)) = resp.send(res) {
        orphan(value);
    }
}

impl ContextPage {
    // Run a blocking session call off the async workers.
    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&CdpSession) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let session = self
            .session
            .clone()
            .ok_or_else(|| Error::RenderError("browsing context already closed".into()))?;
        tokio::task::spawn_blocking(move || f(&session)).await?
    }
}

impl Drop for ContextPage {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = self.cmd_tx.send(Command::Dispose(session, None));
        }
    }
}

#[async_trait]
impl PageDriver for ContextPage {
    async fn navigate(&self, url: &str) -> Result<()> {
        let url = url.to_string();
        self.call(move |s| s.navigate(&url)).await
    }

    async fn loaded_resource_count(&self) -> Result<u64> {
        self.call(|s| s.loaded_resource_count()).await
    }

    async fn scroll_height(&self) -> Result<u64> {
        self.call(|s| s.scroll_height()).await
    }

    async fn scroll_by(&self, dy: u32) -> Result<()> {
        self.call(move |s| s.scroll_by(dy)).await
    }

    async fn scroll_to_top(&self) -> Result<()> {
        self.call(|s| s.scroll_to_top()).await
    }

    async fn pending_images(&self) -> Result<Vec<usize>> {
        self.call(|s| s.pending_images()).await
    }

    async fn wait_for_image(&self, index: usize, limit: Duration) -> Result<ImageStatus> {
        self.call(move |s| s.wait_for_image(index, limit)).await
    }

    async fn capture_full_page(&self, viewport: Viewport) -> Result<Vec<u8>> {
        self.call(move |s| s.capture_full_page(viewport)).await
    }
}

#[async_trait]
impl BrowserBackend for SharedBrowser {
    type Page = ContextPage;

    async fn open_context(&self, viewport: Viewport) -> Result<ContextPage> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Open(viewport, tx))
            .map_err(|_| Error::InitializationError("browser worker has shut down".into()))?;
        let session = rx
            .await
            .map_err(|e| Error::InitializationError(format!("Open canceled: {}", e)))??;
        Ok(ContextPage {
            session: Some(session),
            cmd_tx: self.cmd_tx.clone(),
        })
    }

    async fn close_context(&self, mut page: ContextPage) -> Result<()> {
        let Some(session) = page.session.take() else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Dispose(session, Some(tx)))
            .map_err(|_| Error::InternalError("browser worker has shut down".into()))?;
        rx.await
            .map_err(|e| Error::InternalError(format!("Close canceled: {}", e)))
    }
}
