use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use log::info;
use pagediff::async_api::SharedBrowser;
use pagediff::server::{self, AppState};
use pagediff::store::DirStore;
use pagediff::{CaptureRequest, Comparator, CompareConfig, Viewport};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "pagediff", version, about = "Full-page visual comparison of two web pages")]
struct Cli {
    #[command(flatten)]
    options: GlobalOptions,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct GlobalOptions {
    /// Chrome/Chromium binary (auto-detected when omitted)
    #[arg(long, env = "CHROME_PATH", global = true)]
    chrome_path: Option<PathBuf>,

    /// Disable Chrome's sandbox (needed in most containers)
    #[arg(long, global = true)]
    no_sandbox: bool,

    /// Upper bound for navigation plus network idle, in milliseconds
    #[arg(long, default_value_t = 30_000, global = true)]
    navigation_timeout_ms: u64,

    /// Per-pixel color distance threshold in [0, 1]
    #[arg(long, default_value_t = 0.1, global = true)]
    threshold: f64,

    /// Directory screenshots and diff images are written to
    #[arg(long, env = "PAGEDIFF_ARTIFACT_DIR", default_value = "screenshots", global = true)]
    artifact_dir: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP service
    Serve {
        #[arg(long, env = "HOST", default_value = "0.0.0.0")]
        host: IpAddr,

        #[arg(long, env = "PORT", default_value_t = 5001)]
        port: u16,
    },
    /// Compare two pages once and print the summary as JSON
    Compare {
        url_a: String,
        url_b: String,

        #[arg(long, default_value_t = 1280)]
        width: u32,

        #[arg(long, default_value_t = 720)]
        height: u32,
    },
}

impl GlobalOptions {
    fn into_config(self) -> anyhow::Result<CompareConfig> {
        let mut config = CompareConfig::default();
        config.launch.chrome_path = self.chrome_path;
        config.launch.sandbox = !self.no_sandbox;
        config.render.navigation_timeout = Duration::from_millis(self.navigation_timeout_ms);
        config.diff.threshold = self.threshold;
        config.artifact_dir = self.artifact_dir;
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = cli.options.into_config()?;

    let browser = SharedBrowser::new(config.launch.clone(), config.render.navigation_timeout)
        .context("failed to start browser worker")?;
    let store = Arc::new(
        DirStore::open(&config.artifact_dir, &config.public_prefix)
            .with_context(|| format!("failed to open artifact directory {}", config.artifact_dir.display()))?,
    );
    let comparator = Comparator::from_config(browser.clone(), store, &config);

    let outcome = match cli.command {
        Command::Serve { host, port } => {
            let state = Arc::new(AppState::new(comparator, config.public_prefix.clone()));
            let shutdown = async {
                let _ = tokio::signal::ctrl_c().await;
                info!("Shutting down");
            };
            server::serve(SocketAddr::new(host, port), state, shutdown)
                .await
                .context("server failed")
        }
        Command::Compare {
            url_a,
            url_b,
            width,
            height,
        } => {
            let request = CaptureRequest::new(url_a, url_b, Viewport::new(width, height));
            match comparator.compare(&request).await {
                Ok(summary) => serde_json::to_string_pretty(&summary)
                    .map(|json| println!("{}", json))
                    .context("failed to serialize summary"),
                Err(err) => Err(anyhow::Error::new(err).context("comparison failed")),
            }
        }
    };

    browser.shutdown().await.context("failed to close browser")?;
    outcome
}
