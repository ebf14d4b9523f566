//! sdm-extract command line
//!
//! Prints the extracted record as one JSON line on stdout and saves a pretty
//! copy under the output directory. Logs go to stderr.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use sdm_extract::{Credentials, ExtractorConfig, RecordKind, SearchRequest};

/// Look up one service desk record and print it as JSON
#[derive(Parser, Debug)]
#[command(name = "sdm-extract")]
#[command(version)]
struct Cli {
    /// Record identifier to search for
    identifier: Option<String>,

    /// Record kind: change-order, incident or request
    #[arg(short, long, default_value = "change-order")]
    kind: RecordKind,

    /// Application entry point (the frameset document)
    #[arg(long, env = "SDM_BASE_URL")]
    base_url: Option<String>,

    /// URL fetched first to check that the host answers
    #[arg(long)]
    probe_url: Option<String>,

    /// User for HTTP authentication
    #[arg(short, long, env = "SDM_USER")]
    user: Option<String>,

    /// Password for HTTP authentication
    #[arg(long, env = "SDM_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Directory for result files
    #[arg(short, long, default_value = "output")]
    output_dir: PathBuf,

    /// Chrome/Chromium binary
    #[arg(long)]
    chrome_path: Option<String>,

    /// Show the browser window
    #[arg(long)]
    visible: bool,
}

impl Cli {
    fn config(&self) -> ExtractorConfig {
        let credentials = self.user.as_ref().map(|username| Credentials {
            username: username.clone(),
            password: self.password.clone().unwrap_or_default(),
        });
        ExtractorConfig {
            base_url: self.base_url.clone().unwrap_or_default(),
            probe_url: self.probe_url.clone(),
            credentials,
            headless: !self.visible,
            chrome_path: self.chrome_path.clone(),
            output_dir: self.output_dir.clone(),
            ..Default::default()
        }
    }
}

async fn run(cli: Cli) -> sdm_extract::Result<()> {
    let request = SearchRequest::new(cli.kind, cli.identifier.as_deref().unwrap_or_default())?;
    let config = cli.config();

    let output = sdm_extract::pipeline::run(&config, &request).await?;
    println!("{}", output.to_line()?);

    output.write_to(&config.output_dir, request.key(), chrono::Utc::now())?;
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        tracing::error!("{}", e);
        std::process::exit(e.category().exit_code());
    }
}
