use std::{
    num::NonZeroU32,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use anyhow::{bail, Context};
use fake_user_agent::get_chrome_rua;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Client, Url,
};
use tokio_util::sync::CancellationToken;
use tsumugi::{
    cache::SegmentCache, decrypt::HlsKey, DownloadReport, HttpClient, ParallelDownloader,
};

#[derive(clap::Parser, Debug, Clone)]
#[clap(version, about)]
pub struct TsumugiArgs {
    /// Debug output
    #[clap(long, alias = "debug")]
    pub verbose: bool,

    /// Threads limit
    #[clap(long, default_value = "5")]
    threads: NonZeroU32,

    /// Retry limit of each segment
    #[clap(long, default_value = "3")]
    retries: u32,

    /// Timeout seconds for each playlist/key/segment request.
    #[clap(long, default_value = "20")]
    timeout: u64,

    /// Output file path
    #[clap(short, long, default_value = "./output.ts")]
    output: PathBuf,

    /// Temporary file path
    #[clap(long, env = "TEMP")]
    temp_dir: Option<PathBuf>,

    /// Keep decrypted segments after merging.
    #[clap(short, long)]
    keep: bool,

    /// Set key manually
    ///
    /// Hex encoded AES-128 key. The key declared in the playlist will not be fetched.
    #[clap(long)]
    key: Option<String>,

    /// Base URL used to resolve relative URIs when the playlist is a local file
    #[clap(long)]
    base_url: Option<Url>,

    /// Cookies used to download
    #[clap(long)]
    cookies: Option<String>,

    /// Referer header used to download
    #[clap(long)]
    referer: Option<String>,

    /// User agent used to download. Defaults to a random Chrome user agent.
    #[clap(long)]
    user_agent: Option<String>,

    /// HTTP Header used to download
    ///
    /// Custom header. eg. "User-Agent: xxxxx". A "Cookie" header here overrides --cookies.
    #[clap(short = 'H', long)]
    headers: Vec<String>,

    /// Print the download report as JSON
    #[clap(long)]
    json: bool,

    /// m3u8 file path or URL
    m3u8: String,
}

impl TsumugiArgs {
    fn client(&self) -> anyhow::Result<HttpClient> {
        let mut headers = HeaderMap::new();
        if let Some(referer) = &self.referer {
            headers.insert(
                reqwest::header::REFERER,
                HeaderValue::from_str(referer).context("Invalid referer")?,
            );
        }

        for header in &self.headers {
            let Some((key, value)) = header.split_once(':') else {
                bail!("Invalid header: {header}");
            };
            headers.insert(
                HeaderName::from_str(key.trim()).context("Invalid header name")?,
                HeaderValue::from_str(value.trim()).context("Invalid header value")?,
            );
        }

        let user_agent = self
            .user_agent
            .clone()
            .unwrap_or_else(|| get_chrome_rua().to_string());
        let builder = Client::builder()
            .default_headers(headers)
            .user_agent(user_agent)
            .timeout(Duration::from_secs(self.timeout));
        let client = HttpClient::new(builder)?;

        if let Some(cookies) = &self.cookies {
            let Some(url) = self.cookie_url() else {
                bail!("Can not decide which host --cookies belong to, use --base-url");
            };
            client.add_cookies(vec![cookies.clone()], &url);
        }
        Ok(client)
    }

    /// URL whose host the `--cookies` are sent to.
    fn cookie_url(&self) -> Option<Url> {
        Url::parse(&self.m3u8)
            .ok()
            .filter(|url| matches!(url.scheme(), "http" | "https"))
            .or_else(|| self.base_url.clone())
    }

    fn temp_dir(&self) -> PathBuf {
        let temp_dir = self.temp_dir.clone().unwrap_or_else(std::env::temp_dir);
        let temp_dir = SegmentCache::default_dir(temp_dir);
        log::info!(
            "Temporary path sets to {temp_dir}",
            temp_dir = temp_dir.display()
        );
        temp_dir
    }

    /// Load playlist text and the URL its relative URIs are resolved against.
    async fn load_playlist(&self, client: &HttpClient) -> anyhow::Result<(String, Url)> {
        if let Ok(url) = Url::parse(&self.m3u8) {
            if matches!(url.scheme(), "http" | "https") {
                log::info!("Start fetching M3U8 file.");
                let response = client
                    .get(url)
                    .timeout(Duration::from_secs(self.timeout))
                    .send()
                    .await?
                    .error_for_status()?;
                // relative URIs follow redirects of the playlist request
                let url = response.url().clone();
                let text = response.text().await?;
                log::info!("M3U8 file fetched.");
                return Ok((text, url));
            }
        }

        let Some(base_url) = self.base_url.clone() else {
            bail!("--base-url is required when reading a local playlist file");
        };
        let text = tokio::fs::read_to_string(&self.m3u8)
            .await
            .with_context(|| format!("Failed to read {}", self.m3u8))?;
        Ok((text, base_url))
    }

    /// Run the download and return the process exit code.
    pub async fn run(self) -> anyhow::Result<i32> {
        let client = self.client()?;
        let (playlist, playlist_url) = self.load_playlist(&client).await?;

        // ctrl-c handler
        let cancellation = CancellationToken::new();
        let cancellation_inner = cancellation.clone();
        let ctrlc_handler = tokio::spawn(async move {
            // wait for the first ctrl-c to stop downloader
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            log::info!("Ctrl-C received, stopping downloader.");
            cancellation_inner.cancel();

            // wait for the second ctrl-c to force exit
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("Ctrl-C received again, force exit.");
                std::process::exit(1);
            }
        });

        let mut builder = ParallelDownloader::builder()
            .client(client)
            .concurrency(self.threads)
            .retries(self.retries)
            .timeout(Duration::from_secs(self.timeout))
            .output(&self.output)
            .temp_dir(self.temp_dir())
            .keep_segments(self.keep)
            .cancellation(cancellation);
        if let Some(key) = &self.key {
            builder = builder.key(HlsKey::from_hex(key)?);
        }

        let report = builder.download(&playlist, &playlist_url).await;
        ctrlc_handler.abort();
        let report = report?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print_summary(&report);
        }

        Ok(exit_code(&report))
    }
}

fn print_summary(report: &DownloadReport) {
    log::info!(
        "{} segment(s) succeeded, {} segment(s) failed.",
        report.succeeded,
        report.failed
    );
    for failure in &report.failures {
        log::warn!("  - #{} {}: {}", failure.index, failure.url, failure.reason);
    }
    match &report.output {
        Some(output) => log::info!("Output: {}", output.display()),
        None => log::error!("No segment was downloaded."),
    }
}

/// `0` for a complete output, `1` when the output has gaps, `2` when nothing was written.
pub fn exit_code(report: &DownloadReport) -> i32 {
    if report.output.is_none() {
        2
    } else if report.is_complete() {
        0
    } else {
        1
    }
}
