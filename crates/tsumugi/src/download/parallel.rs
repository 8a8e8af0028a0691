use std::{
    num::NonZeroU32,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{DownloadReport, Progress, SegmentFailure};
use crate::{
    cache::SegmentCache,
    decrypt::{HlsKey, SegmentDecryptor},
    error::{TsumugiError, TsumugiResult},
    fetch::fetch_segment,
    hls::{parse_playlist, Manifest},
    merge::ConcatMerger,
    segment::{SegmentStatus, SegmentTask},
    util::http::HttpClient,
};

/// Drives every segment of a playlist to a terminal state, then merges the result.
pub struct ParallelDownloader {
    client: HttpClient,
    concurrency: NonZeroU32,
    retries: u32,
    timeout: Duration,
    key: Option<HlsKey>,

    cache: SegmentCache,
    merger: ConcatMerger,
    keep_segments: bool,

    cancellation: CancellationToken,
    progress: Progress,
}

/// Everything a worker needs, shared read-only between workers.
struct WorkerContext {
    client: HttpClient,
    decryptor: SegmentDecryptor,
    cache: Arc<SegmentCache>,
    timeout: Duration,
    retries: u32,
    cancellation: CancellationToken,
    progress: Progress,
}

/// Self-contained result of one task, returned by its worker.
struct SegmentOutcome {
    task: SegmentTask,
    error: Option<TsumugiError>,
}

impl ParallelDownloader {
    pub fn builder() -> ParallelDownloaderBuilder {
        ParallelDownloaderBuilder::new()
    }

    pub fn progress(&self) -> Progress {
        self.progress.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Parse `playlist` retrieved from `playlist_url` and download it.
    pub async fn download(self, playlist: &str, playlist_url: &Url) -> TsumugiResult<DownloadReport> {
        let manifest = parse_playlist(playlist, playlist_url)?;
        self.download_manifest(manifest).await
    }

    pub async fn download_manifest(mut self, manifest: Manifest) -> TsumugiResult<DownloadReport> {
        let key = match self.resolve_key(&manifest).await {
            Ok(key) => key,
            Err(e) => {
                // nothing can be decrypted without the key
                self.cancellation.cancel();
                tracing::error!("{e}");
                return Err(e);
            }
        };
        let decryptor = SegmentDecryptor::new(manifest.cipher_method, key)?;

        self.cache.ensure_cache_dir().await?;
        let cache = Arc::new(self.cache);

        let tasks = SegmentTask::from_manifest(&manifest);
        self.progress.set_total(tasks.len());
        tracing::info!(
            "Start downloading {} segments with {} thread(s).",
            tasks.len(),
            self.concurrency.get()
        );

        let context = Arc::new(WorkerContext {
            client: self.client,
            decryptor,
            cache: cache.clone(),
            timeout: self.timeout,
            retries: self.retries,
            cancellation: self.cancellation.clone(),
            progress: self.progress.clone(),
        });
        let tasks = run_tasks(context, tasks, self.concurrency).await;

        let mut failures = Vec::new();
        let tasks: Vec<SegmentTask> = tasks
            .into_iter()
            .map(|outcome| {
                if let Some(error) = outcome.error {
                    failures.push(SegmentFailure {
                        index: outcome.task.index,
                        url: outcome.task.uri.to_string(),
                        reason: error.to_string(),
                    });
                }
                outcome.task
            })
            .collect();

        if !failures.is_empty() {
            tracing::error!("Failed to download {} segments:", failures.len());
            for failure in failures.iter() {
                tracing::error!("  - #{} {}: {}", failure.index, failure.url, failure.reason);
            }
        }

        let merged = self.merger.merge(&tasks).await?;
        let report = DownloadReport::new(tasks, failures, merged);

        if !self.keep_segments {
            if let Err(e) = cache.cleanup().await {
                tracing::warn!("Failed to clean up {}: {e}", cache.cache_dir().display());
            }
        }

        Ok(report)
    }

    async fn resolve_key(&self, manifest: &Manifest) -> TsumugiResult<Option<Arc<HlsKey>>> {
        if !manifest.is_encrypted() {
            return Ok(None);
        }
        if let Some(key) = &self.key {
            log::debug!("Using manual key.");
            return Ok(Some(Arc::new(key.clone())));
        }

        let key_uri = manifest
            .key_uri
            .as_ref()
            .ok_or_else(|| TsumugiError::Parse("Key URI is missing".to_string()))?;
        let key = HlsKey::fetch(&self.client, key_uri, self.timeout).await?;
        Ok(Some(Arc::new(key)))
    }
}

/// Run all tasks with at most `concurrency` in flight. Outcomes are returned in index order.
async fn run_tasks(
    context: Arc<WorkerContext>,
    tasks: Vec<SegmentTask>,
    concurrency: NonZeroU32,
) -> Vec<SegmentOutcome> {
    let permits = Arc::new(Semaphore::new(concurrency.get() as usize));
    let mut outcomes: Vec<Option<SegmentOutcome>> = (0..tasks.len()).map(|_| None).collect();
    let mut join_set = JoinSet::new();

    let mut pending = tasks.iter().cloned();
    for task in pending.by_ref() {
        let permit = tokio::select! {
            biased;
            _ = context.cancellation.cancelled() => None,
            permit = permits.clone().acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            let index = task.index;
            outcomes[index] = Some(cancelled(task));
            break;
        };

        let context = context.clone();
        join_set.spawn(async move {
            let outcome = process_segment(&context, task).await;
            drop(permit);
            outcome
        });
    }

    // stop dispatching, tasks already running are allowed to finish
    for task in pending {
        let index = task.index;
        outcomes[index] = Some(cancelled(task));
    }
    if context.cancellation.is_cancelled() {
        tracing::info!("Downloader stopped, waiting for running tasks.");
    }

    while let Some(result) = join_set.join_next().await {
        match result {
            Ok(outcome) => {
                let index = outcome.task.index;
                outcomes[index] = Some(outcome);
            }
            Err(e) => tracing::error!("Segment worker crashed: {e}"),
        }
    }

    outcomes
        .into_iter()
        .zip(tasks)
        .map(|(outcome, task)| {
            outcome.unwrap_or_else(|| {
                failed(task, std::io::Error::other("segment worker crashed").into())
            })
        })
        .collect()
}

/// Fetch and decrypt one segment, retrying up to `context.retries` times.
async fn process_segment(context: &WorkerContext, mut task: SegmentTask) -> SegmentOutcome {
    let path = context.cache.segment_path(&task);
    let filename = task.file_name().to_string();
    let mut retries = context.retries;

    let result = loop {
        let result = async {
            let data = fetch_segment(&context.client, &task.uri, context.timeout).await?;
            task.status = SegmentStatus::Fetched;
            context
                .decryptor
                .decrypt_to_file(&data, &task.iv, &path)
                .await
        }
        .await;

        match result {
            Ok(path) => break Ok(path),
            Err(e) => {
                // no partial file may outlive a failed attempt
                if let Err(e) = context.cache.invalidate(&task).await {
                    tracing::warn!("Failed to remove {}: {e}", path.display());
                }
                if retries == 0 || context.cancellation.is_cancelled() {
                    break Err(e);
                }
                retries -= 1;
                tracing::warn!("Processing {filename} failed, retry later. {e}");
            }
        }
    };

    let downloaded = context.progress.advance();
    let total = context.progress.total();
    let percentage = context.progress.percentage();
    match result {
        Ok(path) => {
            tracing::info!(
                "Processing {filename} finished. ({downloaded} / {total} or {percentage:.2}%)"
            );
            task.status = SegmentStatus::Decrypted;
            task.local_path = Some(path);
            SegmentOutcome { task, error: None }
        }
        Err(e) => {
            tracing::error!("Processing {filename} failed, max retries exceed, drop. {e}");
            failed(task, e)
        }
    }
}

fn failed(mut task: SegmentTask, error: TsumugiError) -> SegmentOutcome {
    task.status = SegmentStatus::Failed;
    task.local_path = None;
    SegmentOutcome {
        task,
        error: Some(error),
    }
}

fn cancelled(task: SegmentTask) -> SegmentOutcome {
    failed(task, TsumugiError::Cancelled)
}

pub struct ParallelDownloaderBuilder {
    client: Option<HttpClient>,
    concurrency: NonZeroU32,
    retries: u32,
    timeout: Duration,
    key: Option<HlsKey>,
    output: PathBuf,
    temp_dir: Option<PathBuf>,
    keep_segments: bool,
    cancellation: Option<CancellationToken>,
}

impl ParallelDownloaderBuilder {
    pub fn new() -> Self {
        Self {
            client: None,
            concurrency: NonZeroU32::MIN.saturating_add(4),
            retries: 3,
            timeout: Duration::from_secs(20),
            key: None,
            output: PathBuf::from("output.ts"),
            temp_dir: None,
            keep_segments: false,
            cancellation: None,
        }
    }

    pub fn client(mut self, client: HttpClient) -> Self {
        self.client = Some(client);
        self
    }

    pub fn concurrency(mut self, concurrency: NonZeroU32) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Extra attempts for a failed segment. `0` disables retry.
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Timeout of every key and segment request.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Use a known key instead of fetching the one declared in the playlist.
    pub fn key(mut self, key: HlsKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = output.into();
        self
    }

    /// Directory for decrypted segments. Created if absent.
    pub fn temp_dir(mut self, temp_dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(temp_dir.into());
        self
    }

    pub fn keep_segments(mut self, keep_segments: bool) -> Self {
        self.keep_segments = keep_segments;
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn build(self) -> ParallelDownloader {
        let temp_dir = self
            .temp_dir
            .unwrap_or_else(|| SegmentCache::default_dir(std::env::temp_dir()));

        ParallelDownloader {
            client: self.client.unwrap_or_default(),
            concurrency: self.concurrency,
            retries: self.retries,
            timeout: self.timeout,
            key: self.key,
            cache: SegmentCache::new(temp_dir),
            merger: ConcatMerger::new(self.output).keep_segments(self.keep_segments),
            keep_segments: self.keep_segments,
            cancellation: self.cancellation.unwrap_or_default(),
            progress: Progress::default(),
        }
    }

    pub async fn download(self, playlist: &str, playlist_url: &Url) -> TsumugiResult<DownloadReport> {
        self.build().download(playlist, playlist_url).await
    }
}

impl Default for ParallelDownloaderBuilder {
    fn default() -> Self {
        Self::new()
    }
}
