use std::path::PathBuf;

use serde::Serialize;
use tokio::{fs::File, io::AsyncWriteExt};

use crate::{
    error::{TsumugiError, TsumugiResult},
    segment::{SegmentStatus, SegmentTask},
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    /// Output file, `None` when there was nothing to merge
    pub output: Option<PathBuf>,
    pub merged_indices: Vec<usize>,
    /// Segments missing from the output, leaving a gap in the stream
    pub skipped_indices: Vec<usize>,
    /// Decrypted segments whose file could not be opened, with the reason
    pub unreadable: Vec<(usize, String)>,
}

/// Concat all decrypted segments into a single file after all segments are downloaded.
pub struct ConcatMerger {
    /// Final output file path.
    output_file: PathBuf,
    /// Keep segment files after they are copied.
    keep_segments: bool,
}

impl ConcatMerger {
    pub fn new(output_file: impl Into<PathBuf>) -> Self {
        Self {
            output_file: output_file.into(),
            keep_segments: false,
        }
    }

    pub fn keep_segments(mut self, keep_segments: bool) -> Self {
        self.keep_segments = keep_segments;
        self
    }

    /// Append every decrypted segment to the output in ascending index order.
    ///
    /// Failures while copying into the output file are errors. Failed segments, and segments
    /// whose cached file can not be opened, are skipped and reported.
    pub async fn merge(&self, tasks: &[SegmentTask]) -> TsumugiResult<MergeReport> {
        let mut tasks: Vec<&SegmentTask> = tasks.iter().collect();
        tasks.sort_by_key(|task| task.index);

        let mut report = MergeReport::default();
        if !tasks
            .iter()
            .any(|task| task.status == SegmentStatus::Decrypted)
        {
            tracing::warn!("No segment was downloaded, output file is not created.");
            report.skipped_indices = tasks.iter().map(|task| task.index).collect();
            return Ok(report);
        }

        tracing::info!("Merging chunks...");
        if let Some(parent) = self.output_file.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(TsumugiError::Assembly)?;
            }
        }
        let mut output = File::create(&self.output_file)
            .await
            .map_err(TsumugiError::Assembly)?;

        for task in tasks {
            let path = match (&task.status, &task.local_path) {
                (SegmentStatus::Decrypted, Some(path)) => path,
                _ => {
                    report.skipped_indices.push(task.index);
                    continue;
                }
            };

            let mut file = match File::open(path).await {
                Ok(file) => file,
                Err(e) => {
                    tracing::error!(
                        "Failed to read segment {} at {}: {e}",
                        task.index,
                        path.display()
                    );
                    report.skipped_indices.push(task.index);
                    report
                        .unreadable
                        .push((task.index, format!("Failed to read segment file: {e}")));
                    continue;
                }
            };
            tokio::io::copy(&mut file, &mut output)
                .await
                .map_err(TsumugiError::Assembly)?;
            report.merged_indices.push(task.index);

            if !self.keep_segments {
                if let Err(e) = tokio::fs::remove_file(path).await {
                    tracing::warn!("Failed to remove {}: {e}", path.display());
                }
            }
        }
        output.flush().await.map_err(TsumugiError::Assembly)?;

        if !report.skipped_indices.is_empty() {
            tracing::warn!(
                "Output has gaps, skipped segments: {:?}",
                report.skipped_indices
            );
        }
        tracing::info!(
            "All finished. Please checkout your files at {}",
            self.output_file.display()
        );

        report.output = Some(self.output_file.clone());
        Ok(report)
    }
}
