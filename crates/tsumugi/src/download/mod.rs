mod parallel;

pub use parallel::{ParallelDownloader, ParallelDownloaderBuilder};

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use serde::Serialize;

use crate::{
    merge::MergeReport,
    segment::{SegmentStatus, SegmentTask},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentFailure {
    pub index: usize,
    pub url: String,
    pub reason: String,
}

/// Outcome of a whole download job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DownloadReport {
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<SegmentFailure>,
    /// Merged output file, `None` when no segment succeeded
    pub output: Option<PathBuf>,
    /// Indices missing from the output
    pub skipped_indices: Vec<usize>,
    /// Every task in manifest order, in its terminal state
    pub segments: Vec<SegmentTask>,
}

impl DownloadReport {
    pub fn is_complete(&self) -> bool {
        self.failed == 0 && self.skipped_indices.is_empty() && self.output.is_some()
    }

    /// Build the report from tasks in their terminal state and the merge result.
    ///
    /// Segments the merger could not read are moved from succeeded to failed.
    pub(crate) fn new(
        mut segments: Vec<SegmentTask>,
        mut failures: Vec<SegmentFailure>,
        merged: MergeReport,
    ) -> Self {
        for (index, reason) in merged.unreadable {
            let Some(task) = segments.iter_mut().find(|task| task.index == index) else {
                continue;
            };
            task.status = SegmentStatus::Failed;
            task.local_path = None;
            failures.push(SegmentFailure {
                index,
                url: task.uri.to_string(),
                reason,
            });
        }
        failures.sort_by_key(|failure| failure.index);

        let succeeded = segments
            .iter()
            .filter(|task| task.status == SegmentStatus::Decrypted)
            .count();
        Self {
            succeeded,
            failed: segments.len() - succeeded,
            failures,
            output: merged.output,
            skipped_indices: merged.skipped_indices,
            segments,
        }
    }
}

/// Counter of finished segments, readable while a download is running.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    total: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
}

impl Progress {
    pub fn total(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn percentage(&self) -> f32 {
        let total = self.total();
        if total == 0 {
            0.
        } else {
            self.completed() as f32 / total as f32 * 100.
        }
    }

    pub(crate) fn set_total(&self, total: usize) {
        self.total.store(total, Ordering::Relaxed);
    }

    /// Mark one more segment finished and return the new count.
    pub(crate) fn advance(&self) -> usize {
        self.completed.fetch_add(1, Ordering::Relaxed) + 1
    }
}
