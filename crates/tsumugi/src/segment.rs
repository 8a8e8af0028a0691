use std::path::PathBuf;

use serde::Serialize;
use url::Url;

use crate::hls::{Manifest, SegmentFormat};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum SegmentStatus {
    #[default]
    Pending,
    Fetched,
    Decrypted,
    Failed,
}

impl SegmentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Decrypted | Self::Failed)
    }
}

/// One unit of work derived from a manifest entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentTask {
    /// Position in the manifest, starts from 0
    pub index: usize,
    /// `media_sequence_base + index`
    pub sequence_number: u64,
    pub uri: Url,
    #[serde(skip)]
    pub iv: [u8; 16],
    pub status: SegmentStatus,
    /// Set once the segment is decrypted
    pub local_path: Option<PathBuf>,
}

impl SegmentTask {
    pub fn new(index: usize, sequence_number: u64, uri: Url, explicit_iv: Option<[u8; 16]>) -> Self {
        Self {
            index,
            sequence_number,
            uri,
            iv: explicit_iv.unwrap_or_else(|| (sequence_number as u128).to_be_bytes()),
            status: SegmentStatus::Pending,
            local_path: None,
        }
    }

    /// Create one pending task per manifest segment, in manifest order.
    pub fn from_manifest(manifest: &Manifest) -> Vec<Self> {
        manifest
            .segments
            .iter()
            .enumerate()
            .map(|(index, uri)| {
                Self::new(
                    index,
                    manifest.media_sequence_base.saturating_add(index as u64),
                    uri.clone(),
                    manifest.explicit_iv,
                )
            })
            .collect()
    }

    /// Last path component of the segment URI, used to name its cache file.
    pub fn file_name(&self) -> &str {
        self.uri
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty())
            .unwrap_or("segment")
    }

    pub fn format(&self) -> SegmentFormat {
        SegmentFormat::from_filename(self.file_name())
    }
}
