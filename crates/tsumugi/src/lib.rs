//! ```text
//! ┌──────────────┐    ┌──────────┐
//! │   Playlist   ├────► Manifest ├──────────────────┐
//! └──────────────┘    └────┬─────┘                  │
//!                          │ key_uri                │ segments
//!                     ┌────▼─────┐          ┌───────▼────────┐
//!                     │  HlsKey  ├──────────►  SegmentTask   │ x N
//!                     └──────────┘  shared  └───────┬────────┘
//!                                                   │ fetch_segment
//!                                           ┌───────▼────────┐
//!                      ParallelDownloader   │   decrypt to   │ bounded
//!                                           │  SegmentCache  │ workers
//!                                           └───────┬────────┘
//!                                                   │ index order
//!                                           ┌───────▼────────┐
//!                                           │  ConcatMerger  │
//!                                           └───────┬────────┘
//!                                                   ▼
//!                                             output file
//! ```

pub mod cache;
pub mod decrypt;
pub mod download;
pub mod error;
pub mod fetch;
pub mod hls;
pub mod merge;
pub mod segment;
pub mod util;

pub use download::{DownloadReport, ParallelDownloader, Progress, SegmentFailure};
pub use error::{TsumugiError, TsumugiResult};
pub use hls::Manifest;
pub use segment::{SegmentStatus, SegmentTask};
pub use util::http::HttpClient;
