pub mod format;
pub mod playlist;
pub mod utils;

pub use format::SegmentFormat;
pub use playlist::{parse_playlist, CipherMethod, KeyDeclaration, Manifest};
