mod concat;

pub use concat::{ConcatMerger, MergeReport};
