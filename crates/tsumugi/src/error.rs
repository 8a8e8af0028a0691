use thiserror::Error;

#[derive(Error, Debug)]
pub enum TsumugiError {
    #[error("Invalid m3u8 file: {0}")]
    Parse(String),

    #[error("Failed to fetch key from {url}: {reason}")]
    KeyFetch { url: String, reason: String },

    #[error("Failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("Decryption failed: {0}")]
    Decrypt(String),

    #[error("Failed to write output: {0}")]
    Assembly(#[source] std::io::Error),

    #[error("Download cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Request(#[from] reqwest::Error),
}

impl TsumugiError {
    /// Whether the error stops the whole job rather than a single segment.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Fetch { .. } | Self::Decrypt(_))
    }

    pub(crate) fn fetch(url: impl ToString, reason: impl ToString) -> Self {
        Self::Fetch {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn key_fetch(url: impl ToString, reason: impl ToString) -> Self {
        Self::KeyFetch {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type TsumugiResult<T> = Result<T, TsumugiError>;
