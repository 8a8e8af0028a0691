use serde::Serialize;

/// Container format of a media segment, guessed from its file extension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub enum SegmentFormat {
    #[default]
    Mpeg2TS,
    Mp4,
    M4a,
    Aac,
    Mp3,
    Cmfv,
    Cmfa,
    Other(String),
}

impl SegmentFormat {
    pub fn as_ext(&self) -> &str {
        match self {
            Self::Mpeg2TS => "ts",
            Self::Mp4 => "mp4",
            Self::M4a => "m4a",
            Self::Aac => "aac",
            Self::Mp3 => "mp3",
            Self::Cmfv => "cmfv",
            Self::Cmfa => "cmfa",
            Self::Other(ext) => ext.as_str(),
        }
    }

    /// Guess the format from a file name or URI.
    ///
    /// Query string and fragment are ignored, so `a.ts?token=1` is still a transport stream.
    pub fn from_filename(s: &str) -> Self {
        let path = s.split(['?', '#']).next().unwrap_or(s);
        let name = path.rsplit('/').next().unwrap_or(path);
        let ext = match name.rsplit_once('.') {
            Some((_, ext)) => ext.to_ascii_lowercase(),
            None => return Self::Other(String::new()),
        };
        match ext.as_str() {
            "ts" | "m2ts" | "mts" => Self::Mpeg2TS,
            "mp4" | "m4s" | "m4v" => Self::Mp4,
            "m4a" => Self::M4a,
            "aac" => Self::Aac,
            "mp3" => Self::Mp3,
            "cmfv" => Self::Cmfv,
            "cmfa" => Self::Cmfa,
            _ => Self::Other(ext),
        }
    }

    /// Whether a playlist line with this format references a media segment.
    pub fn is_media(&self) -> bool {
        !matches!(self, Self::Other(_))
    }
}
