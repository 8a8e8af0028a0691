use std::str::FromStr;

use serde::Serialize;
use url::Url;

use super::{
    format::SegmentFormat,
    utils::{decode_iv, resolve_uri, split_attributes},
};
use crate::error::{TsumugiError, TsumugiResult};

const KEY_TAG: &str = "#EXT-X-KEY:";
const MEDIA_SEQUENCE_TAG: &str = "#EXT-X-MEDIA-SEQUENCE:";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum CipherMethod {
    #[default]
    None,
    Aes128Cbc,
}

impl FromStr for CipherMethod {
    type Err = TsumugiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NONE" => Ok(Self::None),
            "AES-128" => Ok(Self::Aes128Cbc),
            _ => Err(TsumugiError::Parse(format!("Unsupported key method: {s}"))),
        }
    }
}

/// Attributes of an `#EXT-X-KEY` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDeclaration {
    pub method: CipherMethod,
    pub uri: Option<String>,
    pub iv: Option<[u8; 16]>,
}

impl KeyDeclaration {
    /// Parse the attribute list following `#EXT-X-KEY:`.
    pub fn parse(attributes: &str) -> TsumugiResult<Self> {
        let mut method = None;
        let mut uri = None;
        let mut iv = None;
        for (name, value) in split_attributes(attributes) {
            match name.as_str() {
                "METHOD" => method = Some(value),
                "URI" => uri = Some(value),
                "IV" => iv = Some(value),
                _ => log::debug!("Ignored key attribute {name}={value}"),
            }
        }

        let method: CipherMethod = method
            .ok_or_else(|| TsumugiError::Parse("METHOD is missing in #EXT-X-KEY".to_string()))?
            .parse()?;
        if method == CipherMethod::None {
            return Ok(Self {
                method,
                uri: None,
                iv: None,
            });
        }

        let uri = match uri {
            Some(uri) if !uri.is_empty() => uri,
            _ => {
                return Err(TsumugiError::Parse(
                    "URI is missing in #EXT-X-KEY".to_string(),
                ))
            }
        };
        let iv = iv.as_deref().map(decode_iv).transpose()?;

        Ok(Self {
            method,
            uri: Some(uri),
            iv,
        })
    }
}

/// Parsed media playlist. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub cipher_method: CipherMethod,
    pub key_uri: Option<Url>,
    pub explicit_iv: Option<[u8; 16]>,
    pub media_sequence_base: u64,
    pub segments: Vec<Url>,
}

impl Manifest {
    pub fn is_encrypted(&self) -> bool {
        self.cipher_method != CipherMethod::None
    }
}

/// Parse playlist text retrieved from `base_url` into a [`Manifest`].
pub fn parse_playlist(text: &str, base_url: &Url) -> TsumugiResult<Manifest> {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    if lines.first() != Some(&"#EXTM3U") {
        log::warn!("Playlist does not start with #EXTM3U, parsing anyway.");
    }

    let key = lines
        .iter()
        .find_map(|line| line.strip_prefix(KEY_TAG))
        .map(KeyDeclaration::parse)
        .transpose()?;

    let media_sequence_base: u64 = match lines
        .iter()
        .find_map(|line| line.strip_prefix(MEDIA_SEQUENCE_TAG))
    {
        Some(value) => value.trim().parse().unwrap_or_else(|_| {
            log::warn!("Invalid media sequence {value}, using 0 instead.");
            0
        }),
        None => 0,
    };

    let segments = lines
        .iter()
        .filter(|line| !line.starts_with('#'))
        .filter(|line| SegmentFormat::from_filename(line).is_media())
        .map(|line| resolve_uri(base_url, line))
        .collect::<TsumugiResult<Vec<_>>>()?;
    if segments.is_empty() {
        return Err(TsumugiError::Parse("No segment found".to_string()));
    }
    // sequence numbers of every segment must fit in u64
    if media_sequence_base
        .checked_add(segments.len() as u64 - 1)
        .is_none()
    {
        return Err(TsumugiError::Parse(format!(
            "Media sequence {media_sequence_base} overflows with {} segments",
            segments.len()
        )));
    }

    let (cipher_method, key_uri, explicit_iv) = match key {
        Some(KeyDeclaration {
            method,
            uri: Some(uri),
            iv,
        }) => (method, Some(resolve_uri(base_url, &uri)?), iv),
        _ => (CipherMethod::None, None, None),
    };

    log::debug!(
        "Parsed playlist: {} segments, method {cipher_method:?}, media sequence {media_sequence_base}",
        segments.len()
    );

    Ok(Manifest {
        cipher_method,
        key_uri,
        explicit_iv,
        media_sequence_base,
        segments,
    })
}
