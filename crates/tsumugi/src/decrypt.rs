use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, KeyIvInit};
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::{
    error::{TsumugiError, TsumugiResult},
    hls::CipherMethod,
    util::http::HttpClient,
};

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

pub const BLOCK_SIZE: usize = 16;

/// Raw AES-128 key shared read-only by every segment of a playlist.
#[derive(Clone, PartialEq, Eq)]
pub struct HlsKey([u8; 16]);

impl std::fmt::Debug for HlsKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HlsKey(..)")
    }
}

impl HlsKey {
    pub fn new(key: [u8; 16]) -> Self {
        Self(key)
    }

    /// Parse a key given manually by the user, e.g. `--key 0123456789abcdef0123456789abcdef`.
    pub fn from_hex(key: &str) -> TsumugiResult<Self> {
        let bytes = hex::decode(key.trim())
            .map_err(|e| TsumugiError::key_fetch("<manual>", format!("invalid hex key: {e}")))?;
        Self::from_bytes("<manual>", bytes)
    }

    /// Fetch the key from `url`. A single request, no retry.
    pub async fn fetch(client: &HttpClient, url: &Url, timeout: Duration) -> TsumugiResult<Self> {
        log::info!("Fetching key from {url}");

        let response = client
            .get(url.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| TsumugiError::key_fetch(url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TsumugiError::key_fetch(url, format!("HTTP error: {status}")));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| TsumugiError::key_fetch(url, e))?;
        Self::from_bytes(url, bytes.to_vec())
    }

    fn from_bytes(source: impl ToString, bytes: Vec<u8>) -> TsumugiResult<Self> {
        let key: [u8; 16] = bytes.try_into().map_err(|v: Vec<u8>| {
            TsumugiError::key_fetch(
                source,
                format!("expected a 16-byte key, got {} bytes", v.len()),
            )
        })?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

pub enum SegmentDecryptor {
    Aes128(Arc<HlsKey>),
    Clear,
}

impl SegmentDecryptor {
    pub fn new(method: CipherMethod, key: Option<Arc<HlsKey>>) -> TsumugiResult<Self> {
        match (method, key) {
            (CipherMethod::None, _) => Ok(Self::Clear),
            (CipherMethod::Aes128Cbc, Some(key)) => Ok(Self::Aes128(key)),
            (CipherMethod::Aes128Cbc, None) => Err(TsumugiError::Decrypt(
                "decryption key required".to_string(),
            )),
        }
    }

    /// Decrypt one segment with its IV and strip block padding when it is well-formed.
    pub fn decrypt(&self, data: &[u8], iv: &[u8; 16]) -> TsumugiResult<Vec<u8>> {
        let key = match self {
            Self::Clear => return Ok(data.to_vec()),
            Self::Aes128(key) => key,
        };

        if data.len() % BLOCK_SIZE != 0 {
            return Err(TsumugiError::Decrypt(format!(
                "ciphertext length {} is not a multiple of {BLOCK_SIZE}",
                data.len()
            )));
        }

        let mut plaintext = Aes128CbcDec::new(key.as_bytes().into(), iv.into())
            .decrypt_padded_vec_mut::<NoPadding>(data)
            .map_err(|e| TsumugiError::Decrypt(e.to_string()))?;
        strip_padding(&mut plaintext);
        Ok(plaintext)
    }

    /// Decrypt `data` and write the plaintext to `path`.
    ///
    /// The file is removed again if writing fails halfway.
    pub async fn decrypt_to_file(
        &self,
        data: &[u8],
        iv: &[u8; 16],
        path: &Path,
    ) -> TsumugiResult<PathBuf> {
        let plaintext = self.decrypt(data, iv)?;

        let result = async {
            let mut file = tokio::fs::File::create(path).await?;
            file.write_all(&plaintext).await?;
            file.flush().await?;
            Ok::<_, std::io::Error>(())
        }
        .await;

        if let Err(e) = result {
            _ = tokio::fs::remove_file(path).await;
            return Err(e.into());
        }
        Ok(path.to_path_buf())
    }
}

/// Remove PKCS#7 padding in place.
///
/// Trailers that are not valid padding are left untouched, as some encoders omit padding.
pub fn strip_padding(data: &mut Vec<u8>) {
    let Some(&pad) = data.last() else {
        return;
    };
    let pad = pad as usize;
    if pad == 0 || pad > BLOCK_SIZE || pad > data.len() {
        return;
    }
    if data[data.len() - pad..].iter().all(|&b| b as usize == pad) {
        data.truncate(data.len() - pad);
    }
}
