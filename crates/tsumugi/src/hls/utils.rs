use url::Url;

use crate::error::{TsumugiError, TsumugiResult};

/// Split an attribute list like `METHOD=AES-128,URI="a,b.key"` into trimmed name/value pairs.
///
/// Commas inside quoted strings do not split, and surrounding quotes are removed from values.
pub fn split_attributes(input: &str) -> Vec<(String, String)> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);

    parts
        .into_iter()
        .filter_map(|part| {
            let (name, value) = part.split_once('=')?;
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            Some((name.trim().to_string(), value.to_string()))
        })
        .collect()
}

/// Resolve a playlist URI against the URL the playlist was retrieved from.
///
/// Absolute URIs pass through, `/path` joins the scheme and host, anything else joins
/// the playlist's directory.
pub fn resolve_uri(base: &Url, uri: &str) -> TsumugiResult<Url> {
    base.join(uri.trim())
        .map_err(|e| TsumugiError::Parse(format!("Invalid URI {uri}: {e}")))
}

/// Decode an `IV=0x...` attribute into 16 bytes, left-padding short values with zeros.
pub fn decode_iv(iv: &str) -> TsumugiResult<[u8; 16]> {
    let hex_str = iv
        .strip_prefix("0x")
        .or_else(|| iv.strip_prefix("0X"))
        .unwrap_or(iv);
    if hex_str.is_empty() {
        return Err(TsumugiError::Parse(format!("IV is empty: {iv:?}")));
    }
    let hex_str = if hex_str.len() % 2 == 1 {
        format!("0{hex_str}")
    } else {
        hex_str.to_string()
    };

    let bytes = hex::decode(hex_str)
        .map_err(|e| TsumugiError::Parse(format!("Invalid IV {iv}: {e}")))?;
    if bytes.len() > 16 {
        return Err(TsumugiError::Parse(format!(
            "IV is longer than 16 bytes: {iv}"
        )));
    }

    let mut result = [0u8; 16];
    result[16 - bytes.len()..].copy_from_slice(&bytes);
    Ok(result)
}
