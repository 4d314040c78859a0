use anyhow::Context;
use rand::RngCore;

fn hex_digit(nibble: u8) -> u8 {
    match nibble {
        0..=9 => b'0' + nibble,
        10..=15 => b'a' + (nibble - 10),
        _ => b'0',
    }
}

/// Lowercase hex string built from `bytes` bytes of OS randomness.
///
/// # Errors
/// Returns an error if the OS random source is unavailable.
pub fn random_hex_id(bytes: usize) -> anyhow::Result<String> {
    let mut raw = vec![0_u8; bytes];
    rand::rngs::OsRng
        .try_fill_bytes(&mut raw)
        .context("read OS randomness")?;

    let mut out = String::with_capacity(bytes.saturating_mul(2));
    for b in raw {
        out.push(char::from(hex_digit(b >> 4)));
        out.push(char::from(hex_digit(b & 0x0f)));
    }
    Ok(out)
}

/// 8-character hex id, used for store lock owners.
///
/// # Errors
/// Returns an error if the OS random source is unavailable.
pub fn random_id8() -> anyhow::Result<String> {
    random_hex_id(4)
}

/// Identifier for an ingested item when the caller does not supply one.
///
/// # Errors
/// Returns an error if the OS random source is unavailable.
pub fn new_item_id() -> anyhow::Result<String> {
    Ok(format!("item-{}", random_hex_id(6)?))
}

/// Item ids are opaque, but they end up in file names and log lines, so keep them tame.
///
/// # Errors
/// Returns an error if `id` is empty, longer than 128 bytes, or contains characters other
/// than ASCII alphanumerics, `-`, `_`, `.` and `:`.
pub fn validate_item_id(id: &str) -> anyhow::Result<()> {
    if id.is_empty() {
        return Err(anyhow::anyhow!("item id must not be empty"));
    }
    if id.len() > 128 {
        return Err(anyhow::anyhow!("item id must be at most 128 bytes"));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
    {
        return Err(anyhow::anyhow!("item id contains unsupported characters: {id}"));
    }
    Ok(())
}
