use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::AppConfig;
use crate::error::BatchError;

type HmacSha256 = Hmac<Sha256>;

/// How many bytes of a text input are sampled for the decode probe.
const TEXT_SAMPLE_LEN: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Spreadsheet,
    Csv,
}

/// Classifies the input by extension, `None` for anything unsupported.
pub fn input_kind(path: &Path) -> Option<InputKind> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    match ext.as_str() {
        "xlsx" | "xls" => Some(InputKind::Spreadsheet),
        "csv" => Some(InputKind::Csv),
        _ => None,
    }
}

pub fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Input hygiene: existence, size bounds and a cheap well-formedness probe
/// for the declared type. Read-only.
pub fn validate_input(path: &Path, config: &AppConfig) -> Result<InputKind, BatchError> {
    if !path.exists() {
        return Err(BatchError::NotFound(path.to_path_buf()));
    }
    let size = fs::metadata(path)?.len();
    if size == 0 {
        return Err(BatchError::EmptyFile(path.to_path_buf()));
    }
    if size > config.max_file_size_bytes {
        return Err(BatchError::TooLarge {
            size,
            limit: config.max_file_size_bytes,
        });
    }

    let kind = input_kind(path).ok_or_else(|| BatchError::UnsupportedFormat(extension_of(path)))?;
    match kind {
        InputKind::Spreadsheet => {
            // xlsx/xls inputs must at least be a readable archive container
            if zip::ZipArchive::new(File::open(path)?).is_err() {
                return Err(BatchError::MalformedSpreadsheet(path.to_path_buf()));
            }
        }
        InputKind::Csv => {
            let mut sample = vec![0u8; TEXT_SAMPLE_LEN];
            let mut file = File::open(path)?;
            let read = file.read(&mut sample)?;
            sample.truncate(read);
            if !decodes_as_text(&sample) {
                return Err(BatchError::MalformedText(path.to_path_buf()));
            }
        }
    }
    Ok(kind)
}

/// UTF-8 first, Latin-1 as the fallback. Latin-1 maps every byte to the
/// code point of the same value, so the fallback only rejects NUL bytes,
/// which no textual CSV contains.
fn decodes_as_text(sample: &[u8]) -> bool {
    if std::str::from_utf8(sample).is_ok() {
        return true;
    }
    !sample.contains(&0)
}

/// HMAC-SHA256 over the raw file bytes, hex signature compared in constant
/// time. Only consulted when `require_signature` is set.
pub fn verify_signature(
    path: &Path,
    signature: Option<&str>,
    config: &AppConfig,
) -> Result<(), BatchError> {
    if !config.require_signature {
        return Ok(());
    }
    let signature = signature.ok_or(BatchError::SignatureMissing)?;
    if config.signature_secret.is_empty() {
        return Err(BatchError::SecretMissing);
    }
    let expected =
        hex::decode(signature.trim()).map_err(|_| BatchError::SignatureFormat(signature.to_string()))?;

    let mut mac = HmacSha256::new_from_slice(config.signature_secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    let mut file = File::open(path)?;
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        mac.update(&buf[..n]);
    }
    mac.verify_slice(&expected)
        .map_err(|_| BatchError::SignatureMismatch)
}
