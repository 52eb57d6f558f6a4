use std::collections::HashMap;

use crate::config::AppConfig;

/// Exact header names the input table must carry, case-sensitive.
pub const COL_IDENTITY: &str = "NO IDENTITAS";
pub const COL_FAMILY_CARD: &str = "NOMOR KK";
pub const COL_NAME: &str = "NAMA LENGKAP";
pub const COL_PAYLOAD: &str = "KODE QR";
pub const COL_DISTRICT: &str = "KECAMATAN";
pub const COL_SUBDISTRICT: &str = "KELURAHAN";

pub const REQUIRED_COLUMNS: [&str; 4] = [COL_IDENTITY, COL_FAMILY_CARD, COL_NAME, COL_PAYLOAD];

/// National identity and family-card numbers are always exactly 16 digits.
pub const ID_NUMBER_LEN: usize = 16;

const DEFAULT_DISTRICT: &str = "Kecamatan";
const DEFAULT_SUBDISTRICT: &str = "Kelurahan";

/// One table row paired with its ordinal position in the input.
#[derive(Debug, Clone)]
pub struct RawRow {
    pub index: usize,
    pub cells: HashMap<String, String>,
}

impl RawRow {
    pub fn get(&self, column: &str) -> Option<&str> {
        self.cells.get(column).map(String::as_str)
    }
}

/// A rejected row. `reason` is the user-facing text for the summary;
/// `token` is the terse label recorded in the audit trail, which must stay
/// free of identifier digits.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub token: &'static str,
    pub reason: String,
}

impl Rejection {
    fn new(token: &'static str, reason: impl Into<String>) -> Self {
        Self {
            token,
            reason: reason.into(),
        }
    }
}

/// A row after extraction, validation and sanitization. Destination paths
/// are only ever computed from values that went through here.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRecord {
    pub identity: String,
    pub family_card: String,
    pub name: String,
    pub district: String,
    pub subdistrict: String,
    pub payload: String,
}

impl CanonicalRecord {
    /// Builds a canonical record from one raw row, or the reason the row is
    /// invalid. Digit validation runs before anything path-like is derived.
    pub fn from_row(row: &RawRow, config: &AppConfig) -> Result<Self, Rejection> {
        let identity = clean_number(row.get(COL_IDENTITY).unwrap_or(""));
        if !valid_number(&identity, ID_NUMBER_LEN) {
            return Err(Rejection::new("invalid_nik", format!("Invalid NIK: {identity}")));
        }
        let family_card = clean_number(row.get(COL_FAMILY_CARD).unwrap_or(""));
        if !valid_number(&family_card, ID_NUMBER_LEN) {
            return Err(Rejection::new("invalid_kk", format!("Invalid KK: {family_card}")));
        }

        let name = sanitize_filename(row.get(COL_NAME).unwrap_or(""));
        let district = folder_or_default(row.get(COL_DISTRICT), DEFAULT_DISTRICT);
        let subdistrict = folder_or_default(row.get(COL_SUBDISTRICT), DEFAULT_SUBDISTRICT);

        let payload = escape_html(row.get(COL_PAYLOAD).unwrap_or("").trim());
        if payload.chars().count() > config.max_qr_content_length {
            return Err(Rejection::new("qr_content_too_long", "QR content too long"));
        }

        Ok(Self {
            identity,
            family_card,
            name,
            district,
            subdistrict,
            payload,
        })
    }

    /// Destination file name. Every part is already filesystem-safe, so the
    /// joined name carries no separators.
    pub fn file_name(&self) -> String {
        format!("{}-{}-{}.png", self.identity, self.family_card, self.name)
    }
}

/// Missing column: the fixed placeholder label. Present value: sanitized,
/// with the generic fallback when nothing survives sanitization.
fn folder_or_default(value: Option<&str>, default_label: &str) -> String {
    match value {
        Some(v) => sanitize_folder(v),
        None => default_label.to_string(),
    }
}

pub fn clean_number(value: &str) -> String {
    value.chars().filter(char::is_ascii_digit).collect()
}

pub fn valid_number(value: &str, len: usize) -> bool {
    !value.is_empty() && value.len() == len && value.chars().all(|c| c.is_ascii_digit())
}

/// Replaces every character outside `[A-Za-z0-9._-]` with `_`, trims the
/// underscores off both ends and falls back to `"file"` for names that
/// sanitize away entirely.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('_');
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Folder labels additionally exclude the dot, so no token can ever spell a
/// relative path component.
pub fn sanitize_folder(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('_');
    if trimmed.is_empty() {
        "folder".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Escapes `& < > " '` the way HTML attribute text is escaped.
pub fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}
