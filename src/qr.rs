use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use dashmap::DashSet;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use log::{error, info};
use qrcode::{EcLevel, QrCode};

use crate::record::CanonicalRecord;

/// Pixels per QR module before upscaling.
const MODULE_PIXELS: u32 = 10;
/// Integer upscale factor applied after rendering.
const SCALE_FACTOR: u32 = 6;

/// Destination paths claimed by rows of the current run. Makes duplicate
/// rows deterministic instead of racing on the existence check.
pub type ClaimedPaths = Arc<DashSet<PathBuf>>;

/// Per-row result of attempted QR generation. Exactly one per input row.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Created { file: String },
    Skipped { file: String },
    Invalid { reason: String },
    Blocked { reason: String },
    Error { message: String },
}

impl Outcome {
    /// Tag recorded in the audit trail.
    pub fn action(&self) -> &'static str {
        match self {
            Outcome::Created { .. } => "ok",
            Outcome::Skipped { .. } => "skip",
            Outcome::Invalid { .. } => "invalid",
            Outcome::Blocked { .. } => "blocked",
            Outcome::Error { .. } => "error",
        }
    }
}

/// Renders one canonical record into the output tree. Never returns an
/// error: every failure mode maps onto an `Outcome` variant, so no row can
/// take the batch down with it. `output_root` must be canonical.
pub fn write_qr(record: &CanonicalRecord, output_root: &Path, claimed: &ClaimedPaths) -> Outcome {
    let folder = output_root.join(&record.district).join(&record.subdistrict);
    let file_name = record.file_name();
    let file_path = folder.join(&file_name);

    // both the folder and the final file must stay under the root; a
    // failure here means sanitization was bypassed
    if let Err(detail) =
        ensure_within(output_root, &folder).and_then(|_| ensure_within(output_root, &file_path))
    {
        error!("Blocked traversal attempt for {}: {}", file_path.display(), detail);
        return Outcome::Blocked {
            reason: "Illegal destination path detected".to_string(),
        };
    }

    if !claimed.insert(file_path.clone()) {
        return Outcome::Skipped { file: file_name };
    }
    if file_path.exists() {
        info!("SKIP: {} already present", file_name);
        return Outcome::Skipped { file: file_name };
    }

    match render_to_file(&record.payload, &folder, &file_path) {
        Ok(()) => {
            info!("OK: {} created", file_name);
            Outcome::Created { file: file_name }
        }
        Err(message) => {
            error!("Failed to create {}: {}", file_name, message);
            Outcome::Error { message }
        }
    }
}

fn render_to_file(payload: &str, folder: &Path, file_path: &Path) -> Result<(), String> {
    fs::create_dir_all(folder)
        .map_err(|e| format!("Failed to create {}: {}", folder.display(), e))?;

    let code = QrCode::with_error_correction_level(payload.as_bytes(), EcLevel::H)
        .map_err(|e| format!("Failed to encode QR: {e}"))?;
    let modules = code
        .render::<image::Luma<u8>>()
        .module_dimensions(MODULE_PIXELS, MODULE_PIXELS)
        .quiet_zone(true)
        .build();

    let rgb = DynamicImage::ImageLuma8(modules).to_rgb8();
    let (width, height) = rgb.dimensions();
    let scaled = image::imageops::resize(
        &rgb,
        width * SCALE_FACTOR,
        height * SCALE_FACTOR,
        FilterType::Lanczos3,
    );

    // temp sibling plus rename, so a concurrent reader never sees half a PNG
    let tmp_path = file_path.with_extension("png.tmp");
    if let Err(e) = scaled.save_with_format(&tmp_path, ImageFormat::Png) {
        let _ = fs::remove_file(&tmp_path);
        return Err(format!("Failed to write image: {e}"));
    }
    fs::rename(&tmp_path, file_path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        format!("Failed to finalize image: {e}")
    })
}

fn ensure_within(root: &Path, candidate: &Path) -> Result<(), String> {
    let normalized = normalize_lexically(candidate)?;
    if normalized.starts_with(root) {
        Ok(())
    } else {
        Err(format!("{} escapes {}", normalized.display(), root.display()))
    }
}

/// Resolves `.` and `..` lexically, without touching the filesystem, so the
/// containment check also covers paths that do not exist yet.
fn normalize_lexically(path: &Path) -> Result<PathBuf, String> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(format!("too many parent references in {}", path.display()));
                }
            }
            Component::CurDir => {}
            Component::Normal(name) => normalized.push(name),
            Component::RootDir => normalized.push(Component::RootDir),
            Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
        }
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record() -> CanonicalRecord {
        CanonicalRecord {
            identity: "1234567890123455".to_string(),
            family_card: "6543210987654321".to_string(),
            name: "Budi_Santoso".to_string(),
            district: "Kecamatan".to_string(),
            subdistrict: "Kelurahan".to_string(),
            payload: "hello world".to_string(),
        }
    }

    #[test]
    fn containment_check_blocks_parent_references() {
        let root = Path::new("/srv/out");
        assert!(ensure_within(root, &root.join("a").join("b")).is_ok());
        assert!(ensure_within(root, &root.join("..").join("elsewhere")).is_err());
        assert!(ensure_within(root, &root.join("a/../../../etc")).is_err());
    }

    #[test]
    fn writes_an_upscaled_png_into_the_region_tree() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let claimed = ClaimedPaths::default();

        let outcome = write_qr(&record(), &root, &claimed);
        let file = "1234567890123455-6543210987654321-Budi_Santoso.png";
        assert_eq!(outcome, Outcome::Created { file: file.to_string() });

        let path = root.join("Kecamatan").join("Kelurahan").join(file);
        let img = image::open(&path).unwrap();
        // module size times upscale factor divides both dimensions
        assert_eq!(img.width(), img.height());
        assert_eq!(img.width() % (MODULE_PIXELS * SCALE_FACTOR), 0);
        // no temp sibling left behind
        assert!(!path.with_extension("png.tmp").exists());
    }

    #[test]
    fn existing_files_are_skipped_and_never_rewritten() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();

        let outcome = write_qr(&record(), &root, &ClaimedPaths::default());
        assert!(matches!(outcome, Outcome::Created { .. }));

        let path = root
            .join("Kecamatan")
            .join("Kelurahan")
            .join(record().file_name());
        let before = std::fs::read(&path).unwrap();

        // fresh claim set simulates a whole new run over the same tree
        let outcome = write_qr(&record(), &root, &ClaimedPaths::default());
        assert!(matches!(outcome, Outcome::Skipped { .. }));
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn duplicate_rows_in_one_run_are_skipped_via_the_claim_set() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let claimed = ClaimedPaths::default();

        assert!(matches!(write_qr(&record(), &root, &claimed), Outcome::Created { .. }));
        assert!(matches!(write_qr(&record(), &root, &claimed), Outcome::Skipped { .. }));
    }

    #[test]
    fn unsanitized_region_labels_are_blocked_without_touching_disk() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();

        // bypasses the normalizer on purpose; the writer must still refuse
        let mut bad = record();
        bad.district = "..".to_string();
        let outcome = write_qr(&bad, &root, &ClaimedPaths::default());
        assert!(matches!(outcome, Outcome::Blocked { .. }));
        assert_eq!(std::fs::read_dir(&root).unwrap().count(), 0);
    }
}
