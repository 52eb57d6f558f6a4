use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use glob::glob;
use log::{info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::BatchError;

/// Bundles the finished output tree into `<root>.zip` next to the root and
/// returns the archive file name. Callers must only invoke this once every
/// writer is done, so the tree is immutable while it is being read.
pub fn archive_output_root(output_root: &Path) -> Result<String, BatchError> {
    let zip_path = output_root.with_extension("zip");
    let zip_name = zip_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "output.zip".to_string());

    let file = File::create(&zip_path)?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut entries = 0usize;
    for path in walk_sorted(output_root)? {
        let Ok(relative) = path.strip_prefix(output_root) else {
            warn!("Skipping archive entry outside the output root: {}", path.display());
            continue;
        };
        let name = relative.to_string_lossy().replace('\\', "/");
        if path.is_dir() {
            writer.add_directory(name, options)?;
        } else {
            writer.start_file(name, options)?;
            let mut input = File::open(&path)?;
            io::copy(&mut input, &mut writer)?;
            entries += 1;
        }
    }
    writer.finish()?;

    info!("Archived {} files into {}", entries, zip_name);
    Ok(zip_name)
}

/// Glob walk of the whole tree; glob yields paths in sorted order, which
/// keeps the archive layout stable across runs.
fn walk_sorted(root: &Path) -> Result<Vec<PathBuf>, BatchError> {
    let pattern = root.join("**/*").to_string_lossy().to_string();
    let paths = glob(&pattern)
        .map_err(|e| BatchError::Walk(e.to_string()))?
        .filter_map(Result::ok)
        .collect();
    Ok(paths)
}
