// src/source/archive.rs

use crate::error::{EtlError, Result};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;
use zip::ZipArchive;

fn zip_error(path: &Path, e: impl std::fmt::Display) -> EtlError {
    EtlError::SourceRead {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

pub fn is_zip(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("zip"))
        .unwrap_or(false)
}

/// `(index, name)` of every `.csv` entry, in archive order.
pub fn csv_entries(zip_path: &Path) -> Result<Vec<(usize, String)>> {
    let file = File::open(zip_path).map_err(|e| zip_error(zip_path, e))?;
    let mut archive = ZipArchive::new(file).map_err(|e| zip_error(zip_path, e))?;

    let mut out = Vec::new();
    for i in 0..archive.len() {
        let entry = archive.by_index(i).map_err(|e| zip_error(zip_path, e))?;
        let name = entry.name().to_string();
        if entry.is_file() && name.to_lowercase().ends_with(".csv") {
            out.push((i, name));
        }
    }
    Ok(out)
}

/// Buffer one archive entry into memory.
pub fn read_entry(zip_path: &Path, index: usize) -> Result<Vec<u8>> {
    let file = File::open(zip_path).map_err(|e| zip_error(zip_path, e))?;
    let mut archive = ZipArchive::new(file).map_err(|e| zip_error(zip_path, e))?;
    let mut entry = archive.by_index(index).map_err(|e| zip_error(zip_path, e))?;

    let mut buf = Vec::with_capacity(entry.size() as usize);
    entry
        .read_to_end(&mut buf)
        .map_err(|e| zip_error(zip_path, e))?;
    Ok(buf)
}

/// Extract every `.csv` entry of `zip_path` into `out_dir`, returning the written paths.
pub fn extract_csv_entries(zip_path: &Path, out_dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(out_dir)?;
    let mut written = Vec::new();
    for (index, name) in csv_entries(zip_path)? {
        // flatten directories inside the archive
        let file_name = Path::new(&name)
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| zip_error(zip_path, format!("bad entry name {}", name)))?;
        let dest = out_dir.join(file_name);
        let data = read_entry(zip_path, index)?;
        fs::write(&dest, data)?;
        debug!(entry = %name, dest = %dest.display(), "extracted");
        written.push(dest);
    }
    Ok(written)
}
