//! Default checkpoint location.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

const CHECKPOINT_SUFFIX: &str = "Followers";

/// Inserts `Followers` between the input file's stem and its extension,
/// in the same directory: `data/repos.json` → `data/reposFollowers.json`.
pub fn derive_checkpoint_path(input: &Path) -> PathBuf {
    let mut file_name: OsString = input.file_stem().unwrap_or_default().to_os_string();
    file_name.push(CHECKPOINT_SUFFIX);
    if let Some(extension) = input.extension() {
        file_name.push(".");
        file_name.push(extension);
    }
    input.with_file_name(file_name)
}
