//! Whole-file writes that readers never observe half-done.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};

static STAGING_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Stages `contents` in a sibling file, syncs it, then renames it over `path`.
///
/// The rename replaces an existing file in one step, so concurrent readers see
/// either the old or the new contents. The staging file is removed on failure.
pub fn write_atomic(path: &Path, contents: impl AsRef<[u8]>) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let staging = staging_path(dir, path);
    let written = stage(&staging, contents.as_ref()).and_then(|()| fs::rename(&staging, path));
    if written.is_err() {
        let _ = fs::remove_file(&staging);
    }
    written
}

/// Writes each `(file name, contents)` pair into `dir`, stopping at the first failure.
pub fn write_file_set<C>(dir: &Path, files: &[(&str, C)]) -> io::Result<()>
where
    C: AsRef<[u8]>,
{
    for (name, contents) in files {
        write_atomic(&dir.join(name), contents)?;
    }
    Ok(())
}

fn stage(staging: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = File::create(staging)?;
    file.write_all(contents)?;
    file.sync_all()
}

/// Unique per process and call, so parallel writers never share a staging file.
fn staging_path(dir: &Path, target: &Path) -> PathBuf {
    let stem = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let serial = STAGING_COUNTER.fetch_add(1, Ordering::Relaxed);
    dir.join(format!(".{stem}.{}.{serial}.staging", process::id()))
}
