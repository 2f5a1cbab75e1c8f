//! Blocking filesystem helpers for staging submissions.
//!
//! Everything here touches the disk synchronously; async callers go through
//! `tokio::task::spawn_blocking`.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Recursively copy `src` into `dst`, creating `dst` if needed.
/// Symlinks are skipped.
pub fn copy_dir_all(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = dst.join(entry.file_name());

        if file_type.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        }
    }

    Ok(())
}

/// Pack the contents of `dir` into a gzip'd tar held in memory.
/// Entries are stored relative to `dir`.
pub fn dir_to_targz(dir: &Path) -> io::Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", dir)?;

    let encoder = builder.into_inner()?;
    encoder.finish()
}

/// Unpack a gzip'd tar produced by [`dir_to_targz`] into `dir`.
pub fn targz_to_dir(bytes: &[u8], dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    archive.set_preserve_permissions(true);
    archive.unpack(dir)
}

/// Create a uniquely named directory under `base` whose name starts with
/// `prefix`. It is removed when the returned handle drops.
pub fn make_temp_dir(base: &Path, prefix: &str) -> io::Result<TempDir> {
    fs::create_dir_all(base)?;
    tempfile::Builder::new().prefix(prefix).tempdir_in(base)
}

/// Detach a temp dir from its cleanup so it survives for inspection.
pub fn retain_temp_dir(dir: TempDir) -> PathBuf {
    dir.into_path()
}
