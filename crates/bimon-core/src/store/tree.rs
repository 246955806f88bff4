//! Filesystem helpers for artifact directory trees.

use std::fs;
use std::path::{Component, Path, PathBuf};

use super::{Result, StoreError};

/// Relative paths of every regular file below `root`, sorted.
pub fn collect_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![PathBuf::new()];
    while let Some(rel) = stack.pop() {
        let dir = root.join(&rel);
        let entries = fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let path = entry.path();
            let meta = fs::metadata(&path).map_err(|e| StoreError::io(&path, e))?;
            let child = rel.join(entry.file_name());
            if meta.is_dir() {
                stack.push(child);
            } else if meta.is_file() {
                files.push(child);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Copy every file below `src` into `dst`, preserving layout and modes.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<u64> {
    let mut bytes = 0;
    fs::create_dir_all(dst).map_err(|e| StoreError::io(dst, e))?;
    for rel in collect_files(src)? {
        bytes += copy_file(&src.join(&rel), &dst.join(&rel))?;
    }
    Ok(bytes)
}

/// Copy a single file, creating parent directories as needed.
pub fn copy_file(src: &Path, dst: &Path) -> Result<u64> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }
    // fs::copy carries permission bits over on unix.
    fs::copy(src, dst).map_err(|e| StoreError::io(src, e))
}

/// Move `src` to `dst`, falling back to copy + delete across devices.
pub fn move_path(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    if fs::metadata(src).map_err(|e| StoreError::io(src, e))?.is_dir() {
        copy_tree(src, dst)?;
        fs::remove_dir_all(src).map_err(|e| StoreError::io(src, e))
    } else {
        copy_file(src, dst)?;
        fs::remove_file(src).map_err(|e| StoreError::io(src, e))
    }
}

/// Replace `dest` with the fully written `staged` directory.
pub fn replace_dir(staged: &Path, dest: &Path) -> Result<()> {
    if dest.exists() {
        fs::remove_dir_all(dest).map_err(|e| StoreError::io(dest, e))?;
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }
    fs::rename(staged, dest).map_err(|e| StoreError::io(dest, e))
}

/// Whether `rel` stays inside the directory it is joined to.
pub fn is_contained(rel: &Path) -> bool {
    !rel.as_os_str().is_empty()
        && rel
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(unix)]
pub fn file_mode(path: &Path) -> Result<u32> {
    use std::os::unix::fs::PermissionsExt;
    let meta = fs::metadata(path).map_err(|e| StoreError::io(path, e))?;
    Ok(meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
pub fn file_mode(_path: &Path) -> Result<u32> {
    Ok(0o644)
}

#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| StoreError::io(path, e))
}

#[cfg(not(unix))]
pub fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
