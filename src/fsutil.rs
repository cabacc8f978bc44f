//! Filesystem helpers shared by the cache and the retrievers

use crate::error::{PipelibError, PipelibResult};
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

/// Recursively copy `src` into a fresh directory at `dst`.
///
/// Symlinks are not followed; a symlink inside a library tree is an
/// integrity error since it could point outside the artifact.
pub fn copy_dir(src: &Path, dst: &Path) -> PipelibResult<()> {
    fs::create_dir_all(dst)
        .map_err(|e| PipelibError::io(format!("creating {}", dst.display()), e))?;

    for entry in WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| {
            let context = format!("walking {}", src.display());
            match e.into_io_error() {
                Some(source) => PipelibError::io(context, source),
                None => PipelibError::Internal(context),
            }
        })?;

        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| {
                PipelibError::Internal(format!("walkdir escaped {}: {}", src.display(), e))
            })?;
        let dest = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&dest)
                .map_err(|e| PipelibError::io(format!("creating {}", dest.display()), e))?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &dest).map_err(|e| {
                PipelibError::io(
                    format!("copying {} to {}", entry.path().display(), dest.display()),
                    e,
                )
            })?;
        } else {
            return Err(PipelibError::IntegrityError(format!(
                "refusing to copy non-regular file {}",
                entry.path().display()
            )));
        }
    }

    Ok(())
}

/// Remove a file or directory tree; missing paths are fine.
pub fn remove_path(path: &Path) -> PipelibResult<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(PipelibError::io(format!("inspecting {}", path.display()), e)),
    };

    let result = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PipelibError::io(format!("removing {}", path.display()), e)),
    }
}

/// Reject relative paths that could climb out of their base directory.
pub fn validate_relative(path: &str) -> PipelibResult<()> {
    let candidate = Path::new(path);
    let escapes = candidate.is_absolute()
        || candidate
            .components()
            .any(|c| !matches!(c, std::path::Component::Normal(_)));
    if path.is_empty() || escapes || path.contains('\0') {
        return Err(PipelibError::IntegrityError(format!(
            "'{}' is not a safe relative path",
            path
        )));
    }
    Ok(())
}
