use crate::errors::{AppError, AppResult};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedSource {
    pub text: String,
    pub path: PathBuf,
    pub modified: Option<SystemTime>,
}

/// Reads template bytes from a root directory. `Ok(None)` means not found.
pub trait TemplateLoader: Send + Sync {
    fn load(&self, root: &Path, path: &str) -> AppResult<Option<LoadedSource>>;
}

#[derive(Debug, Clone)]
pub struct FileSystemLoader {
    follow_symlinks: bool,
}

impl Default for FileSystemLoader {
    fn default() -> Self {
        Self::new(true)
    }
}

impl FileSystemLoader {
    pub fn new(follow_symlinks: bool) -> Self {
        Self { follow_symlinks }
    }
}

impl TemplateLoader for FileSystemLoader {
    fn load(&self, root: &Path, path: &str) -> AppResult<Option<LoadedSource>> {
        let Some(relative) = split_template_path(path) else {
            tracing::debug!(path, "rejected template path outside its root");
            return Ok(None);
        };
        let full = root.join(&relative);

        if !self.follow_symlinks {
            // Every component below the root counts, directories included.
            let mut current = root.to_path_buf();
            for component in relative.components() {
                current.push(component);
                let metadata = match fs::symlink_metadata(&current) {
                    Ok(metadata) => metadata,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                    Err(err) => return Err(AppError::Io(format!("{}: {}", current.display(), err))),
                };
                if metadata.file_type().is_symlink() {
                    tracing::debug!(path = %full.display(), link = %current.display(), "refusing symlinked template");
                    return Ok(None);
                }
            }
        }

        let text = match fs::read_to_string(&full) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            // Directories and dangling links are not templates.
            Err(_) if !full.is_file() => return Ok(None),
            Err(err) => return Err(AppError::Io(format!("{}: {}", full.display(), err))),
        };
        let modified = fs::metadata(&full).and_then(|metadata| metadata.modified()).ok();

        Ok(Some(LoadedSource {
            text,
            path: full,
            modified,
        }))
    }
}

/// Normalizes a slash-separated template path so it stays under its root.
/// `..` segments are refused; empty and `.` segments (leading slashes too)
/// are dropped.
pub fn split_template_path(path: &str) -> Option<PathBuf> {
    let mut relative = PathBuf::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return None,
            _ => {}
        }
        if segment.contains('\\') || Path::new(segment).components().any(|c| !matches!(c, Component::Normal(_))) {
            return None;
        }
        relative.push(segment);
    }
    if relative.as_os_str().is_empty() {
        return None;
    }
    Some(relative)
}
