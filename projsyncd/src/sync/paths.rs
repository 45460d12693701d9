use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("project path is empty")]
    Empty,
    #[error("project path contains unsupported component")]
    UnsupportedComponent,
}

/// Normalizes a project path to `/dir/file` form.
pub fn normalize_path(path: &str) -> Result<String, PathError> {
    let mut parts = Vec::new();
    for part in path.split(['/', '\\']) {
        match part {
            "" | "." => continue,
            ".." => return Err(PathError::UnsupportedComponent),
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Err(PathError::Empty);
    }
    Ok(format!("/{}", parts.join("/")))
}

pub fn local_path_for(root: &Path, project_path: &str) -> Result<PathBuf, PathError> {
    if project_path.is_empty() {
        return Err(PathError::Empty);
    }

    // Project paths are POSIX-like ("/src/main.py"); map them under root.
    let mut out = root.to_path_buf();
    for component in Path::new(project_path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir => continue,
            Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    if out == root {
        return Err(PathError::Empty);
    }
    Ok(out)
}

pub fn project_path_for(root: &Path, local: &Path) -> Option<String> {
    let relative = local.strip_prefix(root).ok()?;
    normalize_path(&relative.to_string_lossy()).ok()
}
