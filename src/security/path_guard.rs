use std::ffi::OsString;
use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::types::{ActionError, ActionResult};

const MAX_SYMLINK_HOPS: usize = 40;

/// A path that has been proven to sit at or below the sandbox root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    root: PathBuf,
    relative_input: String,
    canonical: PathBuf,
}

impl ResolvedPath {
    pub fn relative_input(&self) -> &str {
        &self.relative_input
    }

    pub fn as_path(&self) -> &Path {
        &self.canonical
    }

    pub fn is_root(&self) -> bool {
        self.canonical == self.root
    }

    /// Root-relative rendering used in user-facing messages.
    pub fn display_relative(&self) -> String {
        display_path(&self.root, &self.canonical)
    }
}

/// Confines relative inputs to a single directory tree.
///
/// Containment is decided on canonical paths (symlinks followed, `.`/`..`
/// collapsed) compared component by component, so `/data-evil` never passes
/// for a root of `/data`. Targets do not have to exist, and the guard never
/// creates anything on disk.
#[derive(Debug, Clone)]
pub struct PathGuard {
    root: PathBuf,
}

impl PathGuard {
    pub fn new(root: impl AsRef<Path>) -> ActionResult<Self> {
        let root = root.as_ref();
        if !root.is_absolute() {
            return Err(ActionError::invalid_argument(format!(
                "sandbox root must be absolute, got {}",
                root.display()
            )));
        }
        let root = canonicalize_lenient(root).map_err(|err| {
            ActionError::io(format!(
                "failed resolving sandbox root {}: {err}",
                root.display()
            ))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn contains(&self, candidate: &Path) -> bool {
        candidate.starts_with(&self.root)
    }

    /// Canonical form of `root/relative_input` without the containment check.
    pub fn candidate(&self, relative_input: &str) -> ActionResult<PathBuf> {
        let joined = self.root.join(relative_input.trim());
        canonicalize_lenient(&joined).map_err(|err| {
            ActionError::io(format!("failed resolving path `{relative_input}`: {err}"))
        })
    }

    pub fn resolve(&self, relative_input: &str) -> ActionResult<ResolvedPath> {
        let canonical = self.candidate(relative_input)?;
        if !self.contains(&canonical) {
            debug!(
                "path guard denied `{}` (resolved to {})",
                relative_input,
                canonical.display()
            );
            return Err(ActionError::access_denied(format!(
                "path `{}` is outside the root directory {}",
                relative_input,
                self.root.display()
            )));
        }
        Ok(ResolvedPath {
            root: self.root.clone(),
            relative_input: relative_input.to_owned(),
            canonical,
        })
    }
}

pub fn display_path(root: &Path, path: &Path) -> String {
    if let Ok(relative) = path.strip_prefix(root) {
        let text = relative.to_string_lossy().to_string();
        if text.is_empty() {
            ".".to_owned()
        } else {
            text.replace('\\', "/")
        }
    } else {
        path.display().to_string()
    }
}

/// Canonicalizes the longest existing prefix of `path` through the OS and
/// appends the missing tail with `.`/`..` already collapsed.
pub fn canonicalize_lenient(path: &Path) -> io::Result<PathBuf> {
    canonicalize_with_hops(path, 0)
}

fn canonicalize_with_hops(path: &Path, hops: usize) -> io::Result<PathBuf> {
    if hops > MAX_SYMLINK_HOPS {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("too many levels of symbolic links at {}", path.display()),
        ));
    }

    let mut resolved = PathBuf::new();
    let mut missing = Vec::<OsString>::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => resolved.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if missing.pop().is_none() {
                    resolved.pop();
                }
            }
            Component::Normal(part) => {
                if !missing.is_empty() {
                    missing.push(part.to_os_string());
                    continue;
                }
                let next = resolved.join(part);
                match std::fs::symlink_metadata(&next) {
                    Ok(metadata) => match next.canonicalize() {
                        Ok(canonical) => resolved = canonical,
                        Err(_) if metadata.file_type().is_symlink() => {
                            // Dangling link: follow it by hand so a write through
                            // it cannot land outside the checked location.
                            let target = std::fs::read_link(&next)?;
                            let target = if target.is_absolute() {
                                target
                            } else {
                                resolved.join(target)
                            };
                            resolved = canonicalize_with_hops(&target, hops + 1)?;
                        }
                        Err(err) => return Err(err),
                    },
                    Err(_) => missing.push(part.to_os_string()),
                }
            }
        }
    }
    for part in missing {
        resolved.push(part);
    }
    Ok(resolved)
}
