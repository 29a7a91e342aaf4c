use std::path::Path;

use tracing::{debug, info};

use crate::args::strip_matching_quotes;
use crate::security::{PathGuard, ResolvedPath};
use crate::types::{ActionError, ActionResult};

pub const NO_FILES_MESSAGE: &str = "No files found.";
pub const NOTHING_RENAMED_MESSAGE: &str = "No files were renamed";

/// Filesystem side of the gateway. Every path goes through the [`PathGuard`]
/// first, and every operation answers with a readable outcome string, success
/// or failure, instead of an error.
#[derive(Debug, Clone)]
pub struct FileActions {
    guard: PathGuard,
}

impl FileActions {
    pub fn new(guard: PathGuard) -> Self {
        Self { guard }
    }

    pub fn root(&self) -> &Path {
        self.guard.root()
    }

    pub fn create(&self, filename: &str) -> String {
        outcome("create_file", self.try_create(filename))
    }

    pub fn write(&self, filepath: &str, content: &str) -> String {
        outcome("write_file", self.try_write(filepath, content))
    }

    pub fn read(&self, filepath: &str) -> String {
        outcome("read_file", self.try_read(filepath))
    }

    pub fn list(&self) -> String {
        outcome("list_files", self.try_list())
    }

    pub fn exists(&self, filepath: &str) -> String {
        outcome("file_exists", self.try_exists(filepath))
    }

    pub fn show_root(&self) -> String {
        self.root().display().to_string()
    }

    pub fn rename(&self, old_name: &str, new_name: &str) -> String {
        outcome("rename_file", self.try_rename(old_name, new_name))
    }

    pub fn rename_all(&self, suffix: &str) -> String {
        outcome("rename_all", self.try_rename_all(suffix))
    }

    pub fn delete(&self, filepath: &str) -> String {
        outcome("delete_file", self.try_delete(filepath))
    }

    fn try_create(&self, filename: &str) -> ActionResult<String> {
        let filename = required(filename, "filename")?;
        let target = self.guard.resolve(filename)?;
        reject_directory(&target)?;
        ensure_parent(&target)?;
        std::fs::write(target.as_path(), b"").map_err(|err| {
            ActionError::io(format!("failed creating file '{filename}': {err}"))
        })?;
        info!("created file {}", target.display_relative());
        Ok(format!(
            "File '{filename}' created successfully in {}",
            self.root().display()
        ))
    }

    fn try_write(&self, filepath: &str, content: &str) -> ActionResult<String> {
        let filepath = required(filepath, "filepath")?;
        let target = self.guard.resolve(filepath)?;
        reject_directory(&target)?;
        ensure_parent(&target)?;
        let normalized = normalize_content(content);
        std::fs::write(target.as_path(), normalized.as_bytes()).map_err(|err| {
            ActionError::io(format!("failed writing to file '{filepath}': {err}"))
        })?;
        info!(
            "wrote {} bytes to {}",
            normalized.len(),
            target.display_relative()
        );
        Ok(format!("Successfully wrote content to '{filepath}'"))
    }

    fn try_read(&self, filepath: &str) -> ActionResult<String> {
        let filepath = required(filepath, "filepath")?;
        let target = self.guard.resolve(filepath)?;
        let metadata = std::fs::metadata(target.as_path())
            .map_err(|_| ActionError::not_found(format!("file '{filepath}' not found")))?;
        if metadata.is_dir() {
            return Err(ActionError::invalid_argument(format!(
                "'{filepath}' is a directory, not a file"
            )));
        }
        std::fs::read_to_string(target.as_path())
            .map_err(|err| ActionError::io(format!("failed reading file '{filepath}': {err}")))
    }

    fn try_list(&self) -> ActionResult<String> {
        let entries = std::fs::read_dir(self.root())
            .map_err(|_| ActionError::not_found("root directory not found"))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|err| ActionError::io(format!("failed listing files: {err}")))?;
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        if names.is_empty() {
            return Ok(NO_FILES_MESSAGE.to_owned());
        }
        names.sort();
        Ok(names.join("\n"))
    }

    fn try_exists(&self, filepath: &str) -> ActionResult<String> {
        let filepath = required(filepath, "filepath")?;
        let candidate = self.guard.candidate(filepath)?;
        if !self.guard.contains(&candidate) {
            debug!("existence probe outside root for `{filepath}`");
        }
        Ok(candidate.exists().to_string())
    }

    fn try_rename(&self, old_name: &str, new_name: &str) -> ActionResult<String> {
        let old_name = required(old_name, "old_name")?;
        let new_name = required(new_name, "new_name")?;
        let (source, destination) =
            match (self.guard.resolve(old_name), self.guard.resolve(new_name)) {
                (Ok(source), Ok(destination)) => (source, destination),
                _ => {
                    return Err(ActionError::access_denied(
                        "can only rename files within the root directory",
                    ))
                }
            };
        if source.is_root() || destination.is_root() {
            return Err(ActionError::invalid_argument(
                "the root directory itself cannot be renamed",
            ));
        }
        if std::fs::symlink_metadata(source.as_path()).is_err() {
            return Err(ActionError::not_found(format!(
                "source file '{old_name}' does not exist"
            )));
        }
        if destination.as_path().exists() {
            return Err(ActionError::invalid_argument(format!(
                "destination '{new_name}' already exists"
            )));
        }
        ensure_parent(&destination)?;
        std::fs::rename(source.as_path(), destination.as_path())
            .map_err(|err| ActionError::io(format!("failed renaming file: {err}")))?;
        info!(
            "renamed {} to {}",
            source.display_relative(),
            destination.display_relative()
        );
        Ok(format!("Successfully renamed '{old_name}' to '{new_name}'"))
    }

    fn try_rename_all(&self, suffix: &str) -> ActionResult<String> {
        let suffix = required(suffix, "suffix")?;
        if suffix.contains(['/', '\\']) || suffix.contains("..") {
            return Err(ActionError::invalid_argument(format!(
                "suffix `{suffix}` must not contain path separators"
            )));
        }

        let plan = self.plan_bulk_rename(suffix)?;
        if plan.is_empty() {
            return Ok(NOTHING_RENAMED_MESSAGE.to_owned());
        }

        let mut lines = Vec::with_capacity(plan.len());
        for (from, to, source, destination) in plan {
            if let Err(err) = std::fs::rename(source.as_path(), destination.as_path()) {
                lines.push(format!("Error renaming '{from}': {err}"));
                return Err(ActionError::io(lines.join("\n")));
            }
            lines.push(format!("Renamed '{from}' to '{to}'"));
        }
        info!("bulk rename with suffix `{suffix}` renamed {} files", lines.len());
        Ok(lines.join("\n"))
    }

    /// Works out every rename up front so a collision refuses the whole batch
    /// before anything on disk changes.
    fn plan_bulk_rename(
        &self,
        suffix: &str,
    ) -> ActionResult<Vec<(String, String, ResolvedPath, ResolvedPath)>> {
        let entries = std::fs::read_dir(self.root())
            .map_err(|_| ActionError::not_found("root directory not found"))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|err| ActionError::io(format!("failed listing files: {err}")))?;
            let is_file = entry
                .file_type()
                .map(|file_type| file_type.is_file())
                .unwrap_or(false);
            if !is_file {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(raw) => debug!("skipping non-UTF-8 file name {raw:?} in bulk rename"),
            }
        }
        names.sort();

        // `suffixed_name` is injective over distinct names, so only targets
        // already on disk can collide.
        let mut plan = Vec::new();
        let mut collisions = Vec::new();
        for name in names {
            let Some(target_name) = suffixed_name(&name, suffix) else {
                continue;
            };
            let source = self.guard.resolve(&name)?;
            let destination = self.guard.resolve(&target_name)?;
            if destination.as_path().exists() {
                collisions.push(format!("'{name}' -> '{target_name}'"));
                continue;
            }
            plan.push((name, target_name, source, destination));
        }

        if !collisions.is_empty() {
            return Err(ActionError::invalid_argument(format!(
                "refusing to rename because these targets already exist: {}",
                collisions.join(", ")
            )));
        }
        Ok(plan)
    }

    fn try_delete(&self, filepath: &str) -> ActionResult<String> {
        let filepath = required(filepath, "filepath")?;
        let target = self.guard.resolve(filepath)?;
        let metadata = std::fs::metadata(target.as_path()).map_err(|_| {
            ActionError::not_found(format!("file '{filepath}' does not exist"))
        })?;
        if !metadata.is_file() {
            return Err(ActionError::invalid_argument(format!(
                "'{filepath}' is not a file"
            )));
        }
        std::fs::remove_file(target.as_path())
            .map_err(|err| ActionError::io(format!("failed deleting file '{filepath}': {err}")))?;
        info!("deleted file {}", target.display_relative());
        Ok(format!("Successfully deleted file '{filepath}'"))
    }
}

/// Undoes the quoting and textual escapes models put around file content.
///
/// One layer of surrounding quotes is removed and literal `\n`, `\t`, `\r`
/// become control characters. Full HTML documents additionally lose every
/// carriage return so their line endings come out uniform.
pub fn normalize_content(content: &str) -> String {
    let unquoted = strip_matching_quotes(content);
    let mut text = unquoted
        .replace("\\n", "\n")
        .replace("\\t", "\t")
        .replace("\\r", "\r");
    if looks_like_markup_document(&text) {
        text = text.replace('\r', "");
    }
    text
}

fn looks_like_markup_document(text: &str) -> bool {
    let head = text.trim_start().to_ascii_lowercase();
    head.starts_with("<!doctype") || head.starts_with("<html")
}

/// `index.html` + `_old` -> `index_old.html`; `None` when already suffixed.
fn suffixed_name(name: &str, suffix: &str) -> Option<String> {
    let path = Path::new(name);
    let stem = path.file_stem()?.to_str()?;
    if stem.ends_with(suffix) {
        return None;
    }
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) => Some(format!("{stem}{suffix}.{ext}")),
        None => Some(format!("{stem}{suffix}")),
    }
}

fn required<'a>(value: &'a str, label: &str) -> ActionResult<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ActionError::invalid_argument(format!("{label} required")));
    }
    Ok(trimmed)
}

fn reject_directory(target: &ResolvedPath) -> ActionResult<()> {
    if target.as_path().is_dir() {
        return Err(ActionError::invalid_argument(format!(
            "'{}' is a directory, not a file",
            target.relative_input()
        )));
    }
    Ok(())
}

fn ensure_parent(target: &ResolvedPath) -> ActionResult<()> {
    if let Some(parent) = target.as_path().parent() {
        std::fs::create_dir_all(parent).map_err(|err| {
            ActionError::io(format!(
                "failed creating parent directory {}: {err}",
                parent.display()
            ))
        })?;
    }
    Ok(())
}

fn outcome(action: &str, result: ActionResult<String>) -> String {
    match result {
        Ok(message) => message,
        Err(err) => {
            debug!("{action} failed ({}): {}", err.kind.as_str(), err.message);
            err.to_string()
        }
    }
}
