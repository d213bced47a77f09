use std::path::{Component, Path, PathBuf};

/// Validates a caller-supplied path that must stay inside the storage root.
pub fn validate_relative_path(path: &str) -> Result<PathBuf, String> {
    let trimmed = path.trim();
    if trimmed.contains('\0') {
        return Err("path contains invalid characters".to_string());
    }
    let candidate = Path::new(trimmed);
    if candidate.is_absolute() {
        return Err("path must be relative to the storage root".to_string());
    }
    let mut clean = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir => return Err("path must not contain '..' segments".to_string()),
            Component::RootDir | Component::Prefix(_) => {
                return Err("path must be relative to the storage root".to_string())
            }
        }
    }
    Ok(clean)
}

/// Plain file name: no separators, no traversal.
pub fn validate_file_name(name: &str) -> Result<String, String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err("filename is required".to_string());
    }
    if trimmed == "." || trimmed == ".." || trimmed.contains(['/', '\\', '\0']) {
        return Err(format!("invalid filename: {trimmed}"));
    }
    Ok(trimmed.to_string())
}

/// Resolves a path for reading. Relative paths are joined onto `root`;
/// absolute paths are only accepted inside `capture_dir`, where logcat
/// captures are written.
pub fn resolve_read_path(
    root: &Path,
    capture_dir: Option<&Path>,
    path: &str,
) -> Result<PathBuf, String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err("path is required".to_string());
    }
    let candidate = Path::new(trimmed);
    if !candidate.is_absolute() {
        return Ok(root.join(validate_relative_path(trimmed)?));
    }
    if candidate
        .components()
        .any(|component| component == Component::ParentDir)
    {
        return Err("path must not contain '..' segments".to_string());
    }
    match capture_dir {
        Some(dir) if candidate.starts_with(dir) && candidate != dir => Ok(candidate.to_path_buf()),
        _ => Err(format!("absolute path outside the capture dir: {trimmed}")),
    }
}

/// Path relative to `root` with forward slashes, as handed back to callers.
pub fn to_storage_relative(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}
