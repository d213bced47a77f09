use std::fs;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::app::adb::apk::PackageFormat;
use crate::app::adb::paths::{
    resolve_read_path, to_storage_relative, validate_file_name, validate_relative_path,
};
use crate::app::error::AppError;

/// Host-local storage root. Callers only ever see paths relative to it,
/// except capture files which live in the capture dir and are addressed
/// absolutely.
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
    upload_dir: String,
    capture_dir: Option<PathBuf>,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>, upload_dir: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            upload_dir: upload_dir.into(),
            capture_dir: None,
        }
    }

    /// Allows absolute reads of capture files below `dir`.
    pub fn with_capture_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.capture_dir = Some(dir.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_root(&self, trace_id: &str) -> Result<(), AppError> {
        fs::create_dir_all(&self.root).map_err(|err| {
            AppError::internal(
                format!("Failed to create storage root {}: {err}", self.root.display()),
                trace_id,
            )
        })
    }

    /// Destination of a generic upload: `<root>/<storage_path>/<filename>`.
    pub fn upload_target(
        &self,
        storage_path: &str,
        filename: &str,
        trace_id: &str,
    ) -> Result<PathBuf, AppError> {
        let name =
            validate_file_name(filename).map_err(|err| AppError::validation(err, trace_id))?;
        let dir = validate_relative_path(storage_path)
            .map_err(|err| AppError::validation(err, trace_id))?;
        Ok(self.root.join(dir).join(name))
    }

    /// Destination of a package upload. The caller's name only contributes
    /// its extension; the file itself gets a fresh unique name.
    pub fn package_target(
        &self,
        filename: &str,
        trace_id: &str,
    ) -> Result<(PathBuf, PackageFormat), AppError> {
        let format = PackageFormat::from_path(Path::new(filename.trim())).ok_or_else(|| {
            AppError::validation(
                format!("Unsupported package type: {filename} (expected .apk or .aab)"),
                trace_id,
            )
        })?;
        let name = format!("{}.{}", Uuid::new_v4(), format.extension());
        Ok((self.root.join(&self.upload_dir).join(name), format))
    }

    pub fn resolve(&self, path: &str, trace_id: &str) -> Result<PathBuf, AppError> {
        resolve_read_path(&self.root, self.capture_dir.as_deref(), path)
            .map_err(|err| AppError::validation(err, trace_id))
    }

    pub fn relative(&self, path: &Path) -> String {
        to_storage_relative(&self.root, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::error::ERR_VALIDATION;

    #[test]
    fn package_targets_are_unique_and_keep_extension() {
        let storage = Storage::new("/srv/station", "UploadedFiles");
        let (first, format) = storage.package_target("game.apk", "trace").expect("apk");
        let (second, _) = storage.package_target("game.apk", "trace").expect("apk");
        assert_eq!(format, PackageFormat::Apk);
        assert_ne!(first, second);
        assert!(first.starts_with("/srv/station/UploadedFiles"));
        assert_eq!(first.extension().and_then(|ext| ext.to_str()), Some("apk"));

        let (bundle, format) = storage.package_target("game.AAB", "trace").expect("aab");
        assert_eq!(format, PackageFormat::Bundle);
        assert_eq!(bundle.extension().and_then(|ext| ext.to_str()), Some("aab"));
    }

    #[test]
    fn package_target_rejects_other_extensions() {
        let storage = Storage::new("/srv/station", "UploadedFiles");
        let err = storage.package_target("notes.txt", "trace").expect_err("txt");
        assert_eq!(err.code, ERR_VALIDATION);
        assert!(storage.package_target("noext", "trace").is_err());
    }

    #[test]
    fn upload_target_stays_under_root() {
        let storage = Storage::new("/srv/station", "UploadedFiles");
        assert_eq!(
            storage.upload_target("logs/run1", "a.txt", "trace").expect("ok"),
            PathBuf::from("/srv/station/logs/run1/a.txt")
        );
        assert!(storage.upload_target("../etc", "a.txt", "trace").is_err());
        assert!(storage.upload_target("logs", "../a.txt", "trace").is_err());
        assert_eq!(
            storage.relative(Path::new("/srv/station/logs/run1/a.txt")),
            "logs/run1/a.txt"
        );
    }
}
