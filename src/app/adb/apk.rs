use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use zip::ZipArchive;

use crate::app::adb::runner::run_command_with_timeout;
use crate::app::config::ApkToolSettings;
use crate::app::error::AppError;

pub const APK_EXTENSION: &str = "apk";
pub const BUNDLE_EXTENSION: &str = "aab";
const UNIVERSAL_APK: &str = "universal.apk";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageFormat {
    Apk,
    Bundle,
}

impl PackageFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            APK_EXTENSION => Some(PackageFormat::Apk),
            BUNDLE_EXTENSION => Some(PackageFormat::Bundle),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            PackageFormat::Apk => APK_EXTENSION,
            PackageFormat::Bundle => BUNDLE_EXTENSION,
        }
    }
}

/// External package tooling: identity lookup, signing and bundle conversion.
pub trait PackageTools: Send + Sync {
    fn package_name(&self, apk: &Path, trace_id: &str) -> Result<String, AppError>;

    /// Returns the path of the signed artifact.
    fn sign(&self, apk: &Path, trace_id: &str) -> Result<PathBuf, AppError>;

    /// Converts a bundle into an installable apk and returns its path.
    fn convert_bundle(&self, bundle: &Path, trace_id: &str) -> Result<PathBuf, AppError>;
}

#[derive(Debug, Clone)]
pub struct ApkTools {
    settings: ApkToolSettings,
}

impl ApkTools {
    pub fn new(settings: ApkToolSettings) -> Self {
        Self { settings }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.settings.tool_timeout_secs)
    }

    fn keystore_args(&self, trace_id: &str) -> Result<Vec<String>, AppError> {
        let settings = &self.settings;
        if settings.keystore_path.trim().is_empty()
            || settings.keystore_pass.is_empty()
            || settings.key_alias.trim().is_empty()
        {
            return Err(AppError::validation(
                "Signing requires keystore_path, keystore_pass and key_alias",
                trace_id,
            ));
        }
        if !Path::new(&settings.keystore_path).is_file() {
            return Err(AppError::not_found(
                format!("Keystore not found: {}", settings.keystore_path),
                trace_id,
            ));
        }
        Ok(vec![
            "--ks".to_string(),
            settings.keystore_path.clone(),
            "--ks-pass".to_string(),
            format!("pass:{}", settings.keystore_pass),
            "--ks-key-alias".to_string(),
            settings.key_alias.clone(),
        ])
    }
}

impl PackageTools for ApkTools {
    fn package_name(&self, apk: &Path, trace_id: &str) -> Result<String, AppError> {
        ensure_zip_archive(apk, trace_id)?;
        let args = vec![
            "dump".to_string(),
            "badging".to_string(),
            apk.to_string_lossy().to_string(),
        ];
        let output =
            run_command_with_timeout(&self.settings.aapt2_path, &args, self.timeout(), trace_id)?;
        parse_badging_package_name(&output.stdout).ok_or_else(|| {
            AppError::tool(
                format!("Could not get package name: {}", output.diagnostic()),
                trace_id,
            )
        })
    }

    fn sign(&self, apk: &Path, trace_id: &str) -> Result<PathBuf, AppError> {
        let ks_args = self.keystore_args(trace_id)?;
        let aligned = sibling_with_suffix(apk, "aligned");
        let align_args = vec![
            "-f".to_string(),
            "-p".to_string(),
            "4".to_string(),
            apk.to_string_lossy().to_string(),
            aligned.to_string_lossy().to_string(),
        ];
        let output = run_command_with_timeout(
            &self.settings.zipalign_path,
            &align_args,
            self.timeout(),
            trace_id,
        )?;
        if !output.success() {
            return Err(AppError::tool(
                format!("zipalign failed: {}", output.diagnostic()),
                trace_id,
            ));
        }

        let signed = sibling_with_suffix(apk, "signed");
        let mut sign_args = vec!["sign".to_string()];
        sign_args.extend(ks_args);
        sign_args.push("--out".to_string());
        sign_args.push(signed.to_string_lossy().to_string());
        sign_args.push(aligned.to_string_lossy().to_string());
        let output = run_command_with_timeout(
            &self.settings.apksigner_path,
            &sign_args,
            self.timeout(),
            trace_id,
        )?;
        let _ = fs::remove_file(&aligned);
        if !output.success() || !signed.is_file() {
            return Err(AppError::tool(
                format!("Could not sign apk: {}", output.diagnostic()),
                trace_id,
            ));
        }
        Ok(signed)
    }

    fn convert_bundle(&self, bundle: &Path, trace_id: &str) -> Result<PathBuf, AppError> {
        let apks = bundle.with_extension("apks");
        let mut args = vec![
            "-jar".to_string(),
            self.settings.bundletool_path.clone(),
            "build-apks".to_string(),
            format!("--bundle={}", bundle.to_string_lossy()),
            format!("--output={}", apks.to_string_lossy()),
            "--mode=universal".to_string(),
            "--overwrite".to_string(),
        ];
        if let Ok(ks_args) = self.keystore_args(trace_id) {
            // bundletool wants `--flag=value` pairs.
            args.extend(
                ks_args
                    .chunks(2)
                    .map(|pair| format!("{}={}", pair[0], pair[1])),
            );
        }
        let output =
            run_command_with_timeout(&self.settings.java_path, &args, self.timeout(), trace_id)?;
        if !output.success() || !apks.is_file() {
            return Err(AppError::tool(
                format!(".aab file could not be converted to .apk: {}", output.diagnostic()),
                trace_id,
            ));
        }
        let stem = bundle
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| "bundle".to_string());
        let target_dir = bundle.with_file_name(stem);
        let extracted = extract_universal_apk(&apks, &target_dir, trace_id);
        let _ = fs::remove_file(&apks);
        extracted
    }
}

pub fn parse_badging_package_name(output: &str) -> Option<String> {
    let re = Regex::new(r"package:\s*name='([^']+)'").ok()?;
    output
        .lines()
        .find_map(|line| re.captures(line).map(|caps| caps[1].to_string()))
}

pub fn ensure_zip_archive(path: &Path, trace_id: &str) -> Result<(), AppError> {
    let file = File::open(path).map_err(|err| {
        AppError::not_found(format!("Failed to open package {}: {err}", path.display()), trace_id)
    })?;
    ZipArchive::new(file)
        .map(|_| ())
        .map_err(|err| AppError::validation(format!("Invalid package archive: {err}"), trace_id))
}

/// Pulls `universal.apk` out of a bundletool `.apks` archive into `target_dir`.
pub fn extract_universal_apk(
    apks: &Path,
    target_dir: &Path,
    trace_id: &str,
) -> Result<PathBuf, AppError> {
    let file = File::open(apks)
        .map_err(|err| AppError::tool(format!("Failed to open apks archive: {err}"), trace_id))?;
    let mut archive = ZipArchive::new(file)
        .map_err(|err| AppError::tool(format!("Invalid apks archive: {err}"), trace_id))?;
    let mut entry = archive.by_name(UNIVERSAL_APK).map_err(|err| {
        AppError::tool(format!("apks archive has no {UNIVERSAL_APK}: {err}"), trace_id)
    })?;
    fs::create_dir_all(target_dir)
        .map_err(|err| AppError::internal(format!("Failed to create dir: {err}"), trace_id))?;
    let target = target_dir.join(UNIVERSAL_APK);
    let mut output = File::create(&target)
        .map_err(|err| AppError::internal(format!("Failed to extract apk: {err}"), trace_id))?;
    io::copy(&mut entry, &mut output)
        .map_err(|err| AppError::internal(format!("Failed to extract apk: {err}"), trace_id))?;
    Ok(target)
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!("{stem}-{suffix}.{APK_EXTENSION}"))
}
