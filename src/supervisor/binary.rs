//! Engine binary acquisition

use crate::common::BinaryError;
use crate::config::Settings;
use parking_lot::Mutex;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Release asset for an OS / CPU architecture pair, as named by
/// `std::env::consts`.
pub fn asset_name(os: &str, arch: &str) -> Result<String, BinaryError> {
    let os_part = match os {
        "windows" => "windows",
        "linux" => "linux",
        "macos" => "macos",
        other => return Err(BinaryError::UnsupportedOS(other.to_string())),
    };
    let arch_part = match arch {
        "x86_64" => "64",
        "aarch64" => "arm64-v8a",
        other => return Err(BinaryError::UnsupportedOS(format!("{}/{}", os, other))),
    };
    Ok(format!("Xray-{}-{}.zip", os_part, arch_part))
}

/// Release asset for the host
pub fn host_asset_name() -> Result<String, BinaryError> {
    asset_name(std::env::consts::OS, std::env::consts::ARCH)
}

/// Locates the engine executable, downloading it on first use
pub struct BinaryManager {
    path: PathBuf,
    release_url: String,
    timeout: Duration,
    resolved: Mutex<Option<PathBuf>>,
}

impl BinaryManager {
    pub fn new(path: PathBuf, release_url: impl Into<String>, timeout: Duration) -> Self {
        BinaryManager {
            path,
            release_url: release_url.into(),
            timeout,
            resolved: Mutex::new(None),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.engine_path(),
            settings.engine_release_url.clone(),
            settings.download_timeout(),
        )
    }

    /// Expected executable location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return the executable path, downloading the release archive if the
    /// executable is missing. Failures are reported once, not retried.
    pub async fn ensure(&self) -> Result<PathBuf, BinaryError> {
        let cached = self.resolved.lock().clone();
        if let Some(path) = cached {
            if path.exists() {
                return Ok(path);
            }
        }

        if !self.path.exists() {
            let asset = host_asset_name()?;
            self.download(&asset).await?;
        }

        *self.resolved.lock() = Some(self.path.clone());
        Ok(self.path.clone())
    }

    async fn download(&self, asset: &str) -> Result<(), BinaryError> {
        let url = format!("{}/{}", self.release_url.trim_end_matches('/'), asset);
        info!("Engine not found at {}, downloading {}", self.path.display(), url);

        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| BinaryError::download(e.to_string()))?;

        let resp = client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| BinaryError::download(format!("{}: {}", url, e)))?;

        let content = resp
            .bytes()
            .await
            .map_err(|e| BinaryError::download(format!("{}: {}", url, e)))?;
        debug!("Downloaded {} bytes", content.len());

        let target = self.path.clone();
        tokio::task::spawn_blocking(move || install_archive(&content, &target))
            .await
            .map_err(|e| BinaryError::download(format!("extraction task failed: {}", e)))??;

        info!("Engine installed at {}", self.path.display());
        Ok(())
    }
}

/// Unpack a release archive next to `target` and make `target` executable
fn install_archive(content: &[u8], target: &Path) -> Result<(), BinaryError> {
    let dir = target
        .parent()
        .ok_or_else(|| BinaryError::download(format!("invalid engine path: {}", target.display())))?;
    std::fs::create_dir_all(dir).map_err(|e| BinaryError::download(e.to_string()))?;

    // Removed when dropped
    let mut archive_file = tempfile::Builder::new()
        .prefix("engine-")
        .suffix(".zip")
        .tempfile_in(dir)
        .map_err(|e| BinaryError::download(e.to_string()))?;
    archive_file
        .write_all(content)
        .and_then(|_| archive_file.flush())
        .map_err(|e| BinaryError::download(e.to_string()))?;

    let reader = archive_file
        .reopen()
        .map_err(|e| BinaryError::download(e.to_string()))?;
    let mut archive = zip::ZipArchive::new(reader)
        .map_err(|e| BinaryError::download(format!("bad archive: {}", e)))?;
    archive
        .extract(dir)
        .map_err(|e| BinaryError::download(format!("extraction failed: {}", e)))?;

    if !target.exists() {
        return Err(BinaryError::download(format!(
            "archive does not contain {}",
            target.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
        )));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(target, std::fs::Permissions::from_mode(0o755))
            .map_err(|e| BinaryError::download(e.to_string()))?;
    }

    Ok(())
}
