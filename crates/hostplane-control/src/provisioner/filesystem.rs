//! Site directories, templates and archives.
//!
//! Tree walks, copies and tar.gz work run on the blocking pool. Archive jobs
//! are bounded by the configured timeout. A failure part way through leaves
//! whatever was already written in place.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::task::spawn_blocking;
use tracing::{debug, info};

use crate::config::StorageConfig;
use crate::error::{ControlError, ControlResult};
use crate::process::ProcessCommand;
use crate::types::{Site, SiteId};

/// Subdirectories created in every site root.
pub const SITE_SUBDIRECTORIES: [&str; 3] = ["public", "private", "logs"];

/// One entry of an archive: a file or directory and its name inside the
/// archive.
#[derive(Debug, Clone)]
pub struct ArchiveSource {
    /// Path on disk.
    pub path: PathBuf,
    /// Path inside the archive.
    pub name: PathBuf,
}

impl ArchiveSource {
    /// Archive `path` under `name`.
    pub fn new(path: impl Into<PathBuf>, name: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
        }
    }
}

/// What [`FilesystemProvisioner::deploy_template`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateOutcome {
    /// Template files were copied; `installed` is set when the install
    /// script ran.
    Deployed {
        /// Files copied.
        files: u64,
        /// Whether the install script ran.
        installed: bool,
    },
    /// The site tree already held files.
    AlreadyPopulated,
    /// No template tree exists for the platform and template.
    NoTemplate,
}

/// Creates and tears down per-site file trees.
#[derive(Debug, Clone)]
pub struct FilesystemProvisioner {
    sites_root: PathBuf,
    templates_root: PathBuf,
    backup_root: PathBuf,
    install_script: String,
    install_timeout: Duration,
    archive_timeout: Duration,
}

impl FilesystemProvisioner {
    /// Create a provisioner from configuration.
    #[must_use]
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            sites_root: config.sites_root.clone(),
            templates_root: config.templates_root.clone(),
            backup_root: config.backup_root.clone(),
            install_script: config.install_script.clone(),
            install_timeout: config.install_timeout(),
            archive_timeout: config.archive_timeout(),
        }
    }

    /// Root directory of a site.
    #[must_use]
    pub fn site_directory(&self, site_id: &SiteId) -> PathBuf {
        self.sites_root.join(site_id.as_str())
    }

    /// Directory backups are written to.
    #[must_use]
    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    /// Create the site root with its `public`, `private` and `logs`
    /// subdirectories. Existing directories are kept.
    pub async fn create_site_directories(&self, site_id: &SiteId) -> ControlResult<PathBuf> {
        let root = self.site_directory(site_id);
        for sub in SITE_SUBDIRECTORIES {
            tokio::fs::create_dir_all(root.join(sub)).await?;
        }
        debug!(site_id = %site_id, path = %root.display(), "site directories created");
        Ok(root)
    }

    /// Copy the site's template into its directory and run the template's
    /// install script if it has one.
    ///
    /// Does nothing when the directory already holds files, so a cloned
    /// tree is never overwritten.
    pub async fn deploy_template(&self, site: &Site, site_dir: &Path) -> ControlResult<TemplateOutcome> {
        if has_files(site_dir).await? {
            debug!(site_id = %site.id, "site tree already populated, template skipped");
            return Ok(TemplateOutcome::AlreadyPopulated);
        }

        let template_dir = self.templates_root.join(&site.platform).join(&site.template);
        if !tokio::fs::try_exists(&template_dir).await? {
            debug!(
                site_id = %site.id,
                template = %template_dir.display(),
                "no template tree"
            );
            return Ok(TemplateOutcome::NoTemplate);
        }

        let files = self.copy_tree(&template_dir, site_dir).await?;

        let script = site_dir.join(&self.install_script);
        let installed = tokio::fs::try_exists(&script).await?;
        if installed {
            self.run_install_script(site, site_dir, &script).await?;
        }

        info!(
            site_id = %site.id,
            platform = %site.platform,
            template = %site.template,
            files,
            installed,
            "template deployed"
        );
        Ok(TemplateOutcome::Deployed { files, installed })
    }

    async fn run_install_script(&self, site: &Site, site_dir: &Path, script: &Path) -> ControlResult<()> {
        let output = ProcessCommand::new("/bin/sh", self.install_timeout)
            .arg(script.to_string_lossy())
            .current_dir(site_dir)
            .env("SITE_ID", site.id.as_str())
            .env("SITE_NAME", &site.name)
            .env("SITE_DOMAIN", &site.domain)
            .env("SITE_PLATFORM", &site.platform)
            .env("SITE_TEMPLATE", &site.template)
            .env("SITE_PATH", site_dir.to_string_lossy())
            .run()
            .await?;
        debug!(
            site_id = %site.id,
            duration_ms = output.duration.as_millis(),
            "install script finished"
        );
        Ok(())
    }

    /// Recursively copy `source` into `target`. Returns the number of files
    /// copied.
    pub async fn copy_tree(&self, source: &Path, target: &Path) -> ControlResult<u64> {
        let source = source.to_owned();
        let target = target.to_owned();
        let files = self
            .blocking("copy", move || copy_tree_sync(&source, &target))
            .await?;
        Ok(files)
    }

    /// Remove a site directory. Returns whether it existed.
    pub async fn delete_site_directory(&self, site_dir: &Path) -> ControlResult<bool> {
        match tokio::fs::remove_dir_all(site_dir).await {
            Ok(()) => {
                info!(path = %site_dir.display(), "site directory removed");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Write a gzip-compressed tar of `sources` to `destination`. Returns
    /// the archive size in bytes.
    pub async fn create_archive(&self, sources: Vec<ArchiveSource>, destination: &Path) -> ControlResult<u64> {
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let destination = destination.to_owned();
        let size = self
            .blocking("archive", move || create_archive_sync(&sources, &destination))
            .await?;
        Ok(size)
    }

    /// Unpack a gzip-compressed tar into `destination`.
    pub async fn extract_archive(&self, archive: &Path, destination: &Path) -> ControlResult<()> {
        let archive = archive.to_owned();
        let destination = destination.to_owned();
        self.blocking("extract", move || extract_archive_sync(&archive, &destination))
            .await
    }

    /// Total size of the regular files under `path`. Missing paths count as
    /// empty.
    pub async fn directory_size(&self, path: &Path) -> ControlResult<u64> {
        let path = path.to_owned();
        self.blocking("size", move || directory_size_sync(&path)).await
    }

    async fn blocking<T, F>(&self, operation: &str, f: F) -> ControlResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> io::Result<T> + Send + 'static,
    {
        match tokio::time::timeout(self.archive_timeout, spawn_blocking(f)).await {
            Ok(Ok(result)) => Ok(result?),
            Ok(Err(e)) => Err(ControlError::internal(format!("{operation} task failed: {e}"))),
            Err(_) => Err(ControlError::Timeout {
                operation: operation.to_owned(),
                limit: self.archive_timeout,
            }),
        }
    }
}

async fn has_files(path: &Path) -> ControlResult<bool> {
    let path = path.to_owned();
    let found = spawn_blocking(move || has_files_sync(&path))
        .await
        .map_err(|e| ControlError::internal(format!("scan task failed: {e}")))??;
    Ok(found)
}

fn has_files_sync(path: &Path) -> io::Result<bool> {
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if !file_type.is_dir() || has_files_sync(&entry.path())? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn copy_tree_sync(source: &Path, target: &Path) -> io::Result<u64> {
    std::fs::create_dir_all(target)?;
    let mut files = 0;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let to = target.join(entry.file_name());
        if file_type.is_dir() {
            files += copy_tree_sync(&entry.path(), &to)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &to)?;
            files += 1;
        }
    }
    Ok(files)
}

fn directory_size_sync(path: &Path) -> io::Result<u64> {
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut total = 0;
    for entry in entries {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            total += directory_size_sync(&entry.path())?;
        } else if file_type.is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

fn create_archive_sync(sources: &[ArchiveSource], destination: &Path) -> io::Result<u64> {
    let file = File::create(destination)?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder.follow_symlinks(false);

    for source in sources {
        if source.path.is_dir() {
            builder.append_dir_all(&source.name, &source.path)?;
        } else {
            builder.append_path_with_name(&source.path, &source.name)?;
        }
    }

    builder.into_inner()?.finish()?;
    let size = std::fs::metadata(destination)?.len();
    debug!(path = %destination.display(), size, "archive written");
    Ok(size)
}

fn extract_archive_sync(archive: &Path, destination: &Path) -> io::Result<()> {
    std::fs::create_dir_all(destination)?;
    let mut archive = tar::Archive::new(GzDecoder::new(File::open(archive)?));
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.unpack(destination)
}
