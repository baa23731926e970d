use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use camino::{Utf8Path, Utf8PathBuf};
use md5::{Digest, Md5};
use tracing::debug;

use crate::error::ScrnaseqError;
use crate::fs_util::{fs_error, walk_dir};
use crate::store::{CachedKey, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkMode {
    /// Links into the cache become backend links, anything else is uploaded.
    #[default]
    Auto,
    /// Every symlink must point into the cache.
    Always,
    /// Symlinks are followed and their contents uploaded.
    Never,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub path: String,
    pub source: PathBuf,
    pub size: u64,
    pub md5sum: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadLink {
    pub path: String,
    pub target: CachedKey,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadListing {
    pub files: Vec<UploadFile>,
    pub links: Vec<UploadLink>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOptions {
    pub deduplicate: bool,
    pub probation: bool,
    pub concurrent: usize,
    pub abort_failed: bool,
    pub links: LinkMode,
    pub token: Option<String>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            deduplicate: true,
            probation: false,
            concurrent: 1,
            abort_failed: true,
            links: LinkMode::Auto,
            token: None,
        }
    }
}

/// Describes every file under `directory` for an upload session.
///
/// Symlinks resolving into `<cache_root>/bucket/<package>/<name>/<version>/`
/// are reported as links according to `links`.
pub fn prepare_directory_upload(
    directory: &Path,
    cache_root: &Utf8Path,
    links: LinkMode,
) -> Result<UploadListing, ScrnaseqError> {
    let cache = fs::canonicalize(cache_root.as_std_path())
        .ok()
        .and_then(|root| Utf8PathBuf::from_path_buf(root).ok())
        .map(Store::new_with_root);

    let mut listing = UploadListing::default();
    for entry in walk_dir(directory)? {
        let meta = fs::symlink_metadata(&entry).map_err(|err| fs_error(&entry, err))?;
        if meta.is_dir() {
            continue;
        }
        let relative = relative_key(directory, &entry)?;

        if !meta.file_type().is_symlink() {
            listing.files.push(describe_file(relative, &entry)?);
            continue;
        }

        let target = fs::canonicalize(&entry).map_err(|err| fs_error(&entry, err))?;
        if target.is_dir() {
            return Err(ScrnaseqError::Validation(format!(
                "symbolic links to directories are not supported: {relative}"
            )));
        }
        if links != LinkMode::Never {
            let key = cache.as_ref().and_then(|store| {
                Utf8PathBuf::from_path_buf(target.clone())
                    .ok()
                    .and_then(|target| store.parse_cached_path(&target))
            });
            if let Some(key) = key {
                debug!(path = %relative, target = %key.path, "uploading as link");
                listing.links.push(UploadLink {
                    path: relative,
                    target: key,
                });
                continue;
            }
            if links == LinkMode::Always {
                return Err(ScrnaseqError::Validation(format!(
                    "{relative} does not point into the cache at {cache_root}"
                )));
            }
        }
        listing.files.push(describe_file(relative, &target)?);
    }
    Ok(listing)
}

fn relative_key(root: &Path, path: &Path) -> Result<String, ScrnaseqError> {
    let relative = path
        .strip_prefix(root)
        .map_err(|err| ScrnaseqError::Filesystem(err.to_string()))?;
    let mut parts = Vec::new();
    for part in relative.components() {
        let part = part.as_os_str().to_str().ok_or_else(|| {
            ScrnaseqError::Validation(format!("non UTF-8 path: {}", relative.display()))
        })?;
        if part.starts_with("..") {
            return Err(ScrnaseqError::Validation(format!(
                "names starting with '..' are reserved: {}",
                relative.display()
            )));
        }
        parts.push(part);
    }
    Ok(parts.join("/"))
}

fn describe_file(path: String, source: &Path) -> Result<UploadFile, ScrnaseqError> {
    let size = fs::metadata(source)
        .map_err(|err| fs_error(source, err))?
        .len();
    Ok(UploadFile {
        path,
        source: source.to_path_buf(),
        size,
        md5sum: md5_file(source)?,
    })
}

pub fn md5_file(path: &Path) -> Result<String, ScrnaseqError> {
    let file = File::open(path).map_err(|err| fs_error(path, err))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = reader.read(&mut buffer).map_err(|err| fs_error(path, err))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Runs `task` over `items` on up to `concurrent` threads and returns the
/// failures. With `stop_on_failure`, no new item is started after the first
/// failure.
pub fn run_concurrently<T, F>(
    items: &[T],
    concurrent: usize,
    stop_on_failure: bool,
    task: F,
) -> Vec<ScrnaseqError>
where
    T: Sync,
    F: Fn(&T) -> Result<(), ScrnaseqError> + Sync,
{
    let next = AtomicUsize::new(0);
    let stop = AtomicBool::new(false);
    let failures = Mutex::new(Vec::new());
    let workers = concurrent.clamp(1, items.len().max(1));

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                while !stop.load(Ordering::SeqCst) {
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    let Some(item) = items.get(index) else {
                        break;
                    };
                    if let Err(err) = task(item) {
                        if stop_on_failure {
                            stop.store(true, Ordering::SeqCst);
                        }
                        failures
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .push(err);
                    }
                }
            });
        }
    });

    failures
        .into_inner()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
