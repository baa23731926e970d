use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::ScrnaseqError;

/// Lists every file and directory under `root` without following symlinks.
pub fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, ScrnaseqError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries = fs::read_dir(&path).map_err(|err| fs_error(&path, err))?;
        for entry in entries {
            let entry = entry.map_err(|err| ScrnaseqError::Filesystem(err.to_string()))?;
            let path = entry.path();
            let file_type = entry
                .file_type()
                .map_err(|err| ScrnaseqError::Filesystem(err.to_string()))?;
            if file_type.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    items.sort();
    Ok(items)
}

pub fn symlink_file(source: &Path, dest: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(source, dest)
    }
    #[cfg(not(unix))]
    {
        fs::copy(source, dest).map(|_| ())
    }
}

pub fn hard_link_or_copy(source: &Path, dest: &Path) -> io::Result<()> {
    if fs::hard_link(source, dest).is_err() {
        fs::copy(source, dest)?;
    }
    Ok(())
}

pub fn remove_dir_if_exists(path: &Path) -> Result<(), ScrnaseqError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).map_err(|err| fs_error(path, err)),
        Ok(_) => fs::remove_file(path).map_err(|err| fs_error(path, err)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(fs_error(path, err)),
    }
}

pub fn fs_error(path: &Path, err: io::Error) -> ScrnaseqError {
    ScrnaseqError::Filesystem(format!("{}: {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walk_lists_nested_files() {
        let temp = tempfile::tempdir().unwrap();
        fs::create_dir_all(temp.path().join("a/b")).unwrap();
        fs::write(temp.path().join("a/b/c.txt"), b"x").unwrap();
        fs::write(temp.path().join("top.txt"), b"y").unwrap();

        let files: Vec<_> = walk_dir(temp.path())
            .unwrap()
            .into_iter()
            .filter(|path| path.is_file())
            .map(|path| path.strip_prefix(temp.path()).unwrap().to_path_buf())
            .collect();
        assert_eq!(files, vec![PathBuf::from("a/b/c.txt"), PathBuf::from("top.txt")]);
    }

    #[test]
    fn remove_missing_dir_is_ok() {
        let temp = tempfile::tempdir().unwrap();
        remove_dir_if_exists(&temp.path().join("missing")).unwrap();
    }
}
