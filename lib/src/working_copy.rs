// Copyright 2024 The Treemerge Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The working tree surface the merge writes into, and the status-tracker
//! collaborator informed of the result.

#![allow(missing_docs)]

use std::fs;
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::symlink;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use tempfile::NamedTempFile;
use tracing::debug;

use crate::file_util;
use crate::file_util::IoResultExt;
use crate::file_util::PathError;
use crate::manifest::FileFlag;
use crate::repo_path::RepoPath;

/// Stat data captured after a write, for the tracker to avoid a re-stat.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileData {
    pub mode: u32,
    pub size: u64,
    pub mtime_millis: i64,
}

/// The working tree rooted at one directory.
///
/// All paths come in as [`RepoPath`], which cannot name anything outside the
/// root, so no separate path audit is needed.
#[derive(Clone, Debug)]
pub struct WorkingCopy {
    root: PathBuf,
}

impl WorkingCopy {
    pub fn new(root: PathBuf) -> Self {
        WorkingCopy { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn disk_path(&self, path: &RepoPath) -> PathBuf {
        path.to_fs_path(&self.root)
    }

    pub fn exists(&self, path: &RepoPath) -> bool {
        self.disk_path(path).symlink_metadata().is_ok()
    }

    pub fn is_file_or_link(&self, path: &str) -> bool {
        let mut disk_path = self.root.clone();
        disk_path.extend(path.split('/'));
        disk_path
            .symlink_metadata()
            .map(|m| m.is_file() || m.is_symlink())
            .unwrap_or(false)
    }

    pub fn is_dir(&self, path: &RepoPath) -> bool {
        self.disk_path(path).is_dir()
    }

    pub fn read(&self, path: &RepoPath) -> Result<Vec<u8>, PathError> {
        let disk_path = self.disk_path(path);
        let metadata = disk_path.symlink_metadata().context(&disk_path)?;
        if metadata.is_symlink() {
            let target = disk_path.read_link().context(&disk_path)?;
            Ok(target.to_string_lossy().into_owned().into_bytes())
        } else {
            fs::read(&disk_path).context(&disk_path)
        }
    }

    pub fn flags(&self, path: &RepoPath) -> FileFlag {
        let disk_path = self.disk_path(path);
        match disk_path.symlink_metadata() {
            Ok(metadata) if metadata.is_symlink() => FileFlag::Symlink,
            #[cfg(unix)]
            Ok(metadata) if metadata.permissions().mode() & 0o100 != 0 => FileFlag::Executable,
            Ok(_) => FileFlag::Normal,
            Err(_) => FileFlag::Normal,
        }
    }

    /// Removes any existing file, link, or directory occupying `path`, so a
    /// fresh write lands cleanly.
    pub fn clear_stale(&self, path: &RepoPath) -> Result<(), PathError> {
        let disk_path = self.disk_path(path);
        match disk_path.symlink_metadata() {
            Ok(metadata) if metadata.is_dir() => {
                fs::remove_dir_all(&disk_path).context(&disk_path)
            }
            Ok(_) => fs::remove_file(&disk_path).context(&disk_path),
            Err(_) => Ok(()),
        }
    }

    /// Writes `data` at `path`, creating parent directories and honoring the
    /// flags. Returns the stat data of the written file.
    pub fn write(
        &self,
        path: &RepoPath,
        data: &[u8],
        flags: FileFlag,
        atomic: bool,
    ) -> Result<FileData, PathError> {
        let disk_path = self.disk_path(path);
        if let Some(parent) = disk_path.parent() {
            fs::create_dir_all(parent).context(parent)?;
        }
        match flags {
            FileFlag::Symlink => {
                self.clear_stale(path)?;
                let target = String::from_utf8_lossy(data).into_owned();
                #[cfg(unix)]
                symlink(&target, &disk_path).context(&disk_path)?;
                #[cfg(not(unix))]
                fs::write(&disk_path, target.as_bytes()).context(&disk_path)?;
            }
            FileFlag::Normal | FileFlag::Executable => {
                if atomic {
                    // rename() replaces files but not directories or links.
                    let metadata = disk_path.symlink_metadata();
                    if metadata.map(|m| m.is_dir() || m.is_symlink()).unwrap_or(false) {
                        self.clear_stale(path)?;
                    }
                    let parent = disk_path.parent().expect("file path has a parent");
                    let mut temp_file = NamedTempFile::new_in(parent).context(parent)?;
                    temp_file.write_all(data).context(&disk_path)?;
                    file_util::persist_temp_file(temp_file, &disk_path).context(&disk_path)?;
                } else {
                    self.clear_stale(path)?;
                    fs::write(&disk_path, data).context(&disk_path)?;
                }
                self.set_executable(&disk_path, flags.is_executable())?;
            }
        }
        self.file_data(path)
    }

    #[cfg(unix)]
    fn set_executable(&self, disk_path: &Path, executable: bool) -> Result<(), PathError> {
        let mode = if executable { 0o755 } else { 0o644 };
        fs::set_permissions(disk_path, fs::Permissions::from_mode(mode)).context(disk_path)
    }

    #[cfg(not(unix))]
    fn set_executable(&self, _disk_path: &Path, _executable: bool) -> Result<(), PathError> {
        Ok(())
    }

    /// Changes only the flags of an existing file.
    pub fn set_flags(&self, path: &RepoPath, flags: FileFlag) -> Result<(), PathError> {
        if flags.is_symlink() {
            let data = self.read(path)?;
            return self.write(path, &data, flags, false).map(|_| ());
        }
        let disk_path = self.disk_path(path);
        if disk_path.symlink_metadata().context(&disk_path)?.is_symlink() {
            let data = self.read(path)?;
            return self.write(path, &data, flags, false).map(|_| ());
        }
        self.set_executable(&disk_path, flags.is_executable())
    }

    /// Removes the file and prunes any directories the removal emptied.
    pub fn remove(&self, path: &RepoPath, ignore_missing: bool) -> Result<(), PathError> {
        let disk_path = self.disk_path(path);
        match fs::remove_file(&disk_path) {
            Ok(()) => {}
            Err(err) if ignore_missing && err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(());
            }
            Err(err) => return Err(err).context(&disk_path),
        }
        for dir in path.parent_dirs() {
            let mut dir_path = self.root.clone();
            dir_path.extend(dir.split('/'));
            if fs::remove_dir(&dir_path).is_err() {
                break;
            }
        }
        Ok(())
    }

    pub fn file_data(&self, path: &RepoPath) -> Result<FileData, PathError> {
        let disk_path = self.disk_path(path);
        let metadata = disk_path.symlink_metadata().context(&disk_path)?;
        #[cfg(unix)]
        let mode = metadata.permissions().mode();
        #[cfg(not(unix))]
        let mode = 0o644;
        let mtime_millis = metadata
            .modified()
            .ok()
            .and_then(|mtime| mtime.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Ok(FileData {
            mode,
            size: metadata.len(),
            mtime_millis,
        })
    }

    /// The backup name used when an untracked file or a path conflict is
    /// about to be overwritten.
    pub fn backup_path(&self, path: &RepoPath) -> PathBuf {
        let mut disk_path = self.disk_path(path).into_os_string();
        disk_path.push(".orig");
        PathBuf::from(disk_path)
    }

    /// Moves whatever occupies `path` aside to its backup name.
    pub fn backup(&self, path: &RepoPath) -> Result<(), PathError> {
        let disk_path = self.disk_path(path);
        let backup = self.backup_path(path);
        debug!(path = path.as_str(), backup = %backup.display(), "backing up");
        if backup.symlink_metadata().is_ok() {
            if backup.is_dir() {
                fs::remove_dir_all(&backup).context(&backup)?;
            } else {
                fs::remove_file(&backup).context(&backup)?;
            }
        }
        fs::rename(&disk_path, &backup).context(&disk_path)
    }

    /// Whether the on-disk content at `path` differs from `data`.
    pub fn content_differs(&self, path: &RepoPath, data: &[u8]) -> bool {
        match self.read(path) {
            Ok(existing) => existing != data,
            Err(_) => true,
        }
    }
}

/// The status tracker collaborator: told which paths ended up
/// tracked/untracked/removed/copied so later status runs agree with the
/// merged tree.
pub trait WorkingCopyTracker {
    fn add(&mut self, path: &RepoPath);
    fn remove(&mut self, path: &RepoPath);
    /// Forget the entry without recording a removal.
    fn drop_entry(&mut self, path: &RepoPath);
    fn copy(&mut self, source: &RepoPath, dest: &RepoPath);
    /// Mark clean, with stat data when the caller already has it.
    fn normal(&mut self, path: &RepoPath, data: Option<&FileData>);
    /// Mark clean but needing a content check on the next status run.
    fn normal_lookup(&mut self, path: &RepoPath);
    fn merge(&mut self, path: &RepoPath);
    fn other_parent(&mut self, path: &RepoPath);
    /// Whether the path is ignored in the working copy.
    fn is_ignored(&self, path: &RepoPath) -> bool {
        let _ = path;
        false
    }
    /// Whether the path is tracked in the working copy.
    fn is_tracked(&self, path: &RepoPath) -> bool;
}
