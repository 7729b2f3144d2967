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

//! The persisted ledger of per-file merge conflicts.
//!
//! The state survives process restarts so an interrupted merge can be
//! resumed or retried. Two files are kept in the state directory: `state`
//! in the legacy line-oriented encoding and `state2` in the typed
//! self-describing encoding. The typed file is authoritative when both are
//! present and consistent; on disagreement the legacy file is assumed newer
//! and wins, with the missing fields backfilled conservatively.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::PathBuf;

use blake2::Blake2b512;
use blake2::Digest;
use thiserror::Error;
use tracing::warn;

use crate::file_util;
use crate::file_util::IoResultExt;
use crate::file_util::PathError;
use crate::filemerge::FileMergeError;
use crate::filemerge::FileMergeInput;
use crate::filemerge::FileMergeTool;
use crate::filemerge::MergeLabels;
use crate::filemerge::MergeOutcome;
use crate::manifest::FileFlag;
use crate::repo::Repo;
use crate::repo_path::RepoPath;
use crate::store::NodeId;
use crate::store::StoreError;
use crate::working_copy::WorkingCopy;

const STATE_PATH_V1: &str = "state";
const STATE_PATH_V2: &str = "state2";

// Record types. Uppercase types are mandatory: readers that do not know
// them must refuse the whole state.
const RECORD_LOCAL: u8 = b'L';
const RECORD_OTHER: u8 = b'O';
const RECORD_MERGED: u8 = b'F';
const RECORD_CHANGEDELETE_CONFLICT: u8 = b'C';
const RECORD_MERGE_DRIVER_MERGE: u8 = b'D';
const RECORD_PATH_CONFLICT: u8 = b'P';
const RECORD_MERGE_DRIVER_STATE: u8 = b'm';
const RECORD_FILE_VALUES: u8 = b'f';
const RECORD_LABELS: u8 = b'l';
const RECORD_OVERRIDE: u8 = b't';
// Written by old releases; read but never produced.
const LEGACY_RECORD_RESOLVED_OTHER: u8 = b'R';

const EXTRA_ANCESTOR_LINK: &str = "ancestorlinknode";

fn null_hex() -> String {
    NodeId::null().hex()
}

/// Per-file conflict status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileConflictState {
    Unresolved,
    Resolved,
    UnresolvedPath,
    ResolvedPath,
    DriverResolved,
    /// Resolved automatically in favor of the other side; kept only for
    /// commit-time bookkeeping.
    MergedOther,
}

impl FileConflictState {
    fn as_str(self) -> &'static str {
        match self {
            FileConflictState::Unresolved => "u",
            FileConflictState::Resolved => "r",
            FileConflictState::UnresolvedPath => "pu",
            FileConflictState::ResolvedPath => "pr",
            FileConflictState::DriverResolved => "d",
            FileConflictState::MergedOther => "o",
        }
    }

    fn from_str(value: &str) -> Option<Self> {
        match value {
            "u" => Some(FileConflictState::Unresolved),
            "r" => Some(FileConflictState::Resolved),
            "pu" => Some(FileConflictState::UnresolvedPath),
            "pr" => Some(FileConflictState::ResolvedPath),
            "d" => Some(FileConflictState::DriverResolved),
            "o" => Some(FileConflictState::MergedOther),
            _ => None,
        }
    }

    pub fn is_unresolved(self) -> bool {
        matches!(
            self,
            FileConflictState::Unresolved | FileConflictState::UnresolvedPath
        )
    }
}

/// State of the configured merge driver for this session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum MergeDriverState {
    #[default]
    Unmarked,
    Marked,
    Success,
}

impl MergeDriverState {
    fn as_str(self) -> &'static str {
        match self {
            MergeDriverState::Unmarked => "u",
            MergeDriverState::Marked => "m",
            MergeDriverState::Success => "s",
        }
    }

    fn from_str(value: &str) -> Option<Self> {
        match value {
            "u" => Some(MergeDriverState::Unmarked),
            "m" => Some(MergeDriverState::Marked),
            "s" => Some(MergeDriverState::Success),
            _ => None,
        }
    }
}

/// Which side a path-conflict file came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictOrigin {
    Local,
    Remote,
}

impl ConflictOrigin {
    fn as_str(self) -> &'static str {
        match self {
            ConflictOrigin::Local => "l",
            ConflictOrigin::Remote => "r",
        }
    }

    fn from_str(value: &str) -> Option<Self> {
        match value {
            "l" => Some(ConflictOrigin::Local),
            "r" => Some(ConflictOrigin::Remote),
            _ => None,
        }
    }
}

/// One entry of the merge state, keyed by destination path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeStateEntry {
    /// A (potentially) conflicting file merge.
    File {
        state: FileConflictState,
        /// Key of the saved pre-merge local content in the side store, or
        /// the null hex when the local side is absent.
        local_key: String,
        local_path: RepoPath,
        ancestor_path: RepoPath,
        ancestor_node: String,
        other_path: RepoPath,
        other_node: String,
        flags: FileFlag,
    },
    /// A file-vs-directory conflict.
    PathConflict {
        state: FileConflictState,
        rename_to: RepoPath,
        origin: ConflictOrigin,
    },
    /// Automatically resolved in favor of the other side.
    MergedOther,
}

impl MergeStateEntry {
    pub fn state(&self) -> FileConflictState {
        match self {
            MergeStateEntry::File { state, .. } => *state,
            MergeStateEntry::PathConflict { state, .. } => *state,
            MergeStateEntry::MergedOther => FileConflictState::MergedOther,
        }
    }
}

/// Queued working-copy bookkeeping produced by re-running merges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum QueuedAction {
    Remove,
    Forget,
    Add,
    AddModified,
    Get,
}

#[derive(Debug, Error)]
pub enum MergeStateError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("Corrupt merge state: {0}")]
    Corrupt(String),
    #[error("Unsupported merge state records: {0:?}")]
    UnsupportedRecords(Vec<char>),
    #[error("Merge driver changed since merge started (was '{was}', now '{now}')")]
    DriverChanged { was: String, now: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    FileMerge(#[from] FileMergeError),
}

/// The persisted merge state of one working copy.
///
/// Either completely empty (no merge in progress) or carrying both the
/// local and other node identities. Every structural mutation marks the
/// state dirty; [`MergeState::commit`] re-serializes all entries to both
/// encodings, so a crash loses at most the most recent transition.
#[derive(Debug)]
pub struct MergeState {
    state_dir: PathBuf,
    local: Option<NodeId>,
    other: Option<NodeId>,
    entries: BTreeMap<RepoPath, MergeStateEntry>,
    extras: BTreeMap<RepoPath, BTreeMap<String, String>>,
    labels: Option<Vec<String>>,
    driver: Option<String>,
    driver_state: MergeDriverState,
    results: BTreeMap<RepoPath, (MergeOutcome, Option<QueuedAction>)>,
    dirty: bool,
}

impl MergeState {
    /// Initializes a brand new merge state, removing any existing state on
    /// disk.
    pub fn clean(
        state_dir: PathBuf,
        local: NodeId,
        other: NodeId,
        labels: Option<Vec<String>>,
        driver: Option<String>,
    ) -> Result<MergeState, MergeStateError> {
        if state_dir.exists() {
            fs::remove_dir_all(&state_dir).context(&state_dir)?;
        }
        let driver_state = if driver.is_some() {
            MergeDriverState::Success
        } else {
            MergeDriverState::Unmarked
        };
        Ok(MergeState {
            state_dir,
            local: Some(local),
            other: Some(other),
            entries: BTreeMap::new(),
            extras: BTreeMap::new(),
            labels,
            driver,
            driver_state,
            results: BTreeMap::new(),
            dirty: false,
        })
    }

    /// Reads the merge state from disk, reconciling the two encodings.
    /// `fallback_other` supplies the other-side identity when only the
    /// legacy encoding is present (the working copy's second parent).
    pub fn read(
        state_dir: PathBuf,
        fallback_other: Option<NodeId>,
    ) -> Result<MergeState, MergeStateError> {
        let mut ms = MergeState {
            state_dir,
            local: None,
            other: None,
            entries: BTreeMap::new(),
            extras: BTreeMap::new(),
            labels: None,
            driver: None,
            driver_state: MergeDriverState::Success,
            results: BTreeMap::new(),
            dirty: false,
        };
        let records = ms.read_records(fallback_other)?;
        let mut unsupported = vec![];
        for (rtype, data) in records {
            match rtype {
                RECORD_LOCAL => {
                    ms.local = Some(NodeId::from_hex(&data).ok_or_else(|| {
                        MergeStateError::Corrupt("bad local node record".to_string())
                    })?);
                }
                RECORD_OTHER => {
                    ms.other = Some(NodeId::from_hex(&data).ok_or_else(|| {
                        MergeStateError::Corrupt("bad other node record".to_string())
                    })?);
                }
                RECORD_MERGE_DRIVER_STATE => {
                    let (driver, state) = data
                        .split_once('\0')
                        .ok_or_else(|| MergeStateError::Corrupt("driver record".to_string()))?;
                    ms.driver = Some(driver.to_string());
                    // An unknown run state just means the driver reruns; it
                    // is expected to be idempotent.
                    ms.driver_state =
                        MergeDriverState::from_str(state).unwrap_or(MergeDriverState::Unmarked);
                }
                RECORD_MERGED
                | RECORD_CHANGEDELETE_CONFLICT
                | RECORD_PATH_CONFLICT
                | RECORD_MERGE_DRIVER_MERGE
                | LEGACY_RECORD_RESOLVED_OTHER => {
                    let (path, entry) = parse_entry(&data)?;
                    ms.entries.insert(path, entry);
                }
                RECORD_FILE_VALUES => {
                    let mut parts = data.split('\0');
                    let filename = parts
                        .next()
                        .ok_or_else(|| MergeStateError::Corrupt("extras record".to_string()))?;
                    let mut extras = BTreeMap::new();
                    loop {
                        let Some(key) = parts.next() else {
                            break;
                        };
                        let Some(value) = parts.next() else {
                            return Err(MergeStateError::Corrupt("odd extras record".to_string()));
                        };
                        extras.insert(key.to_string(), value.to_string());
                    }
                    ms.extras
                        .insert(RepoPath::from_internal_string(filename), extras);
                }
                RECORD_LABELS => {
                    ms.labels = Some(
                        data.split('\0')
                            .filter(|l| !l.is_empty())
                            .map(|l| l.to_string())
                            .collect(),
                    );
                }
                rtype if rtype.is_ascii_uppercase() => {
                    unsupported.push(rtype as char);
                }
                _ => {
                    // Unknown advisory record; safe to ignore.
                }
            }
        }
        if !unsupported.is_empty() {
            return Err(MergeStateError::UnsupportedRecords(unsupported));
        }
        Ok(ms)
    }

    fn read_records(
        &self,
        fallback_other: Option<NodeId>,
    ) -> Result<Vec<(u8, String)>, MergeStateError> {
        let v1 = self.read_records_v1()?;
        let v2 = self.read_records_v2()?;
        if v1_v2_match(&v1, &v2) {
            Ok(v2)
        } else {
            // The legacy file is newer than the typed one: an old writer
            // overwrote the state. The other-side identity is not stored in
            // the legacy encoding, so infer it from the working copy's
            // second parent and backfill the per-file other node with a
            // conservative placeholder.
            let mut records = v1;
            records.push((
                RECORD_OTHER,
                fallback_other.map(|n| n.hex()).unwrap_or_else(null_hex),
            ));
            for record in &mut records {
                if record.0 == RECORD_MERGED {
                    let mut bits: Vec<&str> = record.1.split('\0').collect();
                    if bits.len() == 8 {
                        bits.insert(7, "");
                        record.1 = bits.join("\0");
                    }
                }
            }
            Ok(records)
        }
    }

    fn read_records_v1(&self) -> Result<Vec<(u8, String)>, MergeStateError> {
        let path = self.state_dir.join(STATE_PATH_V1);
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(error) => return Err(PathError { path, error }.into()),
        };
        let mut records = vec![];
        for (i, line) in data.split_terminator('\n').enumerate() {
            if i == 0 {
                records.push((RECORD_LOCAL, line.to_string()));
            } else {
                records.push((RECORD_MERGED, line.to_string()));
            }
        }
        Ok(records)
    }

    fn read_records_v2(&self) -> Result<Vec<(u8, String)>, MergeStateError> {
        let path = self.state_dir.join(STATE_PATH_V2);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(error) => return Err(PathError { path, error }.into()),
        };
        let mut records = vec![];
        let mut off = 0;
        while off < data.len() {
            if off + 5 > data.len() {
                return Err(MergeStateError::Corrupt("truncated record header".to_string()));
            }
            let mut rtype = data[off];
            off += 1;
            let length =
                u32::from_be_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
                    as usize;
            off += 4;
            if off + length > data.len() {
                return Err(MergeStateError::Corrupt("truncated record payload".to_string()));
            }
            let mut payload = &data[off..off + length];
            off += length;
            if rtype == RECORD_OVERRIDE {
                // The escape type: the first payload byte is the real record
                // type. Old readers treat the whole record as advisory.
                if payload.is_empty() {
                    return Err(MergeStateError::Corrupt("empty override record".to_string()));
                }
                rtype = payload[0];
                payload = &payload[1..];
            }
            let payload = String::from_utf8(payload.to_vec())
                .map_err(|_| MergeStateError::Corrupt("non-utf8 record".to_string()))?;
            records.push((rtype, payload));
        }
        Ok(records)
    }

    /// Whether a merge appears to be in progress.
    pub fn is_active(&self) -> bool {
        self.local.is_some() || !self.entries.is_empty()
    }

    pub fn local(&self) -> Option<&NodeId> {
        self.local.as_ref()
    }

    pub fn other(&self) -> Option<&NodeId> {
        self.other.as_ref()
    }

    pub fn labels(&self) -> Option<&[String]> {
        self.labels.as_deref()
    }

    pub fn driver(&self) -> Option<&str> {
        self.driver.as_deref()
    }

    pub fn driver_state(&self) -> MergeDriverState {
        self.driver_state
    }

    pub fn set_driver_state(&mut self, state: MergeDriverState) {
        self.driver_state = state;
        self.dirty = true;
    }

    /// Errors out when the configured driver differs from the one the merge
    /// started with; a paused merge must not silently run a different
    /// driver.
    pub fn check_driver(&self, configured: Option<&str>) -> Result<(), MergeStateError> {
        match (&self.driver, configured) {
            (Some(was), Some(now)) if was != now => Err(MergeStateError::DriverChanged {
                was: was.clone(),
                now: now.to_string(),
            }),
            (Some(was), None) => Err(MergeStateError::DriverChanged {
                was: was.clone(),
                now: "<none>".to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn local_key(path: &RepoPath) -> String {
        let mut hasher = Blake2b512::new();
        hasher.update(path.as_str().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Adds a (potentially) conflicting file merge, saving the pre-merge
    /// local content into the side store.
    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &mut self,
        dest: &RepoPath,
        local_path: &RepoPath,
        local_content: Option<(&[u8], FileFlag)>,
        other_path: &RepoPath,
        other_node: Option<&NodeId>,
        ancestor_path: &RepoPath,
        ancestor_node: Option<&NodeId>,
        ancestor_commit: Option<&NodeId>,
    ) -> Result<(), MergeStateError> {
        let (local_key, flags) = match local_content {
            Some((data, flags)) => {
                let key = Self::local_key(local_path);
                file_util::create_or_reuse_dir(&self.state_dir).context(&self.state_dir)?;
                let blob_path = self.state_dir.join(&key);
                fs::write(&blob_path, data).context(&blob_path)?;
                (key, flags)
            }
            None => (null_hex(), FileFlag::Normal),
        };
        self.entries.insert(
            dest.clone(),
            MergeStateEntry::File {
                state: FileConflictState::Unresolved,
                local_key,
                local_path: local_path.clone(),
                ancestor_path: ancestor_path.clone(),
                ancestor_node: ancestor_node.map(|n| n.hex()).unwrap_or_else(null_hex),
                other_path: other_path.clone(),
                other_node: other_node.map(|n| n.hex()).unwrap_or_else(null_hex),
                flags,
            },
        );
        if let Some(commit) = ancestor_commit {
            self.extras
                .entry(dest.clone())
                .or_default()
                .insert(EXTRA_ANCESTOR_LINK.to_string(), commit.hex());
        }
        self.dirty = true;
        Ok(())
    }

    /// Adds a new conflicting path: `path` is the conflict slot, `rename_to`
    /// the name the conflicting file was moved to.
    pub fn add_path_conflict(
        &mut self,
        path: &RepoPath,
        rename_to: &RepoPath,
        origin: ConflictOrigin,
    ) {
        self.entries.insert(
            path.clone(),
            MergeStateEntry::PathConflict {
                state: FileConflictState::UnresolvedPath,
                rename_to: rename_to.clone(),
                origin,
            },
        );
        self.dirty = true;
    }

    pub fn add_merged_other(&mut self, path: &RepoPath) {
        self.entries.insert(path.clone(), MergeStateEntry::MergedOther);
        self.dirty = true;
    }

    pub fn contains(&self, path: &RepoPath) -> bool {
        self.entries.contains_key(path)
    }

    pub fn entry(&self, path: &RepoPath) -> Option<&MergeStateEntry> {
        self.entries.get(path)
    }

    pub fn state_of(&self, path: &RepoPath) -> Option<FileConflictState> {
        self.entries.get(path).map(|e| e.state())
    }

    pub fn files(&self) -> impl Iterator<Item = &RepoPath> {
        self.entries.keys()
    }

    /// Flips the conflict state of an entry; used by explicit resolve/mark.
    pub fn mark(&mut self, path: &RepoPath, state: FileConflictState) {
        if let Some(entry) = self.entries.get_mut(path) {
            match entry {
                MergeStateEntry::File { state: s, .. } => *s = state,
                MergeStateEntry::PathConflict { state: s, .. } => *s = state,
                MergeStateEntry::MergedOther => {}
            }
            self.dirty = true;
        }
    }

    pub fn unresolved(&self) -> impl Iterator<Item = &RepoPath> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.state().is_unresolved())
            .map(|(path, _)| path)
    }

    pub fn unresolved_count(&self) -> usize {
        self.unresolved().count()
    }

    pub fn driver_resolved(&self) -> impl Iterator<Item = &RepoPath> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.state() == FileConflictState::DriverResolved)
            .map(|(path, _)| path)
    }

    pub fn extras(&mut self, path: &RepoPath) -> &mut BTreeMap<String, String> {
        self.extras.entry(path.clone()).or_default()
    }

    /// Queues a file to be removed from the tracker. Meant for merge
    /// drivers.
    pub fn queue_remove(&mut self, path: &RepoPath) {
        self.results
            .insert(path.clone(), (MergeOutcome::Resolved, Some(QueuedAction::Remove)));
    }

    /// Queues a file to be added to the tracker. Meant for merge drivers.
    pub fn queue_add(&mut self, path: &RepoPath) {
        self.results
            .insert(path.clone(), (MergeOutcome::Resolved, Some(QueuedAction::Add)));
    }

    /// Queues a file to be marked modified in the tracker. Meant for merge
    /// drivers.
    pub fn queue_get(&mut self, path: &RepoPath) {
        self.results
            .insert(path.clone(), (MergeOutcome::Resolved, Some(QueuedAction::Get)));
    }

    /// Runs the premerge pass for one file. Returns whether the merge is
    /// complete and the outcome.
    pub fn preresolve(
        &mut self,
        path: &RepoPath,
        wc: &WorkingCopy,
        repo: &Repo,
        tool: &dyn FileMergeTool,
    ) -> Result<(bool, MergeOutcome), MergeStateError> {
        self.resolve_inner(true, path, wc, repo, tool)
    }

    /// Runs the full merge pass (premerge assumed done) for one file.
    pub fn resolve(
        &mut self,
        path: &RepoPath,
        wc: &WorkingCopy,
        repo: &Repo,
        tool: &dyn FileMergeTool,
    ) -> Result<MergeOutcome, MergeStateError> {
        Ok(self.resolve_inner(false, path, wc, repo, tool)?.1)
    }

    fn resolve_inner(
        &mut self,
        premerge: bool,
        path: &RepoPath,
        wc: &WorkingCopy,
        repo: &Repo,
        tool: &dyn FileMergeTool,
    ) -> Result<(bool, MergeOutcome), MergeStateError> {
        let entry = match self.entries.get(path) {
            Some(entry) => entry.clone(),
            None => return Ok((true, MergeOutcome::Resolved)),
        };
        match entry.state() {
            FileConflictState::Resolved
            | FileConflictState::DriverResolved
            | FileConflictState::MergedOther => {
                return Ok((true, MergeOutcome::Resolved));
            }
            _ => {}
        }
        let MergeStateEntry::File {
            local_key,
            local_path,
            ancestor_path,
            ancestor_node,
            other_path,
            other_node,
            flags,
            ..
        } = entry
        else {
            // Path conflicts are only resolved by explicit marking.
            return Ok((true, MergeOutcome::Unresolved));
        };

        let store = repo.store();
        let local_absent = local_key == null_hex();
        let other_absent = other_node == null_hex();
        let ancestor_absent = ancestor_node == null_hex();

        let local_content = if local_absent {
            None
        } else {
            let blob_path = self.state_dir.join(&local_key);
            Some(fs::read(&blob_path).context(&blob_path)?)
        };
        let other_content = if other_absent {
            None
        } else {
            let node = NodeId::from_hex(&other_node)
                .ok_or_else(|| MergeStateError::Corrupt("bad other node".to_string()))?;
            Some(store.read(&other_path, &node)?)
        };
        let ancestor_content = if ancestor_absent {
            None
        } else {
            let node = NodeId::from_hex(&ancestor_node)
                .ok_or_else(|| MergeStateError::Corrupt("bad ancestor node".to_string()))?;
            Some(store.read(&ancestor_path, &node)?)
        };

        let other_flags = if other_absent {
            FileFlag::Normal
        } else {
            let node = NodeId::from_hex(&other_node).expect("checked above");
            store.flags(&other_path, &node)?
        };
        let ancestor_flags = if ancestor_absent {
            FileFlag::Normal
        } else {
            let node = NodeId::from_hex(&ancestor_node).expect("checked above");
            store.flags(&ancestor_path, &node)?
        };

        // Three-way merge of the execute bit, unless a symlink is involved.
        let mut effective_flags = flags;
        let any_exec = [flags, other_flags, ancestor_flags]
            .iter()
            .any(|f| f.is_executable());
        let any_link = [flags, other_flags, ancestor_flags]
            .iter()
            .any(|f| f.is_symlink());
        if any_exec && !any_link {
            if ancestor_absent && flags != other_flags {
                if premerge {
                    warn!(
                        path = ancestor_path.as_str(),
                        "cannot merge flags without common ancestor - keeping local flags"
                    );
                }
            } else if flags == ancestor_flags {
                effective_flags = other_flags;
            }
        }

        if premerge {
            // Restore the saved pre-merge local content before handing the
            // file to the tool.
            match &local_content {
                Some(data) => {
                    wc.write(path, data, effective_flags, false)?;
                }
                None => {
                    wc.remove(path, true)?;
                }
            }
        }

        let labels = self
            .labels
            .as_ref()
            .map(|l| MergeLabels::from_list(l))
            .unwrap_or_default();
        let input = FileMergeInput {
            path,
            local_path: &local_path,
            other_path: &other_path,
            local: local_content.as_deref(),
            other: other_content.as_deref(),
            ancestor: ancestor_content.as_deref(),
            flags: effective_flags,
            labels: &labels,
        };
        let verdict = if premerge {
            tool.premerge(wc, &input)?
        } else {
            tool.merge(wc, &input)?
        };

        match verdict.outcome {
            MergeOutcome::Identical => {
                // No real conflict after all.
                self.entries.remove(path);
                self.extras.remove(path);
                self.dirty = true;
            }
            MergeOutcome::Resolved => {
                self.mark(path, FileConflictState::Resolved);
            }
            MergeOutcome::Unresolved => {}
        }

        if verdict.complete {
            let action = if verdict.deleted {
                if local_absent {
                    // Local picked its deletion; drop the entry if present,
                    // which may happen on re-resolves.
                    Some(QueuedAction::Forget)
                } else {
                    Some(QueuedAction::Remove)
                }
            } else if local_absent {
                // The other side's content won.
                Some(QueuedAction::Get)
            } else if other_absent {
                if repo
                    .rev_by_node(self.local.as_ref().expect("local node set"))
                    .map(|rev| repo.snapshot(rev).contains(path))
                    .unwrap_or(false)
                {
                    Some(QueuedAction::AddModified)
                } else {
                    Some(QueuedAction::Add)
                }
            } else {
                // Regular merges need no bookkeeping beyond the merge mark.
                None
            };
            self.results.insert(path.clone(), (verdict.outcome, action));
        }

        Ok((verdict.complete, verdict.outcome))
    }

    /// Counts of files updated, merged, and removed by re-run merges in this
    /// session.
    pub fn counts(&self) -> (usize, usize, usize) {
        let mut updated = 0;
        let mut merged = 0;
        let mut removed = 0;
        for (outcome, action) in self.results.values() {
            match outcome {
                MergeOutcome::Identical => updated += 1,
                MergeOutcome::Resolved => {
                    if *action == Some(QueuedAction::Remove) {
                        removed += 1;
                    } else {
                        merged += 1;
                    }
                }
                MergeOutcome::Unresolved => {}
            }
        }
        (updated, merged, removed)
    }

    /// The queued tracker actions produced by re-run merges.
    pub fn actions(&self) -> BTreeMap<QueuedAction, Vec<RepoPath>> {
        let mut actions: BTreeMap<QueuedAction, Vec<RepoPath>> = BTreeMap::new();
        for (path, (_, action)) in &self.results {
            if let Some(action) = action {
                actions.entry(*action).or_default().push(path.clone());
            }
        }
        actions
    }

    /// Writes the current state to disk (if anything changed) in both
    /// encodings.
    pub fn commit(&mut self) -> Result<(), MergeStateError> {
        if !self.dirty {
            return Ok(());
        }
        let records = self.make_records();
        file_util::create_or_reuse_dir(&self.state_dir).context(&self.state_dir)?;
        self.write_records_v1(&records)?;
        self.write_records_v2(&records)?;
        self.dirty = false;
        Ok(())
    }

    /// Removes all merge state from disk; the merge concluded or was
    /// aborted.
    pub fn reset(&mut self) -> Result<(), MergeStateError> {
        if self.state_dir.exists() {
            fs::remove_dir_all(&self.state_dir).context(&self.state_dir)?;
        }
        self.entries.clear();
        self.extras.clear();
        self.results.clear();
        self.local = None;
        self.other = None;
        self.labels = None;
        self.dirty = false;
        Ok(())
    }

    fn make_records(&self) -> Vec<(u8, String)> {
        let mut records = vec![];
        records.push((
            RECORD_LOCAL,
            self.local.as_ref().map(|n| n.hex()).unwrap_or_else(null_hex),
        ));
        records.push((
            RECORD_OTHER,
            self.other.as_ref().map(|n| n.hex()).unwrap_or_else(null_hex),
        ));
        if let Some(driver) = &self.driver {
            records.push((
                RECORD_MERGE_DRIVER_STATE,
                format!("{}\0{}", driver, self.driver_state.as_str()),
            ));
        }
        for (path, entry) in &self.entries {
            let (rtype, fields) = serialize_entry(entry);
            let mut data = path.as_str().to_string();
            for field in fields {
                data.push('\0');
                data.push_str(&field);
            }
            records.push((rtype, data));
        }
        for (path, extras) in &self.extras {
            if extras.is_empty() {
                continue;
            }
            let mut data = path.as_str().to_string();
            for (key, value) in extras {
                data.push('\0');
                data.push_str(key);
                data.push('\0');
                data.push_str(value);
            }
            records.push((RECORD_FILE_VALUES, data));
        }
        if let Some(labels) = &self.labels {
            records.push((RECORD_LABELS, labels.join("\0")));
        }
        records
    }

    fn write_records_v1(&self, records: &[(u8, String)]) -> Result<(), MergeStateError> {
        let path = self.state_dir.join(STATE_PATH_V1);
        let mut out = String::new();
        let local = records
            .iter()
            .find(|(rtype, _)| *rtype == RECORD_LOCAL)
            .expect("records start with the local node");
        out.push_str(&local.1);
        out.push('\n');
        for (rtype, data) in records {
            if *rtype == RECORD_MERGED {
                out.push_str(&drop_other_node(data));
                out.push('\n');
            }
        }
        fs::write(&path, out).context(&path)?;
        Ok(())
    }

    fn write_records_v2(&self, records: &[(u8, String)]) -> Result<(), MergeStateError> {
        // Record types every typed-format reader knows; anything else is
        // wrapped in the escape type so old readers skip it as advisory.
        let allowlist = [RECORD_LOCAL, RECORD_OTHER, RECORD_MERGED];
        let path = self.state_dir.join(STATE_PATH_V2);
        let mut out: Vec<u8> = vec![];
        for (rtype, data) in records {
            let (rtype, payload) = if allowlist.contains(rtype) {
                (*rtype, data.as_bytes().to_vec())
            } else {
                let mut payload = vec![*rtype];
                payload.extend_from_slice(data.as_bytes());
                (RECORD_OVERRIDE, payload)
            };
            out.push(rtype);
            out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            out.extend_from_slice(&payload);
        }
        fs::write(&path, out).context(&path)?;
        Ok(())
    }
}

fn serialize_entry(entry: &MergeStateEntry) -> (u8, Vec<String>) {
    match entry {
        MergeStateEntry::File {
            state,
            local_key,
            local_path,
            ancestor_path,
            ancestor_node,
            other_path,
            other_node,
            flags,
        } => {
            // Change/delete conflicts get their own mandatory type so old
            // readers refuse rather than mishandle them.
            let rtype = if *state == FileConflictState::DriverResolved {
                RECORD_MERGE_DRIVER_MERGE
            } else if *local_key == null_hex() || *other_node == null_hex() {
                RECORD_CHANGEDELETE_CONFLICT
            } else {
                RECORD_MERGED
            };
            (
                rtype,
                vec![
                    state.as_str().to_string(),
                    local_key.clone(),
                    local_path.as_str().to_string(),
                    ancestor_path.as_str().to_string(),
                    ancestor_node.clone(),
                    other_path.as_str().to_string(),
                    other_node.clone(),
                    flags.as_str().to_string(),
                ],
            )
        }
        MergeStateEntry::PathConflict {
            state,
            rename_to,
            origin,
        } => (
            RECORD_PATH_CONFLICT,
            vec![
                state.as_str().to_string(),
                rename_to.as_str().to_string(),
                origin.as_str().to_string(),
            ],
        ),
        MergeStateEntry::MergedOther => (
            RECORD_MERGED,
            vec![
                FileConflictState::MergedOther.as_str().to_string(),
                null_hex(),
                null_hex(),
            ],
        ),
    }
}

fn parse_entry(data: &str) -> Result<(RepoPath, MergeStateEntry), MergeStateError> {
    let bits: Vec<&str> = data.split('\0').collect();
    if bits.len() < 2 {
        return Err(MergeStateError::Corrupt(format!("short entry record: {data:?}")));
    }
    let path = RepoPath::from_internal_string(bits[0]);
    let state = FileConflictState::from_str(bits[1])
        .ok_or_else(|| MergeStateError::Corrupt(format!("unknown entry state: {:?}", bits[1])))?;
    let entry = match state {
        FileConflictState::MergedOther => MergeStateEntry::MergedOther,
        FileConflictState::UnresolvedPath | FileConflictState::ResolvedPath => {
            if bits.len() < 4 {
                return Err(MergeStateError::Corrupt("short path conflict record".to_string()));
            }
            MergeStateEntry::PathConflict {
                state,
                rename_to: RepoPath::from_internal_string(bits[2]),
                origin: ConflictOrigin::from_str(bits[3]).ok_or_else(|| {
                    MergeStateError::Corrupt(format!("unknown conflict origin: {:?}", bits[3]))
                })?,
            }
        }
        _ => {
            if bits.len() < 9 {
                return Err(MergeStateError::Corrupt("short file merge record".to_string()));
            }
            MergeStateEntry::File {
                state,
                local_key: bits[2].to_string(),
                local_path: RepoPath::from_internal_string(bits[3]),
                ancestor_path: RepoPath::from_internal_string(bits[4]),
                ancestor_node: bits[5].to_string(),
                other_path: RepoPath::from_internal_string(bits[6]),
                other_node: if bits[7].is_empty() {
                    null_hex()
                } else {
                    bits[7].to_string()
                },
                flags: FileFlag::from_str(bits[8]).unwrap_or(FileFlag::Normal),
            }
        }
    };
    Ok((path, entry))
}

/// Removes the other-node field from a merged record, producing its legacy
/// form.
fn drop_other_node(data: &str) -> String {
    let mut bits: Vec<&str> = data.split('\0').collect();
    if bits.len() >= 2 {
        bits.remove(bits.len() - 2);
    }
    bits.join("\0")
}

/// Whether the legacy records are a subset of the typed records (modulo the
/// fields the legacy encoding cannot represent). When they are not, the
/// legacy file was written last and wins.
fn v1_v2_match(v1: &[(u8, String)], v2: &[(u8, String)]) -> bool {
    let mut old_v2: HashSet<(u8, String)> = HashSet::new();
    for (rtype, data) in v2 {
        match *rtype {
            RECORD_LOCAL => {
                old_v2.insert((RECORD_LOCAL, data.clone()));
            }
            RECORD_MERGED => {
                old_v2.insert((RECORD_MERGED, drop_other_node(data)));
            }
            _ => {}
        }
    }
    v1.iter().all(|record| old_v2.contains(record))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo_path(value: &str) -> RepoPath {
        RepoPath::from_internal_string(value)
    }

    #[test]
    fn test_drop_other_node() {
        assert_eq!(drop_other_node("f\0u\0k\0lf\0af\0an\0of\0on\0x"), "f\0u\0k\0lf\0af\0an\0of\0x");
    }

    #[test]
    fn test_entry_serialization_roundtrip() {
        let entry = MergeStateEntry::File {
            state: FileConflictState::Unresolved,
            local_key: "ab".repeat(32),
            local_path: repo_path("src/a.rs"),
            ancestor_path: repo_path("src/a.rs"),
            ancestor_node: "11".repeat(20),
            other_path: repo_path("src/b.rs"),
            other_node: "22".repeat(20),
            flags: FileFlag::Executable,
        };
        let (rtype, fields) = serialize_entry(&entry);
        assert_eq!(rtype, RECORD_MERGED);
        let data = format!("dest\0{}", fields.join("\0"));
        let (path, parsed) = parse_entry(&data).unwrap();
        assert_eq!(path, repo_path("dest"));
        assert_eq!(parsed, entry);
    }

    #[test]
    fn test_change_delete_gets_mandatory_type() {
        let entry = MergeStateEntry::File {
            state: FileConflictState::Unresolved,
            local_key: null_hex(),
            local_path: repo_path("a"),
            ancestor_path: repo_path("a"),
            ancestor_node: "11".repeat(20),
            other_path: repo_path("a"),
            other_node: "22".repeat(20),
            flags: FileFlag::Normal,
        };
        let (rtype, _) = serialize_entry(&entry);
        assert_eq!(rtype, RECORD_CHANGEDELETE_CONFLICT);
    }

    #[test]
    fn test_path_conflict_roundtrip() {
        let entry = MergeStateEntry::PathConflict {
            state: FileConflictState::UnresolvedPath,
            rename_to: repo_path("x~local"),
            origin: ConflictOrigin::Local,
        };
        let (rtype, fields) = serialize_entry(&entry);
        assert_eq!(rtype, RECORD_PATH_CONFLICT);
        let data = format!("x\0{}", fields.join("\0"));
        let (path, parsed) = parse_entry(&data).unwrap();
        assert_eq!(path, repo_path("x"));
        assert_eq!(parsed, entry);
    }
}
