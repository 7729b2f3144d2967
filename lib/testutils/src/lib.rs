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

//! Helpers for building small in-memory repositories in tests.

#![allow(missing_docs)]

use std::collections::HashSet;
use std::sync::Arc;

use blake2::Blake2b512;
use blake2::Digest;
use tempfile::TempDir;
use treemerge_lib::manifest::FileFlag;
use treemerge_lib::manifest::Manifest;
use treemerge_lib::manifest::ManifestEntry;
use treemerge_lib::repo::Repo;
use treemerge_lib::repo::RevId;
use treemerge_lib::repo_path::RepoPath;
use treemerge_lib::store::FileRevId;
use treemerge_lib::store::MemoryFileStore;
use treemerge_lib::store::NodeId;
use treemerge_lib::working_copy::FileData;
use treemerge_lib::working_copy::WorkingCopy;
use treemerge_lib::working_copy::WorkingCopyTracker;

pub fn new_temp_dir() -> TempDir {
    tempfile::Builder::new()
        .prefix("treemerge-test-")
        .tempdir()
        .unwrap()
}

pub fn repo_path(value: &str) -> RepoPath {
    RepoPath::from_internal_string(value)
}

/// One change a test commit makes relative to its first parent.
pub enum FileChange {
    Write {
        path: String,
        content: Vec<u8>,
        flags: FileFlag,
    },
    /// Write recorded as copied from `from` (which stays).
    Copy {
        path: String,
        content: Vec<u8>,
        from: String,
    },
    /// Write recorded as renamed from `from` (which goes away).
    Rename {
        path: String,
        content: Vec<u8>,
        from: String,
    },
    Remove { path: String },
}

pub fn write(path: &str, content: &str) -> FileChange {
    FileChange::Write {
        path: path.to_string(),
        content: content.as_bytes().to_vec(),
        flags: FileFlag::Normal,
    }
}

pub fn write_flagged(path: &str, content: &str, flags: FileFlag) -> FileChange {
    FileChange::Write {
        path: path.to_string(),
        content: content.as_bytes().to_vec(),
        flags,
    }
}

pub fn copy(path: &str, content: &str, from: &str) -> FileChange {
    FileChange::Copy {
        path: path.to_string(),
        content: content.as_bytes().to_vec(),
        from: from.to_string(),
    }
}

pub fn rename(path: &str, content: &str, from: &str) -> FileChange {
    FileChange::Rename {
        path: path.to_string(),
        content: content.as_bytes().to_vec(),
        from: from.to_string(),
    }
}

pub fn remove(path: &str) -> FileChange {
    FileChange::Remove {
        path: path.to_string(),
    }
}

/// Builds an in-memory [`Repo`] commit by commit.
#[derive(Default)]
pub struct TestRepoBuilder {
    store: MemoryFileStore,
    manifests: Vec<Manifest>,
    pending: Vec<(NodeId, Vec<RevId>, Vec<RepoPath>)>,
}

impl TestRepoBuilder {
    pub fn new() -> Self {
        TestRepoBuilder::default()
    }

    fn file_node(path: &RepoPath, content: &[u8], parents: &[FileRevId]) -> NodeId {
        let mut hasher = Blake2b512::new();
        hasher.update(path.as_str().as_bytes());
        hasher.update([0]);
        for parent in parents {
            hasher.update(parent.path.as_str().as_bytes());
            hasher.update(parent.node.as_bytes());
        }
        hasher.update([0]);
        hasher.update(content);
        NodeId::from_bytes(&hasher.finalize()[..20])
    }

    /// Adds a commit applying `changes` on top of the first parent's tree.
    pub fn commit(&mut self, parents: &[RevId], changes: &[FileChange]) -> RevId {
        let rev = self.pending.len() as RevId;
        let mut manifest = parents
            .first()
            .map(|parent| self.manifests[*parent as usize].clone())
            .unwrap_or_default();
        let mut changed_paths: Vec<RepoPath> = vec![];

        for change in changes {
            match change {
                FileChange::Write {
                    path,
                    content,
                    flags,
                } => {
                    let path = repo_path(path);
                    let file_parents: Vec<FileRevId> = manifest
                        .get(&path)
                        .map(|entry| vec![FileRevId::new(path.clone(), entry.node.clone())])
                        .unwrap_or_default();
                    self.write_file(&mut manifest, &path, content, *flags, file_parents, rev);
                    changed_paths.push(path);
                }
                FileChange::Copy {
                    path,
                    content,
                    from,
                } => {
                    let path = repo_path(path);
                    let from = repo_path(from);
                    let source = manifest.get(&from).expect("copy source must exist");
                    let file_parents = vec![FileRevId::new(from.clone(), source.node.clone())];
                    self.write_file(
                        &mut manifest,
                        &path,
                        content,
                        FileFlag::Normal,
                        file_parents,
                        rev,
                    );
                    changed_paths.push(path);
                }
                FileChange::Rename {
                    path,
                    content,
                    from,
                } => {
                    let path = repo_path(path);
                    let from = repo_path(from);
                    let source = manifest.get(&from).expect("rename source must exist");
                    let file_parents = vec![FileRevId::new(from.clone(), source.node.clone())];
                    self.write_file(
                        &mut manifest,
                        &path,
                        content,
                        FileFlag::Normal,
                        file_parents,
                        rev,
                    );
                    manifest.remove(&from);
                    changed_paths.push(path);
                    changed_paths.push(from);
                }
                FileChange::Remove { path } => {
                    let path = repo_path(path);
                    manifest.remove(&path);
                    changed_paths.push(path);
                }
            }
        }

        let mut commit_hasher = Blake2b512::new();
        commit_hasher.update(rev.to_be_bytes());
        for (path, entry) in manifest.iter() {
            commit_hasher.update(path.as_str().as_bytes());
            commit_hasher.update(entry.node.as_bytes());
        }
        let node = NodeId::from_bytes(&commit_hasher.finalize()[..20]);

        self.manifests.push(manifest);
        self.pending.push((node, parents.to_vec(), changed_paths));
        rev
    }

    fn write_file(
        &mut self,
        manifest: &mut Manifest,
        path: &RepoPath,
        content: &[u8],
        flags: FileFlag,
        file_parents: Vec<FileRevId>,
        rev: RevId,
    ) {
        let node = Self::file_node(path, content, &file_parents);
        self.store.add(
            path.clone(),
            node.clone(),
            content.to_vec(),
            flags,
            file_parents,
            Some(rev),
        );
        manifest.insert(path.clone(), ManifestEntry::new(node, flags));
    }

    pub fn build(self) -> Repo {
        let mut repo = Repo::new(Arc::new(self.store));
        for (manifest, (node, parents, files)) in
            self.manifests.into_iter().zip(self.pending.into_iter())
        {
            repo.add_commit(node, parents, manifest, files);
        }
        repo
    }
}

/// Points the working snapshot at `rev` with a clean status.
pub fn checkout(repo: &mut Repo, rev: RevId) {
    let manifest = repo.snapshot(rev).manifest().clone();
    let working = repo.working_mut();
    working.parents = vec![rev];
    working.manifest = manifest;
    working.copies.clear();
    working.modified.clear();
    working.added.clear();
    working.removed.clear();
    working.deleted.clear();
}

/// Writes the tree of `rev` into the working directory.
pub fn materialize(repo: &Repo, rev: RevId, wc: &WorkingCopy) {
    let snapshot = repo.snapshot(rev);
    for (path, entry) in snapshot.manifest().iter() {
        let data = repo.store().read(path, &entry.node).unwrap();
        wc.write(path, &data, entry.flags, false).unwrap();
    }
}

/// A [`WorkingCopyTracker`] that records every call for assertions.
#[derive(Debug, Default)]
pub struct TestTracker {
    pub tracked: HashSet<RepoPath>,
    pub ignored: HashSet<RepoPath>,
    pub events: Vec<String>,
    pub copies: Vec<(RepoPath, RepoPath)>,
}

impl TestTracker {
    pub fn tracking(repo: &Repo, rev: RevId) -> Self {
        TestTracker {
            tracked: repo.snapshot(rev).manifest().paths().cloned().collect(),
            ..TestTracker::default()
        }
    }

    pub fn has_event(&self, event: &str) -> bool {
        self.events.iter().any(|e| e == event)
    }
}

impl WorkingCopyTracker for TestTracker {
    fn add(&mut self, path: &RepoPath) {
        self.tracked.insert(path.clone());
        self.events.push(format!("add {}", path.as_str()));
    }

    fn remove(&mut self, path: &RepoPath) {
        self.tracked.remove(path);
        self.events.push(format!("remove {}", path.as_str()));
    }

    fn drop_entry(&mut self, path: &RepoPath) {
        self.tracked.remove(path);
        self.events.push(format!("drop {}", path.as_str()));
    }

    fn copy(&mut self, source: &RepoPath, dest: &RepoPath) {
        self.copies.push((source.clone(), dest.clone()));
        self.events
            .push(format!("copy {} -> {}", source.as_str(), dest.as_str()));
    }

    fn normal(&mut self, path: &RepoPath, _data: Option<&FileData>) {
        self.tracked.insert(path.clone());
        self.events.push(format!("normal {}", path.as_str()));
    }

    fn normal_lookup(&mut self, path: &RepoPath) {
        self.tracked.insert(path.clone());
        self.events.push(format!("normallookup {}", path.as_str()));
    }

    fn merge(&mut self, path: &RepoPath) {
        self.tracked.insert(path.clone());
        self.events.push(format!("merge {}", path.as_str()));
    }

    fn other_parent(&mut self, path: &RepoPath) {
        self.tracked.insert(path.clone());
        self.events.push(format!("otherparent {}", path.as_str()));
    }

    fn is_ignored(&self, path: &RepoPath) -> bool {
        self.ignored.contains(path)
    }

    fn is_tracked(&self, path: &RepoPath) -> bool {
        self.tracked.contains(path)
    }
}
