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

//! Manifests: immutable snapshots of one commit's file tree.

#![allow(missing_docs)]

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::collections::HashSet;

use crate::matchers::Matcher;
use crate::repo_path::RepoPath;
use crate::store::NodeId;

/// Mode flags of one tree entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum FileFlag {
    #[default]
    Normal,
    Executable,
    Symlink,
}

impl FileFlag {
    /// The single-character form used in state records ("", "x" or "l").
    pub fn as_str(self) -> &'static str {
        match self {
            FileFlag::Normal => "",
            FileFlag::Executable => "x",
            FileFlag::Symlink => "l",
        }
    }

    pub fn from_str(value: &str) -> Option<FileFlag> {
        match value {
            "" => Some(FileFlag::Normal),
            "x" => Some(FileFlag::Executable),
            "l" => Some(FileFlag::Symlink),
            _ => None,
        }
    }

    pub fn is_symlink(self) -> bool {
        self == FileFlag::Symlink
    }

    pub fn is_executable(self) -> bool {
        self == FileFlag::Executable
    }
}

/// One manifest entry: a content identity plus mode flags.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ManifestEntry {
    pub node: NodeId,
    pub flags: FileFlag,
}

impl ManifestEntry {
    pub fn new(node: NodeId, flags: FileFlag) -> Self {
        ManifestEntry { node, flags }
    }
}

/// An immutable mapping from path to [`ManifestEntry`].
///
/// Iteration order is the path order, which keeps every downstream plan and
/// report deterministic.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: BTreeMap<RepoPath, ManifestEntry>,
}

impl Manifest {
    pub fn new() -> Self {
        Manifest::default()
    }

    pub fn insert(&mut self, path: RepoPath, entry: ManifestEntry) {
        self.entries.insert(path, entry);
    }

    pub fn remove(&mut self, path: &RepoPath) {
        self.entries.remove(path);
    }

    pub fn get(&self, path: &RepoPath) -> Option<&ManifestEntry> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &RepoPath) -> bool {
        self.entries.contains_key(path)
    }

    pub fn flags(&self, path: &RepoPath) -> FileFlag {
        self.entries.get(path).map(|e| e.flags).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, RepoPath, ManifestEntry> {
        self.entries.iter()
    }

    pub fn paths(&self) -> impl Iterator<Item = &RepoPath> {
        self.entries.keys()
    }

    /// The symmetric difference against `other`, restricted to paths accepted
    /// by `matcher`. A path maps to its entry on each side (`None` where it
    /// does not exist); identical entries are not reported.
    pub fn diff(
        &self,
        other: &Manifest,
        matcher: &dyn Matcher,
    ) -> BTreeMap<RepoPath, (Option<ManifestEntry>, Option<ManifestEntry>)> {
        let mut result = BTreeMap::new();
        for (path, entry) in &self.entries {
            if !matcher.always() && !matcher.matches(path) {
                continue;
            }
            match other.entries.get(path) {
                Some(other_entry) if other_entry == entry => {}
                other_entry => {
                    result.insert(path.clone(), (Some(entry.clone()), other_entry.cloned()));
                }
            }
        }
        for (path, other_entry) in &other.entries {
            if self.entries.contains_key(path) {
                continue;
            }
            if !matcher.always() && !matcher.matches(path) {
                continue;
            }
            result.insert(path.clone(), (None, Some(other_entry.clone())));
        }
        result
    }

    /// Paths present in `self` but not in `other`.
    pub fn files_not_in<'a>(&'a self, other: &'a Manifest) -> impl Iterator<Item = &'a RepoPath> {
        self.entries
            .keys()
            .filter(move |path| !other.entries.contains_key(path))
    }

    /// All directories containing at least one file, in internal form.
    pub fn dirs(&self) -> HashSet<&str> {
        let mut dirs = HashSet::new();
        for path in self.entries.keys() {
            for dir in path.parent_dirs() {
                if !dirs.insert(dir) {
                    break;
                }
            }
        }
        dirs
    }

    /// Whether any file lives under the directory `dir` (internal form).
    pub fn has_dir(&self, dir: &str) -> bool {
        self.entries.keys().any(|path| path.starts_with_dir(dir))
    }
}

impl FromIterator<(RepoPath, ManifestEntry)> for Manifest {
    fn from_iter<I: IntoIterator<Item = (RepoPath, ManifestEntry)>>(iter: I) -> Self {
        Manifest {
            entries: iter.into_iter().collect(),
        }
    }
}
