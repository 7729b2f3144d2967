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

//! Content identifiers and the content-store collaborator interface.
//!
//! The merge engine never writes file revisions; it only reads them from a
//! [`FileStore`] and writes into the working tree.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::fmt::{Debug, Error, Formatter};

use thiserror::Error;

use crate::manifest::FileFlag;
use crate::repo::RevId;
use crate::repo_path::RepoPath;

const NODE_ID_LEN: usize = 20;

/// Identifier of one revision of one file's content.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
pub struct NodeId(Vec<u8>);

impl Debug for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        f.debug_tuple("NodeId").field(&self.hex()).finish()
    }
}

impl NodeId {
    pub fn new(value: Vec<u8>) -> Self {
        Self(value)
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        hex::decode(hex).ok().map(Self)
    }

    pub fn hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// The identity standing for an absent file.
    pub fn null() -> Self {
        Self(vec![0; NODE_ID_LEN])
    }

    pub fn is_null(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Phony identity for files newly added in the working copy.
    pub fn working_added() -> Self {
        Self(vec![b'a'; NODE_ID_LEN])
    }

    /// Phony identity for files modified in the working copy.
    pub fn working_modified() -> Self {
        Self(vec![b'm'; NODE_ID_LEN])
    }
}

/// A `(path, node)` pair naming one file revision, possibly in another
/// file's history when a rename crossed file boundaries.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FileRevId {
    pub path: RepoPath,
    pub node: NodeId,
}

impl FileRevId {
    pub fn new(path: RepoPath, node: NodeId) -> Self {
        FileRevId { path, node }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("File {path} with id {node} not found in store", path = .path.as_str(), node = .node.hex())]
    NotFound { path: RepoPath, node: NodeId },
    #[error("Error: {0}")]
    Other(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Read access to stored file revisions and their per-file ancestry.
pub trait FileStore: Send + Sync {
    fn read(&self, path: &RepoPath, node: &NodeId) -> StoreResult<Vec<u8>>;

    fn flags(&self, path: &RepoPath, node: &NodeId) -> StoreResult<FileFlag>;

    /// Ancestry of a file revision. Parents may live under a different path
    /// when the revision was recorded as a copy/rename.
    fn parents(&self, path: &RepoPath, node: &NodeId) -> StoreResult<Vec<FileRevId>>;

    /// The revision that introduced this file revision, or `None` for
    /// uncommitted content.
    fn link_rev(&self, path: &RepoPath, node: &NodeId) -> StoreResult<Option<RevId>>;
}

#[derive(Clone, Debug)]
struct FileRecord {
    data: Vec<u8>,
    flags: FileFlag,
    parents: Vec<FileRevId>,
    link_rev: Option<RevId>,
}

/// In-memory [`FileStore`], used by tests and small repositories.
#[derive(Debug, Default)]
pub struct MemoryFileStore {
    files: HashMap<(RepoPath, NodeId), FileRecord>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        MemoryFileStore::default()
    }

    pub fn add(
        &mut self,
        path: RepoPath,
        node: NodeId,
        data: Vec<u8>,
        flags: FileFlag,
        parents: Vec<FileRevId>,
        link_rev: Option<RevId>,
    ) {
        self.files.insert(
            (path, node),
            FileRecord {
                data,
                flags,
                parents,
                link_rev,
            },
        );
    }

    pub fn contains(&self, path: &RepoPath, node: &NodeId) -> bool {
        self.files.contains_key(&(path.clone(), node.clone()))
    }

    fn get(&self, path: &RepoPath, node: &NodeId) -> StoreResult<&FileRecord> {
        self.files
            .get(&(path.clone(), node.clone()))
            .ok_or_else(|| StoreError::NotFound {
                path: path.clone(),
                node: node.clone(),
            })
    }
}

impl FileStore for MemoryFileStore {
    fn read(&self, path: &RepoPath, node: &NodeId) -> StoreResult<Vec<u8>> {
        Ok(self.get(path, node)?.data.clone())
    }

    fn flags(&self, path: &RepoPath, node: &NodeId) -> StoreResult<FileFlag> {
        Ok(self.get(path, node)?.flags)
    }

    fn parents(&self, path: &RepoPath, node: &NodeId) -> StoreResult<Vec<FileRevId>> {
        Ok(self.get(path, node)?.parents.clone())
    }

    fn link_rev(&self, path: &RepoPath, node: &NodeId) -> StoreResult<Option<RevId>> {
        Ok(self.get(path, node)?.link_rev)
    }
}
