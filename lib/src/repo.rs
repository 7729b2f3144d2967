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

//! The commit graph and snapshot handles the merge engine operates on.

#![allow(missing_docs)]

use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use crate::dag_walk;
use crate::manifest::Manifest;
use crate::manifest::ManifestEntry;
use crate::repo_path::RepoPath;
use crate::store::FileStore;
use crate::store::NodeId;

/// Revision number of a commit in the local graph.
pub type RevId = u32;

/// Sentinel revision number standing for the uncommitted working snapshot in
/// graph-distance computations.
pub const WORKING_REV: RevId = RevId::MAX;

#[derive(Clone, Debug)]
struct CommitData {
    node: NodeId,
    parents: Vec<RevId>,
    manifest: Arc<Manifest>,
    /// Paths changed relative to the first parent.
    files: Vec<RepoPath>,
}

/// Mutable state of the working snapshot, fed by the status tracker.
#[derive(Debug, Default)]
pub struct WorkingState {
    pub parents: Vec<RevId>,
    pub manifest: Manifest,
    /// Pending copies recorded in the working copy: destination to source.
    pub copies: HashMap<RepoPath, RepoPath>,
    pub modified: HashSet<RepoPath>,
    pub added: HashSet<RepoPath>,
    pub removed: HashSet<RepoPath>,
    pub deleted: HashSet<RepoPath>,
}

impl WorkingState {
    pub fn is_dirty(&self) -> bool {
        !self.modified.is_empty()
            || !self.added.is_empty()
            || !self.removed.is_empty()
            || !self.deleted.is_empty()
    }
}

/// A repository: the commit graph, the content store, and the working
/// snapshot.
pub struct Repo {
    commits: Vec<CommitData>,
    store: Arc<dyn FileStore>,
    working: WorkingState,
}

impl Repo {
    pub fn new(store: Arc<dyn FileStore>) -> Self {
        Repo {
            commits: vec![],
            store,
            working: WorkingState::default(),
        }
    }

    pub fn add_commit(
        &mut self,
        node: NodeId,
        parents: Vec<RevId>,
        manifest: Manifest,
        files: Vec<RepoPath>,
    ) -> RevId {
        for parent in &parents {
            assert!((*parent as usize) < self.commits.len(), "unknown parent rev");
        }
        self.commits.push(CommitData {
            node,
            parents,
            manifest: Arc::new(manifest),
            files,
        });
        (self.commits.len() - 1) as RevId
    }

    pub fn store(&self) -> &Arc<dyn FileStore> {
        &self.store
    }

    pub fn working(&self) -> &WorkingState {
        &self.working
    }

    pub fn working_mut(&mut self) -> &mut WorkingState {
        &mut self.working
    }

    pub fn num_commits(&self) -> usize {
        self.commits.len()
    }

    pub fn snapshot(&self, rev: RevId) -> Snapshot<'_> {
        assert!((rev as usize) < self.commits.len(), "unknown rev {rev}");
        Snapshot {
            repo: self,
            rev: Some(rev),
        }
    }

    pub fn working_snapshot(&self) -> Snapshot<'_> {
        Snapshot {
            repo: self,
            rev: None,
        }
    }

    pub fn rev_by_node(&self, node: &NodeId) -> Option<RevId> {
        self.commits
            .iter()
            .position(|c| &c.node == node)
            .map(|i| i as RevId)
    }

    fn parent_revs(&self, rev: RevId) -> &[RevId] {
        &self.commits[rev as usize].parents
    }

    /// All ancestors of `rev`, inclusive.
    pub fn ancestor_set(&self, rev: RevId) -> HashSet<RevId> {
        dag_walk::dfs([rev], |r| *r, |r| self.parent_revs(*r).to_vec()).collect()
    }

    /// Whether `a` is an ancestor of `b` (inclusive).
    pub fn is_ancestor(&self, a: RevId, b: RevId) -> bool {
        a <= b && self.ancestor_set(b).contains(&a)
    }

    /// The maximal elements of the common ancestor set of `a` and `b`,
    /// sorted ascending.
    pub fn common_ancestor_heads(&self, a: RevId, b: RevId) -> Vec<RevId> {
        let common: HashSet<RevId> = self
            .ancestor_set(a)
            .intersection(&self.ancestor_set(b))
            .copied()
            .collect();
        let mut non_heads: HashSet<RevId> = HashSet::new();
        for &rev in &common {
            for &parent in self.parent_revs(rev) {
                non_heads.extend(self.ancestor_set(parent));
            }
        }
        let mut heads: Vec<RevId> = common.difference(&non_heads).copied().collect();
        heads.sort_unstable();
        heads
    }

    /// The preferred single common ancestor: the highest-numbered head of the
    /// common ancestor set.
    pub fn greatest_common_ancestor(&self, a: RevId, b: RevId) -> Option<RevId> {
        self.common_ancestor_heads(a, b).last().copied()
    }

    /// The revisions in `base::head` (descendants of `base` that are
    /// ancestors of `head`), inclusive.
    pub fn revs_between(&self, base: RevId, head: RevId) -> Vec<RevId> {
        let mut revs: Vec<RevId> = self
            .ancestor_set(head)
            .into_iter()
            .filter(|rev| self.is_ancestor(base, *rev))
            .collect();
        revs.sort_unstable();
        revs
    }

    /// Finds the last revision that needs to be checked so that a full
    /// transitive closure for file copies between `a` and `b` can be
    /// computed.
    ///
    /// Marks the two endpoints with opposite sides and walks the graph
    /// downward: a revision still on one side is "interesting"; a revision
    /// reached from both sides stops counting. The lowest interesting
    /// revision seen bounds the file-ancestry walks.
    pub fn find_limit(&self, a: Option<RevId>, b: Option<RevId>) -> RevId {
        let a = a.unwrap_or(WORKING_REV);
        let b = b.unwrap_or(WORKING_REV);
        let parents_of = |rev: RevId| -> Vec<RevId> {
            if rev == WORKING_REV {
                self.working.parents.clone()
            } else {
                self.parent_revs(rev).to_vec()
            }
        };

        let mut side: HashMap<RevId, i8> = HashMap::from([(a, -1), (b, 1)]);
        let mut visit: BinaryHeap<RevId> = BinaryHeap::from([a, b]);
        let mut interesting = visit.len();
        let mut limit = WORKING_REV;

        while interesting > 0 {
            let Some(r) = visit.pop() else {
                break;
            };
            for p in parents_of(r) {
                let r_side = side[&r];
                match side.get(&p).copied() {
                    None => {
                        side.insert(p, r_side);
                        if r_side != 0 {
                            interesting += 1;
                        }
                        visit.push(p);
                    }
                    Some(p_side) if p_side != 0 && p_side != r_side => {
                        side.insert(p, 0);
                        interesting -= 1;
                    }
                    Some(_) => {}
                }
            }
            if side[&r] != 0 {
                limit = r;
                interesting -= 1;
            }
        }

        limit.min(a).min(b)
    }
}

impl std::fmt::Debug for Repo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repo")
            .field("commits", &self.commits.len())
            .finish()
    }
}

/// A handle to one commit, or to the uncommitted working snapshot
/// (`rev() == None`).
#[derive(Clone, Copy)]
pub struct Snapshot<'a> {
    repo: &'a Repo,
    rev: Option<RevId>,
}

impl PartialEq for Snapshot<'_> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.repo, other.repo) && self.rev == other.rev
    }
}

impl Eq for Snapshot<'_> {}

impl std::fmt::Debug for Snapshot<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Snapshot").field(&self.label()).finish()
    }
}

impl<'a> Snapshot<'a> {
    pub fn repo(&self) -> &'a Repo {
        self.repo
    }

    pub fn rev(&self) -> Option<RevId> {
        self.rev
    }

    pub fn is_working(&self) -> bool {
        self.rev.is_none()
    }

    /// The commit identity. For the working snapshot this is the identity of
    /// its first parent, the convention every consumer of "the local node"
    /// expects.
    pub fn node(&self) -> NodeId {
        match self.rev {
            Some(rev) => self.repo.commits[rev as usize].node.clone(),
            None => self
                .parents()
                .first()
                .map(|p| p.node())
                .unwrap_or_else(NodeId::null),
        }
    }

    /// Short human-readable form used in diagnostics; the working snapshot is
    /// suffixed with `+`.
    pub fn label(&self) -> String {
        match self.rev {
            Some(rev) => {
                let hex = self.repo.commits[rev as usize].node.hex();
                hex[..hex.len().min(12)].to_string()
            }
            None => {
                let mut label = self
                    .parents()
                    .first()
                    .map(|p| p.label())
                    .unwrap_or_else(|| "000000000000".to_string());
                label.push('+');
                label
            }
        }
    }

    pub fn manifest(&self) -> &'a Manifest {
        match self.rev {
            Some(rev) => &self.repo.commits[rev as usize].manifest,
            None => &self.repo.working.manifest,
        }
    }

    pub fn file_entry(&self, path: &RepoPath) -> Option<&'a ManifestEntry> {
        self.manifest().get(path)
    }

    pub fn contains(&self, path: &RepoPath) -> bool {
        self.manifest().contains(path)
    }

    pub fn parents(&self) -> Vec<Snapshot<'a>> {
        let parent_revs = match self.rev {
            Some(rev) => &self.repo.commits[rev as usize].parents,
            None => &self.repo.working.parents,
        };
        parent_revs.iter().map(|rev| self.repo.snapshot(*rev)).collect()
    }

    /// Paths changed relative to the first parent. Empty for the working
    /// snapshot; callers interested in pending edits use the status sets.
    pub fn changed_paths(&self) -> &'a [RepoPath] {
        match self.rev {
            Some(rev) => &self.repo.commits[rev as usize].files,
            None => &[],
        }
    }

    /// Resolves the working snapshot to its first parent, the way history
    /// walks treat uncommitted state.
    pub fn committed(&self) -> Option<Snapshot<'a>> {
        match self.rev {
            Some(_) => Some(*self),
            None => self.parents().first().copied(),
        }
    }

    pub fn is_ancestor_of(&self, other: &Snapshot<'_>) -> bool {
        match (self.rev, other.rev) {
            (Some(a), Some(b)) => self.repo.is_ancestor(a, b),
            (Some(a), None) => other
                .parents()
                .iter()
                .any(|p| self.repo.is_ancestor(a, p.rev.unwrap())),
            (None, _) => false,
        }
    }

    /// The preferred single common ancestor of `self` and `other`.
    pub fn ancestor(&self, other: &Snapshot<'a>) -> Option<Snapshot<'a>> {
        let a = self.committed()?.rev?;
        let b = other.committed()?.rev?;
        self.repo
            .greatest_common_ancestor(a, b)
            .map(|rev| self.repo.snapshot(rev))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryFileStore;

    fn empty_repo_with_chain(n: usize) -> Repo {
        let mut repo = Repo::new(Arc::new(MemoryFileStore::new()));
        for i in 0..n {
            let parents = if i == 0 { vec![] } else { vec![(i - 1) as RevId] };
            repo.add_commit(NodeId::from_bytes(&[i as u8 + 1; 20]), parents, Manifest::new(), vec![]);
        }
        repo
    }

    #[test]
    fn test_linear_ancestry() {
        let repo = empty_repo_with_chain(4);
        assert!(repo.is_ancestor(0, 3));
        assert!(repo.is_ancestor(2, 2));
        assert!(!repo.is_ancestor(3, 1));
        assert_eq!(repo.greatest_common_ancestor(2, 3), Some(2));
        assert_eq!(repo.revs_between(1, 3), vec![1, 2, 3]);
    }

    #[test]
    fn test_branchy_common_ancestors() {
        // 0 <- 1 <- 2
        //        \- 3
        let mut repo = empty_repo_with_chain(2);
        repo.add_commit(NodeId::from_bytes(&[10; 20]), vec![1], Manifest::new(), vec![]);
        repo.add_commit(NodeId::from_bytes(&[11; 20]), vec![1], Manifest::new(), vec![]);
        assert_eq!(repo.common_ancestor_heads(2, 3), vec![1]);
        assert_eq!(repo.greatest_common_ancestor(2, 3), Some(1));
    }

    #[test]
    fn test_criss_cross_has_two_ancestor_heads() {
        // 0, then 1 and 2 both children of 0, then 3 = merge(1,2) and
        // 4 = merge(1,2): the common ancestor heads of 3 and 4 are {1, 2}.
        let mut repo = empty_repo_with_chain(1);
        repo.add_commit(NodeId::from_bytes(&[21; 20]), vec![0], Manifest::new(), vec![]);
        repo.add_commit(NodeId::from_bytes(&[22; 20]), vec![0], Manifest::new(), vec![]);
        repo.add_commit(NodeId::from_bytes(&[23; 20]), vec![1, 2], Manifest::new(), vec![]);
        repo.add_commit(NodeId::from_bytes(&[24; 20]), vec![1, 2], Manifest::new(), vec![]);
        assert_eq!(repo.common_ancestor_heads(3, 4), vec![1, 2]);
    }

    #[test]
    fn test_find_limit_unrelated_branches() {
        // 0 <- 1 (side a), 0 <- 2 (side b): the limit is the fork point.
        let mut repo = empty_repo_with_chain(2);
        repo.add_commit(NodeId::from_bytes(&[30; 20]), vec![0], Manifest::new(), vec![]);
        let limit = repo.find_limit(Some(1), Some(2));
        assert!(limit <= 1);
    }

    #[test]
    fn test_working_snapshot() {
        let mut repo = empty_repo_with_chain(2);
        repo.working_mut().parents = vec![1];
        let wc = repo.working_snapshot();
        assert!(wc.is_working());
        assert_eq!(wc.rev(), None);
        assert_eq!(wc.node(), repo.snapshot(1).node());
        assert!(wc.label().ends_with('+'));
        assert!(repo.snapshot(0).is_ancestor_of(&wc));
    }
}
