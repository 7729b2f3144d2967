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

//! Copy and rename tracing across history.
//!
//! Renames are not always recorded explicitly, so the merge consults both the
//! per-file ancestry recorded in the content store and, optionally, filename
//! heuristics to correlate destination paths with their sources.

#![allow(missing_docs)]

use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::collections::HashSet;

use itertools::Itertools;
use tracing::debug;
use tracing::instrument;

use crate::manifest::Manifest;
use crate::matchers::EverythingMatcher;
use crate::matchers::Matcher;
use crate::repo::RevId;
use crate::repo::Snapshot;
use crate::repo::WORKING_REV;
use crate::repo_path::RepoPath;
use crate::settings::CopyTraceMode;
use crate::settings::MergeSettings;
use crate::store::FileRevId;
use crate::store::FileStore;
use crate::store::StoreResult;

/// Copy information for one side of a merge, relative to the merge base.
#[derive(Clone, Debug, Default)]
pub struct BranchCopies {
    /// Destination on this side to source: copies that the merge should
    /// honor when the other side touched the source.
    pub copy: HashMap<RepoPath, RepoPath>,
    /// File added on the *other* side to its new location under a directory
    /// this side renamed.
    pub move_with_dir: HashMap<RepoPath, RepoPath>,
    /// Directory renames performed on this side: source dir to destination
    /// dir, in internal form without trailing slashes.
    pub dir_move: HashMap<String, String>,
    /// Source renamed on this side but deleted on the other, to the rename
    /// destinations.
    pub rename_delete: HashMap<RepoPath, Vec<RepoPath>>,
}

/// Divergent renames: one source renamed to different destinations on the
/// two sides.
pub type Diverge = HashMap<RepoPath, Vec<RepoPath>>;

/// Chains two copy maps: entries of `b` whose source is itself a destination
/// in `a` are followed through.
fn chain(a: &HashMap<RepoPath, RepoPath>, b: &HashMap<RepoPath, RepoPath>) -> HashMap<RepoPath, RepoPath> {
    let mut t = a.clone();
    for (k, v) in b.iter().sorted() {
        let src = t.get(v).cloned().unwrap_or_else(|| v.clone());
        t.insert(k.clone(), src);
    }
    t
}

/// Filters out invalid copies after chaining: copies from files that did not
/// exist at the source end, criss-crossed copies whose endpoints exist at
/// both commits, and copies whose target was later removed.
fn filter_invalid(x: &Snapshot<'_>, y: &Snapshot<'_>, t: &mut HashMap<RepoPath, RepoPath>) {
    let mx = x.manifest();
    let my = y.manifest();
    t.retain(|k, v| mx.contains(v) && !(mx.contains(k) && my.contains(v)) && my.contains(k));
}

/// Pending copies recorded against the working snapshot, filtered to tracked
/// destinations.
fn working_copy_records(wc: &Snapshot<'_>, matcher: &dyn Matcher) -> HashMap<RepoPath, RepoPath> {
    wc.repo()
        .working()
        .copies
        .iter()
        .filter(|(dst, _)| wc.contains(dst) && (matcher.always() || matcher.matches(dst)))
        .map(|(dst, src)| (dst.clone(), src.clone()))
        .collect()
}

/// Walks a file revision's ancestry looking for the revision present in the
/// ancestor manifest `am` (or in `base_mf`), stopping at the first ancestor
/// introduced at or below `limit`.
fn trace_file(
    store: &dyn FileStore,
    start: &FileRevId,
    am: &Manifest,
    base_mf: Option<&Manifest>,
    limit: RevId,
) -> StoreResult<Option<RepoPath>> {
    let mut work = store.parents(&start.path, &start.node)?;
    let mut seen: HashSet<FileRevId> = work.iter().cloned().collect();
    while let Some(f) = work.pop() {
        if am.get(&f.path).map(|e| &e.node) == Some(&f.node) {
            return Ok(Some(f.path));
        }
        if let Some(mf) = base_mf {
            if mf.get(&f.path).map(|e| &e.node) == Some(&f.node) {
                return Ok(Some(f.path));
            }
        }
        if let Some(link_rev) = store.link_rev(&f.path, &f.node)? {
            if link_rev <= limit {
                return Ok(None);
            }
        }
        for parent in store.parents(&f.path, &f.node)? {
            if seen.insert(parent.clone()) {
                work.push(parent);
            }
        }
    }
    Ok(None)
}

/// Finds `{dst@b -> src@a}` where `a` is an ancestor of `b` and both are
/// committed snapshots.
fn committed_forward_copies(
    a: &Snapshot<'_>,
    b: &Snapshot<'_>,
    base: Option<&Snapshot<'_>>,
    matcher: &dyn Matcher,
) -> StoreResult<HashMap<RepoPath, RepoPath>> {
    if a.rev() == b.rev() {
        return Ok(HashMap::new());
    }
    let repo = a.repo();
    let limit = repo.find_limit(a.rev(), b.rev());
    debug!(limit, "copy search limit");
    let am = a.manifest();
    let base_mf = base.map(|base| base.manifest());

    // We only look for where new files came from; finding where old files
    // went would mean walking every file's history.
    let mut missing: Vec<&RepoPath> = b
        .manifest()
        .files_not_in(am)
        .filter(|path| matcher.always() || matcher.matches(path))
        .collect();
    // Comparing a commit against its sole parent is the common case, and the
    // changed-path list already bounds the candidates.
    let b_parents = b.parents();
    if b_parents.len() == 1 && b_parents[0].rev() == a.rev() {
        let changed: HashSet<&RepoPath> = b.changed_paths().iter().collect();
        missing.retain(|path| changed.contains(path));
    }
    missing.sort();

    let mut cm = HashMap::new();
    for path in missing {
        let entry = b.file_entry(path).expect("missing file must exist at b");
        let start = FileRevId::new(path.clone(), entry.node.clone());
        if let Some(source) = trace_file(repo.store().as_ref(), &start, am, base_mf, limit)? {
            debug!(dst = path.as_str(), src = source.as_str(), "traced rename");
            cm.insert(path.clone(), source);
        }
    }
    Ok(cm)
}

/// Finds `{dst@b -> src@a}` where `a` is an ancestor of `b`. `b` may be the
/// working snapshot, in which case pending copies are chained on top.
fn forward_copies(
    a: &Snapshot<'_>,
    b: &Snapshot<'_>,
    base: Option<&Snapshot<'_>>,
    matcher: &dyn Matcher,
) -> StoreResult<HashMap<RepoPath, RepoPath>> {
    if b.is_working() {
        let committed = match b.committed() {
            Some(p1) => committed_forward_copies(a, &p1, base, matcher)?,
            None => HashMap::new(),
        };
        Ok(chain(&committed, &working_copy_records(b, matcher)))
    } else {
        committed_forward_copies(a, b, base, matcher)
    }
}

/// Inverts the forward map from `b` down to its descendant `a`, dropping
/// sources that still exist at `a` (copies, not renames) and resolving 1:n
/// inversions deterministically (first destination in path order wins).
fn backward_renames(
    a: &Snapshot<'_>,
    b: &Snapshot<'_>,
    matcher: &dyn Matcher,
    settings: &MergeSettings,
) -> StoreResult<HashMap<RepoPath, RepoPath>> {
    if settings.copy_trace == CopyTraceMode::Off {
        return Ok(HashMap::new());
    }
    // The matcher must filter the inverted keys, so the forward walk runs
    // unfiltered.
    let forward = forward_copies(b, a, None, &EverythingMatcher)?;
    let mut result = HashMap::new();
    for (k, v) in forward.iter().sorted() {
        if !matcher.always() && !matcher.matches(v) {
            continue;
        }
        if a.contains(v) {
            continue;
        }
        result.entry(v.clone()).or_insert_with(|| k.clone());
    }
    Ok(result)
}

/// Finds the `{dst@y -> src@x}` copy mapping for a directed comparison of
/// two snapshots.
#[instrument(skip_all)]
pub fn path_copies(
    x: &Snapshot<'_>,
    y: &Snapshot<'_>,
    matcher: &dyn Matcher,
    settings: &MergeSettings,
) -> StoreResult<HashMap<RepoPath, RepoPath>> {
    if settings.copy_trace == CopyTraceMode::Off {
        return Ok(HashMap::new());
    }
    if x == y {
        return Ok(HashMap::new());
    }
    let ancestor = x.ancestor(y);
    let mut copies;
    if ancestor.as_ref() == x.committed().as_ref() && x.is_ancestor_of(y) {
        debug!("copy search mode: forward");
        if y.is_working() && y.parents().first() == Some(x) {
            // Short-circuit to the pending records for parent -> working.
            return Ok(working_copy_records(y, matcher));
        }
        copies = forward_copies(x, y, None, matcher)?;
    } else if y.is_ancestor_of(x) {
        debug!("copy search mode: backward");
        copies = backward_renames(x, y, matcher, settings)?;
    } else {
        debug!("copy search mode: combined");
        match ancestor {
            Some(a) => {
                let backward = backward_renames(x, &a, matcher, settings)?;
                let forward = forward_copies(&a, y, Some(x), matcher)?;
                copies = chain(&backward, &forward);
            }
            None => copies = HashMap::new(),
        }
    }
    filter_invalid(x, y, &mut copies);
    Ok(copies)
}

/// Walks two file histories back by introduction revision until their
/// generations coincide, to decide whether they share an origin.
fn related(store: &dyn FileStore, f1: &FileRevId, f2: &FileRevId) -> StoreResult<bool> {
    if f1 == f2 {
        return Ok(true);
    }

    struct Walker {
        heap: BinaryHeap<(RevId, usize)>,
        nodes: Vec<FileRevId>,
        seen: HashSet<FileRevId>,
    }
    impl Walker {
        fn push(&mut self, store: &dyn FileStore, f: FileRevId) -> StoreResult<()> {
            if !self.seen.insert(f.clone()) {
                return Ok(());
            }
            // Uncommitted content has no introduction revision; order it
            // before everything committed.
            let rev = store.link_rev(&f.path, &f.node)?.unwrap_or(WORKING_REV);
            self.heap.push((rev, self.nodes.len()));
            self.nodes.push(f);
            Ok(())
        }

        fn next(&mut self, store: &dyn FileStore) -> StoreResult<Option<(RevId, FileRevId)>> {
            let Some((rev, index)) = self.heap.pop() else {
                return Ok(None);
            };
            let f = self.nodes[index].clone();
            for parent in store.parents(&f.path, &f.node)? {
                self.push(store, parent)?;
            }
            Ok(Some((rev, f)))
        }
    }

    let mut walker1 = Walker {
        heap: BinaryHeap::new(),
        nodes: vec![],
        seen: HashSet::new(),
    };
    let mut walker2 = Walker {
        heap: BinaryHeap::new(),
        nodes: vec![],
        seen: HashSet::new(),
    };
    walker1.push(store, f1.clone())?;
    walker2.push(store, f2.clone())?;

    let Some(mut cur1) = walker1.next(store)? else {
        return Ok(false);
    };
    let Some(mut cur2) = walker2.next(store)? else {
        return Ok(false);
    };
    // Working content stands in for its first ancestor. The substitution is
    // only safe at the surface, so it applies to the starting revisions and
    // never deeper into the walk.
    if cur1.0 == WORKING_REV {
        match walker1.next(store)? {
            Some(next) => cur1 = next,
            None => return Ok(false),
        }
    }
    if cur2.0 == WORKING_REV {
        match walker2.next(store)? {
            Some(next) => cur2 = next,
            None => return Ok(false),
        }
    }
    loop {
        if cur1.0 > cur2.0 {
            match walker1.next(store)? {
                Some(next) => cur1 = next,
                None => return Ok(false),
            }
        } else if cur2.0 > cur1.0 {
            match walker2.next(store)? {
                Some(next) => cur2 = next,
                None => return Ok(false),
            }
        } else {
            // Both walks reached the same generation; they are related
            // exactly when they landed on the same file revision.
            return Ok(cur1.1 == cur2.1);
        }
    }
}

/// Cross-checks copies seen on one side only: offers them as merge
/// candidates when the other side modified the source, and records
/// rename+delete conflicts.
#[allow(clippy::too_many_arguments)]
fn check_single_side_copies(
    src: &RepoPath,
    dsts: &[RepoPath],
    m_this: &Manifest,
    m_other: &Manifest,
    m_base: &Manifest,
    c_other: &Snapshot<'_>,
    base: &Snapshot<'_>,
    copy: &mut HashMap<RepoPath, RepoPath>,
    rename_delete: &mut HashMap<RepoPath, Vec<RepoPath>>,
) -> StoreResult<()> {
    if !m_other.contains(src) {
        // Deleted on the other side.
        if !m_this.contains(src) {
            // Renamed here, deleted there.
            rename_delete.insert(src.clone(), dsts.to_vec());
        }
    } else if m_other.get(src).map(|e| &e.node) != m_base.get(src).map(|e| &e.node) {
        // Modified on the other side: only offer the copy if the two file
        // revisions actually share an origin.
        let f_other = FileRevId::new(
            src.clone(),
            c_other.file_entry(src).expect("src exists in other").node.clone(),
        );
        let f_base = FileRevId::new(
            src.clone(),
            base.file_entry(src).expect("src exists at base").node.clone(),
        );
        if !related(c_other.repo().store().as_ref(), &f_other, &f_base)? {
            return Ok(());
        }
        for dst in dsts {
            if !m_other.contains(dst) {
                // Destinations the other side also has fall out as regular
                // "both created" merges.
                copy.insert(dst.clone(), src.clone());
            }
        }
    }
    Ok(())
}

/// Detects whole-directory renames performed by one side, and relocates
/// files the other side added under a moved directory.
fn dir_renames(
    c_this: &Snapshot<'_>,
    c_other: &Snapshot<'_>,
    full_copy: &HashMap<RepoPath, RepoPath>,
    added_on_other: &[RepoPath],
    resolved_copies: &HashMap<RepoPath, RepoPath>,
) -> (HashMap<String, String>, HashMap<RepoPath, RepoPath>) {
    let d_this = c_this.manifest().dirs();
    let d_other = c_other.manifest().dirs();
    let mut invalid: HashSet<String> = HashSet::new();
    let mut dir_move: HashMap<String, String> = HashMap::new();

    // A directory rename requires every file to have moved to the same
    // destination directory, with nothing left behind on either side.
    for (dst, src) in full_copy.iter().sorted() {
        let dsrc = src.dir_name();
        let ddst = dst.dir_name();
        if invalid.contains(dsrc) {
            continue;
        }
        if d_this.contains(dsrc) && d_this.contains(ddst) {
            invalid.insert(dsrc.to_string());
        } else if d_other.contains(dsrc) && d_other.contains(ddst) {
            invalid.insert(dsrc.to_string());
        } else if let Some(existing) = dir_move.get(dsrc) {
            if existing != ddst {
                invalid.insert(dsrc.to_string());
            }
        } else {
            dir_move.insert(dsrc.to_string(), ddst.to_string());
        }
    }
    for dir in &invalid {
        dir_move.remove(dir);
    }
    for (src, dst) in &dir_move {
        debug!(src, dst, "discovered dir rename");
    }

    let mut move_with_dir = HashMap::new();
    if !dir_move.is_empty() {
        for path in added_on_other {
            if full_copy.contains_key(path) {
                continue;
            }
            for (src_dir, dst_dir) in dir_move.iter().sorted() {
                if path.starts_with_dir(src_dir) {
                    let rest = &path.as_str()[src_dir.len() + 1..];
                    let df = RepoPath::join_dir(dst_dir, rest);
                    if !resolved_copies.contains_key(&df) {
                        debug!(src = path.as_str(), dst = df.as_str(), "pending dir rename move");
                        move_with_dir.insert(path.clone(), df);
                    }
                    break;
                }
            }
        }
    }
    (dir_move, move_with_dir)
}

/// The exhaustive tracing algorithm: walk every file added since the merge
/// base on both sides, then infer directory renames.
fn full_copy_tracing(
    c1: &Snapshot<'_>,
    c2: &Snapshot<'_>,
    base: &Snapshot<'_>,
    settings: &MergeSettings,
) -> StoreResult<(BranchCopies, BranchCopies, Diverge)> {
    let m1 = c1.manifest();
    let m2 = c2.manifest();
    let mb = base.manifest();

    let copies1 = path_copies(base, c1, &EverythingMatcher, settings)?;
    let copies2 = path_copies(base, c2, &EverythingMatcher, settings)?;

    let mut inverse1: HashMap<&RepoPath, Vec<RepoPath>> = HashMap::new();
    let mut inverse2: HashMap<&RepoPath, Vec<RepoPath>> = HashMap::new();
    for (dst, src) in copies1.iter().sorted() {
        inverse1.entry(src).or_default().push(dst.clone());
    }
    for (dst, src) in copies2.iter().sorted() {
        inverse2.entry(src).or_default().push(dst.clone());
    }

    let mut copy1 = HashMap::new();
    let mut copy2 = HashMap::new();
    let mut diverge: Diverge = HashMap::new();
    let mut rename_delete1 = HashMap::new();
    let mut rename_delete2 = HashMap::new();

    let all_sources: Vec<&RepoPath> = inverse1
        .keys()
        .chain(inverse2.keys())
        .copied()
        .unique()
        .sorted()
        .collect();
    for src in all_sources {
        let dsts1 = inverse1.get(src);
        let dsts2 = inverse2.get(src);
        match (dsts1, dsts2) {
            (Some(dsts1), Some(dsts2)) => {
                let set1: HashSet<&RepoPath> = dsts1.iter().collect();
                let set2: HashSet<&RepoPath> = dsts2.iter().collect();
                if !m1.contains(src) && !m2.contains(src) {
                    // Renamed on both sides. Overlapping destinations are
                    // consistent; disjoint ones have diverged.
                    if set1.is_disjoint(&set2) {
                        diverge.insert(
                            src.clone(),
                            set1.union(&set2).map(|dst| (*dst).clone()).sorted().collect(),
                        );
                    } else {
                        for dst in set1.intersection(&set2) {
                            copy1.insert((*dst).clone(), src.clone());
                            copy2.insert((*dst).clone(), src.clone());
                        }
                    }
                } else if m1.contains(src) && m2.contains(src) {
                    // Copied on both sides.
                    for dst in set1.intersection(&set2) {
                        copy1.insert((*dst).clone(), src.clone());
                        copy2.insert((*dst).clone(), src.clone());
                    }
                }
                // Renamed on one side and copied on the other is not
                // handled.
            }
            (Some(dsts1), None) => {
                check_single_side_copies(
                    src,
                    dsts1,
                    m1,
                    m2,
                    mb,
                    c2,
                    base,
                    &mut copy1,
                    &mut rename_delete1,
                )?;
            }
            (None, Some(dsts2)) => {
                check_single_side_copies(
                    src,
                    dsts2,
                    m2,
                    m1,
                    mb,
                    c1,
                    base,
                    &mut copy2,
                    &mut rename_delete2,
                )?;
            }
            (None, None) => unreachable!("source came from one of the inverses"),
        }
    }

    let added_in_m1: HashSet<&RepoPath> = m1.files_not_in(mb).collect();
    let added_in_m2: HashSet<&RepoPath> = m2.files_not_in(mb).collect();
    let u1: Vec<RepoPath> = added_in_m1
        .difference(&added_in_m2)
        .map(|path| (*path).clone())
        .sorted()
        .collect();
    let u2: Vec<RepoPath> = added_in_m2
        .difference(&added_in_m1)
        .map(|path| (*path).clone())
        .sorted()
        .collect();
    if !u1.is_empty() {
        debug!(files = ?u1, "unmatched files on local side");
    }
    if !u2.is_empty() {
        debug!(files = ?u2, "unmatched files on other side");
    }

    let mut resolved: HashMap<RepoPath, RepoPath> = copy1.clone();
    resolved.extend(copy2.clone());
    let (dir_move1, move_with_dir2) = dir_renames(c1, c2, &copies1, &u2, &resolved);
    let (dir_move2, move_with_dir1) = dir_renames(c2, c1, &copies2, &u1, &resolved);

    Ok((
        BranchCopies {
            copy: copy1,
            move_with_dir: move_with_dir1,
            dir_move: dir_move1,
            rename_delete: rename_delete1,
        },
        BranchCopies {
            copy: copy2,
            move_with_dir: move_with_dir2,
            dir_move: dir_move2,
            rename_delete: rename_delete2,
        },
        diverge,
    ))
}

/// Fast copy tracing using filename heuristics.
///
/// Assumes renames either stay within a directory (same directory, new name)
/// or move between directories keeping the file name. Works only when the
/// path from the base to `c2` is a single merge-free line; anything else
/// falls back to the full trace.
fn heuristics_copy_tracing(
    c1: &Snapshot<'_>,
    c2: &Snapshot<'_>,
    base: &Snapshot<'_>,
    settings: &MergeSettings,
) -> StoreResult<(BranchCopies, BranchCopies, Diverge)> {
    let repo = c1.repo();
    let c1 = c1.committed().unwrap_or(*c1);
    let c2 = c2.committed().unwrap_or(*c2);
    let (Some(base_rev), Some(c2_rev)) = (base.rev(), c2.rev()) else {
        return full_copy_tracing(&c1, &c2, base, settings);
    };

    if repo.revs_between(base_rev, c2_rev).is_empty() {
        debug!("switching to full copy tracing: base is not an ancestor of the other side");
        return full_copy_tracing(&c1, &c2, base, settings);
    }

    let mut changed_files: HashSet<RepoPath> = HashSet::new();
    let mut ctx = c2;
    while ctx != *base {
        let parents = ctx.parents();
        if parents.len() == 2 {
            debug!("switching to full copy tracing: merge commit on the source branch");
            return full_copy_tracing(&c1, &c2, base, settings);
        }
        changed_files.extend(ctx.changed_paths().iter().cloned());
        match parents.into_iter().next() {
            Some(parent) => ctx = parent,
            None => break,
        }
    }

    let m1 = c1.manifest();
    let mut copies = HashMap::new();
    for (dst, src) in forward_copies(base, &c2, None, &EverythingMatcher)? {
        if m1.contains(&src) {
            copies.insert(dst, src);
        }
    }

    // A file is "missing" if it is absent from the destination but present at
    // the base and at the source: absent-from-base excludes additions,
    // present-at-source excludes removals.
    let missing_files: Vec<&RepoPath> = changed_files
        .iter()
        .filter(|f| !m1.contains(f) && base.contains(f) && c2.contains(f))
        .sorted()
        .collect();

    if !missing_files.is_empty() {
        let mut by_basename: HashMap<&str, Vec<&RepoPath>> = HashMap::new();
        let mut by_dirname: HashMap<&str, Vec<&RepoPath>> = HashMap::new();
        for f in m1.files_not_in(base.manifest()) {
            by_basename.entry(f.base_name()).or_default().push(f);
            by_dirname.entry(f.dir_name()).or_default().push(f);
        }

        for f in missing_files {
            let same_basename = by_basename.get(f.base_name());
            let same_dirname = by_dirname.get(f.dir_name());
            let candidates: Vec<&RepoPath> = same_basename
                .into_iter()
                .flatten()
                .chain(same_dirname.into_iter().flatten())
                .copied()
                .unique()
                .collect();
            if candidates.len() > settings.move_candidate_limit {
                debug!(
                    file = f.as_str(),
                    candidates = candidates.len(),
                    "skipping copy tracing: more candidates than the limit"
                );
                continue;
            }
            let f2 = FileRevId::new(
                (*f).clone(),
                c2.file_entry(f).expect("missing file exists at c2").node.clone(),
            );
            for candidate in candidates {
                let f1 = FileRevId::new(
                    candidate.clone(),
                    c1.file_entry(candidate)
                        .expect("candidate exists at c1")
                        .node
                        .clone(),
                );
                if related(repo.store().as_ref(), &f1, &f2)? {
                    // A few related candidates all get the change merged in,
                    // matching the full algorithm's behavior.
                    copies.insert(candidate.clone(), (*f).clone());
                }
            }
        }
    }

    Ok((
        BranchCopies {
            copy: copies,
            ..Default::default()
        },
        BranchCopies::default(),
        Diverge::new(),
    ))
}

/// Whether the history between the base and the local side is short enough
/// that the full trace is affordable anyway.
fn is_full_copy_traceable(c1: &Snapshot<'_>, base: &Snapshot<'_>, settings: &MergeSettings) -> bool {
    let Some(c1) = c1.committed() else {
        return false;
    };
    match (base.rev(), c1.rev()) {
        (Some(base_rev), Some(c1_rev)) => {
            let commits = c1.repo().revs_between(base_rev, c1_rev).len();
            commits < settings.source_commit_limit
        }
        _ => false,
    }
}

/// Finds moves and copies between `c1` (local) and `c2` (other) relevant for
/// merging with the given base.
///
/// Returns the per-side copy information and the divergent renames.
#[instrument(skip_all)]
pub fn merge_copies(
    c1: &Snapshot<'_>,
    c2: &Snapshot<'_>,
    base: &Snapshot<'_>,
    settings: &MergeSettings,
) -> StoreResult<(BranchCopies, BranchCopies, Diverge)> {
    if c1 == c2 {
        return Ok((BranchCopies::default(), BranchCopies::default(), Diverge::new()));
    }

    // Updating from a parent to the working snapshot only needs the pending
    // records.
    if c2.is_working() && c2.parents().first() == Some(c1) {
        return Ok((
            BranchCopies {
                copy: working_copy_records(c2, &EverythingMatcher),
                ..Default::default()
            },
            BranchCopies::default(),
            Diverge::new(),
        ));
    }

    match settings.copy_trace {
        CopyTraceMode::Off => {
            Ok((BranchCopies::default(), BranchCopies::default(), Diverge::new()))
        }
        CopyTraceMode::Heuristics => {
            // Short mutable histories get the full algorithm anyway: fast
            // enough, and it also covers what the heuristics would miss.
            if is_full_copy_traceable(c1, base, settings) {
                full_copy_tracing(c1, c2, base, settings)
            } else {
                heuristics_copy_tracing(c1, c2, base, settings)
            }
        }
        CopyTraceMode::Full => full_copy_tracing(c1, c2, base, settings),
    }
}

/// Reproduces the copies between `from_rev` and `rev` in the working copy's
/// tracker after a graft. Copies that already occurred between `from_rev`
/// and `skip_rev` are not duplicated.
pub fn duplicate_copies(
    repo: &crate::repo::Repo,
    tracker: &mut dyn crate::working_copy::WorkingCopyTracker,
    rev: RevId,
    from_rev: RevId,
    skip_rev: Option<RevId>,
    settings: &MergeSettings,
) -> StoreResult<()> {
    let from = repo.snapshot(from_rev);
    let exclude = match skip_rev {
        Some(skip_rev) if settings.copy_trace != CopyTraceMode::Off => {
            path_copies(&from, &repo.snapshot(skip_rev), &EverythingMatcher, settings)?
        }
        _ => HashMap::new(),
    };
    for (dst, src) in path_copies(&from, &repo.snapshot(rev), &EverythingMatcher, settings)?
        .into_iter()
        .sorted()
    {
        if exclude.contains_key(&dst) {
            continue;
        }
        if tracker.is_tracked(&dst) {
            tracker.copy(&src, &dst);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use maplit::hashmap;

    use super::*;

    fn repo_path(value: &str) -> RepoPath {
        RepoPath::from_internal_string(value)
    }

    #[test]
    fn test_chain_follows_through() {
        let a = hashmap! { repo_path("mid") => repo_path("src") };
        let b = hashmap! { repo_path("dst") => repo_path("mid") };
        let chained = chain(&a, &b);
        assert_eq!(chained[&repo_path("dst")], repo_path("src"));
        assert_eq!(chained[&repo_path("mid")], repo_path("src"));
    }

    #[test]
    fn test_chain_keeps_unrelated() {
        let a = hashmap! { repo_path("x") => repo_path("y") };
        let b = hashmap! { repo_path("p") => repo_path("q") };
        let chained = chain(&a, &b);
        assert_eq!(chained[&repo_path("p")], repo_path("q"));
    }

    // The interesting end-to-end behavior is covered by the copy-tracing
    // integration tests; `dag_walk` and `related` get exercised there with
    // real file ancestry.
}
