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

//! The three-way manifest merge: computing the per-path action plan.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::collections::HashSet;

use itertools::Itertools;
use thiserror::Error;
use tracing::debug;
use tracing::instrument;

use crate::copies;
use crate::copies::BranchCopies;
use crate::copies::Diverge;
use crate::manifest::FileFlag;
use crate::manifest::Manifest;
use crate::matchers::EverythingMatcher;
use crate::matchers::FilesMatcher;
use crate::matchers::IntersectionMatcher;
use crate::matchers::Matcher;
use crate::mergestate::ConflictOrigin;
use crate::repo::Snapshot;
use crate::repo_path::RepoPath;
use crate::settings::MergeSettings;
use crate::settings::UnknownFilePolicy;
use crate::store::NodeId;
use crate::store::StoreError;
use crate::working_copy::WorkingCopy;
use crate::working_copy::WorkingCopyTracker;

/// Arguments shared by the merge-style actions: the local and other input
/// paths, the ancestor path, whether the local input is consumed by a move,
/// and the ancestor commit the file contexts resolve against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeArgs {
    pub local_path: Option<RepoPath>,
    pub other_path: Option<RepoPath>,
    pub ancestor_path: Option<RepoPath>,
    pub move_local: bool,
    pub ancestor_commit: NodeId,
}

/// One per-path unit of work in the action plan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Nothing to do; the local side already has the right content.
    Keep,
    /// Fetch the other side's content, optionally backing up what is there.
    Get { flags: FileFlag, backup: bool },
    /// `Get`, plus record in the merge state that the other side won.
    GetOtherAndStore { flags: FileFlag },
    /// Track again (bookkeeping only).
    Add,
    /// Track again and mark modified (bookkeeping only).
    AddModified,
    /// Remove from the working tree.
    Remove,
    /// Stop tracking (bookkeeping only).
    Forget,
    /// Only the flags change; content stays local.
    Exec { flags: FileFlag },
    /// A genuine three-way file merge.
    Merge(MergeArgs),
    /// Changed locally, deleted remotely; surfaced as a merge conflict.
    ChangedDeleted(MergeArgs),
    /// Deleted locally, changed remotely; surfaced as a merge conflict.
    DeletedChanged(MergeArgs),
    /// New on the other side.
    Created { flags: FileFlag },
    /// New on the other side under `force`: get or merge depending on the
    /// untracked file in the way.
    CreatedMerge { flags: FileFlag, ancestor_commit: NodeId },
    /// Fetch the other side's `from` into this path: a local directory
    /// rename relocated the new remote file.
    LocalDirRenameGet { from: RepoPath, flags: FileFlag },
    /// Move the local `from` here: a remote directory rename relocated it.
    DirRenameMoveLocal { from: RepoPath, flags: FileFlag },
    /// This slot is a file-vs-directory conflict; the conflicting file was
    /// renamed to `rename_to`.
    PathConflict {
        rename_to: RepoPath,
        origin: ConflictOrigin,
    },
    /// Move the conflicting file `from` into this (safe) path.
    PathConflictResolve { from: RepoPath, orig_from: RepoPath },
}

/// Discriminant of [`Action`], used for grouping and bidding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ActionKind {
    Keep,
    Get,
    GetOtherAndStore,
    Add,
    AddModified,
    Remove,
    Forget,
    Exec,
    Merge,
    ChangedDeleted,
    DeletedChanged,
    Created,
    CreatedMerge,
    LocalDirRenameGet,
    DirRenameMoveLocal,
    PathConflict,
    PathConflictResolve,
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Keep => ActionKind::Keep,
            Action::Get { .. } => ActionKind::Get,
            Action::GetOtherAndStore { .. } => ActionKind::GetOtherAndStore,
            Action::Add => ActionKind::Add,
            Action::AddModified => ActionKind::AddModified,
            Action::Remove => ActionKind::Remove,
            Action::Forget => ActionKind::Forget,
            Action::Exec { .. } => ActionKind::Exec,
            Action::Merge(_) => ActionKind::Merge,
            Action::ChangedDeleted(_) => ActionKind::ChangedDeleted,
            Action::DeletedChanged(_) => ActionKind::DeletedChanged,
            Action::Created { .. } => ActionKind::Created,
            Action::CreatedMerge { .. } => ActionKind::CreatedMerge,
            Action::LocalDirRenameGet { .. } => ActionKind::LocalDirRenameGet,
            Action::DirRenameMoveLocal { .. } => ActionKind::DirRenameMoveLocal,
            Action::PathConflict { .. } => ActionKind::PathConflict,
            Action::PathConflictResolve { .. } => ActionKind::PathConflictResolve,
        }
    }
}

/// An action plus the human-readable reason it was chosen.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedAction {
    pub action: Action,
    pub reason: String,
}

impl PlannedAction {
    fn new(action: Action, reason: impl Into<String>) -> Self {
        PlannedAction {
            action,
            reason: reason.into(),
        }
    }
}

pub type ActionMap = BTreeMap<RepoPath, PlannedAction>;
pub type RenameDelete = std::collections::HashMap<RepoPath, Vec<RepoPath>>;

/// Output of one manifest merge run.
#[derive(Debug, Default)]
pub struct ManifestMergeResult {
    pub actions: ActionMap,
    pub diverge: Diverge,
    pub rename_delete: RenameDelete,
}

/// Output of [`calculate_updates`]: the resolved plan plus collected
/// user-facing notes.
#[derive(Debug, Default)]
pub struct CalculatedUpdates {
    pub actions: ActionMap,
    pub diverge: Diverge,
    pub rename_delete: RenameDelete,
    pub warnings: Vec<String>,
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("Untracked files in working directory differ from files in requested revision")]
    UntrackedConflicts { warnings: Vec<String> },
    #[error("Case-folding collision between {path1} and {path2}", path1 = .path1.as_str(), path2 = .path2)]
    CaseCollision { path1: RepoPath, path2: String },
    #[error("Destination manifest contains path conflicts")]
    InvalidRemoteManifest { paths: Vec<RepoPath> },
    #[error("Merge affects file '{path}' outside the active narrow scope", path = .path.as_str())]
    OutsideNarrowScope { path: RepoPath },
    #[error("Conflict in file '{path}' is outside the active narrow scope", path = .path.as_str())]
    ConflictOutsideNarrowScope { path: RepoPath },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Path(#[from] crate::file_util::PathError),
}

/// Picks a name like `path~tag` (or `path~tag~N`) not taken by the working
/// manifest or the plan.
fn safe_name(path: &RepoPath, tag: &str, wctx: &Snapshot<'_>, taken: &HashSet<&RepoPath>) -> RepoPath {
    let candidate = RepoPath::from_internal_string(format!("{}~{}", path.as_str(), tag));
    if !wctx.contains(&candidate) && !taken.contains(&candidate) {
        return candidate;
    }
    for n in 1.. {
        let candidate = RepoPath::from_internal_string(format!("{}~{}~{}", path.as_str(), tag, n));
        if !wctx.contains(&candidate) && !taken.contains(&candidate) {
            return candidate;
        }
    }
    unreachable!()
}

/// The three-way diff of the local and other manifests against one ancestor,
/// rendered as an action plan.
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all)]
pub fn manifest_merge(
    wctx: &Snapshot<'_>,
    p2: &Snapshot<'_>,
    pa: &Snapshot<'_>,
    branch_merge: bool,
    force: bool,
    matcher: Option<&dyn Matcher>,
    accept_remote: bool,
    follow_copies: bool,
    force_full_diff: bool,
    narrow: Option<&dyn Matcher>,
    settings: &MergeSettings,
) -> Result<ManifestMergeResult, MergeError> {
    let matcher = matcher.filter(|m| !m.always());

    let (branch_copies1, branch_copies2, diverge) = if follow_copies {
        copies::merge_copies(wctx, p2, pa, settings)?
    } else {
        (BranchCopies::default(), BranchCopies::default(), Diverge::new())
    };

    debug!(
        branch_merge,
        force,
        partial = matcher.is_some(),
        ancestor = %pa.label(),
        local = %wctx.label(),
        remote = %p2.label(),
        "resolving manifests"
    );

    let m1 = wctx.manifest();
    let m2 = p2.manifest();
    let ma = pa.manifest();

    let copied1: HashSet<&RepoPath> = branch_copies1
        .copy
        .values()
        .chain(branch_copies1.move_with_dir.values())
        .collect();
    let copied2: HashSet<&RepoPath> = branch_copies2
        .copy
        .values()
        .chain(branch_copies2.move_with_dir.values())
        .collect();

    // Restrict the full m1-vs-m2 diff to the files the merge can actually
    // affect. Skipped when the ancestor is one of the endpoints (the diff
    // degenerates) and during bid merge, which needs the full diff.
    let mut relevant_matcher: Option<FilesMatcher> = None;
    let pa_is_endpoint = pa == wctx
        || pa.rev() == p2.rev()
        || wctx.parents().iter().any(|parent| parent.rev() == pa.rev());
    if !pa_is_endpoint && !force_full_diff {
        let mut relevant: HashSet<RepoPath> =
            ma.diff(m2, &EverythingMatcher).into_keys().collect();
        for (copy_key, copy_value) in &branch_copies1.copy {
            if relevant.contains(copy_value) {
                relevant.insert(copy_key.clone());
            }
        }
        relevant.extend(branch_copies1.move_with_dir.keys().cloned());
        relevant_matcher = Some(FilesMatcher::new(relevant));
    }
    let diff_matcher: Box<dyn Matcher + '_> = match (matcher, relevant_matcher) {
        (None, None) => Box::new(EverythingMatcher),
        (Some(m), None) => Box::new(m),
        (None, Some(f)) => Box::new(f),
        (Some(m), Some(f)) => Box::new(IntersectionMatcher::new(m, f)),
    };

    let diff = m1.diff(m2, &diff_matcher);

    let mut actions: ActionMap = BTreeMap::new();
    for (f, (e1, e2)) in &diff {
        match (e1, e2) {
            (Some(e1), Some(e2)) => {
                // The file exists on both sides.
                if !ma.contains(f) {
                    let fa = branch_copies1
                        .copy
                        .get(f)
                        .or_else(|| branch_copies2.copy.get(f));
                    let planned = match fa {
                        Some(fa) => PlannedAction::new(
                            Action::Merge(MergeArgs {
                                local_path: Some(f.clone()),
                                other_path: Some(f.clone()),
                                ancestor_path: Some(fa.clone()),
                                move_local: false,
                                ancestor_commit: pa.node(),
                            }),
                            format!("both renamed from {}", fa.as_str()),
                        ),
                        None => PlannedAction::new(
                            Action::Merge(MergeArgs {
                                local_path: Some(f.clone()),
                                other_path: Some(f.clone()),
                                ancestor_path: None,
                                move_local: false,
                                ancestor_commit: pa.node(),
                            }),
                            "both created",
                        ),
                    };
                    actions.insert(f.clone(), planned);
                } else {
                    let a = ma.get(f).expect("checked above");
                    let no_symlink =
                        ![e1.flags, e2.flags, a.flags].iter().any(|fl| fl.is_symlink());
                    let planned = if e2.node == a.node && e2.flags == a.flags {
                        PlannedAction::new(Action::Keep, "remote unchanged")
                    } else if e1.node == a.node && e1.flags == a.flags {
                        // Local unchanged: use the remote side.
                        if e1.node == e2.node {
                            PlannedAction::new(
                                Action::Exec { flags: e2.flags },
                                "update permissions",
                            )
                        } else if branch_merge {
                            PlannedAction::new(
                                Action::GetOtherAndStore { flags: e2.flags },
                                "remote is newer",
                            )
                        } else {
                            PlannedAction::new(
                                Action::Get {
                                    flags: e2.flags,
                                    backup: false,
                                },
                                "remote is newer",
                            )
                        }
                    } else if no_symlink && e2.node == a.node {
                        // The remote side only flipped the execute bit.
                        PlannedAction::new(Action::Exec { flags: e2.flags }, "update permissions")
                    } else if no_symlink && e1.node == a.node {
                        // The local side only flipped the execute bit; fetch
                        // the remote content under the local flags.
                        if branch_merge {
                            PlannedAction::new(
                                Action::GetOtherAndStore { flags: e1.flags },
                                "remote is newer",
                            )
                        } else {
                            PlannedAction::new(
                                Action::Get {
                                    flags: e1.flags,
                                    backup: false,
                                },
                                "remote is newer",
                            )
                        }
                    } else {
                        PlannedAction::new(
                            Action::Merge(MergeArgs {
                                local_path: Some(f.clone()),
                                other_path: Some(f.clone()),
                                ancestor_path: Some(f.clone()),
                                move_local: false,
                                ancestor_commit: pa.node(),
                            }),
                            "versions differ",
                        )
                    };
                    actions.insert(f.clone(), planned);
                }
            }
            (Some(e1), None) => {
                // The file exists only on the local side.
                if copied2.contains(f) {
                    // The other side's copy handling covers it.
                } else if let Some(f2) = branch_copies1.move_with_dir.get(f) {
                    if m2.contains(f2) {
                        actions.insert(
                            f2.clone(),
                            PlannedAction::new(
                                Action::Merge(MergeArgs {
                                    local_path: Some(f.clone()),
                                    other_path: Some(f2.clone()),
                                    ancestor_path: None,
                                    move_local: true,
                                    ancestor_commit: pa.node(),
                                }),
                                "remote directory rename, both created",
                            ),
                        );
                    } else {
                        actions.insert(
                            f2.clone(),
                            PlannedAction::new(
                                Action::DirRenameMoveLocal {
                                    from: f.clone(),
                                    flags: e1.flags,
                                },
                                format!("remote directory rename - move from {}", f.as_str()),
                            ),
                        );
                    }
                } else if let Some(f2) = branch_copies1.copy.get(f) {
                    actions.insert(
                        f.clone(),
                        PlannedAction::new(
                            Action::Merge(MergeArgs {
                                local_path: Some(f.clone()),
                                other_path: Some(f2.clone()),
                                ancestor_path: Some(f2.clone()),
                                move_local: false,
                                ancestor_commit: pa.node(),
                            }),
                            format!("local copied/moved from {}", f2.as_str()),
                        ),
                    );
                } else if let Some(a) = ma.get(f) {
                    let planned = if e1.node != a.node {
                        if accept_remote {
                            PlannedAction::new(Action::Remove, "remote delete")
                        } else {
                            PlannedAction::new(
                                Action::ChangedDeleted(MergeArgs {
                                    local_path: Some(f.clone()),
                                    other_path: None,
                                    ancestor_path: Some(f.clone()),
                                    move_local: false,
                                    ancestor_commit: pa.node(),
                                }),
                                "prompt changed/deleted",
                            )
                        }
                    } else if e1.node == NodeId::working_added() {
                        // Locally added; forget it rather than delete it.
                        PlannedAction::new(Action::Forget, "remote deleted")
                    } else {
                        PlannedAction::new(Action::Remove, "other deleted")
                    };
                    actions.insert(f.clone(), planned);
                }
            }
            (None, Some(e2)) => {
                // The file exists only on the remote side.
                if copied1.contains(f) {
                    // The local side's copy handling covers it.
                } else if let Some(f2) = branch_copies2.move_with_dir.get(f) {
                    if m1.contains(f2) {
                        actions.insert(
                            f2.clone(),
                            PlannedAction::new(
                                Action::Merge(MergeArgs {
                                    local_path: Some(f2.clone()),
                                    other_path: Some(f.clone()),
                                    ancestor_path: None,
                                    move_local: false,
                                    ancestor_commit: pa.node(),
                                }),
                                "local directory rename, both created",
                            ),
                        );
                    } else {
                        actions.insert(
                            f2.clone(),
                            PlannedAction::new(
                                Action::LocalDirRenameGet {
                                    from: f.clone(),
                                    flags: e2.flags,
                                },
                                format!("local directory rename - get from {}", f.as_str()),
                            ),
                        );
                    }
                } else if let Some(f2) = branch_copies2.copy.get(f) {
                    let planned = if m2.contains(f2) {
                        PlannedAction::new(
                            Action::Merge(MergeArgs {
                                local_path: Some(f2.clone()),
                                other_path: Some(f.clone()),
                                ancestor_path: Some(f2.clone()),
                                move_local: false,
                                ancestor_commit: pa.node(),
                            }),
                            format!("remote copied from {}", f2.as_str()),
                        )
                    } else {
                        PlannedAction::new(
                            Action::Merge(MergeArgs {
                                local_path: Some(f2.clone()),
                                other_path: Some(f.clone()),
                                ancestor_path: Some(f2.clone()),
                                move_local: true,
                                ancestor_commit: pa.node(),
                            }),
                            format!("remote moved from {}", f2.as_str()),
                        )
                    };
                    actions.insert(f.clone(), planned);
                } else if !ma.contains(f) {
                    // Local unknown, remote created. Checking whether an
                    // untracked file differs is expensive, so under force a
                    // dedicated action defers that decision.
                    let planned = if !force || !branch_merge {
                        PlannedAction::new(Action::Created { flags: e2.flags }, "remote created")
                    } else {
                        PlannedAction::new(
                            Action::CreatedMerge {
                                flags: e2.flags,
                                ancestor_commit: pa.node(),
                            },
                            "remote created, get or merge",
                        )
                    };
                    actions.insert(f.clone(), planned);
                } else if ma.get(f).map(|a| &a.node) != Some(&e2.node) {
                    let mut dir_rename_target = None;
                    for (src_dir, dst_dir) in branch_copies1.dir_move.iter().sorted() {
                        if f.starts_with_dir(src_dir) {
                            // A new file appeared in a directory this side
                            // moved.
                            let rest = &f.as_str()[src_dir.len() + 1..];
                            dir_rename_target = Some(RepoPath::join_dir(dst_dir, rest));
                            break;
                        }
                    }
                    match dir_rename_target {
                        Some(df) if m1.contains(&df) => {
                            actions.insert(
                                df.clone(),
                                PlannedAction::new(
                                    Action::Merge(MergeArgs {
                                        local_path: Some(df.clone()),
                                        other_path: Some(f.clone()),
                                        ancestor_path: Some(f.clone()),
                                        move_local: false,
                                        ancestor_commit: pa.node(),
                                    }),
                                    format!(
                                        "local directory rename - respect move from {}",
                                        f.as_str()
                                    ),
                                ),
                            );
                        }
                        _ => {
                            if accept_remote {
                                actions.insert(
                                    f.clone(),
                                    PlannedAction::new(
                                        Action::Created { flags: e2.flags },
                                        "remote recreating",
                                    ),
                                );
                            } else {
                                actions.insert(
                                    f.clone(),
                                    PlannedAction::new(
                                        Action::DeletedChanged(MergeArgs {
                                            local_path: None,
                                            other_path: Some(f.clone()),
                                            ancestor_path: Some(f.clone()),
                                            move_local: false,
                                            ancestor_commit: pa.node(),
                                        }),
                                        "prompt deleted/changed",
                                    ),
                                );
                            }
                        }
                    }
                }
            }
            (None, None) => unreachable!("diff never reports equal entries"),
        }
    }

    if settings.check_path_conflicts {
        check_path_conflicts(wctx, p2, &mut actions)?;
    }

    if let Some(narrow) = narrow {
        if !narrow.always() {
            filter_narrow_actions(narrow, branch_merge, &mut actions)?;
        }
    }

    let mut rename_delete = branch_copies1.rename_delete;
    rename_delete.extend(branch_copies2.rename_delete);

    Ok(ManifestMergeResult {
        actions,
        diverge,
        rename_delete,
    })
}

/// Checks whether any planned action introduces a file-vs-directory
/// conflict, rewriting the plan to route conflicting files through safe
/// alternate names. An internally-inconsistent remote manifest (a path both
/// file and directory) aborts the merge.
fn check_path_conflicts(
    wctx: &Snapshot<'_>,
    mctx: &Snapshot<'_>,
    actions: &mut ActionMap,
) -> Result<(), MergeError> {
    let mf = wctx.manifest();

    // Local files that conflict with a remote directory.
    let mut local_conflicts: HashSet<RepoPath> = HashSet::new();
    // Directories (named by the remote file aliasing them) that may still
    // hold files after the merge.
    let mut remote_conflicts: Vec<RepoPath> = vec![];
    // Paths that are both a file and a directory in the remote manifest.
    let mut invalid_conflicts: HashSet<RepoPath> = HashSet::new();
    let mut created_file_dirs: HashSet<String> = HashSet::new();
    let mut deleted_files: HashSet<RepoPath> = HashSet::new();

    let creates_file = |kind: ActionKind| {
        matches!(
            kind,
            ActionKind::Created
                | ActionKind::DeletedChanged
                | ActionKind::Merge
                | ActionKind::CreatedMerge
        )
    };

    for (f, planned) in actions.iter() {
        let kind = planned.action.kind();
        if creates_file(kind) {
            created_file_dirs.extend(f.parent_dirs().map(|d| d.to_string()));
            if mf.has_dir(f.as_str()) {
                // The new file aliases a local directory. Tolerable only if
                // every file in that directory is going away.
                remote_conflicts.push(f.clone());
            }
        }
        match &planned.action {
            Action::Remove => {
                deleted_files.insert(f.clone());
            }
            Action::Merge(args) if args.move_local => {
                if let Some(local_path) = &args.local_path {
                    deleted_files.insert(local_path.clone());
                }
            }
            Action::DirRenameMoveLocal { from, .. } => {
                deleted_files.insert(from.clone());
            }
            _ => {}
        }
    }

    for dir in created_file_dirs.iter().sorted() {
        let as_path = RepoPath::from_internal_string(dir.clone());
        if mf.contains(&as_path) {
            if mctx.contains(&as_path) {
                // A new file sits inside a directory that aliases both a
                // local and a remote file: the remote manifest is broken.
                invalid_conflicts.insert(as_path.clone());
            } else {
                local_conflicts.insert(as_path.clone());
            }
        }
        if let Some(planned) = actions.get(&as_path) {
            if creates_file(planned.action.kind()) {
                invalid_conflicts.insert(as_path.clone());
            }
        }
    }

    // Rename local conflicting files out of the way.
    let local_tag = wctx.label().trim_end_matches('+').to_string();
    for p in local_conflicts.iter().sorted() {
        if deleted_files.contains(p) {
            continue;
        }
        let taken: HashSet<&RepoPath> = actions.keys().collect();
        let p_new = safe_name(p, &local_tag, wctx, &taken);
        let p_orig = wctx
            .repo()
            .working()
            .copies
            .get(p)
            .cloned()
            .unwrap_or_else(|| p.clone());
        actions.insert(
            p_new.clone(),
            PlannedAction::new(
                Action::PathConflictResolve {
                    from: p.clone(),
                    orig_from: p_orig,
                },
                "local path conflict",
            ),
        );
        actions.insert(
            p.clone(),
            PlannedAction::new(
                Action::PathConflict {
                    rename_to: p_new,
                    origin: ConflictOrigin::Local,
                },
                "path conflict",
            ),
        );
    }

    if !remote_conflicts.is_empty() {
        // Re-target the incoming file if its aliased directory keeps any
        // file.
        let remote_tag = mctx.label().trim_end_matches('+').to_string();
        let conflict_dirs: HashSet<&str> =
            remote_conflicts.iter().map(|p| p.as_str()).collect();
        'outer: for f in mf.paths() {
            for dir in f.parent_dirs() {
                if !conflict_dirs.contains(dir) {
                    continue;
                }
                let p = RepoPath::from_internal_string(dir);
                if !deleted_files.contains(f) {
                    let planned = actions.get(&p).cloned().expect("conflict slot has an action");
                    let taken: HashSet<&RepoPath> = actions.keys().collect();
                    let p_new = safe_name(&p, &remote_tag, wctx, &taken);
                    match planned.action.kind() {
                        ActionKind::DeletedChanged | ActionKind::Merge => {
                            // Already a merge; just point it at the safe
                            // name.
                            actions.insert(p_new.clone(), planned);
                        }
                        _ => {
                            let flags = match &planned.action {
                                Action::Created { flags } => *flags,
                                Action::CreatedMerge { flags, .. } => *flags,
                                Action::Get { flags, .. } => *flags,
                                Action::GetOtherAndStore { flags } => *flags,
                                _ => FileFlag::Normal,
                            };
                            actions.insert(
                                p_new.clone(),
                                PlannedAction::new(
                                    Action::LocalDirRenameGet {
                                        from: p.clone(),
                                        flags,
                                    },
                                    "remote path conflict",
                                ),
                            );
                        }
                    }
                    actions.insert(
                        p.clone(),
                        PlannedAction::new(
                            Action::PathConflict {
                                rename_to: p_new,
                                origin: ConflictOrigin::Remote,
                            },
                            "path conflict",
                        ),
                    );
                    break 'outer;
                }
            }
        }
    }

    if !invalid_conflicts.is_empty() {
        let paths: Vec<RepoPath> = invalid_conflicts.into_iter().sorted().collect();
        return Err(MergeError::InvalidRemoteManifest { paths });
    }
    Ok(())
}

/// Drops or rejects actions outside the narrow scope: no-ops are dropped,
/// anything conflicting aborts.
fn filter_narrow_actions(
    narrow: &dyn Matcher,
    branch_merge: bool,
    actions: &mut ActionMap,
) -> Result<(), MergeError> {
    let paths: Vec<RepoPath> = actions.keys().cloned().collect();
    for f in paths {
        if narrow.matches(&f) {
            continue;
        }
        if !branch_merge {
            // Just updating; changes outside the clone are not ours.
            actions.remove(&f);
            continue;
        }
        let kind = actions[&f].action.kind();
        match kind {
            ActionKind::Keep => {
                actions.remove(&f);
            }
            ActionKind::Add
            | ActionKind::AddModified
            | ActionKind::Created
            | ActionKind::CreatedMerge
            | ActionKind::Forget
            | ActionKind::Get
            | ActionKind::GetOtherAndStore
            | ActionKind::Remove
            | ActionKind::Exec => {
                return Err(MergeError::OutsideNarrowScope { path: f });
            }
            _ => {
                return Err(MergeError::ConflictOutsideNarrowScope { path: f });
            }
        }
    }
    Ok(())
}

/// Considers planned actions that collide with unknown (untracked) working
/// files. Depending on policy the collision aborts, warns, or silently
/// backs the file up; `Created` actions are lowered to `Get` here.
#[allow(clippy::too_many_arguments)]
pub fn check_unknown_files(
    wctx: &Snapshot<'_>,
    mctx: &Snapshot<'_>,
    wc: Option<&WorkingCopy>,
    tracker: &dyn WorkingCopyTracker,
    force: bool,
    merge_force: bool,
    actions: &mut ActionMap,
    settings: &MergeSettings,
) -> Result<Vec<String>, MergeError> {
    let mut warnings = vec![];
    let mut file_conflicts: HashSet<RepoPath> = HashSet::new();
    let mut path_conflicts: HashSet<RepoPath> = HashSet::new();
    let mut warn_conflicts: Vec<RepoPath> = vec![];
    let mut abort_conflicts: Vec<RepoPath> = vec![];

    // Nothing in an in-memory working copy can be an unknown file.
    let Some(wc) = wc else {
        return Ok(warnings);
    };

    let store = wctx.repo().store();
    let differs_from_remote = |f: &RepoPath, f2: &RepoPath| -> Result<bool, MergeError> {
        if !wc.is_file_or_link(f.as_str()) || tracker.is_tracked(f) {
            return Ok(false);
        }
        let Some(entry) = mctx.file_entry(f2) else {
            return Ok(true);
        };
        let remote = store.read(f2, &entry.node)?;
        Ok(wc.content_differs(f, &remote))
    };

    if !force {
        // Directories already known good or known absent, to avoid
        // re-walking deep trees.
        let mut known_dirs: HashSet<String> = HashSet::new();
        let mut missing_dirs: HashSet<String> = HashSet::new();
        let mut check_unknown_dirs = |f: &RepoPath| -> Option<RepoPath> {
            for dir in f.parent_dirs().collect_vec().into_iter().rev() {
                if missing_dirs.contains(dir) {
                    return None;
                }
                if known_dirs.contains(dir) {
                    continue;
                }
                let dir_path = RepoPath::from_internal_string(dir);
                if wc.is_file_or_link(dir) && !tracker.is_tracked(&dir_path) {
                    return Some(dir_path);
                }
                if !wc.exists(&dir_path) {
                    missing_dirs.insert(dir.to_string());
                    return None;
                }
                known_dirs.insert(dir.to_string());
            }
            // The path itself may be a directory holding untracked files.
            if wc.is_dir(f) {
                let mut work = vec![wc.disk_path(f)];
                while let Some(dir) = work.pop() {
                    let Ok(entries) = std::fs::read_dir(&dir) else {
                        continue;
                    };
                    for entry in entries.flatten() {
                        let entry_path = entry.path();
                        if entry_path.is_dir() {
                            work.push(entry_path);
                        } else if let Ok(rel) =
                            crate::repo_path::parse_fs_path(wc.root(), &entry_path)
                        {
                            if !tracker.is_tracked(&rel) {
                                return Some(f.clone());
                            }
                        }
                    }
                }
            }
            None
        };

        for (f, planned) in actions.iter() {
            match &planned.action {
                Action::Created { .. } | Action::DeletedChanged(_) => {
                    if differs_from_remote(f, f)? {
                        file_conflicts.insert(f.clone());
                    } else if !wctx.contains(f) {
                        if let Some(path) = check_unknown_dirs(f) {
                            path_conflicts.insert(path);
                        }
                    }
                }
                Action::LocalDirRenameGet { from, .. } => {
                    if differs_from_remote(f, from)? {
                        file_conflicts.insert(f.clone());
                    }
                }
                _ => {}
            }
        }

        for f in file_conflicts.union(&path_conflicts).sorted() {
            let policy = if tracker.is_ignored(f) {
                settings.check_ignored
            } else {
                settings.check_unknown
            };
            match policy {
                UnknownFilePolicy::Abort => abort_conflicts.push(f.clone()),
                UnknownFilePolicy::Warn => warn_conflicts.push(f.clone()),
                UnknownFilePolicy::Ignore => {}
            }
        }
    } else {
        let created_merges: Vec<(RepoPath, FileFlag, NodeId)> = actions
            .iter()
            .filter_map(|(f, planned)| match &planned.action {
                Action::CreatedMerge {
                    flags,
                    ancestor_commit,
                } => Some((f.clone(), *flags, ancestor_commit.clone())),
                _ => None,
            })
            .collect();
        for (f, flags, ancestor_commit) in created_merges {
            let different = differs_from_remote(&f, &f)?;
            let policy = if tracker.is_ignored(&f) {
                settings.check_ignored
            } else {
                settings.check_unknown
            };
            // force=true tells us to take the remote side; an untracked file
            // that differs still gets a merge (or a backed-up get under the
            // lenient policies).
            let planned = if !different {
                PlannedAction::new(Action::Get { flags, backup: false }, "remote created")
            } else if merge_force || policy == UnknownFilePolicy::Abort {
                PlannedAction::new(
                    Action::Merge(MergeArgs {
                        local_path: Some(f.clone()),
                        other_path: Some(f.clone()),
                        ancestor_path: None,
                        move_local: false,
                        ancestor_commit,
                    }),
                    "remote differs from untracked local",
                )
            } else {
                if policy == UnknownFilePolicy::Warn {
                    warn_conflicts.push(f.clone());
                }
                PlannedAction::new(Action::Get { flags, backup: true }, "remote created")
            };
            actions.insert(f, planned);
        }
    }

    if !abort_conflicts.is_empty() {
        let mut lines = vec![];
        for f in abort_conflicts.iter().sorted() {
            if path_conflicts.contains(f) {
                if wc.is_file_or_link(f.as_str()) {
                    lines.push(format!("{}: untracked file conflicts with directory", f.as_str()));
                } else {
                    lines.push(format!("{}: untracked directory conflicts with file", f.as_str()));
                }
            } else {
                lines.push(format!("{}: untracked file differs", f.as_str()));
            }
        }
        return Err(MergeError::UntrackedConflicts { warnings: lines });
    }

    for f in warn_conflicts.iter().sorted() {
        if wc.is_file_or_link(f.as_str()) {
            warnings.push(format!("{}: replacing untracked file", f.as_str()));
        } else {
            warnings.push(format!("{}: replacing untracked files in directory", f.as_str()));
        }
    }

    // Every remaining create becomes a get, backed up when something
    // untracked is in the way.
    let creates: Vec<(RepoPath, FileFlag, String)> = actions
        .iter()
        .filter_map(|(f, planned)| match &planned.action {
            Action::Created { flags } => Some((f.clone(), *flags, planned.reason.clone())),
            _ => None,
        })
        .collect();
    for (f, flags, reason) in creates {
        let backup = file_conflicts.contains(&f)
            || path_conflicts.contains(&f)
            || f.parent_dirs()
                .any(|dir| path_conflicts.iter().any(|p| p.as_str() == dir));
        actions.insert(f, PlannedAction::new(Action::Get { flags, backup }, reason));
    }

    Ok(warnings)
}

/// Checks the provisional post-merge manifest for case-folding collisions,
/// including a folded file colliding with a differently-cased directory.
pub fn check_case_collisions(wmf: &Manifest, actions: Option<&ActionMap>) -> Result<(), MergeError> {
    let mut provisional: HashSet<RepoPath> = wmf.paths().cloned().collect();
    if let Some(actions) = actions {
        for (f, planned) in actions {
            match &planned.action {
                Action::Add
                | Action::AddModified
                | Action::Forget
                | Action::Get { .. }
                | Action::GetOtherAndStore { .. }
                | Action::ChangedDeleted(_)
                | Action::DeletedChanged(_)
                | Action::LocalDirRenameGet { .. } => {
                    provisional.insert(f.clone());
                }
                Action::Remove => {
                    provisional.remove(f);
                }
                Action::DirRenameMoveLocal { from, .. } => {
                    provisional.remove(from);
                    provisional.insert(f.clone());
                }
                Action::Merge(args) => {
                    if args.move_local {
                        if let Some(local_path) = &args.local_path {
                            provisional.remove(local_path);
                        }
                    }
                    provisional.insert(f.clone());
                }
                _ => {}
            }
        }
    }

    let mut fold_map: BTreeMap<String, RepoPath> = BTreeMap::new();
    for f in &provisional {
        let fold = f.as_str().to_lowercase();
        if let Some(existing) = fold_map.get(&fold) {
            return Err(MergeError::CaseCollision {
                path1: f.clone(),
                path2: existing.as_str().to_string(),
            });
        }
        fold_map.insert(fold, f.clone());
    }

    // A folded prefix matching while the true casing differs means a file
    // collides with a directory.
    let mut fold_prefix = String::new();
    let mut unfold_prefix = String::new();
    let mut last_full: Option<RepoPath> = None;
    for (fold, f) in &fold_map {
        if !fold_prefix.is_empty()
            && fold.starts_with(&fold_prefix)
            && !f.as_str().starts_with(&unfold_prefix)
        {
            return Err(MergeError::CaseCollision {
                path1: last_full.expect("a previous path set the prefix"),
                path2: format!("directory of {}", f.as_str()),
            });
        }
        fold_prefix = format!("{fold}/");
        unfold_prefix = format!("{}/", f.as_str());
        last_full = Some(f.clone());
    }
    Ok(())
}

/// Forgets files deleted or removed in the working copy that the target
/// does not have, so they stop being tracked.
pub fn forget_removed(wctx: &Snapshot<'_>, mctx: &Snapshot<'_>, branch_merge: bool) -> ActionMap {
    let mut actions = BTreeMap::new();
    let working = wctx.repo().working();
    for f in working.deleted.iter().sorted() {
        if !mctx.contains(f) {
            let action = if branch_merge { Action::Remove } else { Action::Forget };
            actions.insert(f.clone(), PlannedAction::new(action, "forget deleted"));
        }
    }
    if !branch_merge {
        for f in working.removed.iter().sorted() {
            if !mctx.contains(f) {
                actions.insert(f.clone(), PlannedAction::new(Action::Forget, "forget removed"));
            }
        }
    }
    actions
}

/// Resolves false change/delete conflicts where the identity changed but the
/// content did not.
fn resolve_trivial(
    wc: Option<&WorkingCopy>,
    mctx: &Snapshot<'_>,
    ancestor: &Snapshot<'_>,
    actions: &mut ActionMap,
) -> Result<(), MergeError> {
    let store = mctx.repo().store();
    let paths: Vec<RepoPath> = actions.keys().cloned().collect();
    for f in paths {
        match actions[&f].action.kind() {
            ActionKind::ChangedDeleted => {
                let (Some(wc), Some(ancestor_entry)) = (wc, ancestor.file_entry(&f)) else {
                    continue;
                };
                let ancestor_data = store.read(&f, &ancestor_entry.node)?;
                if !wc.content_differs(&f, &ancestor_data) {
                    // The local change round-tripped back to the ancestor
                    // content.
                    actions.insert(f, PlannedAction::new(Action::Remove, "prompt same"));
                }
            }
            ActionKind::DeletedChanged => {
                let (Some(ancestor_entry), Some(other_entry)) =
                    (ancestor.file_entry(&f), mctx.file_entry(&f))
                else {
                    continue;
                };
                let ancestor_data = store.read(&f, &ancestor_entry.node)?;
                let other_data = store.read(&f, &other_entry.node)?;
                if ancestor_data == other_data {
                    // The remote change round-tripped; keep the local
                    // deletion.
                    actions.remove(&f);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Calculates the actions needed to merge `mctx` into `wctx` across one or
/// more candidate ancestors. With several ancestors, each gets its own
/// manifest merge and the per-path disagreements are resolved by auction.
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all)]
pub fn calculate_updates(
    wctx: &Snapshot<'_>,
    mctx: &Snapshot<'_>,
    ancestors: &[Snapshot<'_>],
    branch_merge: bool,
    force: bool,
    accept_remote: bool,
    follow_copies: bool,
    matcher: Option<&dyn Matcher>,
    merge_force: bool,
    narrow: Option<&dyn Matcher>,
    wc: Option<&WorkingCopy>,
    tracker: &dyn WorkingCopyTracker,
    settings: &MergeSettings,
) -> Result<CalculatedUpdates, MergeError> {
    assert!(!ancestors.is_empty(), "at least one ancestor is required");
    let mut warnings = vec![];

    let (mut actions, diverge, rename_delete) = if ancestors.len() == 1 {
        let mut result = manifest_merge(
            wctx,
            mctx,
            &ancestors[0],
            branch_merge,
            force,
            matcher,
            accept_remote,
            follow_copies,
            false,
            narrow,
            settings,
        )?;
        warnings.extend(check_unknown_files(
            wctx,
            mctx,
            wc,
            tracker,
            force,
            merge_force,
            &mut result.actions,
            settings,
        )?);
        (result.actions, result.diverge, result.rename_delete)
    } else {
        debug!(
            local = %wctx.label(),
            other = %mctx.label(),
            ancestors = ancestors.len(),
            "merging using bids from multiple ancestors"
        );

        // Collect one bid per ancestor per path, keyed by the action kind
        // (the store-in-mergestate variant of get bids with the plain gets).
        let mut file_bids: BTreeMap<RepoPath, BTreeMap<ActionKind, Vec<PlannedAction>>> =
            BTreeMap::new();
        let mut diverge: Option<Diverge> = None;
        let mut rename_delete: Option<RenameDelete> = None;
        for ancestor in ancestors {
            debug!(ancestor = %ancestor.label(), "calculating bids for ancestor");
            let mut result = manifest_merge(
                wctx,
                mctx,
                ancestor,
                branch_merge,
                force,
                matcher,
                accept_remote,
                follow_copies,
                true,
                narrow,
                settings,
            )?;
            warnings.extend(check_unknown_files(
                wctx,
                mctx,
                wc,
                tracker,
                force,
                merge_force,
                &mut result.actions,
                settings,
            )?);

            // Track the shortest warning sets, on the theory that the bid
            // merge incorporates the most information there.
            if diverge.as_ref().map_or(true, |d| result.diverge.len() < d.len()) {
                diverge = Some(result.diverge);
            }
            if rename_delete
                .as_ref()
                .map_or(true, |rd| result.rename_delete.len() < rd.len())
            {
                rename_delete = Some(result.rename_delete);
            }

            for (f, planned) in result.actions {
                let mut kind = planned.action.kind();
                if kind == ActionKind::GetOtherAndStore {
                    kind = ActionKind::Get;
                }
                debug!(path = f.as_str(), reason = %planned.reason, ?kind, "bid");
                file_bids
                    .entry(f)
                    .or_default()
                    .entry(kind)
                    .or_default()
                    .push(planned);
            }
        }

        // The auction.
        let mut actions: ActionMap = BTreeMap::new();
        for (f, bids) in file_bids {
            if bids.len() == 1 {
                let (kind, bid_list) = bids.into_iter().next().expect("len is 1");
                if bid_list.iter().all(|bid| *bid == bid_list[0]) {
                    debug!(path = f.as_str(), ?kind, "consensus");
                    actions.insert(f, bid_list.into_iter().next().expect("non-empty"));
                    continue;
                }
                // Same kind, different payloads: fall through to the
                // ambiguity handling below.
                let mut bids_again = BTreeMap::new();
                bids_again.insert(kind, bid_list);
                pick_ambiguous_bid(&f, bids_again, &mut actions, &mut warnings);
                continue;
            }
            // If keep is an option, just do it.
            if let Some(keep_bids) = bids.get(&ActionKind::Keep) {
                debug!(path = f.as_str(), "picking 'keep' action");
                actions.insert(f, keep_bids[0].clone());
                continue;
            }
            // If there are gets and they all agree, do it.
            if let Some(get_bids) = bids.get(&ActionKind::Get) {
                if get_bids.iter().all(|bid| *bid == get_bids[0]) {
                    debug!(path = f.as_str(), "picking 'get' action");
                    actions.insert(f, get_bids[0].clone());
                    continue;
                }
            }
            pick_ambiguous_bid(&f, bids, &mut actions, &mut warnings);
        }
        debug!("end of auction");

        (
            actions,
            diverge.unwrap_or_default(),
            rename_delete.unwrap_or_default(),
        )
    };

    if wctx.rev().is_none() {
        actions.extend(forget_removed(wctx, mctx, branch_merge));
    }

    resolve_trivial(wc, mctx, &ancestors[0], &mut actions)?;

    Ok(CalculatedUpdates {
        actions,
        diverge,
        rename_delete,
        warnings,
    })
}

/// The acknowledged gap in bid resolution: with no consensus and no
/// preferred kind, the first bid in deterministic iteration order wins.
fn pick_ambiguous_bid(
    f: &RepoPath,
    bids: BTreeMap<ActionKind, Vec<PlannedAction>>,
    actions: &mut ActionMap,
    warnings: &mut Vec<String>,
) {
    let (kind, bid_list) = bids.into_iter().next().expect("bids are non-empty");
    warnings.push(format!(
        "{}: ambiguous merge - picked {:?} action",
        f.as_str(),
        kind
    ));
    actions.insert(f.clone(), bid_list.into_iter().next().expect("non-empty"));
}

/// The per-kind action lists the applier drives its phases from.
#[derive(Debug, Default)]
pub struct ActionLists {
    by_kind: BTreeMap<ActionKind, Vec<(RepoPath, PlannedAction)>>,
}

impl ActionLists {
    pub fn from_actions(actions: ActionMap) -> Self {
        let mut by_kind: BTreeMap<ActionKind, Vec<(RepoPath, PlannedAction)>> = BTreeMap::new();
        for (f, planned) in actions {
            by_kind.entry(planned.action.kind()).or_default().push((f, planned));
        }
        ActionLists { by_kind }
    }

    pub fn of_kind(&self, kind: ActionKind) -> &[(RepoPath, PlannedAction)] {
        self.by_kind.get(&kind).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn take_kind(&mut self, kind: ActionKind) -> Vec<(RepoPath, PlannedAction)> {
        self.by_kind.remove(&kind).unwrap_or_default()
    }

    pub fn set_kind(&mut self, kind: ActionKind, entries: Vec<(RepoPath, PlannedAction)>) {
        if entries.is_empty() {
            self.by_kind.remove(&kind);
        } else {
            self.by_kind.insert(kind, entries);
        }
    }

    pub fn push(&mut self, path: RepoPath, planned: PlannedAction) {
        self.by_kind
            .entry(planned.action.kind())
            .or_default()
            .push((path, planned));
    }

    /// Total units of visible work (keeps are free).
    pub fn num_updates(&self) -> usize {
        self.by_kind
            .iter()
            .filter(|(kind, _)| **kind != ActionKind::Keep)
            .map(|(_, entries)| entries.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo_path(value: &str) -> RepoPath {
        RepoPath::from_internal_string(value)
    }

    #[test]
    fn test_case_collision_detected() {
        let mut wmf = Manifest::new();
        wmf.insert(
            repo_path("Readme.md"),
            crate::manifest::ManifestEntry::new(NodeId::from_bytes(&[1; 20]), FileFlag::Normal),
        );
        wmf.insert(
            repo_path("README.md"),
            crate::manifest::ManifestEntry::new(NodeId::from_bytes(&[2; 20]), FileFlag::Normal),
        );
        assert!(check_case_collisions(&wmf, None).is_err());
    }

    #[test]
    fn test_case_collision_with_planned_get() {
        let mut wmf = Manifest::new();
        wmf.insert(
            repo_path("readme"),
            crate::manifest::ManifestEntry::new(NodeId::from_bytes(&[1; 20]), FileFlag::Normal),
        );
        let mut actions = ActionMap::new();
        actions.insert(
            repo_path("README"),
            PlannedAction::new(
                Action::Get {
                    flags: FileFlag::Normal,
                    backup: false,
                },
                "remote created",
            ),
        );
        assert!(check_case_collisions(&wmf, Some(&actions)).is_err());
        // Removing the local file clears the collision.
        actions.insert(repo_path("readme"), PlannedAction::new(Action::Remove, "gone"));
        assert!(check_case_collisions(&wmf, Some(&actions)).is_ok());
    }

    #[test]
    fn test_action_lists_grouping() {
        let mut actions = ActionMap::new();
        actions.insert(repo_path("a"), PlannedAction::new(Action::Keep, "remote unchanged"));
        actions.insert(
            repo_path("b"),
            PlannedAction::new(
                Action::Get {
                    flags: FileFlag::Normal,
                    backup: false,
                },
                "remote is newer",
            ),
        );
        actions.insert(repo_path("c"), PlannedAction::new(Action::Remove, "other deleted"));
        let lists = ActionLists::from_actions(actions);
        assert_eq!(lists.of_kind(ActionKind::Keep).len(), 1);
        assert_eq!(lists.of_kind(ActionKind::Get).len(), 1);
        assert_eq!(lists.of_kind(ActionKind::Remove).len(), 1);
        assert_eq!(lists.num_updates(), 2);
    }
}
