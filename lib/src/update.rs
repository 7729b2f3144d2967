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

//! The merge orchestrator: `update`, `merge`, and `graft`.
//!
//! Selects the ancestor(s), enforces the preconditions, drives the plan
//! calculation and the applier, and hands the outcome to the working-copy
//! tracker.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use itertools::Itertools;
use thiserror::Error;
use tracing::debug;
use tracing::instrument;

use crate::apply;
use crate::apply::ApplyError;
use crate::apply::ApplyOptions;
use crate::apply::UpdateResult;
use crate::copies;
use crate::file_util::IoResultExt;
use crate::file_util::PathError;
use crate::filemerge::FileMergeTool;
use crate::filemerge::MergeDriver;
use crate::matchers::Matcher;
use crate::merge;
use crate::merge::Action;
use crate::merge::ActionKind;
use crate::merge::ActionLists;
use crate::merge::MergeError;
use crate::mergestate::MergeState;
use crate::mergestate::MergeStateError;
use crate::repo::Repo;
use crate::repo::RevId;
use crate::repo_path::RepoPath;
use crate::settings::CopyTraceMode;
use crate::settings::MergeSettings;
use crate::store::StoreError;
use crate::working_copy::FileData;
use crate::working_copy::WorkingCopy;
use crate::working_copy::WorkingCopyTracker;

const MERGE_STATE_DIR: &str = "merge";
const UPDATE_STATE_FILE: &str = "updatestate";

/// What to verify about the working copy before a plain (non-merge) update.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum UpdateCheck {
    None,
    #[default]
    Linear,
    NoConflict,
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("Outstanding uncommitted merge")]
    UncommittedMerge,
    #[error("Outstanding merge conflicts (resolve them first)")]
    UnresolvedConflicts,
    #[error("Merging with a working directory ancestor has no effect")]
    MergeWithAncestor,
    #[error("Nothing to merge")]
    NothingToMerge,
    #[error("Uncommitted changes (commit or discard them first)")]
    UncommittedChanges,
    #[error("Conflicting changes (commit or discard them first)")]
    ConflictingChanges,
    #[error("No common ancestor between the working copy and the target")]
    NoCommonAncestor,
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error(transparent)]
    MergeState(#[from] MergeStateError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Path(#[from] PathError),
}

/// Caller-supplied pieces for one update/merge run.
pub struct UpdateOptions<'a> {
    pub branch_merge: bool,
    pub force: bool,
    /// Explicit merge base; overrides ancestor selection.
    pub ancestor: Option<RevId>,
    /// Accept the incoming side for prompts, and allow merging with an
    /// ancestor (used when replaying changes onto a descendant).
    pub merge_ancestor: bool,
    pub labels: Option<Vec<String>>,
    pub matcher: Option<&'a dyn Matcher>,
    /// Whether the merge was explicitly forced; implies `force`.
    pub merge_force: bool,
    /// The target tree is a scratch overlay, not the checked-out working
    /// copy: unknown-file checks are skipped and merge drivers are refused.
    pub in_memory: bool,
    /// Whether to feed the outcome to the tracker (skipped for partial
    /// updates).
    pub update_tracker: bool,
    pub update_check: UpdateCheck,
    pub narrow: Option<&'a dyn Matcher>,
    pub tool: &'a dyn FileMergeTool,
    pub driver: Option<&'a dyn MergeDriver>,
}

impl<'a> UpdateOptions<'a> {
    pub fn new(tool: &'a dyn FileMergeTool) -> Self {
        UpdateOptions {
            branch_merge: false,
            force: false,
            ancestor: None,
            merge_ancestor: false,
            labels: None,
            matcher: None,
            merge_force: false,
            in_memory: false,
            update_tracker: true,
            update_check: UpdateCheck::default(),
            narrow: None,
            tool,
            driver: None,
        }
    }
}

/// Result of one update/merge run, with the collected user-facing notes.
#[derive(Debug, Default)]
pub struct UpdateReport {
    pub result: UpdateResult,
    pub warnings: Vec<String>,
}

pub fn merge_state_dir(state_dir: &Path) -> PathBuf {
    state_dir.join(MERGE_STATE_DIR)
}

/// Performs a merge between the working copy and `target`.
///
/// `state_dir` is the repository's private state directory, holding the
/// merge state and the in-progress update marker. The working tree lives
/// under `wc`.
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all)]
pub fn update(
    repo: &mut Repo,
    target: RevId,
    wc: &WorkingCopy,
    tracker: &mut dyn WorkingCopyTracker,
    state_dir: &Path,
    options: &UpdateOptions<'_>,
    settings: &MergeSettings,
) -> Result<UpdateReport, UpdateError> {
    let mut warnings = vec![];
    let branch_merge = options.branch_merge;
    let overwrite = options.force && !branch_merge;

    let (outcome, new_parents) = {
        let repo_ref: &Repo = repo;
        let wctx = repo_ref.working_snapshot();
        let parent_snapshots = wctx.parents();
        let p1 = parent_snapshots.first().copied();
        let p2 = repo_ref.snapshot(target);

        let ancestors = if let Some(rev) = options.ancestor {
            vec![repo_ref.snapshot(rev)]
        } else if let Some(p1) = p1 {
            if settings.prefer_all_ancestors {
                let heads = repo_ref.common_ancestor_heads(p1.rev().expect("commit"), target);
                heads.into_iter().map(|rev| repo_ref.snapshot(rev)).collect()
            } else {
                match p1.ancestor(&p2) {
                    Some(ancestor) => vec![ancestor],
                    None => vec![],
                }
            }
        } else {
            vec![]
        };

        // Check phase.
        if !overwrite {
            if parent_snapshots.len() > 1 {
                return Err(UpdateError::UncommittedMerge);
            }
            let second_parent = parent_snapshots.get(1).map(|p| p.node());
            let ms = MergeState::read(merge_state_dir(state_dir), second_parent)?;
            if ms.unresolved().next().is_some() {
                return Err(UpdateError::UnresolvedConflicts);
            }
        }
        let single_ancestor_rev = (ancestors.len() == 1).then(|| ancestors[0].rev()).flatten();
        if branch_merge {
            if single_ancestor_rev == Some(target) {
                return Err(UpdateError::MergeWithAncestor);
            }
            if single_ancestor_rev.is_some()
                && single_ancestor_rev == p1.and_then(|p| p.rev())
                && !options.merge_ancestor
            {
                return Err(UpdateError::NothingToMerge);
            }
            if !options.force && repo_ref.working().is_dirty() {
                return Err(UpdateError::UncommittedChanges);
            }
        } else if !overwrite {
            if p1.map(|p| p.rev()) == Some(Some(target)) {
                // No-op update.
                return Ok(UpdateReport::default());
            }
            if options.update_check == UpdateCheck::Linear
                && single_ancestor_rev != p1.and_then(|p| p.rev())
                && single_ancestor_rev != Some(target)
                && repo_ref.working().is_dirty()
            {
                return Err(UpdateError::UncommittedChanges);
            }
        }

        let ancestors = if overwrite {
            // Overwriting: diff the working tree itself against the target.
            vec![wctx]
        } else if !branch_merge {
            match p1 {
                Some(p1) => vec![p1],
                None => ancestors,
            }
        } else {
            ancestors
        };
        if ancestors.is_empty() {
            return Err(UpdateError::NoCommonAncestor);
        }

        let mut follow_copies = settings.copy_trace != CopyTraceMode::Off;
        if overwrite {
            follow_copies = false;
        }
        if !branch_merge && !repo_ref.working().is_dirty() {
            follow_copies = false;
        }

        // Calculate phase.
        let calculated = merge::calculate_updates(
            &wctx,
            &p2,
            &ancestors,
            branch_merge,
            options.force,
            options.merge_ancestor,
            follow_copies,
            options.matcher,
            options.merge_force,
            options.narrow,
            (!options.in_memory).then_some(wc),
            tracker,
            settings,
        )?;
        warnings.extend(calculated.warnings);

        if options.update_check == UpdateCheck::NoConflict {
            for (f, planned) in &calculated.actions {
                if !matches!(
                    planned.action.kind(),
                    ActionKind::Get
                        | ActionKind::Keep
                        | ActionKind::Exec
                        | ActionKind::Remove
                        | ActionKind::PathConflictResolve
                        | ActionKind::GetOtherAndStore
                ) {
                    debug!(path = f.as_str(), "conflicting change");
                    return Err(UpdateError::ConflictingChanges);
                }
            }
        }

        if !settings.case_sensitive {
            // On a case-insensitive filesystem the provisional result must
            // not fold two names together.
            if !branch_merge && (options.force || !repo_ref.working().is_dirty()) {
                merge::check_case_collisions(p2.manifest(), None)?;
            } else {
                merge::check_case_collisions(wctx.manifest(), Some(&calculated.actions))?;
            }
        }

        for (f, destinations) in calculated.diverge.iter().sorted() {
            warnings.push(format!(
                "note: possible conflict - {} was renamed multiple times to:",
                f.as_str()
            ));
            for dest in destinations.iter().sorted() {
                warnings.push(format!(" {}", dest.as_str()));
            }
        }
        for (f, destinations) in calculated.rename_delete.iter().sorted() {
            warnings.push(format!(
                "note: possible conflict - {} was deleted and renamed to:",
                f.as_str()
            ));
            for dest in destinations.iter().sorted() {
                warnings.push(format!(" {}", dest.as_str()));
            }
        }

        // Apply phase.
        let partial = options
            .matcher
            .map(|matcher| !matcher.always())
            .unwrap_or(false);
        let update_tracker = options.update_tracker && !partial;
        if update_tracker {
            // Note that an update is in progress, for crash recovery.
            let marker = state_dir.join(UPDATE_STATE_FILE);
            fs::write(&marker, p2.node().hex()).context(&marker)?;
        }

        let want_file_data = update_tracker && !branch_merge;
        let outcome = apply::apply_updates(
            repo_ref,
            calculated.actions,
            &wctx,
            &p2,
            wc,
            ApplyOptions {
                overwrite,
                want_file_data,
                in_memory: options.in_memory,
                labels: options.labels.clone(),
                tool: options.tool,
                driver: options.driver,
                state_dir: merge_state_dir(state_dir),
            },
            settings,
        )?;

        let new_parents = if update_tracker {
            if branch_merge {
                let mut parents = vec![];
                if let Some(p1) = p1 {
                    parents.push(p1.rev().expect("commit"));
                }
                parents.push(target);
                Some(parents)
            } else {
                Some(vec![target])
            }
        } else {
            None
        };
        (outcome, new_parents)
    };

    warnings.extend(outcome.warnings);

    if let Some(new_parents) = new_parents {
        repo.working_mut().parents = new_parents;
        record_updates(&outcome.actions, branch_merge, &outcome.file_data, tracker);
        // Update completed; clear the marker.
        let marker = state_dir.join(UPDATE_STATE_FILE);
        if marker.exists() {
            fs::remove_file(&marker).context(&marker)?;
        }
    }

    Ok(UpdateReport {
        result: outcome.result,
        warnings,
    })
}

/// Merges another topological branch into the working copy.
pub fn merge_branch(
    repo: &mut Repo,
    target: RevId,
    wc: &WorkingCopy,
    tracker: &mut dyn WorkingCopyTracker,
    state_dir: &Path,
    tool: &dyn FileMergeTool,
    force: bool,
    settings: &MergeSettings,
) -> Result<UpdateReport, UpdateError> {
    let options = UpdateOptions {
        branch_merge: true,
        force,
        merge_force: force,
        ..UpdateOptions::new(tool)
    };
    update(repo, target, wc, tracker, state_dir, &options, settings)
}

/// Updates to the given commit, discarding working-copy changes.
pub fn clean_update(
    repo: &mut Repo,
    target: RevId,
    wc: &WorkingCopy,
    tracker: &mut dyn WorkingCopyTracker,
    state_dir: &Path,
    tool: &dyn FileMergeTool,
    settings: &MergeSettings,
) -> Result<UpdateReport, UpdateError> {
    let options = UpdateOptions {
        force: true,
        ..UpdateOptions::new(tool)
    };
    update(repo, target, wc, tracker, state_dir, &options, settings)
}

/// A graft-style merge: replays `rev` onto the working copy using `base`
/// (default its first parent) as the merge base, then restores a single
/// parent and replicates the copy records the graft carried.
#[allow(clippy::too_many_arguments)]
pub fn graft(
    repo: &mut Repo,
    rev: RevId,
    base: Option<RevId>,
    wc: &WorkingCopy,
    tracker: &mut dyn WorkingCopyTracker,
    state_dir: &Path,
    tool: &dyn FileMergeTool,
    labels: Option<Vec<String>>,
    keep_conflict_parent: bool,
    settings: &MergeSettings,
) -> Result<UpdateReport, UpdateError> {
    let (base, merge_ancestor, p1) = {
        let wctx = repo.working_snapshot();
        let p1 = wctx.parents().first().and_then(|p| p.rev());
        let base = base.unwrap_or_else(|| {
            repo.snapshot(rev)
                .parents()
                .first()
                .and_then(|p| p.rev())
                .unwrap_or(rev)
        });
        // Passing merge_ancestor allows grafting a descendant onto an
        // ancestor and accepts the incoming changes as the newer ones.
        let merge_ancestor =
            p1.map(|p1| repo.is_ancestor(p1, rev)).unwrap_or(false) || p1 == Some(base);
        (base, merge_ancestor, p1)
    };

    let options = UpdateOptions {
        branch_merge: true,
        force: true,
        ancestor: Some(base),
        merge_ancestor,
        labels,
        ..UpdateOptions::new(tool)
    };
    let report = update(repo, rev, wc, tracker, state_dir, &options, settings)?;

    // The graft result keeps the original parent; the grafted commit only
    // becomes a parent when conflicts should stay attributed to it.
    let mut parents = vec![];
    if let Some(p1) = p1 {
        parents.push(p1);
    }
    if keep_conflict_parent && report.result.unresolved > 0 && Some(rev) != p1 {
        parents.push(rev);
    }
    repo.working_mut().parents = parents;

    copies::duplicate_copies(repo, tracker, rev, base, None, settings)
        .map_err(UpdateError::Store)?;

    Ok(report)
}

/// Records the applied actions in the working-copy tracker.
pub fn record_updates(
    actions: &ActionLists,
    branch_merge: bool,
    file_data: &BTreeMap<RepoPath, Option<FileData>>,
    tracker: &mut dyn WorkingCopyTracker,
) {
    // Removes and forgets must come first so re-adds under the same name
    // win.
    for (f, _) in actions.of_kind(ActionKind::Remove) {
        if branch_merge {
            tracker.remove(f);
        } else {
            tracker.drop_entry(f);
        }
    }
    for (f, _) in actions.of_kind(ActionKind::Forget) {
        tracker.drop_entry(f);
    }

    for (f, planned) in actions.of_kind(ActionKind::PathConflictResolve) {
        let Action::PathConflictResolve { from, orig_from } = &planned.action else {
            unreachable!("grouped by kind");
        };
        tracker.add(f);
        tracker.copy(orig_from, f);
        if from == orig_from {
            tracker.remove(from);
        } else {
            tracker.drop_entry(from);
        }
    }

    for (f, _) in actions.of_kind(ActionKind::Add) {
        tracker.add(f);
    }
    for (f, _) in actions.of_kind(ActionKind::AddModified) {
        if branch_merge {
            tracker.normal_lookup(f);
        } else {
            tracker.add(f);
        }
    }
    for (f, _) in actions.of_kind(ActionKind::Exec) {
        tracker.normal_lookup(f);
    }
    for (f, _) in actions.of_kind(ActionKind::Get) {
        if branch_merge {
            tracker.other_parent(f);
        } else {
            tracker.normal(f, file_data.get(f).and_then(|d| d.as_ref()));
        }
    }

    for (f, planned) in actions.of_kind(ActionKind::Merge) {
        let Action::Merge(args) = &planned.action else {
            unreachable!("grouped by kind");
        };
        let f1 = args.local_path.as_ref();
        let f2 = args.other_path.as_ref();
        if branch_merge {
            tracker.merge(f);
            if f1 != f2 {
                // A copy or rename fed this merge.
                if args.move_local {
                    if let Some(f1) = f1 {
                        tracker.remove(f1);
                    }
                }
                match f1 {
                    Some(f1) if f1 != f => tracker.copy(f1, f),
                    _ => {
                        if let Some(f2) = f2 {
                            tracker.copy(f2, f);
                        }
                    }
                }
            }
        } else {
            // An update-merge of a locally modified file should look like a
            // plain local modification afterwards.
            if f2 == Some(f) {
                tracker.normal_lookup(f);
            }
            if args.move_local {
                if let Some(f1) = f1 {
                    tracker.drop_entry(f1);
                }
            }
        }
    }

    for (f, planned) in actions.of_kind(ActionKind::DirRenameMoveLocal) {
        let Action::DirRenameMoveLocal { from, .. } = &planned.action else {
            unreachable!("grouped by kind");
        };
        if branch_merge {
            tracker.add(f);
            tracker.remove(from);
            tracker.copy(from, f);
        } else {
            tracker.normal(f, None);
            tracker.drop_entry(from);
        }
    }

    for (f, planned) in actions.of_kind(ActionKind::LocalDirRenameGet) {
        let Action::LocalDirRenameGet { from, .. } = &planned.action else {
            unreachable!("grouped by kind");
        };
        if branch_merge {
            tracker.add(f);
            tracker.copy(from, f);
        } else {
            tracker.normal(f, None);
        }
    }
}
