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

//! Applying an action plan to the working tree.
//!
//! Phases run in a fixed order: removes before gets (a vacated path can be
//! reused), path-conflict resolution before gets (later gets assume final
//! names), and every premerge before any full merge (a driver invoked at
//! premerge time sees a fully prepared tree). Only the two bulk phases,
//! remove and get, run on the worker pool.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::path::PathBuf;

use rayon::prelude::*;
use thiserror::Error;
use tracing::debug;
use tracing::instrument;

use crate::file_util::PathError;
use crate::filemerge::FileMergeError;
use crate::filemerge::FileMergeTool;
use crate::filemerge::MergeDriver;
use crate::manifest::FileFlag;
use crate::merge::Action;
use crate::merge::ActionKind;
use crate::merge::ActionLists;
use crate::merge::ActionMap;
use crate::merge::PlannedAction;
use crate::mergestate::MergeDriverState;
use crate::mergestate::MergeState;
use crate::mergestate::MergeStateError;
use crate::mergestate::QueuedAction;
use crate::repo::Repo;
use crate::repo::Snapshot;
use crate::repo_path::RepoPath;
use crate::settings::MergeSettings;
use crate::store::NodeId;
use crate::store::StoreError;
use crate::working_copy::FileData;
use crate::working_copy::WorkingCopy;

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    MergeState(#[from] MergeStateError),
    #[error(transparent)]
    FileMerge(#[from] FileMergeError),
    #[error("Update failed to remove {path}: {message}", path = .path.as_str())]
    RemoveFailed { path: RepoPath, message: String },
    #[error("In-memory merge does not support a merge driver")]
    InMemoryMergeDriver,
}

/// How many files an update touched, by category.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpdateResult {
    pub updated: usize,
    pub merged: usize,
    pub removed: usize,
    pub unresolved: usize,
}

impl UpdateResult {
    pub fn is_empty(&self) -> bool {
        self.updated == 0 && self.merged == 0 && self.removed == 0 && self.unresolved == 0
    }
}

/// Everything [`apply_updates`] produced beyond the working-tree changes:
/// counts, captured stat data, the final action lists for the tracker, and
/// user-facing notes.
pub struct ApplyOutcome {
    pub result: UpdateResult,
    pub file_data: BTreeMap<RepoPath, Option<FileData>>,
    pub actions: ActionLists,
    pub warnings: Vec<String>,
}

/// Caller-supplied pieces for one apply run.
pub struct ApplyOptions<'a> {
    pub overwrite: bool,
    pub want_file_data: bool,
    /// The target tree is a scratch overlay to be materialized later rather
    /// than the checked-out working copy.
    pub in_memory: bool,
    pub labels: Option<Vec<String>>,
    pub tool: &'a dyn FileMergeTool,
    pub driver: Option<&'a dyn MergeDriver>,
    /// Directory holding the persisted merge state.
    pub state_dir: PathBuf,
}

fn use_worker_pool(count: usize, settings: &MergeSettings) -> bool {
    settings.per_file_cost * count as f64 > settings.parallel_cost_threshold
}

/// Applies the merge action plan to the working tree.
#[instrument(skip_all)]
pub fn apply_updates(
    repo: &Repo,
    actions: ActionMap,
    wctx: &Snapshot<'_>,
    mctx: &Snapshot<'_>,
    wc: &WorkingCopy,
    options: ApplyOptions<'_>,
    settings: &MergeSettings,
) -> Result<ApplyOutcome, ApplyError> {
    let mut lists = ActionLists::from_actions(actions);
    let mut warnings = vec![];
    let mut file_data: BTreeMap<RepoPath, Option<FileData>> = BTreeMap::new();
    let mut updated = 0;
    let mut merged = 0;

    let mut ms = MergeState::clean(
        options.state_dir.clone(),
        wctx.node(),
        mctx.node(),
        options.labels.clone(),
        settings.merge_driver.clone(),
    )?;

    // The store-in-mergestate gets are plain gets once recorded.
    let store_gets = lists.take_kind(ActionKind::GetOtherAndStore);
    for (f, planned) in store_gets {
        ms.add_merged_other(&f);
        let Action::GetOtherAndStore { flags } = planned.action else {
            unreachable!("grouped by kind");
        };
        lists.push(
            f,
            PlannedAction {
                action: Action::Get { flags, backup: false },
                reason: planned.reason,
            },
        );
    }

    // Register every merge-requiring file, saving the pre-merge local
    // content first.
    let mut merge_actions: Vec<(RepoPath, PlannedAction)> = vec![];
    merge_actions.extend(lists.of_kind(ActionKind::ChangedDeleted).iter().cloned());
    merge_actions.extend(lists.of_kind(ActionKind::DeletedChanged).iter().cloned());
    merge_actions.extend(lists.of_kind(ActionKind::Merge).iter().cloned());

    let m2 = mctx.manifest();
    let mut moves: Vec<RepoPath> = vec![];
    for (f, planned) in &merge_actions {
        let args = match &planned.action {
            Action::Merge(args) | Action::ChangedDeleted(args) | Action::DeletedChanged(args) => {
                args
            }
            _ => unreachable!("merge lists only hold merge-style actions"),
        };
        let ancestor_path = args
            .ancestor_path
            .clone()
            .or_else(|| args.local_path.clone())
            .or_else(|| args.other_path.clone())
            .unwrap_or_else(|| f.clone());
        let local_path = args.local_path.clone().unwrap_or_else(|| ancestor_path.clone());
        let other_path = args.other_path.clone().unwrap_or_else(|| ancestor_path.clone());

        let local_content;
        let local_input = match &args.local_path {
            Some(f1) => {
                debug!(file = f1.as_str(), dest = f.as_str(), "preserving for resolve");
                local_content = wc.read(f1)?;
                Some((local_content.as_slice(), wc.flags(f1)))
            }
            None => None,
        };
        let other_node = args.other_path.as_ref().and_then(|f2| m2.get(f2)).map(|e| &e.node);
        let ancestor_rev = repo.rev_by_node(&args.ancestor_commit);
        let ancestor_node = ancestor_rev.and_then(|rev| {
            args.ancestor_path
                .as_ref()
                .and_then(|fa| repo.snapshot(rev).file_entry(fa).map(|e| e.node.clone()))
        });
        ms.add(
            f,
            &local_path,
            local_input,
            &other_path,
            other_node,
            &ancestor_path,
            ancestor_node.as_ref(),
            Some(&args.ancestor_commit),
        )?;
        if args.move_local {
            if let Some(f1) = &args.local_path {
                if f1 != f {
                    moves.push(f1.clone());
                }
            }
        }
    }

    // Remove renamed files only after their content is safely stored.
    for f in &moves {
        if wc.exists(f) {
            debug!(path = f.as_str(), "removing moved source");
            wc.remove(f, true)?;
        }
    }

    // Record path conflicts.
    for (f, planned) in lists.of_kind(ActionKind::PathConflict) {
        let Action::PathConflict { rename_to, origin } = &planned.action else {
            unreachable!("grouped by kind");
        };
        warnings.push(format!(
            "{}: path conflict - a file or link has the same name as a directory",
            f.as_str()
        ));
        match origin {
            crate::mergestate::ConflictOrigin::Local => warnings.push(format!(
                "the local file has been renamed to {}",
                rename_to.as_str()
            )),
            crate::mergestate::ConflictOrigin::Remote => warnings.push(format!(
                "the remote file has been renamed to {}",
                rename_to.as_str()
            )),
        }
        warnings.push(format!("resolve manually then mark {} resolved", f.as_str()));
        ms.add_path_conflict(f, rename_to, *origin);
    }

    // Remove in parallel; must come before resolving path conflicts and
    // getting.
    let removes = lists.of_kind(ActionKind::Remove);
    let remove_one = |(f, planned): &(RepoPath, PlannedAction)| -> Result<Option<String>, ApplyError> {
        debug!(path = f.as_str(), reason = %planned.reason, "removing");
        match wc.remove(f, true) {
            Ok(()) => Ok(None),
            Err(err) if settings.abort_on_remove_error => Err(ApplyError::RemoveFailed {
                path: f.clone(),
                message: err.to_string(),
            }),
            Err(err) => Ok(Some(format!(
                "update failed to remove {}: {}",
                f.as_str(),
                err
            ))),
        }
    };
    let remove_warnings: Vec<Option<String>> = if use_worker_pool(removes.len(), settings) {
        removes.par_iter().map(remove_one).collect::<Result<_, _>>()?
    } else {
        removes.iter().map(remove_one).collect::<Result<_, _>>()?
    };
    warnings.extend(remove_warnings.into_iter().flatten());
    let removed = removes.len();

    // Resolve path conflicts; must come before getting, which assumes final
    // names.
    for (f, planned) in lists.of_kind(ActionKind::PathConflictResolve) {
        let Action::PathConflictResolve { from, .. } = &planned.action else {
            unreachable!("grouped by kind");
        };
        debug!(path = f.as_str(), from = from.as_str(), reason = %planned.reason, "resolving path conflict");
        if wc.exists(from) {
            let data = wc.read(from)?;
            let flags = wc.flags(from);
            wc.write(f, &data, flags, false)?;
            wc.remove(from, true)?;
        }
    }

    // Get in parallel.
    let gets = lists.of_kind(ActionKind::Get);
    let store = repo.store();
    let get_one = |(f, planned): &(RepoPath, PlannedAction)| -> Result<(RepoPath, FileData), ApplyError> {
        let Action::Get { flags, backup } = &planned.action else {
            unreachable!("grouped by kind");
        };
        debug!(path = f.as_str(), reason = %planned.reason, "getting");
        if *backup {
            // Back up a same-named file, or a file standing where one of
            // our parent directories must go.
            let mut conflicting = Some(f.clone());
            if !wc.exists(f) {
                conflicting = f
                    .parent_dirs()
                    .find(|dir| wc.is_file_or_link(dir))
                    .map(RepoPath::from_internal_string);
            }
            if let Some(conflicting) = conflicting {
                if wc.exists(&conflicting) {
                    wc.backup(&conflicting)?;
                }
            }
        }
        let entry = m2.get(f).ok_or_else(|| StoreError::NotFound {
            path: f.clone(),
            node: NodeId::null(),
        })?;
        let data = store.read(f, &entry.node)?;
        let stat = wc.write(f, &data, *flags, settings.atomic_file_writes)?;
        Ok((f.clone(), stat))
    };
    let got: Vec<(RepoPath, FileData)> = if use_worker_pool(gets.len(), settings) {
        gets.par_iter().map(get_one).collect::<Result<_, _>>()?
    } else {
        gets.iter().map(get_one).collect::<Result<_, _>>()?
    };
    updated += got.len();
    if options.want_file_data {
        for (f, stat) in got {
            file_data.insert(f, Some(stat));
        }
    }

    // Bookkeeping-only actions: no I/O, the tracker handles them later.
    for kind in [ActionKind::Forget, ActionKind::Add, ActionKind::AddModified, ActionKind::Keep] {
        for (f, planned) in lists.of_kind(kind) {
            debug!(path = f.as_str(), reason = %planned.reason, ?kind, "bookkeeping");
        }
    }

    // Directory rename: move local files to their new homes.
    for (f, planned) in lists.of_kind(ActionKind::DirRenameMoveLocal) {
        let Action::DirRenameMoveLocal { from, flags } = &planned.action else {
            unreachable!("grouped by kind");
        };
        debug!(from = from.as_str(), to = f.as_str(), "moving for directory rename");
        let data = wc.read(from)?;
        wc.write(f, &data, *flags, false)?;
        wc.remove(from, true)?;
        updated += 1;
    }

    // Directory rename: fetch remote files into their relocated homes.
    for (f, planned) in lists.of_kind(ActionKind::LocalDirRenameGet) {
        let Action::LocalDirRenameGet { from, flags } = &planned.action else {
            unreachable!("grouped by kind");
        };
        debug!(from = from.as_str(), to = f.as_str(), "getting for directory rename");
        let entry = m2.get(from).ok_or_else(|| StoreError::NotFound {
            path: from.clone(),
            node: NodeId::null(),
        })?;
        let data = store.read(from, &entry.node)?;
        wc.write(f, &data, *flags, settings.atomic_file_writes)?;
        updated += 1;
    }

    // Flag-only changes.
    for (f, planned) in lists.of_kind(ActionKind::Exec) {
        let Action::Exec { flags } = &planned.action else {
            unreachable!("grouped by kind");
        };
        debug!(path = f.as_str(), reason = %planned.reason, "updating permissions");
        wc.set_flags(f, *flags)?;
        updated += 1;
    }

    // The driver may claim a subset of the merge-requiring files before the
    // per-file passes run.
    let use_driver = !options.overwrite && !merge_actions.is_empty() && options.driver.is_some();
    if use_driver {
        if options.in_memory {
            // A driver resolves files in place in the working tree; there is
            // no sensible way to replay that into an overlay.
            return Err(ApplyError::InMemoryMergeDriver);
        }
        ms.check_driver(settings.merge_driver.as_deref())?;
        ms.commit()?;
        let driver = options.driver.expect("checked above");
        let proceed = driver.preprocess(wc, &mut ms)?;
        let unresolved_files: std::collections::HashSet<RepoPath> =
            ms.unresolved().cloned().collect();
        if !proceed {
            // The driver wants this session stopped; report at least one
            // unresolved file so callers treat the merge as incomplete.
            ms.commit()?;
            return Ok(ApplyOutcome {
                result: UpdateResult {
                    updated,
                    merged,
                    removed,
                    unresolved: unresolved_files.len().max(1),
                },
                file_data,
                actions: lists,
                warnings,
            });
        }
        merge_actions.retain(|(f, _)| unresolved_files.contains(f));
    }

    // Premerge everything first, then run full merges for what remains.
    let merge_phases = (|| -> Result<(), ApplyError> {
        let mut to_complete = vec![];
        for (f, planned) in &merge_actions {
            debug!(path = f.as_str(), reason = %planned.reason, "premerge");
            let (complete, _) = ms.preresolve(f, wc, repo, options.tool)?;
            if !complete {
                to_complete.push(f.clone());
            }
        }
        for f in &to_complete {
            debug!(path = f.as_str(), "merge");
            ms.resolve(f, wc, repo, options.tool)?;
        }
        Ok(())
    })();
    ms.commit()?;
    merge_phases?;

    let mut unresolved = ms.unresolved_count();

    if use_driver && unresolved == 0 && ms.driver_state() != MergeDriverState::Success {
        let driver = options.driver.expect("checked above");
        if !driver.conclude(wc, &mut ms)? {
            unresolved = unresolved.max(1);
        }
        ms.commit()?;
    }

    let (ms_updated, ms_merged, ms_removed) = ms.counts();
    updated += ms_updated;
    merged += ms_merged;
    let removed = removed + ms_removed;

    // Fold the queued bookkeeping from re-run merges back into the lists,
    // and drop those files from the plain merge list so the tracker does
    // not record them twice.
    let extra_actions = ms.actions();
    if !extra_actions.is_empty() {
        let mut merge_files: std::collections::HashSet<RepoPath> = lists
            .of_kind(ActionKind::Merge)
            .iter()
            .map(|(f, _)| f.clone())
            .collect();
        for (queued, files) in extra_actions {
            for f in files {
                if queued == QueuedAction::Get && options.want_file_data {
                    // No stat data until the merge state can provide it.
                    file_data.insert(f.clone(), None);
                }
                merge_files.remove(&f);
                let action = match queued {
                    QueuedAction::Remove => Action::Remove,
                    QueuedAction::Forget => Action::Forget,
                    QueuedAction::Add => Action::Add,
                    QueuedAction::AddModified => Action::AddModified,
                    QueuedAction::Get => Action::Get {
                        flags: FileFlag::Normal,
                        backup: false,
                    },
                };
                lists.push(f, PlannedAction { action, reason: "merge result".to_string() });
            }
        }
        let remaining: Vec<(RepoPath, PlannedAction)> = lists
            .take_kind(ActionKind::Merge)
            .into_iter()
            .filter(|(f, _)| merge_files.contains(f))
            .collect();
        lists.set_kind(ActionKind::Merge, remaining);
    }

    Ok(ApplyOutcome {
        result: UpdateResult {
            updated,
            merged,
            removed,
            unresolved,
        },
        file_data,
        actions: lists,
        warnings,
    })
}
