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

use assert_matches::assert_matches;
use testutils::{checkout, remove, rename, repo_path, write, TestRepoBuilder};
use treemerge_lib::manifest::{FileFlag, ManifestEntry};
use treemerge_lib::matchers::PrefixMatcher;
use treemerge_lib::merge::{manifest_merge, Action, ActionKind, MergeError};
use treemerge_lib::mergestate::ConflictOrigin;
use treemerge_lib::settings::MergeSettings;
use treemerge_lib::store::NodeId;

#[test]
fn test_merge_with_self_yields_only_keep() {
    let mut builder = TestRepoBuilder::new();
    let r0 = builder.commit(&[], &[write("a", "alpha"), write("b", "beta")]);
    let r1 = builder.commit(&[r0], &[write("b", "beta 2")]);
    let mut repo = builder.build();
    checkout(&mut repo, r1);
    // A pending local edit makes the diff non-empty without changing the
    // outcome: the remote side is identical to the ancestor everywhere.
    repo.working_mut().manifest.insert(
        repo_path("a"),
        ManifestEntry::new(NodeId::working_modified(), FileFlag::Normal),
    );
    repo.working_mut().modified.insert(repo_path("a"));

    let settings = MergeSettings::default();
    let wctx = repo.working_snapshot();
    let p2 = repo.snapshot(r1);
    let result =
        manifest_merge(&wctx, &p2, &p2, false, false, None, false, true, false, None, &settings)
            .unwrap();
    assert!(!result.actions.is_empty());
    assert!(result
        .actions
        .values()
        .all(|planned| planned.action.kind() == ActionKind::Keep));
}

#[test]
fn test_remote_newer_takes_other_side() {
    let mut builder = TestRepoBuilder::new();
    let r0 = builder.commit(&[], &[write("a", "old")]);
    let r1 = builder.commit(&[r0], &[write("a", "new")]);
    let mut repo = builder.build();
    checkout(&mut repo, r0);

    let settings = MergeSettings::default();
    let wctx = repo.working_snapshot();
    let p2 = repo.snapshot(r1);
    let pa = repo.snapshot(r0);

    let result =
        manifest_merge(&wctx, &p2, &pa, false, false, None, false, true, false, None, &settings)
            .unwrap();
    let planned = &result.actions[&repo_path("a")];
    assert_eq!(planned.action, Action::Get { flags: FileFlag::Normal, backup: false });
    assert_eq!(planned.reason, "remote is newer");

    // On a branch merge the same situation is recorded in the merge state.
    let result =
        manifest_merge(&wctx, &p2, &pa, true, false, None, false, true, false, None, &settings)
            .unwrap();
    let planned = &result.actions[&repo_path("a")];
    assert_eq!(planned.action, Action::GetOtherAndStore { flags: FileFlag::Normal });
}

#[test]
fn test_both_created_same_path() {
    let mut builder = TestRepoBuilder::new();
    let r0 = builder.commit(&[], &[write("base", "b")]);
    let r1 = builder.commit(&[r0], &[write("new", "left version")]);
    let r2 = builder.commit(&[r0], &[write("new", "right version")]);
    let mut repo = builder.build();
    checkout(&mut repo, r1);

    let settings = MergeSettings::default();
    let wctx = repo.working_snapshot();
    let result = manifest_merge(
        &wctx,
        &repo.snapshot(r2),
        &repo.snapshot(r0),
        true,
        false,
        None,
        false,
        true,
        false,
        None,
        &settings,
    )
    .unwrap();

    let planned = &result.actions[&repo_path("new")];
    assert_eq!(planned.reason, "both created");
    assert_matches!(
        &planned.action,
        Action::Merge(args) if args.ancestor_path.is_none() && !args.move_local
    );
}

#[test]
fn test_local_rename_remote_edit_merges_at_new_name() {
    // Ancestor has a.txt; the local side renames it to b.txt unchanged, the
    // remote side edits a.txt. The edit must follow the rename.
    let mut builder = TestRepoBuilder::new();
    let r0 = builder.commit(&[], &[write("a.txt", "v1")]);
    let r1 = builder.commit(&[r0], &[rename("b.txt", "v1", "a.txt")]);
    let r2 = builder.commit(&[r0], &[write("a.txt", "v2")]);
    let mut repo = builder.build();
    checkout(&mut repo, r1);

    let settings = MergeSettings::default();
    let wctx = repo.working_snapshot();
    let result = manifest_merge(
        &wctx,
        &repo.snapshot(r2),
        &repo.snapshot(r0),
        true,
        false,
        None,
        false,
        true,
        false,
        None,
        &settings,
    )
    .unwrap();

    assert_eq!(result.actions.len(), 1);
    let planned = &result.actions[&repo_path("b.txt")];
    assert_eq!(planned.reason, "local copied/moved from a.txt");
    assert_matches!(
        &planned.action,
        Action::Merge(args)
            if args.local_path.as_ref() == Some(&repo_path("b.txt"))
                && args.other_path.as_ref() == Some(&repo_path("a.txt"))
                && args.ancestor_path.as_ref() == Some(&repo_path("a.txt"))
    );
    assert!(result.diverge.is_empty());
    assert!(result.rename_delete.is_empty());
}

#[test]
fn test_changed_locally_deleted_remotely() {
    let mut builder = TestRepoBuilder::new();
    let r0 = builder.commit(&[], &[write("a", "v1"), write("keep", "k")]);
    let r1 = builder.commit(&[r0], &[write("a", "v2")]);
    let r2 = builder.commit(&[r0], &[remove("a")]);
    let mut repo = builder.build();
    checkout(&mut repo, r1);

    let settings = MergeSettings::default();
    let wctx = repo.working_snapshot();
    let result = manifest_merge(
        &wctx,
        &repo.snapshot(r2),
        &repo.snapshot(r0),
        true,
        false,
        None,
        false,
        true,
        false,
        None,
        &settings,
    )
    .unwrap();
    let planned = &result.actions[&repo_path("a")];
    assert_eq!(planned.reason, "prompt changed/deleted");
    assert_matches!(planned.action, Action::ChangedDeleted(_));

    // Accepting the remote side turns the prompt into a plain removal.
    let result = manifest_merge(
        &wctx,
        &repo.snapshot(r2),
        &repo.snapshot(r0),
        true,
        false,
        None,
        true,
        true,
        false,
        None,
        &settings,
    )
    .unwrap();
    assert_eq!(result.actions[&repo_path("a")].action, Action::Remove);
}

#[test]
fn test_deleted_locally_changed_remotely() {
    let mut builder = TestRepoBuilder::new();
    let r0 = builder.commit(&[], &[write("a", "v1"), write("keep", "k")]);
    let r1 = builder.commit(&[r0], &[remove("a")]);
    let r2 = builder.commit(&[r0], &[write("a", "v2")]);
    let mut repo = builder.build();
    checkout(&mut repo, r1);

    let settings = MergeSettings::default();
    let wctx = repo.working_snapshot();
    let result = manifest_merge(
        &wctx,
        &repo.snapshot(r2),
        &repo.snapshot(r0),
        true,
        false,
        None,
        false,
        true,
        false,
        None,
        &settings,
    )
    .unwrap();
    let planned = &result.actions[&repo_path("a")];
    assert_eq!(planned.reason, "prompt deleted/changed");
    assert_matches!(planned.action, Action::DeletedChanged(_));
}

#[test]
fn test_remote_exec_bit_flip_updates_permissions() {
    let mut builder = TestRepoBuilder::new();
    let r0 = builder.commit(&[], &[write("bin", "#!/bin/sh\n")]);
    let mut repo = builder.build();
    // A flag-only change keeps the content identity; build the remote
    // manifest by hand to model that.
    let entry = repo.snapshot(r0).file_entry(&repo_path("bin")).unwrap().clone();
    let mut flipped = repo.snapshot(r0).manifest().clone();
    flipped.insert(
        repo_path("bin"),
        ManifestEntry::new(entry.node.clone(), FileFlag::Executable),
    );
    let r1 = repo.add_commit(
        NodeId::from_bytes(&[7; 20]),
        vec![r0],
        flipped,
        vec![repo_path("bin")],
    );
    checkout(&mut repo, r0);

    let settings = MergeSettings::default();
    let wctx = repo.working_snapshot();
    let result = manifest_merge(
        &wctx,
        &repo.snapshot(r1),
        &repo.snapshot(r0),
        true,
        false,
        None,
        false,
        false,
        false,
        None,
        &settings,
    )
    .unwrap();
    let planned = &result.actions[&repo_path("bin")];
    assert_eq!(planned.action, Action::Exec { flags: FileFlag::Executable });
    assert_eq!(planned.reason, "update permissions");
}

#[test]
fn test_local_exec_bit_flip_keeps_local_flags_on_get() {
    let mut builder = TestRepoBuilder::new();
    let r0 = builder.commit(&[], &[write("bin", "v1")]);
    let r1 = builder.commit(&[r0], &[write("bin", "v2")]);
    let mut repo = builder.build();
    checkout(&mut repo, r0);
    // The local side only flipped the execute bit.
    let entry = repo.snapshot(r0).file_entry(&repo_path("bin")).unwrap().clone();
    repo.working_mut().manifest.insert(
        repo_path("bin"),
        ManifestEntry::new(entry.node.clone(), FileFlag::Executable),
    );

    let settings = MergeSettings::default();
    let wctx = repo.working_snapshot();
    let result = manifest_merge(
        &wctx,
        &repo.snapshot(r1),
        &repo.snapshot(r0),
        false,
        false,
        None,
        false,
        false,
        false,
        None,
        &settings,
    )
    .unwrap();
    let planned = &result.actions[&repo_path("bin")];
    assert_eq!(planned.action, Action::Get { flags: FileFlag::Executable, backup: false });
}

#[test]
fn test_directory_rename_relocates_new_remote_file() {
    // The remote side renamed lib/ to src/; a file added locally under lib/
    // after the rename point must follow the move.
    let mut builder = TestRepoBuilder::new();
    let r0 = builder.commit(&[], &[write("lib/old.txt", "1"), write("other.txt", "x")]);
    let r1 = builder.commit(&[r0], &[rename("src/old.txt", "1", "lib/old.txt")]);
    let r2 = builder.commit(&[r0], &[write("lib/new.txt", "2")]);
    let mut repo = builder.build();
    checkout(&mut repo, r2);

    let settings = MergeSettings::default();
    let wctx = repo.working_snapshot();
    let result = manifest_merge(
        &wctx,
        &repo.snapshot(r1),
        &repo.snapshot(r0),
        true,
        false,
        None,
        false,
        true,
        false,
        None,
        &settings,
    )
    .unwrap();

    let planned = &result.actions[&repo_path("src/new.txt")];
    assert_eq!(planned.reason, "remote directory rename - move from lib/new.txt");
    assert_matches!(
        &planned.action,
        Action::DirRenameMoveLocal { from, .. } if from == &repo_path("lib/new.txt")
    );
    // The moved file gets no action under its old name.
    assert!(!result.actions.contains_key(&repo_path("lib/new.txt")));
    // The renamed file itself: removed here, created at the new name.
    assert_eq!(result.actions[&repo_path("lib/old.txt")].action, Action::Remove);
    assert_eq!(result.actions[&repo_path("src/old.txt")].action.kind(), ActionKind::Created);
}

#[test]
fn test_directory_rename_fetches_new_remote_file() {
    // Same situation seen from the renaming side: the new file was added
    // remotely and must be fetched into the renamed directory.
    let mut builder = TestRepoBuilder::new();
    let r0 = builder.commit(&[], &[write("lib/old.txt", "1"), write("other.txt", "x")]);
    let r1 = builder.commit(&[r0], &[rename("src/old.txt", "1", "lib/old.txt")]);
    let r2 = builder.commit(&[r0], &[write("lib/new.txt", "2")]);
    let mut repo = builder.build();
    checkout(&mut repo, r1);

    let settings = MergeSettings::default();
    let wctx = repo.working_snapshot();
    let result = manifest_merge(
        &wctx,
        &repo.snapshot(r2),
        &repo.snapshot(r0),
        true,
        false,
        None,
        false,
        true,
        false,
        None,
        &settings,
    )
    .unwrap();

    assert_eq!(result.actions.len(), 1);
    let planned = &result.actions[&repo_path("src/new.txt")];
    assert_eq!(planned.reason, "local directory rename - get from lib/new.txt");
    assert_matches!(
        &planned.action,
        Action::LocalDirRenameGet { from, .. } if from == &repo_path("lib/new.txt")
    );
}

#[test]
fn test_file_vs_directory_conflict_renames_local_file() {
    // The local side created file x, the remote side created x/y. The local
    // file moves to a safe name and x becomes a conflict slot.
    let mut builder = TestRepoBuilder::new();
    let r0 = builder.commit(&[], &[write("base.txt", "b")]);
    let r1 = builder.commit(&[r0], &[write("x", "a file")]);
    let r2 = builder.commit(&[r0], &[write("x/y", "sub")]);
    let mut repo = builder.build();
    checkout(&mut repo, r1);

    let settings = MergeSettings::default();
    let wctx = repo.working_snapshot();
    let result = manifest_merge(
        &wctx,
        &repo.snapshot(r2),
        &repo.snapshot(r0),
        true,
        false,
        None,
        false,
        true,
        false,
        None,
        &settings,
    )
    .unwrap();

    let conflict = &result.actions[&repo_path("x")];
    let rename_to = assert_matches!(
        &conflict.action,
        Action::PathConflict { rename_to, origin: ConflictOrigin::Local } => rename_to.clone()
    );
    assert!(rename_to.as_str().starts_with("x~"));
    let resolve = &result.actions[&rename_to];
    assert_matches!(
        &resolve.action,
        Action::PathConflictResolve { from, orig_from }
            if from == &repo_path("x") && orig_from == &repo_path("x")
    );
    // The incoming file is still fetched; nothing leaves both a file and a
    // directory at x.
    assert_eq!(result.actions[&repo_path("x/y")].action.kind(), ActionKind::Created);
}

#[test]
fn test_inconsistent_remote_manifest_aborts() {
    // The remote manifest names x both as a file and as a directory.
    let mut builder = TestRepoBuilder::new();
    let r0 = builder.commit(&[], &[write("base.txt", "b")]);
    let r1 = builder.commit(&[r0], &[write("x", "mine")]);
    let r2 = builder.commit(&[r0], &[write("x", "theirs"), write("x/y", "sub")]);
    let mut repo = builder.build();
    checkout(&mut repo, r1);

    let settings = MergeSettings::default();
    let wctx = repo.working_snapshot();
    let err = manifest_merge(
        &wctx,
        &repo.snapshot(r2),
        &repo.snapshot(r0),
        true,
        false,
        None,
        false,
        true,
        false,
        None,
        &settings,
    )
    .unwrap_err();
    assert_matches!(err, MergeError::InvalidRemoteManifest { paths } if paths == vec![repo_path("x")]);
}

#[test]
fn test_narrow_scope_drops_outside_changes_on_update() {
    let mut builder = TestRepoBuilder::new();
    let r0 = builder.commit(&[], &[write("inside/f", "1"), write("outside", "1")]);
    let r1 = builder.commit(&[r0], &[write("inside/f", "2")]);
    let r2 = builder.commit(&[r0], &[write("outside", "2")]);
    let mut repo = builder.build();
    checkout(&mut repo, r1);

    let settings = MergeSettings::default();
    let narrow = PrefixMatcher::new(["inside".to_string()]);
    let wctx = repo.working_snapshot();
    let result = manifest_merge(
        &wctx,
        &repo.snapshot(r2),
        &repo.snapshot(r0),
        false,
        false,
        None,
        false,
        false,
        false,
        Some(&narrow),
        &settings,
    )
    .unwrap();
    assert!(!result.actions.contains_key(&repo_path("outside")));
}

#[test]
fn test_narrow_scope_rejects_outside_changes_on_merge() {
    let mut builder = TestRepoBuilder::new();
    let r0 = builder.commit(&[], &[write("inside/f", "1"), write("outside", "1")]);
    let r1 = builder.commit(&[r0], &[write("inside/f", "2")]);
    let r2 = builder.commit(&[r0], &[write("outside", "2")]);
    let mut repo = builder.build();
    checkout(&mut repo, r1);

    let settings = MergeSettings::default();
    let narrow = PrefixMatcher::new(["inside".to_string()]);
    let wctx = repo.working_snapshot();
    let err = manifest_merge(
        &wctx,
        &repo.snapshot(r2),
        &repo.snapshot(r0),
        true,
        false,
        None,
        false,
        false,
        false,
        Some(&narrow),
        &settings,
    )
    .unwrap_err();
    assert_matches!(err, MergeError::OutsideNarrowScope { path } if path == repo_path("outside"));
}

#[test]
fn test_narrow_scope_rejects_outside_conflict() {
    let mut builder = TestRepoBuilder::new();
    let r0 = builder.commit(&[], &[write("inside/f", "1"), write("outside", "1")]);
    let r1 = builder.commit(&[r0], &[write("outside", "3")]);
    let r2 = builder.commit(&[r0], &[write("outside", "2")]);
    let mut repo = builder.build();
    checkout(&mut repo, r1);

    let settings = MergeSettings::default();
    let narrow = PrefixMatcher::new(["inside".to_string()]);
    let wctx = repo.working_snapshot();
    let err = manifest_merge(
        &wctx,
        &repo.snapshot(r2),
        &repo.snapshot(r0),
        true,
        false,
        None,
        false,
        false,
        false,
        Some(&narrow),
        &settings,
    )
    .unwrap_err();
    assert_matches!(err, MergeError::ConflictOutsideNarrowScope { path } if path == repo_path("outside"));
}
