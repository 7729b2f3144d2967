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

use std::fs;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use testutils::{new_temp_dir, repo_path, write, TestRepoBuilder};
use treemerge_lib::filemerge::{MergeOutcome, SimpleMergeTool};
use treemerge_lib::manifest::FileFlag;
use treemerge_lib::mergestate::{
    ConflictOrigin, FileConflictState, MergeState, MergeStateEntry, MergeStateError, QueuedAction,
};
use treemerge_lib::store::NodeId;
use treemerge_lib::working_copy::WorkingCopy;

#[test]
fn test_state_roundtrip_across_encodings() {
    let temp_dir = new_temp_dir();
    let state_dir = temp_dir.path().join("merge");
    let local = NodeId::from_bytes(&[1; 20]);
    let other = NodeId::from_bytes(&[2; 20]);
    let ancestor_node = NodeId::from_bytes(&[3; 20]);
    let other_node = NodeId::from_bytes(&[4; 20]);
    let ancestor_commit = NodeId::from_bytes(&[5; 20]);

    let mut ms = MergeState::clean(
        state_dir.clone(),
        local.clone(),
        other.clone(),
        Some(vec!["working copy".to_string(), "merge rev".to_string()]),
        None,
    )
    .unwrap();
    ms.add(
        &repo_path("dir/conflicted"),
        &repo_path("dir/conflicted"),
        Some((b"local contents", FileFlag::Executable)),
        &repo_path("dir/conflicted"),
        Some(&other_node),
        &repo_path("dir/conflicted"),
        Some(&ancestor_node),
        Some(&ancestor_commit),
    )
    .unwrap();
    ms.add_path_conflict(&repo_path("x"), &repo_path("x~123abc"), ConflictOrigin::Remote);
    ms.add_merged_other(&repo_path("taken"));
    ms.commit().unwrap();
    assert!(state_dir.join("state").is_file());
    assert!(state_dir.join("state2").is_file());

    let mut read = MergeState::read(state_dir, None).unwrap();
    assert!(read.is_active());
    assert_eq!(read.local(), Some(&local));
    assert_eq!(read.other(), Some(&other));
    assert_eq!(
        read.labels(),
        Some(&["working copy".to_string(), "merge rev".to_string()][..])
    );
    assert_eq!(read.unresolved_count(), 2);
    assert_matches!(
        read.entry(&repo_path("dir/conflicted")),
        Some(MergeStateEntry::File {
            state: FileConflictState::Unresolved,
            flags: FileFlag::Executable,
            ..
        })
    );
    assert_matches!(
        read.entry(&repo_path("x")),
        Some(MergeStateEntry::PathConflict {
            state: FileConflictState::UnresolvedPath,
            rename_to,
            origin: ConflictOrigin::Remote,
        }) if rename_to == &repo_path("x~123abc")
    );
    assert_matches!(read.entry(&repo_path("taken")), Some(MergeStateEntry::MergedOther));
    assert_eq!(
        read.extras(&repo_path("dir/conflicted")).get("ancestorlinknode"),
        Some(&ancestor_commit.hex())
    );
}

#[test]
fn test_legacy_encoding_newer_than_typed_wins() {
    let temp_dir = new_temp_dir();
    let state_dir = temp_dir.path().join("merge");
    let local = NodeId::from_bytes(&[1; 20]);
    let other = NodeId::from_bytes(&[2; 20]);
    let mut ms =
        MergeState::clean(state_dir.clone(), local.clone(), other, None, None).unwrap();
    ms.add(
        &repo_path("f"),
        &repo_path("f"),
        Some((b"local", FileFlag::Normal)),
        &repo_path("f"),
        Some(&NodeId::from_bytes(&[4; 20])),
        &repo_path("f"),
        Some(&NodeId::from_bytes(&[3; 20])),
        None,
    )
    .unwrap();
    ms.commit().unwrap();

    // An old release resolved the file and rewrote only the legacy file.
    let v1_path = state_dir.join("state");
    let data = fs::read_to_string(&v1_path).unwrap();
    let data = data.replacen("\0u\0", "\0r\0", 1);
    fs::write(&v1_path, data).unwrap();

    let fallback = NodeId::from_bytes(&[9; 20]);
    let read = MergeState::read(state_dir, Some(fallback.clone())).unwrap();
    assert_eq!(read.state_of(&repo_path("f")), Some(FileConflictState::Resolved));
    assert_eq!(read.local(), Some(&local));
    // The legacy encoding cannot name the other side; it is backfilled from
    // the working copy's second parent.
    assert_eq!(read.other(), Some(&fallback));
}

#[test]
fn test_unknown_advisory_record_is_ignored() {
    let temp_dir = new_temp_dir();
    let state_dir = temp_dir.path().join("merge");
    fs::create_dir(&state_dir).unwrap();
    let local_hex = NodeId::from_bytes(&[1; 20]).hex();
    let mut data = vec![b'L'];
    data.extend((local_hex.len() as u32).to_be_bytes());
    data.extend(local_hex.as_bytes());
    data.push(b'z');
    data.extend(4u32.to_be_bytes());
    data.extend(b"meta");
    fs::write(state_dir.join("state2"), &data).unwrap();

    let ms = MergeState::read(state_dir, None).unwrap();
    assert!(ms.is_active());
}

#[test]
fn test_unknown_mandatory_record_is_refused() {
    let temp_dir = new_temp_dir();
    let state_dir = temp_dir.path().join("merge");
    fs::create_dir(&state_dir).unwrap();
    let local_hex = NodeId::from_bytes(&[1; 20]).hex();
    let mut data = vec![b'L'];
    data.extend((local_hex.len() as u32).to_be_bytes());
    data.extend(local_hex.as_bytes());
    data.push(b'X');
    data.extend(4u32.to_be_bytes());
    data.extend(b"data");
    fs::write(state_dir.join("state2"), &data).unwrap();

    let err = MergeState::read(state_dir, None).unwrap_err();
    assert_matches!(err, MergeStateError::UnsupportedRecords(types) if types == vec!['X']);
}

#[test]
fn test_preresolve_takes_other_and_is_idempotent() {
    let mut builder = TestRepoBuilder::new();
    let r0 = builder.commit(&[], &[write("f", "base")]);
    let r1 = builder.commit(&[r0], &[write("f", "theirs")]);
    let repo = builder.build();

    let wc_dir = new_temp_dir();
    let wc = WorkingCopy::new(wc_dir.path().to_path_buf());
    let state_dir = new_temp_dir();
    let f = repo_path("f");
    let other_node = repo.snapshot(r1).file_entry(&f).unwrap().node.clone();
    let ancestor_node = repo.snapshot(r0).file_entry(&f).unwrap().node.clone();
    let mut ms = MergeState::clean(
        state_dir.path().join("merge"),
        repo.snapshot(r0).node(),
        repo.snapshot(r1).node(),
        None,
        None,
    )
    .unwrap();
    ms.add(
        &f,
        &f,
        Some((b"base", FileFlag::Normal)),
        &f,
        Some(&other_node),
        &f,
        Some(&ancestor_node),
        Some(&repo.snapshot(r0).node()),
    )
    .unwrap();

    let (complete, outcome) = ms.preresolve(&f, &wc, &repo, &SimpleMergeTool).unwrap();
    assert!(complete);
    assert_eq!(outcome, MergeOutcome::Resolved);
    assert_eq!(wc.read(&f).unwrap(), b"theirs");
    assert_eq!(ms.state_of(&f), Some(FileConflictState::Resolved));
    assert_eq!(ms.counts(), (0, 1, 0));

    // Resolving an already resolved path succeeds without touching the
    // working tree.
    wc.write(&f, b"user edit", FileFlag::Normal, false).unwrap();
    let (complete, outcome) = ms.preresolve(&f, &wc, &repo, &SimpleMergeTool).unwrap();
    assert!(complete);
    assert_eq!(outcome, MergeOutcome::Resolved);
    assert_eq!(wc.read(&f).unwrap(), b"user edit");
}

#[test]
fn test_preresolve_drops_entry_when_contents_identical() {
    let mut builder = TestRepoBuilder::new();
    let r0 = builder.commit(&[], &[write("f", "old")]);
    let r1 = builder.commit(&[r0], &[write("f", "same")]);
    let repo = builder.build();

    let wc_dir = new_temp_dir();
    let wc = WorkingCopy::new(wc_dir.path().to_path_buf());
    let state_dir = new_temp_dir();
    let f = repo_path("f");
    let other_node = repo.snapshot(r1).file_entry(&f).unwrap().node.clone();
    let ancestor_node = repo.snapshot(r0).file_entry(&f).unwrap().node.clone();
    let mut ms = MergeState::clean(
        state_dir.path().join("merge"),
        repo.snapshot(r0).node(),
        repo.snapshot(r1).node(),
        None,
        None,
    )
    .unwrap();
    ms.add(
        &f,
        &f,
        Some((b"same", FileFlag::Normal)),
        &f,
        Some(&other_node),
        &f,
        Some(&ancestor_node),
        None,
    )
    .unwrap();

    let (complete, outcome) = ms.preresolve(&f, &wc, &repo, &SimpleMergeTool).unwrap();
    assert!(complete);
    assert_eq!(outcome, MergeOutcome::Identical);
    assert!(!ms.contains(&f));
    assert_eq!(ms.counts(), (1, 0, 0));
}

#[test]
fn test_unresolved_conflict_survives_premerge_and_merge() {
    let mut builder = TestRepoBuilder::new();
    let r0 = builder.commit(&[], &[write("f", "base\n")]);
    let r1 = builder.commit(&[r0], &[write("f", "theirs\n")]);
    let repo = builder.build();

    let wc_dir = new_temp_dir();
    let wc = WorkingCopy::new(wc_dir.path().to_path_buf());
    let state_dir = new_temp_dir();
    let f = repo_path("f");
    let other_node = repo.snapshot(r1).file_entry(&f).unwrap().node.clone();
    let ancestor_node = repo.snapshot(r0).file_entry(&f).unwrap().node.clone();
    let mut ms = MergeState::clean(
        state_dir.path().join("merge"),
        repo.snapshot(r0).node(),
        repo.snapshot(r1).node(),
        Some(vec!["working copy".to_string(), "merge rev".to_string()]),
        None,
    )
    .unwrap();
    ms.add(
        &f,
        &f,
        Some((b"mine\n", FileFlag::Normal)),
        &f,
        Some(&other_node),
        &f,
        Some(&ancestor_node),
        None,
    )
    .unwrap();

    let (complete, _) = ms.preresolve(&f, &wc, &repo, &SimpleMergeTool).unwrap();
    assert!(!complete);
    let outcome = ms.resolve(&f, &wc, &repo, &SimpleMergeTool).unwrap();
    assert_eq!(outcome, MergeOutcome::Unresolved);
    assert_eq!(ms.unresolved_count(), 1);
    let text = String::from_utf8(wc.read(&f).unwrap()).unwrap();
    assert!(text.contains("<<<<<<< working copy"));
    assert!(text.contains(">>>>>>> merge rev"));
}

#[test]
fn test_changed_driver_is_rejected() {
    let temp_dir = new_temp_dir();
    let ms = MergeState::clean(
        temp_dir.path().join("merge"),
        NodeId::from_bytes(&[1; 20]),
        NodeId::from_bytes(&[2; 20]),
        None,
        Some("generated-files".to_string()),
    )
    .unwrap();
    assert!(ms.check_driver(Some("generated-files")).is_ok());
    assert_matches!(
        ms.check_driver(Some("other-driver")),
        Err(MergeStateError::DriverChanged { .. })
    );
    assert_matches!(ms.check_driver(None), Err(MergeStateError::DriverChanged { .. }));
}

#[test]
fn test_queued_actions_are_grouped() {
    let temp_dir = new_temp_dir();
    let mut ms = MergeState::clean(
        temp_dir.path().join("merge"),
        NodeId::from_bytes(&[1; 20]),
        NodeId::from_bytes(&[2; 20]),
        None,
        None,
    )
    .unwrap();
    ms.queue_remove(&repo_path("gone"));
    ms.queue_add(&repo_path("kept"));
    ms.queue_get(&repo_path("fetched"));

    let actions = ms.actions();
    assert_eq!(actions[&QueuedAction::Remove], vec![repo_path("gone")]);
    assert_eq!(actions[&QueuedAction::Add], vec![repo_path("kept")]);
    assert_eq!(actions[&QueuedAction::Get], vec![repo_path("fetched")]);
}

#[test]
fn test_reset_clears_state_on_disk() {
    let temp_dir = new_temp_dir();
    let state_dir = temp_dir.path().join("merge");
    let mut ms = MergeState::clean(
        state_dir.clone(),
        NodeId::from_bytes(&[1; 20]),
        NodeId::from_bytes(&[2; 20]),
        None,
        None,
    )
    .unwrap();
    ms.add_merged_other(&repo_path("f"));
    ms.commit().unwrap();
    assert!(state_dir.exists());

    ms.reset().unwrap();
    assert!(!state_dir.exists());
    assert!(!ms.is_active());
}
