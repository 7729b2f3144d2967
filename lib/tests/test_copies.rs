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

use itertools::Itertools;
use maplit::hashmap;
use testutils::{checkout, copy, remove, rename, repo_path, write, TestRepoBuilder, TestTracker};
use treemerge_lib::copies::{duplicate_copies, merge_copies, path_copies};
use treemerge_lib::manifest::{FileFlag, ManifestEntry};
use treemerge_lib::matchers::EverythingMatcher;
use treemerge_lib::settings::{CopyTraceMode, MergeSettings};
use treemerge_lib::store::NodeId;

#[test]
fn test_path_copies_same_revision_is_empty() {
    let mut builder = TestRepoBuilder::new();
    let r0 = builder.commit(&[], &[write("a", "v1")]);
    let r1 = builder.commit(&[r0], &[rename("b", "v1", "a")]);
    let repo = builder.build();

    let settings = MergeSettings::default();
    let s1 = repo.snapshot(r1);
    assert!(path_copies(&s1, &s1, &EverythingMatcher, &settings).unwrap().is_empty());
}

#[test]
fn test_path_copies_forward_rename() {
    let mut builder = TestRepoBuilder::new();
    let r0 = builder.commit(&[], &[write("a", "v1"), write("other", "x")]);
    let r1 = builder.commit(&[r0], &[rename("b", "v1", "a")]);
    let repo = builder.build();

    let settings = MergeSettings::default();
    let copies =
        path_copies(&repo.snapshot(r0), &repo.snapshot(r1), &EverythingMatcher, &settings).unwrap();
    assert_eq!(copies, hashmap! { repo_path("b") => repo_path("a") });
}

#[test]
fn test_path_copies_backward_inverts_renames() {
    let mut builder = TestRepoBuilder::new();
    let r0 = builder.commit(&[], &[write("a", "v1")]);
    let r1 = builder.commit(&[r0], &[rename("b", "v1", "a")]);
    let repo = builder.build();

    let settings = MergeSettings::default();
    let copies =
        path_copies(&repo.snapshot(r1), &repo.snapshot(r0), &EverythingMatcher, &settings).unwrap();
    assert_eq!(copies, hashmap! { repo_path("a") => repo_path("b") });
}

#[test]
fn test_path_copies_backward_drops_copies() {
    // A copy leaves its source in place; walking backward it is not a
    // deletion and must not be reported.
    let mut builder = TestRepoBuilder::new();
    let r0 = builder.commit(&[], &[write("a", "v1")]);
    let r1 = builder.commit(&[r0], &[copy("b", "v1", "a")]);
    let repo = builder.build();

    let settings = MergeSettings::default();
    let forward =
        path_copies(&repo.snapshot(r0), &repo.snapshot(r1), &EverythingMatcher, &settings).unwrap();
    assert_eq!(forward, hashmap! { repo_path("b") => repo_path("a") });
    let backward =
        path_copies(&repo.snapshot(r1), &repo.snapshot(r0), &EverythingMatcher, &settings).unwrap();
    assert!(backward.is_empty());
}

#[test]
fn test_path_copies_across_branches() {
    // x renamed a to b; y (a sibling) still has a. Chaining backward to the
    // fork point and forward again correlates a@y with b@x.
    let mut builder = TestRepoBuilder::new();
    let r0 = builder.commit(&[], &[write("a", "v1")]);
    let r1 = builder.commit(&[r0], &[rename("b", "v1", "a")]);
    let r2 = builder.commit(&[r0], &[write("a", "v2")]);
    let repo = builder.build();

    let settings = MergeSettings::default();
    let copies =
        path_copies(&repo.snapshot(r1), &repo.snapshot(r2), &EverythingMatcher, &settings).unwrap();
    assert_eq!(copies, hashmap! { repo_path("a") => repo_path("b") });
}

#[test]
fn test_path_copies_from_working_records() {
    // Parent-to-working-copy comparisons only need the pending records.
    let mut builder = TestRepoBuilder::new();
    let r0 = builder.commit(&[], &[write("a", "v1")]);
    let mut repo = builder.build();
    checkout(&mut repo, r0);
    repo.working_mut().manifest.insert(
        repo_path("b"),
        ManifestEntry::new(NodeId::working_added(), FileFlag::Normal),
    );
    repo.working_mut().copies.insert(repo_path("b"), repo_path("a"));

    let settings = MergeSettings::default();
    let parent = repo.snapshot(r0);
    let wctx = repo.working_snapshot();
    let copies = path_copies(&parent, &wctx, &EverythingMatcher, &settings).unwrap();
    assert_eq!(copies, hashmap! { repo_path("b") => repo_path("a") });
}

#[test]
fn test_copy_tracing_off_disables_everything() {
    let mut builder = TestRepoBuilder::new();
    let r0 = builder.commit(&[], &[write("a", "v1")]);
    let r1 = builder.commit(&[r0], &[rename("b", "v1", "a")]);
    let r2 = builder.commit(&[r0], &[write("a", "v2")]);
    let repo = builder.build();

    let config = config::Config::builder()
        .set_override("merge.copy-trace", "off")
        .unwrap()
        .build()
        .unwrap();
    let settings = MergeSettings::from_config(&config).unwrap();
    assert_eq!(settings.copy_trace, CopyTraceMode::Off);

    let copies =
        path_copies(&repo.snapshot(r0), &repo.snapshot(r1), &EverythingMatcher, &settings).unwrap();
    assert!(copies.is_empty());

    let (branch1, branch2, diverge) =
        merge_copies(&repo.snapshot(r1), &repo.snapshot(r2), &repo.snapshot(r0), &settings)
            .unwrap();
    assert!(branch1.copy.is_empty());
    assert!(branch1.rename_delete.is_empty());
    assert!(branch2.copy.is_empty());
    assert!(diverge.is_empty());
}

#[test]
fn test_merge_copies_offers_rename_against_edited_source() {
    let mut builder = TestRepoBuilder::new();
    let r0 = builder.commit(&[], &[write("a", "v1")]);
    let r1 = builder.commit(&[r0], &[rename("b", "v1", "a")]);
    let r2 = builder.commit(&[r0], &[write("a", "v2")]);
    let repo = builder.build();

    let settings = MergeSettings::default();
    let (branch1, branch2, diverge) =
        merge_copies(&repo.snapshot(r1), &repo.snapshot(r2), &repo.snapshot(r0), &settings)
            .unwrap();
    assert_eq!(branch1.copy, hashmap! { repo_path("b") => repo_path("a") });
    assert!(branch2.copy.is_empty());
    assert!(diverge.is_empty());
}

#[test]
fn test_merge_copies_reports_divergent_renames() {
    let mut builder = TestRepoBuilder::new();
    let r0 = builder.commit(&[], &[write("a", "v1")]);
    let r1 = builder.commit(&[r0], &[rename("b", "v1", "a")]);
    let r2 = builder.commit(&[r0], &[rename("c", "v1", "a")]);
    let repo = builder.build();

    let settings = MergeSettings::default();
    let (branch1, branch2, diverge) =
        merge_copies(&repo.snapshot(r1), &repo.snapshot(r2), &repo.snapshot(r0), &settings)
            .unwrap();
    assert!(branch1.copy.is_empty());
    assert!(branch2.copy.is_empty());
    assert_eq!(
        diverge.get(&repo_path("a")).map(|dsts| dsts.iter().sorted().collect_vec()),
        Some(vec![&repo_path("b"), &repo_path("c")])
    );
}

#[test]
fn test_merge_copies_reports_rename_and_delete() {
    let mut builder = TestRepoBuilder::new();
    let r0 = builder.commit(&[], &[write("a", "v1"), write("keep", "k")]);
    let r1 = builder.commit(&[r0], &[rename("b", "v1", "a")]);
    let r2 = builder.commit(&[r0], &[remove("a")]);
    let repo = builder.build();

    let settings = MergeSettings::default();
    let (branch1, _, _) =
        merge_copies(&repo.snapshot(r1), &repo.snapshot(r2), &repo.snapshot(r0), &settings)
            .unwrap();
    assert_eq!(
        branch1.rename_delete.get(&repo_path("a")),
        Some(&vec![repo_path("b")])
    );
}

#[test]
fn test_merge_copies_infers_directory_rename() {
    let mut builder = TestRepoBuilder::new();
    let r0 = builder.commit(&[], &[write("lib/old.txt", "1"), write("other.txt", "x")]);
    let r1 = builder.commit(&[r0], &[rename("src/old.txt", "1", "lib/old.txt")]);
    let r2 = builder.commit(&[r0], &[write("lib/new.txt", "2")]);
    let repo = builder.build();

    let settings = MergeSettings::default();
    let (branch1, branch2, _) =
        merge_copies(&repo.snapshot(r2), &repo.snapshot(r1), &repo.snapshot(r0), &settings)
            .unwrap();
    assert_eq!(
        branch2.dir_move,
        hashmap! { "lib".to_string() => "src".to_string() }
    );
    assert_eq!(
        branch1.move_with_dir,
        hashmap! { repo_path("lib/new.txt") => repo_path("src/new.txt") }
    );
}

#[test]
fn test_heuristic_tracing_matches_by_name() {
    let mut builder = TestRepoBuilder::new();
    let r0 = builder.commit(&[], &[write("a", "v1"), write("other", "x")]);
    let r1 = builder.commit(&[r0], &[rename("b", "v1", "a")]);
    let r2 = builder.commit(&[r0], &[write("a", "v2")]);
    let repo = builder.build();

    // source_commit_limit of zero forbids upgrading short histories back to
    // the full walk, so the heuristics actually run.
    let settings = MergeSettings {
        copy_trace: CopyTraceMode::Heuristics,
        source_commit_limit: 0,
        ..MergeSettings::default()
    };
    let (branch1, _, _) =
        merge_copies(&repo.snapshot(r1), &repo.snapshot(r2), &repo.snapshot(r0), &settings)
            .unwrap();
    assert_eq!(branch1.copy, hashmap! { repo_path("b") => repo_path("a") });
}

#[test]
fn test_heuristic_candidate_overflow_skips_file() {
    let mut builder = TestRepoBuilder::new();
    let r0 = builder.commit(&[], &[write("a", "v1"), write("other", "x")]);
    let r1 = builder.commit(&[r0], &[rename("b", "v1", "a")]);
    let r2 = builder.commit(&[r0], &[write("a", "v2")]);
    let repo = builder.build();

    let settings = MergeSettings {
        copy_trace: CopyTraceMode::Heuristics,
        source_commit_limit: 0,
        move_candidate_limit: 0,
        ..MergeSettings::default()
    };
    let (branch1, _, _) =
        merge_copies(&repo.snapshot(r1), &repo.snapshot(r2), &repo.snapshot(r0), &settings)
            .unwrap();
    assert!(branch1.copy.is_empty());
}

#[test]
fn test_duplicate_copies_replays_into_tracker() {
    let mut builder = TestRepoBuilder::new();
    let r0 = builder.commit(&[], &[write("a", "v1")]);
    let r1 = builder.commit(&[r0], &[rename("b", "v1", "a")]);
    let repo = builder.build();

    let settings = MergeSettings::default();
    let mut tracker = TestTracker::tracking(&repo, r1);
    duplicate_copies(&repo, &mut tracker, r1, r0, None, &settings).unwrap();
    assert_eq!(tracker.copies, vec![(repo_path("a"), repo_path("b"))]);
}
