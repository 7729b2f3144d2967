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

#![allow(missing_docs)]

use std::collections::HashSet;
use std::fmt::Debug;

use crate::repo_path::RepoPath;

/// Filters the set of paths an operation looks at.
pub trait Matcher: Debug + Sync {
    fn matches(&self, path: &RepoPath) -> bool;

    /// Whether this matcher matches every path. Lets callers skip filtering
    /// entirely.
    fn always(&self) -> bool {
        false
    }
}

impl<M: Matcher + ?Sized> Matcher for &M {
    fn matches(&self, path: &RepoPath) -> bool {
        (**self).matches(path)
    }

    fn always(&self) -> bool {
        (**self).always()
    }
}

impl<M: Matcher + ?Sized> Matcher for Box<M> {
    fn matches(&self, path: &RepoPath) -> bool {
        (**self).matches(path)
    }

    fn always(&self) -> bool {
        (**self).always()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EverythingMatcher;

impl Matcher for EverythingMatcher {
    fn matches(&self, _path: &RepoPath) -> bool {
        true
    }

    fn always(&self) -> bool {
        true
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilesMatcher {
    files: HashSet<RepoPath>,
}

impl FilesMatcher {
    pub fn new(files: impl IntoIterator<Item = RepoPath>) -> Self {
        FilesMatcher {
            files: files.into_iter().collect(),
        }
    }
}

impl Matcher for FilesMatcher {
    fn matches(&self, path: &RepoPath) -> bool {
        self.files.contains(path)
    }
}

/// Matches a set of directory prefixes (and everything under them).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrefixMatcher {
    dirs: Vec<String>,
}

impl PrefixMatcher {
    pub fn new(dirs: impl IntoIterator<Item = String>) -> Self {
        PrefixMatcher {
            dirs: dirs.into_iter().collect(),
        }
    }
}

impl Matcher for PrefixMatcher {
    fn matches(&self, path: &RepoPath) -> bool {
        self.dirs
            .iter()
            .any(|dir| path.as_str() == dir || path.starts_with_dir(dir))
    }
}

#[derive(Clone, Debug)]
pub struct IntersectionMatcher<M1: Matcher, M2: Matcher> {
    input1: M1,
    input2: M2,
}

impl<M1: Matcher, M2: Matcher> IntersectionMatcher<M1, M2> {
    pub fn new(input1: M1, input2: M2) -> Self {
        IntersectionMatcher { input1, input2 }
    }
}

impl<M1: Matcher, M2: Matcher> Matcher for IntersectionMatcher<M1, M2> {
    fn matches(&self, path: &RepoPath) -> bool {
        self.input1.matches(path) && self.input2.matches(path)
    }

    fn always(&self) -> bool {
        self.input1.always() && self.input2.always()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo_path(value: &str) -> RepoPath {
        RepoPath::from_internal_string(value)
    }

    #[test]
    fn test_everything_matcher() {
        let m = EverythingMatcher;
        assert!(m.always());
        assert!(m.matches(&repo_path("file")));
        assert!(m.matches(&repo_path("dir/file")));
    }

    #[test]
    fn test_files_matcher() {
        let m = FilesMatcher::new([repo_path("dir/file")]);
        assert!(!m.always());
        assert!(m.matches(&repo_path("dir/file")));
        assert!(!m.matches(&repo_path("dir")));
        assert!(!m.matches(&repo_path("dir/file2")));
    }

    #[test]
    fn test_prefix_matcher() {
        let m = PrefixMatcher::new(["dir".to_string()]);
        assert!(m.matches(&repo_path("dir")));
        assert!(m.matches(&repo_path("dir/sub/file")));
        assert!(!m.matches(&repo_path("dir2/file")));
    }

    #[test]
    fn test_intersection_matcher() {
        let m = IntersectionMatcher::new(
            PrefixMatcher::new(["dir".to_string()]),
            FilesMatcher::new([repo_path("dir/file"), repo_path("other")]),
        );
        assert!(m.matches(&repo_path("dir/file")));
        assert!(!m.matches(&repo_path("other")));
        assert!(!m.matches(&repo_path("dir/file2")));
    }
}
