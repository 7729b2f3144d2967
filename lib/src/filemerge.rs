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

//! The pluggable per-file merge capability.
//!
//! The actual text-merge algorithm is external; the engine only needs the
//! protocol: a cheap `premerge` pass that resolves the easy cases, and a
//! full `merge` pass for the rest. [`SimpleMergeTool`] implements the
//! trivial three-way rules so the engine is usable on its own.

#![allow(missing_docs)]

use thiserror::Error;

use crate::file_util::PathError;
use crate::manifest::FileFlag;
use crate::repo_path::RepoPath;
use crate::working_copy::WorkingCopy;

#[derive(Debug, Error)]
pub enum FileMergeError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("Merge tool failed for {path}: {message}", path = .path.as_str())]
    Tool { path: RepoPath, message: String },
}

/// What a merge pass concluded about one file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The two sides were already identical; nothing to record.
    Identical,
    /// Merged cleanly.
    Resolved,
    /// Conflicts remain for the user.
    Unresolved,
}

/// The result of one premerge/merge pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MergeVerdict {
    /// Whether the file still needs the full merge pass.
    pub complete: bool,
    pub outcome: MergeOutcome,
    /// Whether the surviving result is an absence.
    pub deleted: bool,
}

/// Labels rendered into conflict markers.
#[derive(Clone, Debug)]
pub struct MergeLabels {
    pub local: String,
    pub other: String,
    pub base: String,
}

impl Default for MergeLabels {
    fn default() -> Self {
        MergeLabels {
            local: "local".to_string(),
            other: "other".to_string(),
            base: "base".to_string(),
        }
    }
}

impl MergeLabels {
    pub fn from_list(labels: &[String]) -> Self {
        let default = MergeLabels::default();
        MergeLabels {
            local: labels.first().cloned().unwrap_or(default.local),
            other: labels.get(1).cloned().unwrap_or(default.other),
            base: labels.get(2).cloned().unwrap_or(default.base),
        }
    }

    pub fn to_list(&self) -> Vec<String> {
        vec![self.local.clone(), self.other.clone(), self.base.clone()]
    }
}

/// Everything a tool needs for one file: the destination path, the three
/// inputs (`None` meaning the side is absent), and the effective flags for
/// the result.
pub struct FileMergeInput<'a> {
    pub path: &'a RepoPath,
    pub local_path: &'a RepoPath,
    pub other_path: &'a RepoPath,
    pub local: Option<&'a [u8]>,
    pub other: Option<&'a [u8]>,
    pub ancestor: Option<&'a [u8]>,
    pub flags: FileFlag,
    pub labels: &'a MergeLabels,
}

/// A per-file merge implementation.
///
/// Both passes may rewrite the working-copy file at `input.path`; the saved
/// local content has already been restored there when they run.
pub trait FileMergeTool: Send + Sync {
    fn premerge(
        &self,
        wc: &WorkingCopy,
        input: &FileMergeInput<'_>,
    ) -> Result<MergeVerdict, FileMergeError>;

    fn merge(
        &self,
        wc: &WorkingCopy,
        input: &FileMergeInput<'_>,
    ) -> Result<MergeVerdict, FileMergeError>;
}

/// A driver that can resolve a whole class of files programmatically before
/// and after the per-file merges.
pub trait MergeDriver: Send + Sync {
    /// The configured name this driver answers to; persisted in the merge
    /// state so a changed configuration is detected.
    fn name(&self) -> &str;

    /// Runs before per-file merges. May mark files resolved in the merge
    /// state. Returning `false` stops the merge for this session.
    fn preprocess(
        &self,
        wc: &WorkingCopy,
        ms: &mut crate::mergestate::MergeState,
    ) -> Result<bool, FileMergeError>;

    /// Runs after all per-file merges succeeded.
    fn conclude(
        &self,
        wc: &WorkingCopy,
        ms: &mut crate::mergestate::MergeState,
    ) -> Result<bool, FileMergeError>;
}

/// The built-in tool: resolves trivial three-way cases, otherwise writes
/// conflict markers at merge time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SimpleMergeTool;

impl SimpleMergeTool {
    fn trivial(&self, input: &FileMergeInput<'_>) -> Option<MergeVerdict> {
        if input.local == input.other {
            return Some(MergeVerdict {
                complete: true,
                outcome: MergeOutcome::Identical,
                deleted: input.local.is_none(),
            });
        }
        None
    }

    fn markers(&self, input: &FileMergeInput<'_>) -> Vec<u8> {
        let mut out = vec![];
        out.extend_from_slice(format!("<<<<<<< {}\n", input.labels.local).as_bytes());
        out.extend_from_slice(input.local.unwrap_or_default());
        if let Some(ancestor) = input.ancestor {
            out.extend_from_slice(format!("||||||| {}\n", input.labels.base).as_bytes());
            out.extend_from_slice(ancestor);
        }
        out.extend_from_slice(b"=======\n");
        out.extend_from_slice(input.other.unwrap_or_default());
        out.extend_from_slice(format!(">>>>>>> {}\n", input.labels.other).as_bytes());
        out
    }
}

impl FileMergeTool for SimpleMergeTool {
    fn premerge(
        &self,
        wc: &WorkingCopy,
        input: &FileMergeInput<'_>,
    ) -> Result<MergeVerdict, FileMergeError> {
        if let Some(verdict) = self.trivial(input) {
            return Ok(verdict);
        }
        // One side absent is a change/delete conflict; leave it for the full
        // pass, which leaves it for the user.
        let (Some(local), Some(other)) = (input.local, input.other) else {
            return Ok(MergeVerdict {
                complete: false,
                outcome: MergeOutcome::Unresolved,
                deleted: false,
            });
        };
        if let Some(ancestor) = input.ancestor {
            if local == ancestor {
                // Local did not change: take the other side.
                wc.write(input.path, other, input.flags, false)?;
                return Ok(MergeVerdict {
                    complete: true,
                    outcome: MergeOutcome::Resolved,
                    deleted: false,
                });
            }
            if other == ancestor {
                // Other side did not change: the restored local content
                // already is the result.
                return Ok(MergeVerdict {
                    complete: true,
                    outcome: MergeOutcome::Resolved,
                    deleted: false,
                });
            }
        }
        Ok(MergeVerdict {
            complete: false,
            outcome: MergeOutcome::Unresolved,
            deleted: false,
        })
    }

    fn merge(
        &self,
        wc: &WorkingCopy,
        input: &FileMergeInput<'_>,
    ) -> Result<MergeVerdict, FileMergeError> {
        if let Some(verdict) = self.trivial(input) {
            return Ok(verdict);
        }
        if input.local.is_none() || input.other.is_none() {
            // Change/delete: keep whatever the working copy holds and
            // surface the conflict.
            return Ok(MergeVerdict {
                complete: true,
                outcome: MergeOutcome::Unresolved,
                deleted: false,
            });
        }
        wc.write(input.path, &self.markers(input), input.flags, false)?;
        Ok(MergeVerdict {
            complete: true,
            outcome: MergeOutcome::Unresolved,
            deleted: false,
        })
    }
}
