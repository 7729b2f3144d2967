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

//! Iterative graph-walking helpers for the commit and file-ancestry DAGs.

#![allow(missing_docs)]

use std::collections::HashSet;
use std::hash::Hash;
use std::iter;

/// Depth-first walk from `start`, yielding each node once.
pub fn dfs<T, ID, II, NI>(
    start: II,
    id_fn: impl Fn(&T) -> ID,
    mut neighbors_fn: impl FnMut(&T) -> NI,
) -> impl Iterator<Item = T>
where
    ID: Hash + Eq,
    II: IntoIterator<Item = T>,
    NI: IntoIterator<Item = T>,
{
    let mut pending: Vec<T> = start.into_iter().collect();
    let mut seen: HashSet<ID> = HashSet::new();
    iter::from_fn(move || {
        while let Some(node) = pending.pop() {
            if !seen.insert(id_fn(&node)) {
                continue;
            }
            pending.extend(neighbors_fn(&node));
            return Some(node);
        }
        None
    })
}
