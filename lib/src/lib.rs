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

//! Treemerge version control system: the manifest merge engine.

#![warn(missing_docs)]
#![deny(unused_must_use)]
#![forbid(unsafe_code)]

pub mod apply;
pub mod copies;
pub mod dag_walk;
pub mod file_util;
pub mod filemerge;
pub mod manifest;
pub mod matchers;
pub mod merge;
pub mod mergestate;
pub mod repo;
pub mod repo_path;
pub mod settings;
pub mod store;
pub mod update;
pub mod working_copy;
