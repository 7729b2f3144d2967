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

//! Per-session merge configuration.

#![allow(missing_docs)]

use thiserror::Error;

/// How copy/rename correlations are traced across history.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CopyTraceMode {
    /// No tracing: every rename decomposes into an add and a delete.
    Off,
    /// Filename heuristics on merge-free linear history, falling back to
    /// full tracing.
    Heuristics,
    /// Exhaustive per-file history walk.
    #[default]
    Full,
}

/// What to do when an update would overwrite an untracked file that differs
/// from the incoming content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum UnknownFilePolicy {
    #[default]
    Abort,
    Warn,
    Ignore,
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Invalid value '{value}' for {key} (expected one of {expected})")]
    InvalidChoice {
        key: &'static str,
        value: String,
        expected: &'static str,
    },
    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

/// Immutable configuration for one merge session.
///
/// Constructed once and passed by reference; there is no ambient config
/// object.
#[derive(Clone, Debug)]
pub struct MergeSettings {
    pub copy_trace: CopyTraceMode,
    pub check_path_conflicts: bool,
    /// Cap on heuristic move-candidate sets; files exceeding it are skipped.
    pub move_candidate_limit: usize,
    /// Mutable-history length above which heuristics are not upgraded to a
    /// full trace.
    pub source_commit_limit: usize,
    pub check_unknown: UnknownFilePolicy,
    pub check_ignored: UnknownFilePolicy,
    /// Bid-merge across all common ancestor heads instead of picking one.
    pub prefer_all_ancestors: bool,
    pub atomic_file_writes: bool,
    pub abort_on_remove_error: bool,
    /// Estimated per-file cost of a bulk remove/get; zero disables the
    /// worker pool entirely.
    pub per_file_cost: f64,
    /// Total estimated cost above which bulk phases run on the worker pool.
    pub parallel_cost_threshold: f64,
    pub merge_driver: Option<String>,
    /// Whether the working-copy filesystem distinguishes case. When false,
    /// the provisional merged tree is checked for case-folding collisions.
    pub case_sensitive: bool,
}

impl Default for MergeSettings {
    fn default() -> Self {
        MergeSettings {
            copy_trace: CopyTraceMode::default(),
            check_path_conflicts: true,
            move_candidate_limit: 100,
            source_commit_limit: 100,
            check_unknown: UnknownFilePolicy::default(),
            check_ignored: UnknownFilePolicy::default(),
            prefer_all_ancestors: true,
            atomic_file_writes: false,
            abort_on_remove_error: false,
            per_file_cost: 0.001,
            parallel_cost_threshold: 0.05,
            merge_driver: None,
            case_sensitive: true,
        }
    }
}

fn get_choice<T>(
    config: &config::Config,
    key: &'static str,
    expected: &'static str,
    default: T,
    parse: impl FnOnce(&str) -> Option<T>,
) -> Result<T, SettingsError> {
    match config.get_string(key) {
        Ok(value) => parse(&value).ok_or(SettingsError::InvalidChoice {
            key,
            value,
            expected,
        }),
        Err(config::ConfigError::NotFound(_)) => Ok(default),
        Err(err) => Err(err.into()),
    }
}

fn get_bool(config: &config::Config, key: &str, default: bool) -> Result<bool, SettingsError> {
    match config.get_bool(key) {
        Ok(value) => Ok(value),
        Err(config::ConfigError::NotFound(_)) => Ok(default),
        Err(err) => Err(err.into()),
    }
}

fn get_usize(config: &config::Config, key: &str, default: usize) -> Result<usize, SettingsError> {
    match config.get_int(key) {
        Ok(value) => Ok(value.max(0) as usize),
        Err(config::ConfigError::NotFound(_)) => Ok(default),
        Err(err) => Err(err.into()),
    }
}

fn get_float(config: &config::Config, key: &str, default: f64) -> Result<f64, SettingsError> {
    match config.get_float(key) {
        Ok(value) => Ok(value),
        Err(config::ConfigError::NotFound(_)) => Ok(default),
        Err(err) => Err(err.into()),
    }
}

fn parse_unknown_policy(value: &str) -> Option<UnknownFilePolicy> {
    match value {
        "abort" => Some(UnknownFilePolicy::Abort),
        "warn" => Some(UnknownFilePolicy::Warn),
        "ignore" => Some(UnknownFilePolicy::Ignore),
        _ => None,
    }
}

impl MergeSettings {
    pub fn from_config(config: &config::Config) -> Result<Self, SettingsError> {
        let defaults = MergeSettings::default();
        let copy_trace = get_choice(
            config,
            "merge.copy-trace",
            "'off', 'heuristics', 'full'",
            defaults.copy_trace,
            |value| match value {
                "off" => Some(CopyTraceMode::Off),
                "heuristics" => Some(CopyTraceMode::Heuristics),
                "full" => Some(CopyTraceMode::Full),
                _ => None,
            },
        )?;
        let check_unknown = get_choice(
            config,
            "merge.check-unknown",
            "'abort', 'warn', 'ignore'",
            defaults.check_unknown,
            parse_unknown_policy,
        )?;
        let check_ignored = get_choice(
            config,
            "merge.check-ignored",
            "'abort', 'warn', 'ignore'",
            defaults.check_ignored,
            parse_unknown_policy,
        )?;
        let merge_driver = match config.get_string("merge.driver") {
            Ok(value) => Some(value),
            Err(config::ConfigError::NotFound(_)) => None,
            Err(err) => return Err(err.into()),
        };
        Ok(MergeSettings {
            copy_trace,
            check_path_conflicts: get_bool(
                config,
                "merge.check-path-conflicts",
                defaults.check_path_conflicts,
            )?,
            move_candidate_limit: get_usize(
                config,
                "merge.copy-trace.move-candidate-limit",
                defaults.move_candidate_limit,
            )?,
            source_commit_limit: get_usize(
                config,
                "merge.copy-trace.source-commit-limit",
                defaults.source_commit_limit,
            )?,
            check_unknown,
            check_ignored,
            prefer_all_ancestors: get_bool(
                config,
                "merge.prefer-all-ancestors",
                defaults.prefer_all_ancestors,
            )?,
            atomic_file_writes: get_bool(
                config,
                "merge.atomic-file-writes",
                defaults.atomic_file_writes,
            )?,
            abort_on_remove_error: get_bool(
                config,
                "merge.abort-on-remove-error",
                defaults.abort_on_remove_error,
            )?,
            per_file_cost: get_float(config, "merge.per-file-cost", defaults.per_file_cost)?,
            parallel_cost_threshold: get_float(
                config,
                "merge.parallel-cost-threshold",
                defaults.parallel_cost_threshold,
            )?,
            merge_driver,
            case_sensitive: get_bool(config, "merge.case-sensitive", defaults.case_sensitive)?,
        })
    }
}
