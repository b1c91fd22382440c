use std::{
    env,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::repository::Revnum;
use crate::Result;

/// Expand tilde (~) in path to user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Some(s) = path.to_str() {
        if let Some(stripped) = s.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(stripped);
            }
        } else if s == "~" {
            if let Some(home) = dirs::home_dir() {
                return home;
            }
        }
    }
    path.to_path_buf()
}

/// Options every repository is constructed with. Immutable once the run
/// starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportOptions {
    /// Directory holding the repositories and their logs
    pub output_dir: PathBuf,
    /// Git executable used for `init` and `fast-import`
    pub git: PathBuf,
    pub dry_run: bool,
    /// Append `svn path=...; revision=...` to commit messages
    pub add_metadata: bool,
    /// Attach the same trailer as a note on `refs/notes/commits`
    pub add_metadata_notes: bool,
    /// Checkpoint every this many commits per repository (0 disables)
    pub commit_interval: u64,
    pub max_processes: usize,
    /// Branch state was rebuilt from a previous run
    pub incremental: bool,
    /// Branch that is never deleted
    pub default_branch: String,
    /// Prefix of the submodule URLs written to `.gitmodules`
    pub submodule_url_base: String,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            git: defaults::default_git(),
            dry_run: false,
            add_metadata: false,
            add_metadata_notes: false,
            commit_interval: defaults::default_commit_interval(),
            max_processes: defaults::default_max_processes(),
            incremental: false,
            default_branch: defaults::default_branch(),
            submodule_url_base: String::new(),
        }
    }
}

/// Defaults a rules file may set; command line flags take precedence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleOptions {
    pub output_dir: Option<PathBuf>,
    pub commit_interval: Option<u64>,
    pub max_processes: Option<usize>,
    pub default_branch: Option<String>,
    pub submodule_url_base: Option<String>,
    #[serde(default)]
    pub add_metadata: bool,
    #[serde(default)]
    pub add_metadata_notes: bool,
}

/// A ref a repository is expected to have, with the revisions it may change
/// in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RefRule {
    #[serde(rename = "ref")]
    pub name: String,
    #[serde(default = "defaults::default_min")]
    pub min: Revnum,
    pub max: Option<Revnum>,
}

/// Destination repository declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepositoryRule {
    pub name: String,
    #[serde(default)]
    pub branches: Vec<RefRule>,
    #[serde(default)]
    pub tags: Vec<RefRule>,
    /// Repository this one is mounted in as a submodule
    pub submodule_of: Option<String>,
    /// Mount path inside `submodule_of`
    pub submodule_path: Option<String>,
}

impl RepositoryRule {
    /// Mount path, defaulting to the repository name.
    pub fn mount_path(&self) -> &str {
        self.submodule_path.as_deref().unwrap_or(&self.name)
    }
}

/// Contents of a rules file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RulesConfig {
    #[serde(default)]
    pub options: RuleOptions,
    #[serde(default)]
    pub repositories: Vec<RepositoryRule>,
}

impl RulesConfig {
    /// Load rules from a YAML file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let path = expand_tilde(path);
        tracing::debug!("loading rules from {:?}", path);
        let content = std::fs::read_to_string(&path)?;
        let mut config: RulesConfig = serde_yaml::from_str(&content)?;

        if let Some(dir) = config.options.output_dir.as_ref() {
            config.options.output_dir = Some(expand_tilde(dir));
        }
        Ok(config)
    }
}

impl RuleOptions {
    /// Fill the fields left unset in `self` from `fallback`. Flags are on
    /// when either side turns them on.
    pub fn or(self, fallback: &RuleOptions) -> RuleOptions {
        RuleOptions {
            output_dir: self.output_dir.or_else(|| fallback.output_dir.clone()),
            commit_interval: self.commit_interval.or(fallback.commit_interval),
            max_processes: self.max_processes.or(fallback.max_processes),
            default_branch: self.default_branch.or_else(|| fallback.default_branch.clone()),
            submodule_url_base: self
                .submodule_url_base
                .or_else(|| fallback.submodule_url_base.clone()),
            add_metadata: self.add_metadata || fallback.add_metadata,
            add_metadata_notes: self.add_metadata_notes || fallback.add_metadata_notes,
        }
    }

    /// Override `options` with every field that is set.
    pub fn apply_to(&self, options: &mut ImportOptions) {
        if let Some(dir) = &self.output_dir {
            options.output_dir = dir.clone();
        }
        if let Some(interval) = self.commit_interval {
            options.commit_interval = interval;
        }
        if let Some(max) = self.max_processes {
            options.max_processes = max;
        }
        if let Some(branch) = &self.default_branch {
            options.default_branch = branch.clone();
        }
        if let Some(base) = &self.submodule_url_base {
            options.submodule_url_base = base.clone();
        }
        options.add_metadata |= self.add_metadata;
        options.add_metadata_notes |= self.add_metadata_notes;
    }
}

/// The git executable: `SVN_GIT_EMIT_GIT` if set, else `git` from `PATH`.
pub fn git_executable() -> PathBuf {
    match env::var_os("SVN_GIT_EMIT_GIT") {
        Some(path) if !path.is_empty() => expand_tilde(Path::new(&path)),
        _ => PathBuf::from("git"),
    }
}

mod defaults {
    use std::path::PathBuf;

    use crate::repository::Revnum;

    pub(crate) fn default_git() -> PathBuf {
        super::git_executable()
    }

    pub(crate) fn default_commit_interval() -> u64 {
        10000
    }

    pub(crate) fn default_max_processes() -> usize {
        100
    }

    pub(crate) fn default_branch() -> String {
        "refs/heads/master".to_string()
    }

    pub(crate) fn default_min() -> Revnum {
        1
    }
}
