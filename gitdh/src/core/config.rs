//! Parsed deployment configuration and the per-branch rule projection.
//!
//! A [`Configuration`] is an ordered map of sections to key/value entries.
//! Three section names are reserved (`Git`, `Database`, `DEFAULT`); sections
//! named `<branch>-command` only contribute overrides to `<branch>`. Every
//! other section is a deployable branch, projected into a [`BranchRule`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::core::ini::parse_ini;
use crate::error::ConfigError;

pub const GIT_SECTION: &str = "Git";
pub const DATABASE_SECTION: &str = "Database";
pub const DEFAULT_SECTION: &str = "DEFAULT";
const RESERVED_SECTIONS: [&str; 3] = [GIT_SECTION, DATABASE_SECTION, DEFAULT_SECTION];
const OVERRIDE_SUFFIX: &str = "command";

pub const KEY_REPOSITORY_PATH: &str = "repositorypath";
pub const KEY_DATABASE_FILE: &str = "databasefile";
pub const KEY_COMMAND: &str = "command";
pub const KEY_PATH: &str = "path";
pub const KEY_TIMEOUT: &str = "timeout";
pub const KEY_INITIAL_DEPLOY: &str = "initialdeploy";
pub const KEY_ON_REWRITE: &str = "onrewrite";

pub const DEFAULT_TIMEOUT_SECS: u64 = 30 * 60;
/// State file placed in the repository when `Database` names none.
pub const DEFAULT_STATE_FILE: &str = "gitdh.state.json";

pub fn is_reserved_section(name: &str) -> bool {
    RESERVED_SECTIONS.contains(&name)
}

/// For `<branch>-command` returns `<branch>`.
pub fn override_target(name: &str) -> Option<&str> {
    let idx = name.rfind('-')?;
    (&name[idx + 1..] == OVERRIDE_SUFFIX).then(|| &name[..idx])
}

pub fn is_branch_section(name: &str) -> bool {
    !is_reserved_section(name) && override_target(name).is_none()
}

pub fn override_section_name(branch: &str) -> String {
    format!("{branch}-{OVERRIDE_SUFFIX}")
}

/// One `[name]` block with its entries in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    name: String,
    entries: Vec<(String, String)>,
}

impl Section {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Value stored directly in this section (no `DEFAULT` fallback).
    pub fn get(&self, key: &str) -> Option<&str> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn set(&mut self, key: &str, value: &str) {
        let key = key.to_ascii_lowercase();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.entries.push((key, value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration {
    origin: String,
    sections: Vec<Section>,
}

impl Configuration {
    pub fn parse(text: &str, origin: &str) -> Result<Self, ConfigError> {
        let mut config = parse_ini(text, origin)?;
        config.origin = origin.to_string();
        Ok(config)
    }

    /// Where this configuration was read from (for messages).
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter()
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Look up `key` in `section`, falling back to `DEFAULT`.
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        let own = self.section(section)?;
        own.get(key)
            .or_else(|| self.section(DEFAULT_SECTION).and_then(|d| d.get(key)))
    }

    /// Set `key` in `section`, creating the section at the end if needed.
    pub fn set(&mut self, section: &str, key: &str, value: &str) {
        if self.section(section).is_none() {
            self.add_section(section);
        }
        if let Some(own) = self.sections.iter_mut().find(|s| s.name == section) {
            own.set(key, value);
        }
    }

    pub(crate) fn add_section(&mut self, name: &str) {
        self.sections.push(Section::new(name));
    }

    pub(crate) fn append_value(&mut self, section: &str, key: &str, line: &str) {
        if let Some(own) = self.sections.iter_mut().find(|s| s.name == section)
            && let Some(entry) = own.entries.iter_mut().find(|(k, _)| k == key)
        {
            entry.1.push('\n');
            entry.1.push_str(line);
        }
    }

    pub fn repository_path(&self) -> Option<PathBuf> {
        self.get(GIT_SECTION, KEY_REPOSITORY_PATH)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
    }

    /// State file location: `Database.DatabaseFile`, else inside the repository.
    pub fn database_file(&self) -> Option<PathBuf> {
        let explicit = self
            .get(DATABASE_SECTION, KEY_DATABASE_FILE)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);
        explicit.or_else(|| {
            self.repository_path()
                .map(|repo| repo.join(DEFAULT_STATE_FILE))
        })
    }

    /// Deployable branch names in section order.
    pub fn branch_names(&self) -> impl Iterator<Item = &str> {
        self.sections
            .iter()
            .map(|s| s.name.as_str())
            .filter(|name| is_branch_section(name))
    }

    /// `DEFAULT` < `[branch]` < `[branch-command]`, later layers win.
    pub fn effective_settings(&self, branch: &str) -> BTreeMap<String, String> {
        let override_name = override_section_name(branch);
        let mut settings = BTreeMap::new();
        for name in [DEFAULT_SECTION, branch, override_name.as_str()] {
            if let Some(section) = self.section(name) {
                for (key, value) in section.entries() {
                    settings.insert(key.to_string(), value.to_string());
                }
            }
        }
        settings
    }

    /// Rule for `branch`, or `None` if it is not a configured branch.
    pub fn branch_rule(&self, branch: &str) -> Result<Option<BranchRule>, ConfigError> {
        if !is_branch_section(branch) || self.section(branch).is_none() {
            return Ok(None);
        }
        let repository = self
            .repository_path()
            .ok_or_else(|| ConfigError::MissingRepositoryPath {
                origin: self.origin.clone(),
            })?;
        BranchRule::from_settings(branch, self.effective_settings(branch), &repository).map(Some)
    }

    pub fn branch_rules(&self) -> Result<Vec<BranchRule>, ConfigError> {
        let mut rules = Vec::new();
        for branch in self.branch_names() {
            if let Some(rule) = self.branch_rule(branch)? {
                rules.push(rule);
            }
        }
        Ok(rules)
    }
}

/// What to do for a branch that has never been deployed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitialDeploy {
    /// Deploy the current tip.
    #[default]
    Deploy,
    /// Record the current tip as a baseline without running commands.
    Skip,
}

/// What to do when the new revision does not descend from the old one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RewritePolicy {
    /// Deploy and flag the transition in the report.
    #[default]
    Deploy,
    /// Do not deploy; record a refused attempt (counts as a failure).
    Refuse,
}

/// Read-only view of one deployable branch section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchRule {
    pub branch: String,
    pub commands: Vec<String>,
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub initial_deploy: InitialDeploy,
    pub on_rewrite: RewritePolicy,
    /// Effective settings after merging `DEFAULT` and `<branch>-command`.
    pub settings: BTreeMap<String, String>,
}

impl BranchRule {
    fn from_settings(
        branch: &str,
        settings: BTreeMap<String, String>,
        repository: &std::path::Path,
    ) -> Result<Self, ConfigError> {
        let commands: Vec<String> = settings
            .get(KEY_COMMAND)
            .map(|value| {
                value
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if commands.is_empty() {
            return Err(ConfigError::MissingCommand {
                branch: branch.to_string(),
            });
        }

        let workdir = match settings.get(KEY_PATH).map(|p| p.trim()) {
            Some(path) if !path.is_empty() => repository.join(path),
            _ => repository.to_path_buf(),
        };

        let timeout_secs = match settings.get(KEY_TIMEOUT) {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => secs,
                _ => {
                    return Err(invalid(branch, KEY_TIMEOUT, raw, "expected seconds > 0"));
                }
            },
            None => DEFAULT_TIMEOUT_SECS,
        };

        let initial_deploy = match settings.get(KEY_INITIAL_DEPLOY) {
            Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "deploy" => InitialDeploy::Deploy,
                "skip" => InitialDeploy::Skip,
                _ => {
                    return Err(invalid(
                        branch,
                        KEY_INITIAL_DEPLOY,
                        raw,
                        "expected 'deploy' or 'skip'",
                    ));
                }
            },
            None => InitialDeploy::default(),
        };

        let on_rewrite = match settings.get(KEY_ON_REWRITE) {
            Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "deploy" => RewritePolicy::Deploy,
                "refuse" => RewritePolicy::Refuse,
                _ => {
                    return Err(invalid(
                        branch,
                        KEY_ON_REWRITE,
                        raw,
                        "expected 'deploy' or 'refuse'",
                    ));
                }
            },
            None => RewritePolicy::default(),
        };

        Ok(Self {
            branch: branch.to_string(),
            commands,
            workdir,
            timeout: Duration::from_secs(timeout_secs),
            initial_deploy,
            on_rewrite,
            settings,
        })
    }

    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }
}

fn invalid(section: &str, key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
