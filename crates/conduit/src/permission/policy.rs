use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::model::ResourceLimits;

/// Allow/deny rules applied to every tool call of a run.
///
/// Entries are either a bare tool name (`Bash`) or a scoped pattern matched
/// against the synthesized command string: `Bash(git status)` matches exactly,
/// `Bash(git:*)` and `Bash(git*)` match by prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPolicy {
    #[serde(default)]
    pub allowed: BTreeSet<String>,
    #[serde(default)]
    pub disallowed: BTreeSet<String>,
    #[serde(default)]
    pub fatal_on_reject: BTreeSet<String>,
    #[serde(default)]
    pub confine_to_working_directory: bool,
}

impl ToolPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(mut self, entry: impl Into<String>) -> Self {
        self.allowed.insert(entry.into());
        self
    }

    pub fn deny(mut self, entry: impl Into<String>) -> Self {
        self.disallowed.insert(entry.into());
        self
    }

    pub fn fatal_on_reject(mut self, tool_name: impl Into<String>) -> Self {
        self.fatal_on_reject.insert(tool_name.into());
        self
    }

    pub fn confined(mut self, confine: bool) -> Self {
        self.confine_to_working_directory = confine;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (set_name, set) in [
            ("tools.allowed", &self.allowed),
            ("tools.disallowed", &self.disallowed),
            ("tools.fatal_on_reject", &self.fatal_on_reject),
        ] {
            for entry in set {
                if entry.trim().is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "{} contains an empty tool name",
                        set_name
                    )));
                }
                if let ToolPattern::Malformed = ToolPattern::parse(entry) {
                    return Err(ConfigError::Invalid(format!(
                        "{} entry '{}' is not a tool name or Name(pattern)",
                        set_name, entry
                    )));
                }
            }
        }
        Ok(())
    }

    /// Returns the first deny entry matching the call, if any.
    pub fn denied_by(&self, tool_name: &str, command: &str) -> Option<&str> {
        self.disallowed
            .iter()
            .find(|entry| ToolPattern::parse(entry).matches(tool_name, command))
            .map(String::as_str)
    }

    /// An empty allow-set admits every tool that is not denied.
    pub fn admits(&self, tool_name: &str, command: &str) -> bool {
        self.allowed.is_empty()
            || self
                .allowed
                .iter()
                .any(|entry| ToolPattern::parse(entry).matches(tool_name, command))
    }

    pub fn is_fatal(&self, tool_name: &str) -> bool {
        self.fatal_on_reject.contains(tool_name)
    }

    /// Entries of a set in the form the agents' tool flags take. Scoped
    /// patterns such as `Bash(git:*)` pass through unchanged; both agents
    /// accept them.
    pub fn tool_names(set: &BTreeSet<String>) -> Vec<String> {
        set.iter().cloned().collect()
    }
}

enum ToolPattern<'a> {
    Name(&'a str),
    Scoped { tool: &'a str, pattern: &'a str },
    Malformed,
}

impl<'a> ToolPattern<'a> {
    fn parse(entry: &'a str) -> Self {
        let entry = entry.trim();
        match entry.find('(') {
            None if entry.contains(')') => ToolPattern::Malformed,
            None => ToolPattern::Name(entry),
            Some(open) => match entry.strip_suffix(')') {
                Some(inner) if open > 0 => ToolPattern::Scoped {
                    tool: &entry[..open],
                    pattern: &inner[open + 1..],
                },
                _ => ToolPattern::Malformed,
            },
        }
    }

    fn matches(&self, tool_name: &str, command: &str) -> bool {
        match self {
            ToolPattern::Name(name) => *name == tool_name,
            ToolPattern::Scoped { tool, pattern } => {
                if *tool != tool_name {
                    return false;
                }
                let Some(subject) = command
                    .strip_prefix(tool_name)
                    .and_then(|rest| rest.strip_prefix('('))
                    .and_then(|rest| rest.strip_suffix(')'))
                else {
                    return false;
                };
                if let Some(prefix) = pattern.strip_suffix(":*") {
                    subject.starts_with(prefix)
                } else if let Some(prefix) = pattern.strip_suffix('*') {
                    subject.starts_with(prefix)
                } else {
                    subject == *pattern
                }
            }
            ToolPattern::Malformed => false,
        }
    }
}

/// The read-only policy and limits snapshot taken at the start of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunPolicy {
    pub tools: ToolPolicy,
    pub limits: ResourceLimits,
}

/// Supplies tool policy and resource limits. Read-only to the runtime.
pub trait PolicySource: Send + Sync {
    fn snapshot(&self) -> Result<RunPolicy, ConfigError>;
}

/// A policy source with fixed values, validated once at construction.
#[derive(Debug, Clone)]
pub struct StaticPolicySource {
    policy: RunPolicy,
}

impl StaticPolicySource {
    pub fn new(tools: ToolPolicy, limits: ResourceLimits) -> Result<Self, ConfigError> {
        tools.validate()?;
        validate_limits(&limits)?;
        Ok(Self {
            policy: RunPolicy { tools, limits },
        })
    }
}

impl PolicySource for StaticPolicySource {
    fn snapshot(&self) -> Result<RunPolicy, ConfigError> {
        Ok(self.policy.clone())
    }
}

pub fn validate_limits(limits: &ResourceLimits) -> Result<(), ConfigError> {
    if limits.max_turns == 0 {
        return Err(ConfigError::Invalid("limits.max_turns must be at least 1".into()));
    }
    if limits.timeout.is_zero() {
        return Err(ConfigError::Invalid("limits.timeout_secs must be at least 1".into()));
    }
    if !limits.max_cost_usd.is_finite() || limits.max_cost_usd <= 0.0 {
        return Err(ConfigError::Invalid(format!(
            "limits.max_cost_usd must be a positive amount, got {}",
            limits.max_cost_usd
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_bare_names_match_by_tool() {
        let policy = ToolPolicy::new().deny("WebFetch");
        assert_eq!(policy.denied_by("WebFetch", "WebFetch(https://x)"), Some("WebFetch"));
        assert_eq!(policy.denied_by("Read", "Read(/tmp/a)"), None);
    }

    #[test]
    fn test_scoped_patterns_match_command_string() {
        let policy = ToolPolicy::new()
            .deny("Bash(rm:*)")
            .deny("Bash(sudo*)")
            .deny("Bash(git push --force)");

        assert!(policy.denied_by("Bash", "Bash(rm -rf /)").is_some());
        assert!(policy.denied_by("Bash", "Bash(sudo reboot)").is_some());
        assert!(policy.denied_by("Bash", "Bash(git push --force)").is_some());
        assert!(policy.denied_by("Bash", "Bash(git push)").is_none());
        assert!(policy.denied_by("Bash", "Bash(ls)").is_none());
        // Scoped entries never match a different tool.
        assert!(policy.denied_by("Read", "Read(rm)").is_none());
    }

    #[test]
    fn test_tool_names_keep_scoped_patterns() {
        let policy = ToolPolicy::new().allow("Read").allow("Bash(git:*)").deny("Bash(rm:*)");
        assert_eq!(
            ToolPolicy::tool_names(&policy.allowed),
            vec!["Bash(git:*)".to_string(), "Read".to_string()]
        );
        assert_eq!(ToolPolicy::tool_names(&policy.disallowed), vec!["Bash(rm:*)".to_string()]);
    }

    #[test]
    fn test_empty_allow_set_admits_everything() {
        let policy = ToolPolicy::new();
        assert!(policy.admits("Anything", "Anything"));

        let policy = ToolPolicy::new().allow("Glob").allow("Bash(git:*)");
        assert!(policy.admits("Glob", "Glob"));
        assert!(policy.admits("Bash", "Bash(git status)"));
        assert!(!policy.admits("Bash", "Bash(make)"));
        assert!(!policy.admits("LS", "LS(.)"));
    }

    #[test]
    fn test_validate_rejects_malformed_entries() {
        assert!(ToolPolicy::new().allow("Read").validate().is_ok());
        assert!(ToolPolicy::new().allow("  ").validate().is_err());
        assert!(ToolPolicy::new().deny("Bash(rm").validate().is_err());
        assert!(ToolPolicy::new().deny("(rm)").validate().is_err());
        assert!(ToolPolicy::new().deny("Bash)").validate().is_err());
    }

    #[test]
    fn test_static_source_validates_limits() {
        let zero_turns = ResourceLimits {
            max_turns: 0,
            ..ResourceLimits::default()
        };
        assert!(StaticPolicySource::new(ToolPolicy::new(), zero_turns).is_err());

        let no_time = ResourceLimits {
            timeout: Duration::ZERO,
            ..ResourceLimits::default()
        };
        assert!(StaticPolicySource::new(ToolPolicy::new(), no_time).is_err());

        let nan_cost = ResourceLimits {
            max_cost_usd: f64::NAN,
            ..ResourceLimits::default()
        };
        assert!(StaticPolicySource::new(ToolPolicy::new(), nan_cost).is_err());

        let source = StaticPolicySource::new(ToolPolicy::new(), ResourceLimits::default()).unwrap();
        assert_eq!(source.snapshot().unwrap().limits.max_turns, 10);
    }
}
