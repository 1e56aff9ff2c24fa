//! Decides whether a channel is monitored.

use regex::Regex;

use crate::config::ConfigError;

const PATTERN_PREFIX: &str = "re:";

#[derive(Debug, Clone)]
enum ChannelRule {
    Exact(String),
    Pattern(Regex),
}

impl ChannelRule {
    fn matches(&self, channel_name: &str) -> bool {
        match self {
            ChannelRule::Exact(name) => name == channel_name,
            ChannelRule::Pattern(regex) => regex.is_match(channel_name),
        }
    }
}

/// Compiled set of channel rules. Immutable after construction.
#[derive(Debug, Clone, Default)]
pub struct ChannelMatcher {
    rules: Vec<ChannelRule>,
}

impl ChannelMatcher {
    /// Compile rules from configuration entries. Entries prefixed with `re:`
    /// are regular expressions, everything else must match exactly.
    pub fn from_rules<S: AsRef<str>>(entries: &[S]) -> Result<Self, ConfigError> {
        let mut rules = Vec::with_capacity(entries.len());
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            match entry.strip_prefix(PATTERN_PREFIX) {
                Some(pattern) => {
                    let regex =
                        Regex::new(pattern).map_err(|source| ConfigError::InvalidChannelPattern {
                            pattern: pattern.to_string(),
                            source,
                        })?;
                    rules.push(ChannelRule::Pattern(regex));
                }
                None => rules.push(ChannelRule::Exact(entry.to_string())),
            }
        }
        Ok(Self { rules })
    }

    pub fn matches(&self, channel_name: &str) -> bool {
        self.rules.iter().any(|rule| rule.matches(channel_name))
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
