//! Run request: which suites and groups to run
//!
//! Built from `suite[:group]` tokens:
//! - suites run in the order first named
//! - groups for the same suite accumulate, duplicates dropped
//! - a suite with no groups runs every group
//! - no tokens at all means every configured suite, in config order

use indexmap::IndexMap;

use crate::config::HarnessConfig;

/// Run request errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("empty suite name in '{0}'")]
    EmptySuite(String),

    #[error("empty group name in '{0}'")]
    EmptyGroup(String),
}

/// One suite to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteSelection {
    pub suite_id: String,
    /// Empty means all groups
    pub groups: Vec<String>,
}

/// Ordered suites and group filters for one invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunRequest {
    entries: IndexMap<String, Vec<String>>,
}

impl RunRequest {
    /// Every configured suite, all groups
    pub fn all(config: &HarnessConfig) -> Self {
        Self {
            entries: config.suites.keys().map(|id| (id.clone(), Vec::new())).collect(),
        }
    }

    /// Parse tokens without checking them against a config
    pub fn parse<S: AsRef<str>>(tokens: &[S]) -> Result<Self, RequestError> {
        let mut entries: IndexMap<String, Vec<String>> = IndexMap::new();
        for token in tokens {
            let token = token.as_ref();
            let (suite, group) = match token.split_once(':') {
                Some((suite, group)) => (suite, Some(group)),
                None => (token, None),
            };
            if suite.is_empty() {
                return Err(RequestError::EmptySuite(token.to_string()));
            }
            let groups = entries.entry(suite.to_string()).or_default();
            match group {
                Some("") => return Err(RequestError::EmptyGroup(token.to_string())),
                Some(group) if !groups.iter().any(|g| g == group) => groups.push(group.to_string()),
                _ => {}
            }
        }
        Ok(Self { entries })
    }

    /// Parse tokens; no tokens selects everything. Unknown suites are kept
    /// and fail on their own when run.
    pub fn from_tokens<S: AsRef<str>>(tokens: &[S], config: &HarnessConfig) -> Result<Self, RequestError> {
        if tokens.is_empty() {
            return Ok(Self::all(config));
        }
        Self::parse(tokens)
    }

    /// Requested suites the config does not define
    pub fn unknown_suites<'a>(&'a self, config: &HarnessConfig) -> Vec<&'a str> {
        self.entries
            .keys()
            .filter(|id| config.suite(id).is_none())
            .map(String::as_str)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn selections(&self) -> impl Iterator<Item = SuiteSelection> + '_ {
        self.entries.iter().map(|(suite_id, groups)| SuiteSelection {
            suite_id: suite_id.clone(),
            groups: groups.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SuiteConfig;

    fn config() -> HarnessConfig {
        let mut config = HarnessConfig::parse_toml("version = \"2.0\"\n").unwrap();
        for id in ["webapi", "cert", "security"] {
            config.suites.insert(id.to_string(), SuiteConfig::new("/bin/true"));
        }
        config
    }

    fn ids(request: &RunRequest) -> Vec<(String, Vec<String>)> {
        request.selections().map(|s| (s.suite_id, s.groups)).collect()
    }

    #[test]
    fn test_empty_selects_all_in_config_order() {
        let request = RunRequest::from_tokens::<&str>(&[], &config()).unwrap();
        assert_eq!(
            ids(&request),
            vec![
                ("webapi".to_string(), vec![]),
                ("cert".to_string(), vec![]),
                ("security".to_string(), vec![]),
            ]
        );
    }

    #[test]
    fn test_groups_accumulate_in_first_seen_order() {
        let request = RunRequest::parse(&["cert:b", "webapi", "cert:a", "cert:b"]).unwrap();
        assert_eq!(
            ids(&request),
            vec![
                ("cert".to_string(), vec!["b".to_string(), "a".to_string()]),
                ("webapi".to_string(), vec![]),
            ]
        );
    }

    #[test]
    fn test_bare_token_keeps_groups() {
        let request = RunRequest::parse(&["cert:a", "cert"]).unwrap();
        assert_eq!(ids(&request), vec![("cert".to_string(), vec!["a".to_string()])]);
    }

    #[test]
    fn test_group_may_contain_colon_and_slash() {
        let request = RunRequest::parse(&["webapi:apps/gallery:1"]).unwrap();
        assert_eq!(ids(&request)[0].1, vec!["apps/gallery:1".to_string()]);
    }

    #[test]
    fn test_invalid_tokens() {
        assert_eq!(RunRequest::parse(&[":a"]), Err(RequestError::EmptySuite(":a".to_string())));
        assert_eq!(RunRequest::parse(&["cert:"]), Err(RequestError::EmptyGroup("cert:".to_string())));
    }

    #[test]
    fn test_unknown_suites_are_reported_not_rejected() {
        let config = config();
        let request = RunRequest::from_tokens(&["nope", "cert"], &config).unwrap();
        assert_eq!(request.len(), 2);
        assert_eq!(request.unknown_suites(&config), vec!["nope"]);
    }
}
