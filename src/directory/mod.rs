//! Rule directory: the static mapping from protected domain to block rule.
//!
//! The directory is built once at startup from the configured site list and
//! never mutated afterwards. Rule ids are assigned in configuration order,
//! starting at 1.
//!
//! # Example
//!
//! ```
//! use focusgate::directory::RuleDirectory;
//!
//! let directory = RuleDirectory::new(["facebook.com", "youtube.com"]).unwrap();
//! assert_eq!(directory.rule_id_for("YouTube.com").map(|id| id.get()), Some(2));
//! assert!(directory.match_host("m.facebook.com").is_some());
//! ```

pub mod loader;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Offset between a block rule id and the id of its allow-override rule.
pub const ALLOW_OVERRIDE_OFFSET: u32 = 1000;

/// Error type for rule directory construction.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DirectoryError {
    /// The entry is not a bare hostname.
    #[error("invalid domain {domain:?}: {reason}")]
    InvalidDomain {
        /// Offending input.
        domain: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The same domain was listed twice.
    #[error("duplicate domain: {0}")]
    DuplicateDomain(Domain),

    /// More domains than rule ids available below the override range.
    #[error("too many domains: at most {max} are supported")]
    TooManyDomains {
        /// Maximum number of domains.
        max: usize,
    },
}

/// A bare hostname, stored lowercase without a trailing dot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Domain(String);

impl Domain {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Domain {
    type Err = DirectoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| DirectoryError::InvalidDomain {
            domain: s.to_string(),
            reason,
        };

        let normalized = s.trim().to_lowercase();
        let normalized = normalized.trim_end_matches('.');

        if normalized.is_empty() {
            return Err(invalid("empty"));
        }
        if normalized.contains('*') {
            return Err(invalid("wildcards are not allowed"));
        }
        if normalized.contains("://") || normalized.contains('/') {
            return Err(invalid("expected a hostname, not a URL"));
        }
        if normalized.chars().any(char::is_whitespace) {
            return Err(invalid("contains whitespace"));
        }
        if normalized.split('.').any(str::is_empty) {
            return Err(invalid("empty label"));
        }

        Ok(Self(normalized.to_string()))
    }
}

impl TryFrom<String> for Domain {
    type Error = DirectoryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Domain> for String {
    fn from(domain: Domain) -> Self {
        domain.0
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a block rule in the network rule gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(u32);

impl RuleId {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Id of the allow-override rule paired with this block rule.
    #[must_use]
    pub const fn allow_override(self) -> u32 {
        self.0 + ALLOW_OVERRIDE_OFFSET
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Read-only mapping from protected domains to their block rules.
#[derive(Debug, Clone, Default)]
pub struct RuleDirectory {
    rules: HashMap<Domain, RuleId>,
    /// Domains in rule id order.
    ordered: Vec<Domain>,
}

impl RuleDirectory {
    /// Build a directory, assigning rule ids in iteration order.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError`] if an entry is not a valid hostname, a
    /// domain appears twice, or the list does not fit below the override id
    /// range.
    pub fn new<I, S>(domains: I) -> Result<Self, DirectoryError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rules = HashMap::new();
        let mut ordered = Vec::new();

        for entry in domains {
            let domain: Domain = entry.as_ref().parse()?;
            if rules.contains_key(&domain) {
                return Err(DirectoryError::DuplicateDomain(domain));
            }
            if ordered.len() >= (ALLOW_OVERRIDE_OFFSET - 1) as usize {
                return Err(DirectoryError::TooManyDomains {
                    max: (ALLOW_OVERRIDE_OFFSET - 1) as usize,
                });
            }

            let id = RuleId::new(u32::try_from(ordered.len() + 1).unwrap_or(u32::MAX));
            rules.insert(domain.clone(), id);
            ordered.push(domain);
        }

        Ok(Self { rules, ordered })
    }

    /// Look up the rule protecting exactly `domain`.
    #[must_use]
    pub fn rule_id_for(&self, domain: &str) -> Option<RuleId> {
        self.resolve(domain).map(|(_, id)| id)
    }

    /// Look up a site, returning the normalized domain and its rule.
    #[must_use]
    pub fn resolve(&self, site: &str) -> Option<(&Domain, RuleId)> {
        let domain: Domain = site.parse().ok()?;
        self.rules.get_key_value(&domain).map(|(d, id)| (d, *id))
    }

    /// Find the protected domain covering `host`.
    ///
    /// A domain covers itself and every subdomain, so `m.youtube.com` is
    /// covered by `youtube.com`. The most specific match wins.
    #[must_use]
    pub fn match_host(&self, host: &str) -> Option<(&Domain, RuleId)> {
        let host: Domain = host.parse().ok()?;
        let mut candidate = host.as_str();

        loop {
            if let Some((domain, id)) = self.rules.get_key_value(candidate) {
                return Some((domain, *id));
            }
            let (_, parent) = candidate.split_once('.')?;
            candidate = parent;
        }
    }

    /// Iterate domains in rule id order.
    pub fn domains(&self) -> impl Iterator<Item = (&Domain, RuleId)> {
        self.ordered.iter().map(|d| (d, self.rules[d]))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

impl std::borrow::Borrow<str> for Domain {
    fn borrow(&self) -> &str {
        &self.0
    }
}
