//! Network rule gateway trait and the in-memory rule table.
//!
//! The gateway is the capability that actually enforces blocking: it can
//! switch a domain's block rule on and off and layer a higher-priority
//! "allow" override on top of it. The controller only talks to this trait.
//!
//! [`RuleTable`] is a reference implementation that keeps the rule set in
//! memory and answers blocking queries against it the way a declarative
//! URL filter would (a rule for `youtube.com` also covers `m.youtube.com`).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::directory::{Domain, RuleDirectory, RuleId};

/// Error type for rule gateway operations.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum GatewayError {
    /// The gateway has no block rule with this id.
    #[error("unknown rule {0}")]
    UnknownRule(RuleId),

    /// The gateway could not be reached or refused the update.
    #[error("rule gateway unavailable: {0}")]
    Unavailable(String),
}

/// Trait for toggling network block and allow rules.
pub trait RuleGateway: Send + Sync + 'static {
    /// Turn the block rule on.
    fn enable_block_rule(&self, rule: RuleId)
    -> impl Future<Output = Result<(), GatewayError>> + Send;

    /// Turn the block rule off.
    fn disable_block_rule(
        &self,
        rule: RuleId,
    ) -> impl Future<Output = Result<(), GatewayError>> + Send;

    /// Install (or replace) the allow override for `domain`.
    fn install_allow_override(
        &self,
        rule: RuleId,
        domain: &Domain,
    ) -> impl Future<Output = Result<(), GatewayError>> + Send;

    /// Remove the allow override. Removing a missing override succeeds.
    fn remove_allow_override(
        &self,
        rule: RuleId,
    ) -> impl Future<Output = Result<(), GatewayError>> + Send;
}

impl<G: RuleGateway> RuleGateway for Arc<G> {
    fn enable_block_rule(
        &self,
        rule: RuleId,
    ) -> impl Future<Output = Result<(), GatewayError>> + Send {
        G::enable_block_rule(self, rule)
    }

    fn disable_block_rule(
        &self,
        rule: RuleId,
    ) -> impl Future<Output = Result<(), GatewayError>> + Send {
        G::disable_block_rule(self, rule)
    }

    fn install_allow_override(
        &self,
        rule: RuleId,
        domain: &Domain,
    ) -> impl Future<Output = Result<(), GatewayError>> + Send {
        G::install_allow_override(self, rule, domain)
    }

    fn remove_allow_override(
        &self,
        rule: RuleId,
    ) -> impl Future<Output = Result<(), GatewayError>> + Send {
        G::remove_allow_override(self, rule)
    }
}

#[derive(Debug)]
struct BlockRule {
    domain: Domain,
    enabled: bool,
}

#[derive(Debug, Default)]
struct TableState {
    block_rules: HashMap<RuleId, BlockRule>,
    /// Allow overrides keyed by override id (`RuleId::allow_override`).
    allow_overrides: HashMap<u32, Domain>,
}

/// In-memory rule set mirroring one block rule per directory entry.
#[derive(Debug, Default)]
pub struct RuleTable {
    state: RwLock<TableState>,
}

impl RuleTable {
    /// Create a table with an enabled block rule for every directory entry.
    #[must_use]
    pub fn from_directory(directory: &RuleDirectory) -> Self {
        let block_rules = directory
            .domains()
            .map(|(domain, id)| {
                (
                    id,
                    BlockRule {
                        domain: domain.clone(),
                        enabled: true,
                    },
                )
            })
            .collect();

        Self {
            state: RwLock::new(TableState {
                block_rules,
                allow_overrides: HashMap::new(),
            }),
        }
    }

    /// Whether traffic to `host` is currently blocked by the rule set.
    ///
    /// A host is blocked when an enabled block rule covers it and no allow
    /// override covers it.
    #[must_use]
    pub fn is_blocked(&self, host: &str) -> bool {
        let host = host.trim().to_lowercase();
        let host = host.trim_end_matches('.');
        let state = self.state.read();

        let blocked = state
            .block_rules
            .values()
            .any(|rule| rule.enabled && covers(&rule.domain, host));
        let allowed = state
            .allow_overrides
            .values()
            .any(|domain| covers(domain, host));

        blocked && !allowed
    }

    /// Whether an allow override is installed for `rule`.
    #[must_use]
    pub fn has_allow_override(&self, rule: RuleId) -> bool {
        self.state
            .read()
            .allow_overrides
            .contains_key(&rule.allow_override())
    }

    #[must_use]
    pub fn allow_override_count(&self) -> usize {
        self.state.read().allow_overrides.len()
    }

    fn set_enabled(&self, rule: RuleId, enabled: bool) -> Result<(), GatewayError> {
        let mut state = self.state.write();
        let block_rule = state
            .block_rules
            .get_mut(&rule)
            .ok_or(GatewayError::UnknownRule(rule))?;
        block_rule.enabled = enabled;
        tracing::debug!(rule = %rule, domain = %block_rule.domain, enabled, "block rule toggled");
        Ok(())
    }
}

/// Whether a rule for `domain` applies to `host` (itself or a subdomain).
fn covers(domain: &Domain, host: &str) -> bool {
    let domain = domain.as_str();
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

impl RuleGateway for RuleTable {
    async fn enable_block_rule(&self, rule: RuleId) -> Result<(), GatewayError> {
        self.set_enabled(rule, true)
    }

    async fn disable_block_rule(&self, rule: RuleId) -> Result<(), GatewayError> {
        self.set_enabled(rule, false)
    }

    async fn install_allow_override(
        &self,
        rule: RuleId,
        domain: &Domain,
    ) -> Result<(), GatewayError> {
        let mut state = self.state.write();
        if !state.block_rules.contains_key(&rule) {
            return Err(GatewayError::UnknownRule(rule));
        }
        state
            .allow_overrides
            .insert(rule.allow_override(), domain.clone());
        tracing::debug!(rule = %rule, domain = %domain, "allow override installed");
        Ok(())
    }

    async fn remove_allow_override(&self, rule: RuleId) -> Result<(), GatewayError> {
        let removed = self
            .state
            .write()
            .allow_overrides
            .remove(&rule.allow_override());
        if let Some(domain) = removed {
            tracing::debug!(rule = %rule, domain = %domain, "allow override removed");
        }
        Ok(())
    }
}
