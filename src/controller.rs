//! The access controller: per-domain bypass state machine.
//!
//! A protected domain is in one of three states:
//!
//! - **Blocked**: no bypass record exists
//! - **Bypassed (timed)**: allowed until `end_time`, with a warning wake-up
//!   shortly before and an expiry wake-up at the end
//! - **Bypassed (emergency)**: allowed until explicitly cancelled or until
//!   the next startup reconciliation
//!
//! Every mutation for a domain runs under that domain's lock. A grant installs
//! the gateway allow override first and persists the record second; if the
//! second step fails the first is rolled back, so the domain is never left
//! half-bypassed.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, Timestamp};
use crate::directory::{Domain, RuleDirectory, RuleId};
use crate::gateway::{GatewayError, RuleGateway};
use crate::metrics::{BYPASSES_CANCELLED, BYPASSES_EXPIRED, BYPASSES_GRANTED};
use crate::notifier::{self, Notifier};
use crate::scheduler::{Purpose, Scheduler, Wakeup, WakeupKey};
use crate::store::{BypassKind, BypassRecord, BypassStore, StoreError};

/// Warning lead for bypasses longer than [`SHORT_BYPASS_MINUTES`].
pub const LONG_WARNING_LEAD: Duration = Duration::from_secs(3 * 60);

/// Warning lead for short bypasses.
pub const SHORT_WARNING_LEAD: Duration = Duration::from_secs(60);

/// Bypasses of at most this many minutes get the short warning lead.
pub const SHORT_BYPASS_MINUTES: u32 = 3;

/// How long before the end of a bypass the warning fires.
#[must_use]
pub const fn warning_lead(duration_minutes: u32) -> Duration {
    if duration_minutes > SHORT_BYPASS_MINUTES {
        LONG_WARNING_LEAD
    } else {
        SHORT_WARNING_LEAD
    }
}

/// Error type for access controller operations.
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    /// The site has no rule in the directory.
    #[error("Unknown site")]
    UnknownDomain(String),

    /// The requested duration is not a positive number of minutes.
    #[error("invalid duration: {0}")]
    InvalidDuration(String),

    /// The network rule gateway rejected an update.
    #[error("rule gateway error: {0}")]
    RuleGateway(#[from] GatewayError),

    /// The bypass store could not read or write a record.
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),
}

/// A granted timed bypass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BypassGrant {
    pub domain: Domain,
    pub end_time: Timestamp,
    pub redirect_url: String,
}

/// A granted emergency bypass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmergencyGrant {
    pub domain: Domain,
    pub redirect_url: String,
}

/// Bypass state of a domain as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassStatus {
    Inactive,
    Emergency,
    Timed {
        remaining: Duration,
        end_time: Timestamp,
    },
}

impl BypassStatus {
    #[must_use]
    pub const fn is_active(&self) -> bool {
        !matches!(self, Self::Inactive)
    }
}

/// Gate decision for a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    /// No protected domain covers the host.
    Unprotected,
    /// Covered and currently blocked.
    Blocked(Domain),
    /// Covered but an active bypass lets traffic through.
    Bypassed(Domain, BypassKind),
    /// Covered but blocking is switched off globally.
    Paused(Domain),
}

impl Access {
    #[must_use]
    pub const fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked(_))
    }

    #[must_use]
    pub const fn domain(&self) -> Option<&Domain> {
        match self {
            Self::Unprotected => None,
            Self::Blocked(d) | Self::Bypassed(d, _) | Self::Paused(d) => Some(d),
        }
    }
}

/// Outcome of startup reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Records removed (emergency, expired, or no longer protected).
    pub cleared: usize,
    /// Timed bypasses still running whose rules and wake-ups were restored.
    pub restored: usize,
}

/// Per-domain bypass state machine.
pub struct AccessController<S, G> {
    directory: Arc<RuleDirectory>,
    store: S,
    gateway: G,
    scheduler: Arc<dyn Scheduler>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    locks: HashMap<RuleId, Mutex<()>>,
    blocking_enabled: AtomicBool,
    blocking_switch: Mutex<()>,
}

impl<S, G> AccessController<S, G>
where
    S: BypassStore,
    G: RuleGateway,
{
    pub fn new(
        directory: Arc<RuleDirectory>,
        store: S,
        gateway: G,
        scheduler: Arc<dyn Scheduler>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let locks = directory
            .domains()
            .map(|(_, rule)| (rule, Mutex::new(())))
            .collect();

        Self {
            directory,
            store,
            gateway,
            scheduler,
            notifier,
            clock,
            locks,
            blocking_enabled: AtomicBool::new(true),
            blocking_switch: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn directory(&self) -> &RuleDirectory {
        &self.directory
    }

    #[must_use]
    pub fn blocking_enabled(&self) -> bool {
        self.blocking_enabled.load(Ordering::SeqCst)
    }

    /// Grant a timed bypass of `duration_minutes` for `site`.
    ///
    /// Re-requesting while a bypass is active replaces it, wake-ups included.
    ///
    /// # Errors
    ///
    /// - [`AccessError::UnknownDomain`] if the site is not protected
    /// - [`AccessError::InvalidDuration`] if the duration is not positive
    /// - [`AccessError::RuleGateway`] / [`AccessError::Persistence`] if a side
    ///   effect fails; the domain is left as it was
    pub async fn request_bypass(
        &self,
        site: &str,
        duration_minutes: i64,
        original_url: &str,
    ) -> Result<BypassGrant, AccessError> {
        let (domain, rule) = self.resolve(site)?;
        let minutes = validate_duration(duration_minutes)?;

        let _guard = self.lock(rule).await;
        let now = self.clock.now();
        let end_time = now.saturating_add(Duration::from_secs(u64::from(minutes) * 60));
        let redirect_url = redirect_url(&domain, original_url);

        let record = BypassRecord {
            domain: domain.clone(),
            kind: BypassKind::Timed,
            start_time: now,
            end_time: Some(end_time),
            duration_minutes: Some(minutes),
            original_url: redirect_url.clone(),
        };
        self.install(&domain, rule, record).await?;
        self.arm_wakeups(&domain, end_time, minutes, now);

        metrics::counter!(BYPASSES_GRANTED, "kind" => "timed").increment(1);
        info!(domain = %domain, minutes, end_time = %end_time, "timed bypass granted");

        Ok(BypassGrant {
            domain,
            end_time,
            redirect_url,
        })
    }

    /// Grant an emergency bypass with no expiry.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`request_bypass`](Self::request_bypass), minus
    /// duration validation.
    pub async fn request_emergency_access(
        &self,
        site: &str,
        original_url: &str,
    ) -> Result<EmergencyGrant, AccessError> {
        let (domain, rule) = self.resolve(site)?;

        let _guard = self.lock(rule).await;
        let redirect_url = redirect_url(&domain, original_url);

        let record = BypassRecord {
            domain: domain.clone(),
            kind: BypassKind::Emergency,
            start_time: self.clock.now(),
            end_time: None,
            duration_minutes: None,
            original_url: redirect_url.clone(),
        };
        self.install(&domain, rule, record).await?;
        self.cancel_wakeups(&domain);

        metrics::counter!(BYPASSES_GRANTED, "kind" => "emergency").increment(1);
        info!(domain = %domain, "emergency bypass granted");

        Ok(EmergencyGrant {
            domain,
            redirect_url,
        })
    }

    /// Current bypass state of `site`.
    ///
    /// A timed record whose end has passed is expired on the spot, with the
    /// same notification the expiry wake-up would send, so a late wake-up
    /// never keeps a domain open. Unprotected sites are reported inactive.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::Persistence`] if the store cannot be read.
    pub async fn bypass_status(&self, site: &str) -> Result<BypassStatus, AccessError> {
        let Some((domain, rule)) = self.directory.resolve(site) else {
            return Ok(BypassStatus::Inactive);
        };
        let domain = domain.clone();

        let Some(record) = self.store.get(&domain).await? else {
            return Ok(BypassStatus::Inactive);
        };
        let now = self.clock.now();
        if !record.is_expired_at(now) {
            return Ok(status_of(&record, now));
        }

        let _guard = self.lock(rule).await;
        let now = self.clock.now();
        match self.store.get(&domain).await? {
            Some(current) if current.is_expired_at(now) => {
                debug!(domain = %domain, "bypass found past its end time, expiring");
                self.expire(&domain, rule).await;
                Ok(BypassStatus::Inactive)
            }
            Some(current) => Ok(status_of(&current, now)),
            None => Ok(BypassStatus::Inactive),
        }
    }

    /// Cancel any bypass for `site` and restore blocking.
    ///
    /// Cancelling a domain without a bypass succeeds.
    ///
    /// # Errors
    ///
    /// - [`AccessError::UnknownDomain`] if the site is not protected
    /// - [`AccessError::Persistence`] if the record could not be deleted
    pub async fn cancel_bypass(&self, site: &str) -> Result<(), AccessError> {
        let (domain, rule) = self.resolve(site)?;

        let _guard = self.lock(rule).await;
        let existed = self.store.get(&domain).await?.is_some();
        self.clear(&domain, rule).await?;

        if existed {
            metrics::counter!(BYPASSES_CANCELLED).increment(1);
            info!(domain = %domain, "bypass cancelled");
        }
        Ok(())
    }

    /// Gate decision for `host`, matching subdomains of protected domains.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::Persistence`] if the store cannot be read.
    pub async fn access_for(&self, host: &str) -> Result<Access, AccessError> {
        let Some((domain, _)) = self.directory.match_host(host) else {
            return Ok(Access::Unprotected);
        };
        let domain = domain.clone();

        if !self.blocking_enabled() {
            return Ok(Access::Paused(domain));
        }

        let access = match self.bypass_status(domain.as_str()).await? {
            BypassStatus::Inactive => Access::Blocked(domain),
            BypassStatus::Emergency => Access::Bypassed(domain, BypassKind::Emergency),
            BypassStatus::Timed { .. } => Access::Bypassed(domain, BypassKind::Timed),
        };
        Ok(access)
    }

    /// Switch every block rule on or off and remember the choice.
    ///
    /// Bypass records are left untouched. The switch is persisted in the
    /// store and wins over the configured default on the next start. If the
    /// gateway rejects one of the rules, or the switch cannot be persisted,
    /// the rules already switched are put back.
    ///
    /// # Errors
    ///
    /// - [`AccessError::RuleGateway`] with the first gateway failure
    /// - [`AccessError::Persistence`] if the switch could not be saved
    pub async fn set_blocking_enabled(&self, enabled: bool) -> Result<(), AccessError> {
        let _guard = self.blocking_switch.lock().await;

        let switched = self.switch_block_rules(enabled).await?;
        if let Err(err) = self.store.set_blocking_enabled(enabled).await {
            warn!(enabled, error = ?err, "failed to persist blocking switch, reverting");
            self.revert_block_rules(&switched, enabled).await;
            return Err(err.into());
        }

        self.blocking_enabled.store(enabled, Ordering::SeqCst);
        info!(enabled, rules = switched.len(), "blocking switched");
        Ok(())
    }

    /// Apply the persisted blocking switch, or `default` if it was never set.
    ///
    /// Returns whether blocking is enabled afterwards. The default itself is
    /// not persisted.
    ///
    /// # Errors
    ///
    /// - [`AccessError::Persistence`] if the store cannot be read
    /// - [`AccessError::RuleGateway`] if the rules cannot be switched
    pub async fn restore_blocking_switch(&self, default: bool) -> Result<bool, AccessError> {
        let _guard = self.blocking_switch.lock().await;

        let enabled = self.store.blocking_enabled().await?.unwrap_or(default);
        if enabled != self.blocking_enabled() {
            self.switch_block_rules(enabled).await?;
            self.blocking_enabled.store(enabled, Ordering::SeqCst);
        }
        debug!(enabled, "blocking switch restored");
        Ok(enabled)
    }

    async fn switch_block_rules(&self, enabled: bool) -> Result<Vec<RuleId>, GatewayError> {
        let mut switched = Vec::new();
        for (domain, rule) in self.directory.domains() {
            if let Err(err) = self.toggle_block_rule(rule, enabled).await {
                warn!(domain = %domain, error = ?err, enabled, "failed to switch block rule, reverting");
                self.revert_block_rules(&switched, enabled).await;
                return Err(err);
            }
            switched.push(rule);
        }
        Ok(switched)
    }

    async fn revert_block_rules(&self, rules: &[RuleId], enabled: bool) {
        for &rule in rules {
            if let Err(err) = self.toggle_block_rule(rule, !enabled).await {
                error!(rule = %rule, error = ?err, "failed to revert block rule");
            }
        }
    }

    async fn toggle_block_rule(&self, rule: RuleId, enabled: bool) -> Result<(), GatewayError> {
        if enabled {
            self.gateway.enable_block_rule(rule).await
        } else {
            self.gateway.disable_block_rule(rule).await
        }
    }

    /// React to a fired wake-up.
    ///
    /// Wake-ups that no longer match the domain's current timed bypass are
    /// ignored.
    pub async fn handle_wakeup(&self, wakeup: Wakeup) {
        let Some((domain, rule)) = self.directory.resolve(wakeup.key.domain.as_str()) else {
            debug!(key = %wakeup.key, "ignoring wake-up for unprotected domain");
            return;
        };
        let domain = domain.clone();

        let _guard = self.lock(rule).await;
        let record = match self.store.get(&domain).await {
            Ok(record) => record,
            Err(err) => {
                error!(key = %wakeup.key, error = ?err, "failed to read bypass for wake-up");
                return;
            }
        };
        let Some(record) = record.filter(|r| {
            r.kind == BypassKind::Timed && r.end_time == Some(wakeup.bypass_end)
        }) else {
            debug!(key = %wakeup.key, "ignoring stale wake-up");
            return;
        };

        let now = self.clock.now();
        match wakeup.key.purpose {
            Purpose::Warning => {
                if record.is_expired_at(now) {
                    return;
                }
                let remaining = wakeup.bypass_end.duration_since(now);
                let minutes_left = remaining.as_secs().div_ceil(60).max(1);
                let (title, body) = notifier::warning_message(domain.as_str(), minutes_left);
                self.notifier.notify(title, &body);
                info!(domain = %domain, minutes_left, "bypass ending soon");
            }
            Purpose::Expire => {
                if !record.is_expired_at(now) {
                    debug!(key = %wakeup.key, "expiry fired early, re-arming");
                    self.scheduler.arm(Wakeup {
                        at: wakeup.bypass_end,
                        ..wakeup
                    });
                    return;
                }
                self.expire(&domain, rule).await;
            }
        }
    }

    /// Bring persisted bypasses in line with a fresh process.
    ///
    /// Emergency bypasses do not survive a restart and expired timed bypasses
    /// are cleared. Timed bypasses still running get their allow override and
    /// wake-ups back, since both are lost with the previous process.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::Persistence`] if the store cannot be listed.
    /// Failures on individual records are logged and skipped.
    pub async fn reconcile(&self) -> Result<ReconcileReport, AccessError> {
        let mut report = ReconcileReport::default();

        for (domain, _) in self.store.all_entries().await? {
            let Some((_, rule)) = self.directory.resolve(domain.as_str()) else {
                warn!(domain = %domain, "dropping bypass for domain no longer protected");
                if let Err(err) = self.store.delete(&domain).await {
                    error!(domain = %domain, error = ?err, "failed to delete bypass");
                }
                report.cleared += 1;
                continue;
            };

            let _guard = self.lock(rule).await;
            let record = match self.store.get(&domain).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(err) => {
                    error!(domain = %domain, error = ?err, "failed to read bypass");
                    continue;
                }
            };

            let now = self.clock.now();
            match (record.kind, record.end_time) {
                (BypassKind::Timed, Some(end_time)) if !record.is_expired_at(now) => {
                    if let Err(err) = self.gateway.install_allow_override(rule, &domain).await {
                        warn!(domain = %domain, error = ?err, "cannot restore allow override, dropping bypass");
                        if let Err(err) = self.clear(&domain, rule).await {
                            error!(domain = %domain, error = ?err, "failed to clear bypass");
                            continue;
                        }
                        report.cleared += 1;
                        continue;
                    }
                    let minutes = record.duration_minutes.unwrap_or_else(|| {
                        u32::try_from(end_time.duration_since(record.start_time).as_secs() / 60)
                            .unwrap_or(u32::MAX)
                    });
                    self.arm_wakeups(&domain, end_time, minutes, now);
                    report.restored += 1;
                    debug!(domain = %domain, end_time = %end_time, "timed bypass restored");
                }
                (kind, _) => {
                    if let Err(err) = self.clear(&domain, rule).await {
                        error!(domain = %domain, error = ?err, "failed to clear bypass");
                        continue;
                    }
                    report.cleared += 1;
                    debug!(domain = %domain, kind = kind.as_str(), "bypass cleared on startup");
                }
            }
        }

        info!(
            cleared = report.cleared,
            restored = report.restored,
            "bypass reconciliation complete"
        );
        Ok(report)
    }

    fn resolve(&self, site: &str) -> Result<(Domain, RuleId), AccessError> {
        self.directory
            .resolve(site)
            .map(|(domain, rule)| (domain.clone(), rule))
            .ok_or_else(|| AccessError::UnknownDomain(site.to_string()))
    }

    async fn lock(&self, rule: RuleId) -> MutexGuard<'_, ()> {
        self.locks[&rule].lock().await
    }

    /// Install the allow override and persist `record`, undoing the override
    /// if persisting fails and the domain was blocked before.
    async fn install(
        &self,
        domain: &Domain,
        rule: RuleId,
        record: BypassRecord,
    ) -> Result<(), AccessError> {
        let previous = self.store.get(domain).await?;

        if let Err(err) = self.gateway.install_allow_override(rule, domain).await {
            warn!(domain = %domain, error = ?err, "failed to install allow override");
            return Err(err.into());
        }

        if let Err(err) = self.store.put(domain.clone(), record).await {
            warn!(domain = %domain, error = ?err, "failed to persist bypass");
            if previous.is_none()
                && let Err(rollback) = self.gateway.remove_allow_override(rule).await
            {
                error!(domain = %domain, error = ?rollback, "failed to roll back allow override");
            }
            return Err(err.into());
        }

        Ok(())
    }

    /// Remove the override, cancel wake-ups and delete the record.
    ///
    /// A gateway failure is logged and the record is deleted anyway.
    async fn clear(&self, domain: &Domain, rule: RuleId) -> Result<(), StoreError> {
        if let Err(err) = self.gateway.remove_allow_override(rule).await {
            warn!(domain = %domain, error = ?err, "failed to remove allow override");
        }
        self.cancel_wakeups(domain);
        self.store.delete(domain).await
    }

    /// Clear a timed bypass that ran out and tell the user.
    async fn expire(&self, domain: &Domain, rule: RuleId) {
        if let Err(err) = self.clear(domain, rule).await {
            error!(domain = %domain, error = ?err, "failed to delete expired bypass");
        }
        metrics::counter!(BYPASSES_EXPIRED).increment(1);
        let (title, body) = notifier::expiry_message(domain.as_str());
        self.notifier.notify(title, &body);
        info!(domain = %domain, "timed bypass expired");
    }

    fn arm_wakeups(&self, domain: &Domain, end_time: Timestamp, minutes: u32, now: Timestamp) {
        let warning_at = end_time.saturating_sub(warning_lead(minutes));
        let warning = WakeupKey::new(domain.clone(), Purpose::Warning);
        if warning_at >= now {
            self.scheduler.arm(Wakeup {
                key: warning,
                at: warning_at,
                bypass_end: end_time,
            });
        } else {
            self.scheduler.cancel(&warning);
        }

        self.scheduler.arm(Wakeup {
            key: WakeupKey::new(domain.clone(), Purpose::Expire),
            at: end_time,
            bypass_end: end_time,
        });
    }

    fn cancel_wakeups(&self, domain: &Domain) {
        for purpose in [Purpose::Warning, Purpose::Expire] {
            self.scheduler
                .cancel(&WakeupKey::new(domain.clone(), purpose));
        }
    }
}

fn validate_duration(minutes: i64) -> Result<u32, AccessError> {
    if minutes <= 0 {
        return Err(AccessError::InvalidDuration(format!(
            "{minutes} minutes is not a positive duration"
        )));
    }
    u32::try_from(minutes)
        .map_err(|_| AccessError::InvalidDuration(format!("{minutes} minutes is too long")))
}

fn redirect_url(domain: &Domain, original_url: &str) -> String {
    let original_url = original_url.trim();
    if original_url.is_empty() {
        format!("https://{domain}")
    } else {
        original_url.to_string()
    }
}

fn status_of(record: &BypassRecord, now: Timestamp) -> BypassStatus {
    match (record.kind, record.end_time) {
        (BypassKind::Emergency, _) => BypassStatus::Emergency,
        (BypassKind::Timed, Some(end_time)) => BypassStatus::Timed {
            remaining: end_time.duration_since(now),
            end_time,
        },
        (BypassKind::Timed, None) => BypassStatus::Inactive,
    }
}
