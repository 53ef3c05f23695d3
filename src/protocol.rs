//! JSON request/response messages and their dispatch to the controller.
//!
//! Requests are tagged by `action` and use camelCase fields, e.g.
//! `{"action":"requestBypass","site":"youtube.com","duration":10}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::clock::Timestamp;
use crate::controller::{Access, AccessController, AccessError, BypassStatus};
use crate::directory::Domain;
use crate::gateway::RuleGateway;
use crate::store::BypassStore;

/// An incoming request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Request {
    RequestBypass {
        site: String,
        /// Minutes; accepted as a JSON number or a numeric string.
        duration: Value,
        #[serde(default)]
        original_url: String,
    },
    EmergencyAccess {
        site: String,
        #[serde(default)]
        original_url: String,
    },
    GetBypassStatus {
        site: String,
    },
    CancelBypass {
        site: String,
    },
    CheckAccess {
        host: String,
    },
    SetBlockingEnabled {
        enabled: bool,
    },
}

/// Parse one request from its JSON text.
///
/// # Errors
///
/// Returns the `serde_json` error for malformed JSON, unknown actions and
/// missing fields.
pub fn parse_request(text: &str) -> Result<Request, serde_json::Error> {
    serde_json::from_str(text)
}

/// An outgoing response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged, rename_all_fields = "camelCase")]
pub enum Response {
    Granted {
        success: bool,
        end_time: Timestamp,
        redirect_url: String,
    },
    EmergencyGranted {
        success: bool,
        redirect_url: String,
    },
    Status {
        active: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        emergency: Option<bool>,
        /// Milliseconds left on a timed bypass.
        #[serde(skip_serializing_if = "Option::is_none")]
        remaining_time: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        end_time: Option<Timestamp>,
    },
    Access {
        protected: bool,
        blocked: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        domain: Option<Domain>,
    },
    Done {
        success: bool,
    },
    Failure {
        success: bool,
        error: String,
    },
}

impl Response {
    #[must_use]
    pub const fn done() -> Self {
        Self::Done { success: true }
    }

    #[must_use]
    pub fn failure(error: impl ToString) -> Self {
        Self::Failure {
            success: false,
            error: error.to_string(),
        }
    }

    /// Response to a request that could not be parsed.
    #[must_use]
    pub fn malformed(error: &serde_json::Error) -> Self {
        Self::failure(format!("malformed request: {error}"))
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        match self {
            Self::Granted { success, .. }
            | Self::EmergencyGranted { success, .. }
            | Self::Done { success }
            | Self::Failure { success, .. } => *success,
            Self::Status { .. } | Self::Access { .. } => true,
        }
    }
}

impl From<BypassStatus> for Response {
    fn from(status: BypassStatus) -> Self {
        match status {
            BypassStatus::Inactive => Self::Status {
                active: false,
                emergency: None,
                remaining_time: None,
                end_time: None,
            },
            BypassStatus::Emergency => Self::Status {
                active: true,
                emergency: Some(true),
                remaining_time: None,
                end_time: None,
            },
            BypassStatus::Timed {
                remaining,
                end_time,
            } => Self::Status {
                active: true,
                emergency: None,
                remaining_time: Some(u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX)),
                end_time: Some(end_time),
            },
        }
    }
}

impl From<Access> for Response {
    fn from(access: Access) -> Self {
        Self::Access {
            protected: !matches!(access, Access::Unprotected),
            blocked: access.is_blocked(),
            domain: access.domain().cloned(),
        }
    }
}

/// Read a duration in minutes from a JSON number or numeric string.
///
/// # Errors
///
/// Returns [`AccessError::InvalidDuration`] for anything that is not an
/// integral number.
pub fn parse_duration(value: &Value) -> Result<i64, AccessError> {
    let minutes = match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() <= 9_007_199_254_740_992.0)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    minutes.ok_or_else(|| {
        AccessError::InvalidDuration(format!("{value} is not a whole number of minutes"))
    })
}

/// Execute `request` against `controller`.
///
/// Errors are folded into the response; this never fails.
pub async fn dispatch<S, G>(controller: &AccessController<S, G>, request: Request) -> Response
where
    S: BypassStore,
    G: RuleGateway,
{
    match request {
        Request::RequestBypass {
            site,
            duration,
            original_url,
        } => {
            // An unknown site is reported before a bad duration.
            let result = if controller.directory().resolve(&site).is_none() {
                Err(AccessError::UnknownDomain(site.clone()))
            } else {
                match parse_duration(&duration) {
                    Ok(minutes) => {
                        controller
                            .request_bypass(&site, minutes, &original_url)
                            .await
                    }
                    Err(err) => Err(err),
                }
            };
            match result {
                Ok(grant) => Response::Granted {
                    success: true,
                    end_time: grant.end_time,
                    redirect_url: grant.redirect_url,
                },
                Err(err) => Response::failure(err),
            }
        }
        Request::EmergencyAccess { site, original_url } => {
            match controller
                .request_emergency_access(&site, &original_url)
                .await
            {
                Ok(grant) => Response::EmergencyGranted {
                    success: true,
                    redirect_url: grant.redirect_url,
                },
                Err(err) => Response::failure(err),
            }
        }
        Request::GetBypassStatus { site } => match controller.bypass_status(&site).await {
            Ok(status) => status.into(),
            Err(err) => {
                warn!(site = %site, error = ?err, "bypass status unavailable");
                BypassStatus::Inactive.into()
            }
        },
        Request::CancelBypass { site } => match controller.cancel_bypass(&site).await {
            Ok(()) => Response::done(),
            Err(err) => Response::failure(err),
        },
        Request::CheckAccess { host } => match controller.access_for(&host).await {
            Ok(access) => access.into(),
            Err(err) => Response::failure(err),
        },
        Request::SetBlockingEnabled { enabled } => {
            match controller.set_blocking_enabled(enabled).await {
                Ok(()) => Response::done(),
                Err(err) => Response::failure(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::clock::SystemClock;
    use crate::directory::RuleDirectory;
    use crate::gateway::RuleTable;
    use crate::notifier::LogNotifier;
    use crate::scheduler::TokioScheduler;
    use crate::store::MemoryStore;

    fn controller() -> AccessController<MemoryStore, Arc<RuleTable>> {
        let directory = Arc::new(RuleDirectory::new(["youtube.com"]).unwrap());
        let gateway = Arc::new(RuleTable::from_directory(&directory));
        let (scheduler, _wakeups) = TokioScheduler::new(Arc::new(SystemClock));
        AccessController::new(
            directory,
            MemoryStore::new(),
            gateway,
            Arc::new(scheduler),
            Arc::new(LogNotifier),
            Arc::new(SystemClock),
        )
    }

    #[test]
    fn should_parse_request_bypass_with_camel_case_fields() {
        let request = parse_request(
            r#"{"action":"requestBypass","site":"youtube.com","duration":10,"originalUrl":"https://youtube.com/watch?v=1"}"#,
        )
        .unwrap();

        assert_eq!(
            request,
            Request::RequestBypass {
                site: "youtube.com".into(),
                duration: json!(10),
                original_url: "https://youtube.com/watch?v=1".into(),
            }
        );
    }

    #[test]
    fn should_default_missing_original_url() {
        let request = parse_request(r#"{"action":"emergencyAccess","site":"x.com"}"#).unwrap();

        assert_eq!(
            request,
            Request::EmergencyAccess {
                site: "x.com".into(),
                original_url: String::new(),
            }
        );
    }

    #[test]
    fn should_reject_unknown_action() {
        assert!(parse_request(r#"{"action":"selfDestruct"}"#).is_err());
        assert!(parse_request(r#"{"site":"x.com"}"#).is_err());
        assert!(parse_request("not json").is_err());
    }

    #[test]
    fn should_accept_numeric_durations() {
        assert_eq!(parse_duration(&json!(15)).unwrap(), 15);
        assert_eq!(parse_duration(&json!(15.0)).unwrap(), 15);
        assert_eq!(parse_duration(&json!(" 30 ")).unwrap(), 30);
        assert_eq!(parse_duration(&json!(-1)).unwrap(), -1);
    }

    #[test]
    fn should_reject_non_numeric_durations() {
        for value in [json!(2.5), json!("ten"), json!(null), json!([5]), json!(true)] {
            assert!(
                matches!(parse_duration(&value), Err(AccessError::InvalidDuration(_))),
                "{value} should be rejected"
            );
        }
    }

    #[test]
    fn should_serialize_timed_status() {
        let response: Response = BypassStatus::Timed {
            remaining: Duration::from_secs(90),
            end_time: Timestamp::from_millis(1_000_000),
        }
        .into();

        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"active": true, "remainingTime": 90_000, "endTime": 1_000_000})
        );
    }

    #[test]
    fn should_serialize_emergency_and_inactive_status() {
        let emergency: Response = BypassStatus::Emergency.into();
        let inactive: Response = BypassStatus::Inactive.into();

        assert_eq!(
            serde_json::to_value(&emergency).unwrap(),
            json!({"active": true, "emergency": true})
        );
        assert_eq!(
            serde_json::to_value(&inactive).unwrap(),
            json!({"active": false})
        );
    }

    #[test]
    fn should_serialize_grant_and_failure() {
        let granted = Response::Granted {
            success: true,
            end_time: Timestamp::from_millis(42),
            redirect_url: "https://reddit.com".into(),
        };
        assert_eq!(
            serde_json::to_value(&granted).unwrap(),
            json!({"success": true, "endTime": 42, "redirectUrl": "https://reddit.com"})
        );

        let failure = Response::failure(AccessError::UnknownDomain("nope.example".into()));
        assert!(!failure.is_success());
        assert_eq!(
            serde_json::to_value(&failure).unwrap(),
            json!({"success": false, "error": "Unknown site"})
        );
    }

    #[test]
    fn should_serialize_access_decision() {
        let domain: Domain = "youtube.com".parse().unwrap();

        assert_eq!(
            serde_json::to_value(Response::from(Access::Blocked(domain))).unwrap(),
            json!({"protected": true, "blocked": true, "domain": "youtube.com"})
        );
        assert_eq!(
            serde_json::to_value(Response::from(Access::Unprotected)).unwrap(),
            json!({"protected": false, "blocked": false})
        );
    }

    #[tokio::test]
    async fn should_report_unknown_site_before_bad_duration() {
        let controller = controller();
        let request = Request::RequestBypass {
            site: "example.org".into(),
            duration: json!("abc"),
            original_url: String::new(),
        };

        let response = dispatch(&controller, request).await;

        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"success": false, "error": "Unknown site"})
        );
    }

    #[tokio::test]
    async fn should_report_bad_duration_for_protected_site() {
        let controller = controller();
        let request = Request::RequestBypass {
            site: "youtube.com".into(),
            duration: json!("abc"),
            original_url: String::new(),
        };

        let response = dispatch(&controller, request).await;

        assert!(!response.is_success());
        let body = serde_json::to_value(&response).unwrap();
        assert!(body["error"].as_str().unwrap().starts_with("invalid duration"));
        assert!(controller.access_for("youtube.com").await.unwrap().is_blocked());
    }
}
