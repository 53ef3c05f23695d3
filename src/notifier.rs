//! User notifications for bypass warnings and expiries.

/// Fire-and-forget user notification sink.
pub trait Notifier: Send + Sync + 'static {
    fn notify(&self, title: &str, body: &str);
}

/// Notifier that writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, title: &str, body: &str) {
        tracing::info!(title, body, "notification");
    }
}

/// Title and body of the warning sent before a timed bypass ends.
#[must_use]
pub fn warning_message(domain: &str, minutes_left: u64) -> (&'static str, String) {
    let unit = if minutes_left == 1 { "minute" } else { "minutes" };
    (
        "Time Almost Up!",
        format!("Your access to {domain} expires in {minutes_left} {unit}. Time to wrap up!"),
    )
}

/// Title and body of the notification sent when a timed bypass ends.
#[must_use]
pub fn expiry_message(domain: &str) -> (&'static str, String) {
    (
        "Access Expired",
        format!("Your timed access to {domain} has ended. Back to focus mode!"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_pluralize_warning_minutes() {
        let (title, body) = warning_message("youtube.com", 3);
        assert_eq!(title, "Time Almost Up!");
        assert_eq!(
            body,
            "Your access to youtube.com expires in 3 minutes. Time to wrap up!"
        );

        let (_, body) = warning_message("youtube.com", 1);
        assert!(body.contains("in 1 minute."));
    }

    #[test]
    fn should_name_domain_in_expiry_message() {
        let (title, body) = expiry_message("reddit.com");
        assert_eq!(title, "Access Expired");
        assert!(body.contains("reddit.com"));
    }
}
