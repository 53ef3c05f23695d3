//! Configuration loading and validation.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::directory::loader::load_site_list;
use crate::directory::{Domain, RuleDirectory};
use crate::error::{ConfigError, Result, ValidationError};

/// Sites protected when the configuration does not list any.
pub const DEFAULT_SITES: [&str; 12] = [
    "facebook.com",
    "fb.com",
    "instagram.com",
    "youtube.com",
    "twitter.com",
    "x.com",
    "tiktok.com",
    "reddit.com",
    "snapchat.com",
    "linkedin.com",
    "discord.com",
    "twitch.tv",
];

/// Main configuration for the focusgate daemon.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Protected domains. Rule ids follow this order, starting at 1.
    #[serde(default = "default_sites")]
    pub sites: Vec<String>,

    /// Optional file with more domains, one per line, `#` for comments.
    /// Its entries get rule ids after the inline `sites`.
    pub sites_file: Option<PathBuf>,

    /// Where bypass records are persisted.
    /// Defaults to `focusgate/bypasses.json` under the user data directory.
    pub state_path: Option<PathBuf>,

    /// Control server address.
    #[serde(
        default = "default_listen",
        deserialize_with = "deserialize_socket_addr"
    )]
    pub listen: SocketAddr,

    /// Whether block rules start enabled, until the switch is toggled at
    /// runtime and its stored value takes over.
    #[serde(default = "default_blocking_enabled")]
    pub blocking_enabled: bool,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Prometheus exporter settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Address of the `/metrics` HTTP listener.
    #[serde(
        default = "default_metrics_listen",
        deserialize_with = "deserialize_socket_addr"
    )]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sites: default_sites(),
            sites_file: None,
            state_path: None,
            listen: default_listen(),
            blocking_enabled: default_blocking_enabled(),
            metrics: MetricsConfig::default(),
        }
    }
}

fn default_sites() -> Vec<String> {
    DEFAULT_SITES.iter().map(ToString::to_string).collect()
}

const fn default_listen() -> SocketAddr {
    SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::LOCALHOST), 7878)
}

const fn default_metrics_listen() -> SocketAddr {
    SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::LOCALHOST), 9000)
}

const fn default_blocking_enabled() -> bool {
    true
}

fn deserialize_socket_addr<'de, D>(deserializer: D) -> std::result::Result<SocketAddr, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadFile)?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    fn validate(&self) -> std::result::Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for site in &self.sites {
            let normalized = site.trim().trim_end_matches('.').to_lowercase();
            if normalized.is_empty() {
                return Err(ValidationError::EmptySite.into());
            }
            if normalized.contains('*') {
                return Err(ValidationError::WildcardSite { site: site.clone() }.into());
            }
            if !seen.insert(normalized) {
                return Err(ValidationError::DuplicateSite { site: site.clone() }.into());
            }
        }

        if self
            .sites_file
            .as_ref()
            .is_some_and(|path| path.as_os_str().is_empty())
        {
            return Err(ValidationError::EmptySitesFile.into());
        }

        Ok(())
    }

    /// Resolved location of the bypass store.
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.state_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("focusgate")
                .join("bypasses.json")
        })
    }

    /// Build the rule directory from `sites` followed by `sites_file`.
    ///
    /// Entries of the file that repeat an earlier domain are skipped.
    pub async fn rule_directory(&self) -> Result<RuleDirectory> {
        let mut sites = self.sites.clone();

        if let Some(path) = &self.sites_file {
            let extra = load_site_list(path).await?;
            let mut seen = sites
                .iter()
                .map(|site| site.parse::<Domain>())
                .collect::<std::result::Result<HashSet<_>, _>>()?;

            let before = sites.len();
            for site in extra {
                let domain: Domain = site.parse()?;
                if seen.insert(domain) {
                    sites.push(site);
                } else {
                    tracing::debug!(site = %site, path = ?path, "skipping duplicate site");
                }
            }
            tracing::info!(path = ?path, added = sites.len() - before, "loaded site list");
        }

        Ok(RuleDirectory::new(&sites)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = Config::parse("").unwrap();

        assert_eq!(config.sites.len(), 12);
        assert_eq!(config.sites[0], "facebook.com");
        assert_eq!(config.sites[11], "twitch.tv");
        assert_eq!(config.listen.to_string(), "127.0.0.1:7878");
        assert!(config.blocking_enabled);
        assert!(config.sites_file.is_none());
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn test_parse_valid_config() {
        let toml = r#"
            sites = ["youtube.com", "reddit.com"]
            sites_file = "/etc/focusgate/sites.txt"
            state_path = "/var/lib/focusgate/bypasses.json"
            listen = "127.0.0.1:9999"
            blocking_enabled = false

            [metrics]
            enabled = true
            listen = "0.0.0.0:9100"
        "#;

        let config = Config::parse(toml).unwrap();
        assert_eq!(config.sites, vec!["youtube.com", "reddit.com"]);
        assert_eq!(
            config.state_path(),
            PathBuf::from("/var/lib/focusgate/bypasses.json")
        );
        assert_eq!(config.listen.port(), 9999);
        assert!(!config.blocking_enabled);
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.listen.to_string(), "0.0.0.0:9100");
    }

    #[test]
    fn test_default_state_path_under_data_dir() {
        let config = Config::default();
        let path = config.state_path();

        assert!(path.ends_with("focusgate/bypasses.json"));
    }

    #[test]
    fn test_empty_site_list_is_allowed() {
        let config = Config::parse("sites = []").unwrap();
        assert!(config.sites.is_empty());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = Config::parse("upstream_resolver = \"1.1.1.1:53\"");
        assert!(matches!(
            result,
            Err(crate::Error::Config(ConfigError::Parse(_)))
        ));
    }

    #[test]
    fn test_invalid_listen_address() {
        let result = Config::parse(r#"listen = "not-an-address""#);
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_site_rejected() {
        let result = Config::parse(r#"sites = ["youtube.com", "  "]"#);
        assert!(matches!(
            result,
            Err(crate::Error::Config(ConfigError::Validation(
                ValidationError::EmptySite
            )))
        ));
    }

    #[test]
    fn test_wildcard_site_rejected() {
        let result = Config::parse(r#"sites = ["*.youtube.com"]"#);
        assert!(matches!(
            result,
            Err(crate::Error::Config(ConfigError::Validation(
                ValidationError::WildcardSite { .. }
            )))
        ));
    }

    #[test]
    fn test_duplicate_site_rejected() {
        let result = Config::parse(r#"sites = ["youtube.com", "YouTube.com."]"#);
        assert!(matches!(
            result,
            Err(crate::Error::Config(ConfigError::Validation(
                ValidationError::DuplicateSite { .. }
            )))
        ));
    }

    #[test]
    fn test_empty_sites_file_rejected() {
        let result = Config::parse(r#"sites_file = """#);
        assert!(matches!(
            result,
            Err(crate::Error::Config(ConfigError::Validation(
                ValidationError::EmptySitesFile
            )))
        ));
    }

    #[tokio::test]
    async fn test_rule_directory_appends_sites_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sites.txt");
        std::fs::write(&path, "# extras\nnews.ycombinator.com\nreddit.com\n\nlobste.rs\n").unwrap();

        let config = Config {
            sites: vec!["youtube.com".into(), "reddit.com".into()],
            sites_file: Some(path),
            ..Config::default()
        };
        let directory = config.rule_directory().await.unwrap();

        assert_eq!(directory.len(), 4);
        assert_eq!(directory.rule_id_for("youtube.com").unwrap().get(), 1);
        assert_eq!(directory.rule_id_for("reddit.com").unwrap().get(), 2);
        assert_eq!(
            directory.rule_id_for("news.ycombinator.com").unwrap().get(),
            3
        );
        assert_eq!(directory.rule_id_for("lobste.rs").unwrap().get(), 4);
    }

    #[tokio::test]
    async fn test_rule_directory_fails_on_missing_sites_file() {
        let config = Config {
            sites_file: Some(PathBuf::from("/nonexistent/focusgate/sites.txt")),
            ..Config::default()
        };

        let result = config.rule_directory().await;
        assert!(matches!(result, Err(crate::Error::SiteList(_))));
    }
}
