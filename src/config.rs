//! Configuration types for the endpoint policy daemon.

use crate::intel::SecurityLevel;
use crate::profile::DefaultAction;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::OnceLock;

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Global settings.
    #[serde(default)]
    pub settings: Settings,

    /// Entity enrichment behavior.
    #[serde(default)]
    pub intel: IntelConfig,

    /// GeoIP/ASN databases.
    #[serde(default)]
    pub geo: GeoConfig,

    /// File-based threat lists.
    #[serde(default)]
    pub lists: Vec<ListSourceConfig>,

    /// List IDs enforced when a profile does not name its own.
    #[serde(default)]
    pub active_lists: Vec<String>,
}

/// Global settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    /// Master enable/disable switch.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Action when neither rules, lists nor the profile decide.
    #[serde(default = "default_fallback_action")]
    pub default_action: DefaultAction,

    /// Log blocked connections.
    #[serde(default = "default_true")]
    pub log_blocked: bool,

    /// Log permitted connections.
    #[serde(default)]
    pub log_allowed: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            default_action: default_fallback_action(),
            log_blocked: true,
            log_allowed: false,
        }
    }
}

fn default_fallback_action() -> DefaultAction {
    DefaultAction::Permit
}

/// Entity enrichment configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IntelConfig {
    /// Look up every parent domain down to the public suffix.
    #[serde(default = "default_true")]
    pub resolve_subdomains: bool,

    /// Include the CNAME chain in domain lookups.
    #[serde(default = "default_true")]
    pub check_cnames: bool,

    /// Allow reverse DNS when no domain is known.
    #[serde(default)]
    pub reverse_resolve: bool,

    /// Security level passed to the reverse resolver.
    #[serde(default)]
    pub security_level: SecurityLevel,

    /// How long an entity is reused for repeated observations.
    #[serde(default = "default_entity_ttl")]
    pub entity_cache_ttl_seconds: u64,

    /// Maximum number of cached entities.
    #[serde(default = "default_entity_capacity")]
    pub entity_cache_max_entries: usize,
}

impl Default for IntelConfig {
    fn default() -> Self {
        Self {
            resolve_subdomains: true,
            check_cnames: true,
            reverse_resolve: false,
            security_level: SecurityLevel::default(),
            entity_cache_ttl_seconds: default_entity_ttl(),
            entity_cache_max_entries: default_entity_capacity(),
        }
    }
}

fn default_entity_ttl() -> u64 {
    60
}

fn default_entity_capacity() -> usize {
    10_000
}

/// MaxMind database locations.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GeoConfig {
    /// GeoLite2-ASN database.
    #[serde(default)]
    pub asn_db: Option<PathBuf>,

    /// GeoLite2-Country database.
    #[serde(default)]
    pub country_db: Option<PathBuf>,
}

impl GeoConfig {
    pub fn is_configured(&self) -> bool {
        self.asn_db.is_some() || self.country_db.is_some()
    }
}

/// File-based threat list source.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListSourceConfig {
    /// Identifier used in list occurrences and block reasons.
    pub id: String,

    /// Human readable name.
    #[serde(default)]
    pub name: String,

    /// Enable this list.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Path to list file.
    pub path: PathBuf,

    /// File format.
    #[serde(default)]
    pub format: ListFormat,

    /// How often to refresh the list from disk (seconds).
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_seconds: u64,
}

fn default_refresh_interval() -> u64 {
    300
}

/// List file format.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ListFormat {
    /// Plain text, one entry per line.
    #[default]
    Plain,
    /// CSV with the entry in the first column.
    Csv,
    /// JSON array of entries.
    Json,
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let expanded = expand_env_vars(&content);
        let config: Config = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut ids = HashSet::new();
        for list in &self.lists {
            if list.id.trim().is_empty() {
                anyhow::bail!("List with path {} has an empty id", list.path.display());
            }
            if !ids.insert(list.id.as_str()) {
                anyhow::bail!("Duplicate list id: {}", list.id);
            }
            if list.enabled && !list.path.exists() {
                anyhow::bail!(
                    "List '{}' path does not exist: {}",
                    list.id,
                    list.path.display()
                );
            }
        }

        for id in &self.active_lists {
            if !ids.contains(id.as_str()) {
                anyhow::bail!("Active list '{}' is not configured", id);
            }
        }

        for path in self.geo.asn_db.iter().chain(self.geo.country_db.iter()) {
            if !path.exists() {
                anyhow::bail!("Geo database does not exist: {}", path.display());
            }
        }

        Ok(())
    }

    /// Generate example configuration YAML.
    pub fn example() -> String {
        r#"# Endpoint Policy Configuration

settings:
  enabled: true
  default_action: permit       # permit, ask or block when a profile leaves it unset
  log_blocked: true
  log_allowed: false

# Entity enrichment
intel:
  resolve_subdomains: true     # also check parent domains down to the public suffix
  check_cnames: true           # also check the CNAME chain
  reverse_resolve: false       # reverse DNS for IP-only connections
  security_level: normal       # normal, high or extreme
  entity_cache_ttl_seconds: 60
  entity_cache_max_entries: 10000

# MaxMind GeoLite2 databases (optional)
geo:
  asn_db: "/var/lib/zentinel/GeoLite2-ASN.mmdb"
  country_db: "/var/lib/zentinel/GeoLite2-Country.mmdb"

# File-based threat lists
# Entries: IP, CIDR, AS<number>, country:<CC> or domain
lists:
  - id: "MAL"
    name: "Malware"
    enabled: true
    path: "${ZENTINEL_LISTS}/malware.txt"
    format: plain              # plain, csv, or json
    refresh_interval_seconds: 300

# Lists enforced for profiles that do not select their own
active_lists:
  - "MAL"
"#
        .to_string()
    }
}

fn env_var_pattern() -> Option<&'static regex::Regex> {
    static PATTERN: OnceLock<Option<regex::Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| regex::Regex::new(r"\$\{([^}]+)\}").ok())
        .as_ref()
}

/// Expand environment variables in the format ${VAR_NAME}.
fn expand_env_vars(content: &str) -> String {
    let Some(re) = env_var_pattern() else {
        return content.to_string();
    };

    let expanded: Cow<'_, str> = re.replace_all(content, |cap: &regex::Captures<'_>| {
        std::env::var(&cap[1]).unwrap_or_default()
    });
    expanded.into_owned()
}
