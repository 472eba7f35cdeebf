//! Lookup collaborators used to enrich an entity.
//!
//! The entity never talks to a database or resolver directly. Everything it
//! needs is reached through the traits in this module, bundled into
//! [`IntelSources`] and handed to the entity at construction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;

/// Geographic and routing data for an IP address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Two letter ISO country code.
    pub country: Option<String>,

    /// Autonomous system number.
    pub asn: Option<u32>,

    /// Autonomous system organisation.
    pub as_org: Option<String>,
}

impl Location {
    /// Create a location with a country and an AS number.
    pub fn new(country: &str, asn: u32) -> Self {
        Self {
            country: Some(country.to_string()),
            asn: Some(asn),
            as_org: None,
        }
    }

    /// Set the AS organisation.
    pub fn with_as_org(mut self, org: &str) -> Self {
        self.as_org = Some(org.to_string());
        self
    }
}

/// Security level passed to the reverse resolver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    #[default]
    Normal,
    High,
    Extreme,
}

/// Error from a lookup collaborator.
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    /// The backing store could not be read.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The backing store returned data we could not use.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// The queried key is not known to the collaborator.
    #[error("not found: {0}")]
    NotFound(String),

    /// The collaborator is not ready or not configured.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// Threat and classification list membership lookups.
///
/// Every method returns the IDs of the list sources that contain the key.
/// An empty vector means the key is not listed anywhere.
#[async_trait]
pub trait ThreatListLookup: Send + Sync {
    /// Look up a fully qualified domain (no sub-domain matching).
    async fn lookup_domain(&self, domain: &str) -> Result<Vec<String>, LookupError>;

    /// Look up an IP address.
    async fn lookup_ip(&self, ip: &IpAddr) -> Result<Vec<String>, LookupError>;

    /// Look up an AS number in its decimal form.
    async fn lookup_asn(&self, asn: &str) -> Result<Vec<String>, LookupError>;

    /// Look up a two letter country code.
    async fn lookup_country(&self, country: &str) -> Result<Vec<String>, LookupError>;
}

/// Geo/ASN database lookups.
#[async_trait]
pub trait GeoLookup: Send + Sync {
    async fn location(&self, ip: &IpAddr) -> Result<Location, LookupError>;
}

/// Reverse DNS resolution.
#[async_trait]
pub trait ReverseResolver: Send + Sync {
    async fn resolve(&self, ip: &IpAddr, level: SecurityLevel) -> Result<String, LookupError>;
}

/// The set of collaborators shared by all entities.
#[derive(Clone)]
pub struct IntelSources {
    pub lists: Arc<dyn ThreatListLookup>,
    pub geo: Option<Arc<dyn GeoLookup>>,
    pub resolver: Option<Arc<dyn ReverseResolver>>,
    pub security_level: SecurityLevel,
}

impl IntelSources {
    /// Create a source bundle with list lookups only.
    pub fn new(lists: Arc<dyn ThreatListLookup>) -> Self {
        Self {
            lists,
            geo: None,
            resolver: None,
            security_level: SecurityLevel::default(),
        }
    }

    /// Attach a geo database.
    pub fn with_geo(mut self, geo: Arc<dyn GeoLookup>) -> Self {
        self.geo = Some(geo);
        self
    }

    /// Attach a reverse resolver.
    pub fn with_resolver(mut self, resolver: Arc<dyn ReverseResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Set the security level used for reverse lookups.
    pub fn with_security_level(mut self, level: SecurityLevel) -> Self {
        self.security_level = level;
        self
    }
}

impl std::fmt::Debug for IntelSources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntelSources")
            .field("geo", &self.geo.is_some())
            .field("resolver", &self.resolver.is_some())
            .field("security_level", &self.security_level)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_builder() {
        let loc = Location::new("DE", 3320).with_as_org("Deutsche Telekom AG");
        assert_eq!(loc.country.as_deref(), Some("DE"));
        assert_eq!(loc.asn, Some(3320));
        assert_eq!(loc.as_org.as_deref(), Some("Deutsche Telekom AG"));
    }

    #[test]
    fn test_security_level_yaml() {
        let level: SecurityLevel = serde_yaml::from_str("high").unwrap();
        assert_eq!(level, SecurityLevel::High);
        assert_eq!(SecurityLevel::default(), SecurityLevel::Normal);
    }

    #[test]
    fn test_lookup_error_display() {
        let err = LookupError::Unavailable("filter lists not loaded".to_string());
        assert_eq!(err.to_string(), "unavailable: filter lists not loaded");
    }
}
