//! Geo/ASN lookups backed by MaxMind GeoLite2 databases.

use super::sources::{GeoLookup, Location, LookupError};
use async_trait::async_trait;
use maxminddb::{geoip2, MaxMindDBError, Reader};
use std::net::IpAddr;
use std::path::Path;
use tracing::info;

/// MaxMind ASN and country databases. Either may be absent.
pub struct MaxmindGeo {
    asn: Option<Reader<Vec<u8>>>,
    country: Option<Reader<Vec<u8>>>,
}

fn open_reader(path: &Path) -> Result<Reader<Vec<u8>>, LookupError> {
    let reader = Reader::open_readfile(path).map_err(|e| {
        LookupError::Unavailable(format!("could not read {}: {}", path.display(), e))
    })?;
    info!(path = %path.display(), "Geo database loaded");
    Ok(reader)
}

impl MaxmindGeo {
    pub fn open(asn_db: Option<&Path>, country_db: Option<&Path>) -> Result<Self, LookupError> {
        Ok(Self {
            asn: asn_db.map(open_reader).transpose()?,
            country: country_db.map(open_reader).transpose()?,
        })
    }
}

fn lookup_failed(e: MaxMindDBError) -> LookupError {
    LookupError::InvalidData(e.to_string())
}

#[async_trait]
impl GeoLookup for MaxmindGeo {
    async fn location(&self, ip: &IpAddr) -> Result<Location, LookupError> {
        if self.asn.is_none() && self.country.is_none() {
            return Err(LookupError::Unavailable("no geo database configured".to_string()));
        }

        let mut location = Location::default();

        if let Some(reader) = &self.country {
            match reader.lookup::<geoip2::Country>(*ip) {
                Ok(record) => {
                    location.country = record
                        .country
                        .and_then(|c| c.iso_code)
                        .map(str::to_string);
                }
                Err(MaxMindDBError::AddressNotFoundError(_)) => {}
                Err(e) => return Err(lookup_failed(e)),
            }
        }

        if let Some(reader) = &self.asn {
            match reader.lookup::<geoip2::Asn>(*ip) {
                Ok(record) => {
                    location.asn = record.autonomous_system_number;
                    location.as_org = record.autonomous_system_organization.map(str::to_string);
                }
                Err(MaxMindDBError::AddressNotFoundError(_)) => {}
                Err(e) => return Err(lookup_failed(e)),
            }
        }

        Ok(location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_database() {
        let result = MaxmindGeo::open(Some(Path::new("/nonexistent/GeoLite2-ASN.mmdb")), None);
        assert!(matches!(result, Err(LookupError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_no_database_configured() {
        let geo = MaxmindGeo::open(None, None).unwrap();
        let result = geo.location(&"8.8.8.8".parse().unwrap()).await;
        assert!(matches!(result, Err(LookupError::Unavailable(_))));
    }
}
