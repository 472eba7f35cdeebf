//! Instrumented collaborators for unit tests.

use crate::intel::{
    GeoLookup, ListDimension, Location, LookupError, ReverseResolver, SecurityLevel,
    ThreatListLookup,
};
use crate::lists::{ListIdResolver, ListResolveError};
use crate::profile::endpoints::RuleCompiler;
use crate::profile::metadata::{MetadataError, MetadataSource};
use crate::profile::store::MemoryProfileStore;
use crate::profile::ProfileEnv;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn to_ids(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

/// List lookup with per-dimension call counters and failure injection.
#[derive(Default)]
pub struct FakeLists {
    domains: HashMap<String, Vec<String>>,
    ips: HashMap<IpAddr, Vec<String>>,
    asns: HashMap<String, Vec<String>>,
    countries: HashMap<String, Vec<String>>,
    failing: Mutex<HashSet<ListDimension>>,
    calls: Mutex<HashMap<ListDimension, usize>>,
}

impl FakeLists {
    pub fn with_domain(mut self, domain: &str, ids: &[&str]) -> Self {
        self.domains.insert(domain.to_string(), to_ids(ids));
        self
    }

    pub fn with_ip(mut self, ip: &str, ids: &[&str]) -> Self {
        self.ips.insert(ip.parse().unwrap(), to_ids(ids));
        self
    }

    pub fn with_asn(mut self, asn: &str, ids: &[&str]) -> Self {
        self.asns.insert(asn.to_string(), to_ids(ids));
        self
    }

    pub fn with_country(mut self, country: &str, ids: &[&str]) -> Self {
        self.countries.insert(country.to_string(), to_ids(ids));
        self
    }

    pub fn set_failing(&self, dimension: ListDimension, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(dimension);
        } else {
            set.remove(&dimension);
        }
    }

    /// Number of lookups made for a dimension.
    pub fn calls(&self, dimension: ListDimension) -> usize {
        self.calls.lock().unwrap().get(&dimension).copied().unwrap_or(0)
    }

    fn record(
        &self,
        dimension: ListDimension,
        found: Option<&Vec<String>>,
    ) -> Result<Vec<String>, LookupError> {
        *self.calls.lock().unwrap().entry(dimension).or_default() += 1;
        if self.failing.lock().unwrap().contains(&dimension) {
            return Err(LookupError::Unavailable("injected failure".to_string()));
        }
        Ok(found.cloned().unwrap_or_default())
    }
}

#[async_trait]
impl ThreatListLookup for FakeLists {
    async fn lookup_domain(&self, domain: &str) -> Result<Vec<String>, LookupError> {
        self.record(ListDimension::Domain, self.domains.get(domain))
    }

    async fn lookup_ip(&self, ip: &IpAddr) -> Result<Vec<String>, LookupError> {
        self.record(ListDimension::Ip, self.ips.get(ip))
    }

    async fn lookup_asn(&self, asn: &str) -> Result<Vec<String>, LookupError> {
        self.record(ListDimension::Asn, self.asns.get(asn))
    }

    async fn lookup_country(&self, country: &str) -> Result<Vec<String>, LookupError> {
        self.record(ListDimension::Country, self.countries.get(country))
    }
}

/// Geo lookup answering from a fixed table.
#[derive(Default)]
pub struct FakeGeo {
    locations: HashMap<IpAddr, Location>,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl FakeGeo {
    pub fn with(mut self, ip: &str, location: Location) -> Self {
        self.locations.insert(ip.parse().unwrap(), location);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GeoLookup for FakeGeo {
    async fn location(&self, ip: &IpAddr) -> Result<Location, LookupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(LookupError::Unavailable("injected failure".to_string()));
        }
        Ok(self.locations.get(ip).cloned().unwrap_or_default())
    }
}

/// Reverse resolver answering from a fixed table.
#[derive(Default)]
pub struct FakeResolver {
    names: HashMap<IpAddr, String>,
    calls: AtomicUsize,
}

impl FakeResolver {
    pub fn with(mut self, ip: &str, domain: &str) -> Self {
        self.names.insert(ip.parse().unwrap(), domain.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReverseResolver for FakeResolver {
    async fn resolve(&self, ip: &IpAddr, _level: SecurityLevel) -> Result<String, LookupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.names
            .get(ip)
            .cloned()
            .ok_or_else(|| LookupError::NotFound(ip.to_string()))
    }
}

/// List ID resolver knowing a fixed set of IDs.
pub struct FakeListIds(pub Vec<String>);

impl ListIdResolver for FakeListIds {
    fn resolve_list_ids(&self, ids: &[String]) -> Result<Vec<String>, ListResolveError> {
        ids.iter()
            .map(|id| {
                if self.0.contains(id) {
                    Ok(id.clone())
                } else {
                    Err(ListResolveError::UnknownList(id.clone()))
                }
            })
            .collect()
    }
}

/// Metadata source returning a configured answer.
pub struct FakeMetadata {
    answer: Result<String, MetadataError>,
    calls: AtomicUsize,
}

impl FakeMetadata {
    pub fn name(name: &str) -> Self {
        Self::answering(Ok(name.to_string()))
    }

    pub fn error(error: MetadataError) -> Self {
        Self::answering(Err(error))
    }

    fn answering(answer: Result<String, MetadataError>) -> Self {
        Self {
            answer,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataSource for FakeMetadata {
    async fn binary_name(&self, _path: &Path) -> Result<String, MetadataError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.answer {
            Ok(name) => Ok(name.clone()),
            Err(MetadataError::NotSupported) => Err(MetadataError::NotSupported),
            Err(MetadataError::NotFound) => Err(MetadataError::NotFound),
            Err(MetadataError::EmptyOutput) => Err(MetadataError::EmptyOutput),
            Err(e) => Err(MetadataError::Other(e.to_string())),
        }
    }
}

/// Profile collaborators backed by an in-memory store.
pub fn profile_env(metadata: Arc<dyn MetadataSource>) -> (ProfileEnv, Arc<MemoryProfileStore>) {
    let store = Arc::new(MemoryProfileStore::new());
    let env = ProfileEnv {
        store: store.clone(),
        compiler: Arc::new(RuleCompiler),
        list_ids: Arc::new(FakeListIds(to_ids(&["MAL", "ADS", "TRAC"]))),
        metadata,
    };
    (env, store)
}
