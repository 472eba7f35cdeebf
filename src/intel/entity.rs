//! Remote endpoint entity with lazy enrichment and list matching.
//!
//! An [`Entity`] wraps its state in a mutex. None of the state methods lock
//! anything themselves: the only way to reach them is through the guard
//! returned by [`Entity::lock`], so a decision path holds the lock for its
//! whole enrichment, match and explain sequence.

use super::block_reason::{ListBlockReason, ListMatch};
use super::domain::{make_distinct, merge_sorted, split_domain};
use super::memo::Memo;
use super::netutils::classify_ip;
use super::sources::{IntelSources, Location};
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, trace, warn};

/// The list lookup dimensions of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListDimension {
    Domain,
    Ip,
    Country,
    Asn,
}

#[derive(Debug, Clone, Copy)]
struct ListMemos {
    domain: Memo,
    ip: Memo,
    country: Memo,
    asn: Memo,
}

impl Default for ListMemos {
    fn default() -> Self {
        Self {
            domain: Memo::retrying(),
            ip: Memo::retrying(),
            country: Memo::retrying(),
            asn: Memo::retrying(),
        }
    }
}

impl ListMemos {
    fn reset(&mut self) {
        for memo in [&mut self.domain, &mut self.ip, &mut self.country, &mut self.asn] {
            memo.reset();
        }
    }
}

/// A remote endpoint shared by everything deciding on one connection.
#[derive(Debug)]
pub struct Entity {
    state: Mutex<EntityState>,
}

/// Exclusive access to an entity.
pub type EntityGuard<'a> = MutexGuard<'a, EntityState>;

impl Entity {
    pub fn builder(sources: Arc<IntelSources>) -> EntityBuilder {
        EntityBuilder::new(sources)
    }

    /// Acquire the entity for a read or mutation sequence.
    pub async fn lock(&self) -> EntityGuard<'_> {
        self.state.lock().await
    }

    /// Acquire the entity if nobody else holds it.
    pub fn try_lock(&self) -> Option<EntityGuard<'_>> {
        self.state.try_lock().ok()
    }
}

/// Builder for an [`Entity`].
pub struct EntityBuilder {
    state: EntityState,
}

impl EntityBuilder {
    fn new(sources: Arc<IntelSources>) -> Self {
        Self {
            state: EntityState {
                protocol: 0,
                port: 0,
                dst_port: 0,
                domain: None,
                reverse_domain: None,
                cnames: Vec::new(),
                ip: None,
                country: None,
                asn: None,
                location: None,
                reverse_resolve_enabled: false,
                resolve_subdomain_lists: false,
                check_cnames: false,
                list_occurrences: BTreeMap::new(),
                blocked_by_lists: Vec::new(),
                blocked_entities: Vec::new(),
                location_memo: Memo::once(),
                reverse_memo: Memo::once(),
                list_memos: ListMemos::default(),
                sources,
            },
        }
    }

    pub fn protocol(mut self, protocol: u8) -> Self {
        self.state.protocol = protocol;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.state.port = port;
        self
    }

    pub fn dst_port(mut self, port: u16) -> Self {
        self.state.dst_port = port;
        self
    }

    pub fn domain(mut self, domain: &str) -> Self {
        if !domain.is_empty() {
            self.state.domain = Some(domain.to_string());
        }
        self
    }

    pub fn ip(mut self, ip: IpAddr) -> Self {
        self.state.ip = Some(ip);
        self
    }

    pub fn cnames(mut self, cnames: Vec<String>) -> Self {
        self.state.cnames = cnames;
        self
    }

    pub fn reverse_resolve(mut self, enabled: bool) -> Self {
        self.state.reverse_resolve_enabled = enabled;
        self
    }

    pub fn resolve_subdomains(mut self, enabled: bool) -> Self {
        self.state.resolve_subdomain_lists = enabled;
        self
    }

    pub fn check_cnames(mut self, enabled: bool) -> Self {
        self.state.check_cnames = enabled;
        self
    }

    pub fn build(self) -> Entity {
        Entity {
            state: Mutex::new(self.state),
        }
    }
}

/// State of an entity, reachable only through [`EntityGuard`].
#[derive(Debug)]
pub struct EntityState {
    protocol: u8,
    port: u16,
    dst_port: u16,

    domain: Option<String>,
    reverse_domain: Option<String>,
    cnames: Vec<String>,
    ip: Option<IpAddr>,

    country: Option<String>,
    asn: Option<u32>,
    location: Option<Location>,

    reverse_resolve_enabled: bool,
    resolve_subdomain_lists: bool,
    check_cnames: bool,

    list_occurrences: BTreeMap<String, Vec<String>>,
    blocked_by_lists: Vec<String>,
    blocked_entities: Vec<String>,

    location_memo: Memo,
    reverse_memo: Memo,
    list_memos: ListMemos,

    sources: Arc<IntelSources>,
}

impl EntityState {
    pub fn protocol(&self) -> u8 {
        self.protocol
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn dst_port(&self) -> u16 {
        self.dst_port
    }

    pub fn set_dst_port(&mut self, port: u16) {
        self.dst_port = port;
    }

    /// The forward domain, without triggering any lookup.
    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn cnames(&self) -> &[String] {
        &self.cnames
    }

    /// Replace the CNAME chain. List results are reset since they may
    /// depend on the old chain.
    pub fn set_cnames(&mut self, cnames: Vec<String>) {
        if self.cnames != cnames {
            self.cnames = cnames;
            self.reset_lists();
        }
    }

    /// Enable resolving the domain from the IP on demand.
    pub fn enable_reverse_resolving(&mut self) {
        if self.toggle_locked("reverse resolving") {
            return;
        }
        self.reverse_resolve_enabled = true;
    }

    /// Enable or disable list lookups for sub-domains.
    pub fn resolve_subdomain_lists(&mut self, enabled: bool) {
        if self.toggle_locked("sub-domain resolving") {
            return;
        }
        self.resolve_subdomain_lists = enabled;
    }

    /// Enable or disable list lookups for the CNAME chain.
    pub fn enable_cname_check(&mut self, enabled: bool) {
        if self.toggle_locked("CNAME resolving") {
            return;
        }
        self.check_cnames = enabled;
    }

    pub fn cname_check_enabled(&self) -> bool {
        self.check_cnames
    }

    pub fn subdomain_lists_enabled(&self) -> bool {
        self.resolve_subdomain_lists
    }

    // Toggles only take effect before the domain lists are loaded.
    fn toggle_locked(&self, what: &str) -> bool {
        if self.list_memos.domain.succeeded() {
            warn!(
                domain = self.domain.as_deref().unwrap_or_default(),
                "intel: tried to change {} but lists are already fetched", what
            );
            return true;
        }
        false
    }

    /// Fetch everything that can be fetched, before persisting the entity.
    pub async fn fetch_data(&mut self) {
        self.fetch_location().await;
        self.fetch_lists().await;
    }

    /// The domain of the entity.
    ///
    /// With `prefer_reverse` and reverse resolving enabled, the reverse
    /// domain of the IP is resolved once and returned instead.
    pub async fn get_domain(&mut self, prefer_reverse: bool) -> Option<String> {
        if prefer_reverse && self.reverse_resolve_enabled {
            self.reverse_resolve().await;
            return self.reverse_domain.clone();
        }
        self.domain.clone()
    }

    pub fn get_ip(&self) -> Option<IpAddr> {
        self.ip
    }

    async fn reverse_resolve(&mut self) {
        let (Some(ip), Some(resolver)) = (self.ip, self.sources.resolver.clone()) else {
            return;
        };
        if !self.reverse_memo.begin() {
            return;
        }

        match resolver.resolve(&ip, self.sources.security_level).await {
            Ok(domain) => {
                self.reverse_domain = Some(domain).filter(|d| !d.is_empty());
                self.reverse_memo.finish(true);
            }
            Err(e) => {
                warn!(ip = %ip, error = %e, "intel: failed to resolve IP");
                self.reverse_memo.finish(false);
            }
        }
    }

    async fn fetch_location(&mut self) {
        let (Some(ip), Some(geo)) = (self.ip, self.sources.geo.clone()) else {
            return;
        };
        if !self.location_memo.begin() {
            return;
        }

        match geo.location(&ip).await {
            Ok(location) => {
                self.country = location.country.clone().filter(|c| !c.is_empty());
                self.asn = location.asn.filter(|asn| *asn != 0);
                self.location = Some(location);
                self.location_memo.finish(true);
            }
            Err(e) => {
                warn!(ip = %ip, error = %e, "intel: failed to get location data");
                self.location_memo.finish(false);
            }
        }
    }

    /// The raw location record, fetched once.
    pub async fn get_location(&mut self) -> Option<&Location> {
        self.fetch_location().await;
        self.location.as_ref()
    }

    /// The two letter country code, fetched once with the location.
    pub async fn get_country(&mut self) -> Option<String> {
        self.fetch_location().await;
        self.country.clone()
    }

    /// The AS number, fetched once with the location.
    pub async fn get_asn(&mut self) -> Option<u32> {
        self.fetch_location().await;
        self.asn
    }

    async fn fetch_lists(&mut self) {
        self.load_domain_lists().await;
        self.load_asn_lists().await;
        self.load_ip_lists().await;
        self.load_country_lists().await;
    }

    fn merge_list(&mut self, key: String, list: &[String]) {
        if list.is_empty() {
            return;
        }
        let merged = match self.list_occurrences.get(&key) {
            Some(existing) => merge_sorted(existing, list),
            None => merge_sorted(&[], list),
        };
        self.list_occurrences.insert(key, merged);
    }

    async fn load_domain_lists(&mut self) {
        if self.list_memos.domain.succeeded() {
            return;
        }
        let Some(domain) = self.domain.clone() else {
            return;
        };
        if !self.list_memos.domain.begin() {
            return;
        }

        let mut to_inspect = vec![domain];
        if self.check_cnames {
            trace!(cnames = ?self.cnames, "intel: CNAME filtering enabled, checking CNAMEs too");
            to_inspect.extend(self.cnames.iter().cloned());
        }

        let domains = if self.resolve_subdomain_lists {
            to_inspect.iter().flat_map(|d| split_domain(d)).collect()
        } else {
            to_inspect
        };
        let domains = make_distinct(domains);

        // Results are only committed once every domain was looked up.
        let lists = Arc::clone(&self.sources.lists);
        let mut found = Vec::with_capacity(domains.len());
        for d in domains {
            trace!(domain = %d, "intel: loading domain list");
            match lists.lookup_domain(&d).await {
                Ok(list) => found.push((d, list)),
                Err(e) => {
                    error!(domain = %d, error = %e, "intel: failed to get domain blocklists");
                    self.list_memos.domain.finish(false);
                    return;
                }
            }
        }

        for (d, list) in found {
            self.merge_list(d, &list);
        }
        self.list_memos.domain.finish(true);
    }

    async fn load_asn_lists(&mut self) {
        if self.list_memos.asn.succeeded() {
            return;
        }
        let Some(asn) = self.get_asn().await else {
            return;
        };
        if !self.list_memos.asn.begin() {
            return;
        }

        let asn = asn.to_string();
        trace!(asn = %asn, "intel: loading ASN list");
        let lists = Arc::clone(&self.sources.lists);
        let result = lists.lookup_asn(&asn).await;
        match result {
            Ok(list) => {
                self.merge_list(asn, &list);
                self.list_memos.asn.finish(true);
            }
            Err(e) => {
                error!(asn = %asn, error = %e, "intel: failed to get ASN blocklist");
                self.list_memos.asn.finish(false);
            }
        }
    }

    async fn load_country_lists(&mut self) {
        if self.list_memos.country.succeeded() {
            return;
        }
        let Some(country) = self.get_country().await else {
            return;
        };
        if !self.list_memos.country.begin() {
            return;
        }

        trace!(country = %country, "intel: loading country list");
        let lists = Arc::clone(&self.sources.lists);
        let result = lists.lookup_country(&country).await;
        match result {
            Ok(list) => {
                self.merge_list(country, &list);
                self.list_memos.country.finish(true);
            }
            Err(e) => {
                error!(country = %country, error = %e, "intel: failed to load country blocklist");
                self.list_memos.country.finish(false);
            }
        }
    }

    async fn load_ip_lists(&mut self) {
        if self.list_memos.ip.succeeded() {
            return;
        }
        let Some(ip) = self.ip else {
            return;
        };
        // Only global addresses can appear in public lists.
        if !classify_ip(&ip).is_global() {
            debug!(ip = %ip, "intel: skipping IP list lookup for non-global address");
            return;
        }
        if !self.list_memos.ip.begin() {
            return;
        }

        trace!(ip = %ip, "intel: loading IP list");
        let lists = Arc::clone(&self.sources.lists);
        match lists.lookup_ip(&ip).await {
            Ok(list) => {
                self.merge_list(ip.to_string(), &list);
                self.list_memos.ip.finish(true);
            }
            Err(e) => {
                error!(ip = %ip, error = %e, "intel: failed to get IP blocklist");
                self.list_memos.ip.finish(false);
            }
        }
    }

    /// Look up the entity in all filter lists. Returns whether it was found
    /// in any list.
    pub async fn load_lists(&mut self) -> bool {
        self.fetch_lists().await;
        !self.list_occurrences.is_empty()
    }

    /// Drop all list results so the next load fetches them again.
    /// Location data is kept.
    pub fn reset_lists(&mut self) {
        self.list_occurrences.clear();
        self.blocked_by_lists.clear();
        self.blocked_entities.clear();
        self.list_memos.reset();
    }

    /// Whether the lookup for a dimension has completed successfully.
    pub fn list_loaded(&self, dimension: ListDimension) -> bool {
        let memo = match dimension {
            ListDimension::Domain => &self.list_memos.domain,
            ListDimension::Ip => &self.list_memos.ip,
            ListDimension::Country => &self.list_memos.country,
            ListDimension::Asn => &self.list_memos.asn,
        };
        memo.succeeded()
    }

    /// Match the recorded list occurrences against the active list IDs.
    ///
    /// Recomputes the blocked lists and blocked keys from scratch and returns
    /// whether anything matched.
    pub fn match_lists(&mut self, active: &[String]) -> bool {
        let active: HashSet<&str> = active.iter().map(String::as_str).collect();

        let mut by_lists = Vec::new();
        let mut entities = Vec::new();
        for (key, lists) in &self.list_occurrences {
            for list in lists {
                if active.contains(list.as_str()) {
                    by_lists.push(list.clone());
                    entities.push(key.clone());
                }
            }
        }

        self.blocked_by_lists = make_distinct(by_lists);
        self.blocked_entities = make_distinct(entities);
        !self.blocked_by_lists.is_empty()
    }

    /// Explain the last match, one entry per blocked key.
    pub fn list_block_reason(&self) -> ListBlockReason {
        let active: HashSet<&str> = self.blocked_by_lists.iter().map(String::as_str).collect();

        let matches = self
            .blocked_entities
            .iter()
            .map(|key| {
                let (active_lists, inactive_lists) = self
                    .list_occurrences
                    .get(key)
                    .map(|lists| {
                        lists
                            .iter()
                            .cloned()
                            .partition(|l| active.contains(l.as_str()))
                    })
                    .unwrap_or_default();
                ListMatch {
                    entity: key.clone(),
                    active_lists,
                    inactive_lists,
                }
            })
            .collect();

        ListBlockReason(matches)
    }

    pub fn list_occurrences(&self) -> &BTreeMap<String, Vec<String>> {
        &self.list_occurrences
    }

    pub fn blocked_by_lists(&self) -> &[String] {
        &self.blocked_by_lists
    }

    pub fn blocked_entities(&self) -> &[String] {
        &self.blocked_entities
    }
}
