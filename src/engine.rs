//! Connection decision path.

use crate::cache::{EntityCache, EntityKey};
use crate::config::Config;
use crate::intel::geo::MaxmindGeo;
use crate::intel::{Entity, EntityState, IntelSources, ListBlockReason, Location};
use crate::lists::FileListIndex;
use crate::profile::endpoints::EndpointVerdict;
use crate::profile::{DefaultAction, Profile};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Build the lookup collaborators described by the configuration.
pub fn build_sources(config: &Config) -> anyhow::Result<(Arc<IntelSources>, Arc<FileListIndex>)> {
    let lists = Arc::new(FileListIndex::load(&config.lists));

    let mut sources = IntelSources::new(lists.clone()).with_security_level(config.intel.security_level);
    if config.geo.is_configured() {
        let geo = MaxmindGeo::open(config.geo.asn_db.as_deref(), config.geo.country_db.as_deref())?;
        sources = sources.with_geo(Arc::new(geo));
        info!("Geo databases enabled");
    }

    Ok((Arc::new(sources), lists))
}

/// An observed connection.
#[derive(Debug, Clone, Default)]
pub struct Flow {
    pub protocol: u8,
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub domain: Option<String>,
    pub cnames: Vec<String>,
    pub inbound: bool,
}

impl Flow {
    fn key(&self) -> EntityKey {
        EntityKey {
            protocol: self.protocol,
            ip: self.ip,
            port: self.port,
            domain: self.domain.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Permit,
    Ask,
    Block,
}

/// What decided a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DecisionReason {
    Disabled,
    EndpointRule(String),
    FilterLists(ListBlockReason),
    ProfileDefault,
    Fallback,
}

/// Outcome of [`PolicyEngine::decide`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub verdict: Verdict,
    pub reason: DecisionReason,
}

impl Decision {
    fn new(verdict: Verdict, reason: DecisionReason) -> Self {
        Self { verdict, reason }
    }
}

/// Enrichment and list results for one endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointReport {
    pub domain: Option<String>,
    pub ip: Option<IpAddr>,
    pub location: Option<Location>,
    pub list_occurrences: BTreeMap<String, Vec<String>>,
    pub blocked_by_lists: Vec<String>,
    pub block_reason: ListBlockReason,
    pub summary: Option<String>,
}

/// Decides on connections of profiled applications.
pub struct PolicyEngine {
    config: Arc<Config>,
    sources: Arc<IntelSources>,
    entities: EntityCache,
}

impl PolicyEngine {
    pub fn new(config: Config, sources: Arc<IntelSources>) -> Self {
        let entities = EntityCache::new(
            config.intel.entity_cache_ttl_seconds,
            config.intel.entity_cache_max_entries,
        );

        info!(
            active_lists = config.active_lists.len(),
            geo = sources.geo.is_some(),
            "Policy engine initialized"
        );

        Self {
            config: Arc::new(config),
            sources,
            entities,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The entity for a flow, reused while it is cached.
    pub async fn observe(&self, flow: &Flow) -> Arc<Entity> {
        let intel = &self.config.intel;
        let entity = self.entities.get_or_insert_with(flow.key(), || {
            let mut builder = Entity::builder(Arc::clone(&self.sources))
                .protocol(flow.protocol)
                .port(flow.port)
                .domain(flow.domain.as_deref().unwrap_or_default())
                .cnames(flow.cnames.clone())
                .reverse_resolve(intel.reverse_resolve)
                .resolve_subdomains(intel.resolve_subdomains)
                .check_cnames(intel.check_cnames);
            if let Some(ip) = flow.ip {
                builder = builder.ip(ip);
            }
            builder.build()
        });

        if !flow.cnames.is_empty() {
            entity.lock().await.set_cnames(flow.cnames.clone());
        }

        entity
    }

    /// Decide on a connection: endpoint rules, then filter lists, then the
    /// profile's default action, then the configured fallback.
    pub async fn decide(&self, profile: &Profile, entity: &Entity, inbound: bool) -> Decision {
        if !self.config.settings.enabled {
            debug!("Policy engine disabled globally");
            return Decision::new(Verdict::Permit, DecisionReason::Disabled);
        }

        let mut state = entity.lock().await;
        let decision = self.evaluate(profile, &mut state, inbound).await;

        let target = state.domain().map(str::to_string).or_else(|| state.get_ip().map(|ip| ip.to_string()));
        match decision.verdict {
            Verdict::Block if self.config.settings.log_blocked => {
                info!(
                    profile = %profile.scoped_id(),
                    target = ?target,
                    reason = ?decision.reason,
                    "Blocking connection"
                );
            }
            Verdict::Permit | Verdict::Ask if self.config.settings.log_allowed => {
                info!(
                    profile = %profile.scoped_id(),
                    target = ?target,
                    verdict = ?decision.verdict,
                    "Allowing connection"
                );
            }
            _ => {}
        }

        decision
    }

    async fn evaluate(&self, profile: &Profile, state: &mut EntityState, inbound: bool) -> Decision {
        let matcher = if inbound {
            profile.service_endpoints()
        } else {
            profile.endpoints()
        };
        match matcher {
            Ok(Some(matcher)) => match matcher.match_entity(state).await {
                EndpointVerdict::Permitted(rule) => {
                    return Decision::new(Verdict::Permit, DecisionReason::EndpointRule(rule));
                }
                EndpointVerdict::Denied(rule) => {
                    return Decision::new(Verdict::Block, DecisionReason::EndpointRule(rule));
                }
                EndpointVerdict::NoMatch => {}
            },
            Ok(None) => {}
            Err(e) => warn!(profile = %profile.scoped_id(), error = %e, "Endpoint rules unavailable"),
        }

        let lists = match profile.filter_list_ids() {
            Ok(ids) if !ids.is_empty() => ids,
            _ => self.config.active_lists.clone(),
        };
        if !lists.is_empty() {
            state.load_lists().await;
            if state.match_lists(&lists) {
                return Decision::new(
                    Verdict::Block,
                    DecisionReason::FilterLists(state.list_block_reason()),
                );
            }
        }

        match profile.default_action() {
            Ok(DefaultAction::Permit) => Decision::new(Verdict::Permit, DecisionReason::ProfileDefault),
            Ok(DefaultAction::Ask) => Decision::new(Verdict::Ask, DecisionReason::ProfileDefault),
            Ok(DefaultAction::Block) => Decision::new(Verdict::Block, DecisionReason::ProfileDefault),
            Ok(DefaultAction::NotSet) | Err(_) => self.fallback(),
        }
    }

    fn fallback(&self) -> Decision {
        let verdict = match self.config.settings.default_action {
            DefaultAction::Block => Verdict::Block,
            DefaultAction::Ask => Verdict::Ask,
            DefaultAction::Permit | DefaultAction::NotSet => Verdict::Permit,
        };
        Decision::new(verdict, DecisionReason::Fallback)
    }

    /// Enrich an endpoint and match it against `active` lists, or the
    /// configured active lists when `active` is empty.
    pub async fn inspect(&self, flow: &Flow, active: &[String]) -> EndpointReport {
        let entity = self.observe(flow).await;
        let mut state = entity.lock().await;
        state.fetch_data().await;

        let active = if active.is_empty() {
            self.config.active_lists.as_slice()
        } else {
            active
        };
        state.match_lists(active);
        let block_reason = state.list_block_reason();

        EndpointReport {
            domain: state.get_domain(true).await,
            ip: state.get_ip(),
            location: state.get_location().await.cloned(),
            list_occurrences: state.list_occurrences().clone(),
            blocked_by_lists: state.blocked_by_lists().to_vec(),
            summary: (!block_reason.is_empty()).then(|| block_reason.to_string()),
            block_reason,
        }
    }
}
