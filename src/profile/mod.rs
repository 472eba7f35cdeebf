//! Application profiles: endpoint rules, settings and usage tracking.
//!
//! A [`Profile`] locks internally. Every public method may be called from
//! any task without external synchronization.
//!
//! Settings live in a nested mapping (see [`hierarchy`]) and are interpreted
//! lazily into typed fields. Any edit of the mapping invalidates the
//! interpretation before the next read.

pub mod endpoints;
pub mod hierarchy;
pub mod layered;
pub mod metadata;
pub mod store;

use crate::lists::{ListIdResolver, ListResolveError};
use endpoints::{EndpointCompiler, EndpointMatcher, EndpointParseError};
use hierarchy::{put_value, ConfigError, Perspective};
use layered::LayeredProfile;
use metadata::{file_name, generate_binary_name, MetadataSource};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use store::{make_profile_key, make_scoped_id, ProfileRecord, ProfileStore, StoreError};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub use store::IconType;

/// Setting key of the default action.
pub const CFG_DEFAULT_ACTION_KEY: &str = "filter/defaultAction";
/// Setting key of the endpoint rules.
pub const CFG_ENDPOINTS_KEY: &str = "filter/endpoints";
/// Setting key of the service (inbound) endpoint rules.
pub const CFG_SERVICE_ENDPOINTS_KEY: &str = "filter/serviceEndpoints";
/// Setting key of the filter lists.
pub const CFG_FILTER_LISTS_KEY: &str = "filter/lists";

/// Minimum time between two updates of the last used timestamp.
pub const LAST_USED_UPDATE_THRESHOLD_SECS: i64 = 24 * 60 * 60;

/// Where a profile comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileSource {
    /// Local, editable.
    #[default]
    Local,
    /// Built-in, read-only.
    Special,
    Network,
    Community,
    Enterprise,
}

impl ProfileSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileSource::Local => "local",
            ProfileSource::Special => "special",
            ProfileSource::Network => "network",
            ProfileSource::Community => "community",
            ProfileSource::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for ProfileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do with a connection no rule decided on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultAction {
    #[default]
    NotSet,
    Block,
    Ask,
    Permit,
}

impl FromStr for DefaultAction {
    type Err = ProfileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "permit" => Ok(DefaultAction::Permit),
            "ask" => Ok(DefaultAction::Ask),
            "block" => Ok(DefaultAction::Block),
            other => Err(ProfileError::InvalidDefaultAction(other.to_string())),
        }
    }
}

/// Error from a profile operation.
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("tried to save profile without ID")]
    MissingId,

    #[error("config not prepared")]
    NotPrepared,

    #[error("default action {0:?} invalid")]
    InvalidDefaultAction(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Endpoints(#[from] EndpointParseError),

    #[error(transparent)]
    FilterLists(#[from] ListResolveError),

    #[error("failed to persist profile: {0}")]
    Store(#[from] StoreError),
}

/// Collaborators a profile needs to interpret and persist itself.
#[derive(Clone)]
pub struct ProfileEnv {
    pub store: Arc<dyn ProfileStore>,
    pub compiler: Arc<dyn EndpointCompiler>,
    pub list_ids: Arc<dyn ListIdResolver>,
    pub metadata: Arc<dyn MetadataSource>,
}

impl fmt::Debug for ProfileEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfileEnv").finish_non_exhaustive()
    }
}

/// Outcome of [`Profile::update_metadata`].
#[derive(Debug, Default)]
pub struct MetadataUpdate {
    /// Whether the profile changed and should be saved by the caller.
    pub changed: bool,
    /// Background lookup of a better name, if one was started.
    pub refinement: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct ProfileState {
    record: ProfileRecord,
    perspective: Option<Perspective>,
    parsed: bool,
    default_action: DefaultAction,
    endpoints: Option<Arc<dyn EndpointMatcher>>,
    service_endpoints: Option<Arc<dyn EndpointMatcher>>,
    filter_list_ids: Vec<String>,
    last_parse_error: Option<String>,
}

impl ProfileState {
    fn new(record: ProfileRecord) -> Self {
        let mut state = Self {
            record,
            perspective: None,
            parsed: false,
            default_action: DefaultAction::NotSet,
            endpoints: None,
            service_endpoints: None,
            filter_list_ids: Vec::new(),
            last_parse_error: None,
        };
        state.prepare();
        state
    }

    /// Rebuild the settings view from the current mapping.
    fn prepare(&mut self) {
        self.parsed = false;
        match Perspective::new(&self.record.config) {
            Ok(perspective) => self.perspective = Some(perspective),
            Err(e) => {
                warn!(
                    profile = %make_scoped_id(self.record.source, &self.record.id),
                    error = %e,
                    "profile: failed to prepare config"
                );
                self.perspective = None;
                self.last_parse_error = Some(e.to_string());
            }
        }
    }

    /// Interpret the settings. Each field is derived on its own, so an
    /// invalid value only resets that field. Returns the last field error.
    fn parse(&mut self, env: &ProfileEnv) -> Result<(), ProfileError> {
        let Some(perspective) = self.perspective.as_ref() else {
            return Err(ProfileError::NotPrepared);
        };
        if self.parsed {
            return Ok(());
        }

        let mut last_err: Option<ProfileError> = None;

        let default_action = match perspective.get_as_string(CFG_DEFAULT_ACTION_KEY) {
            Ok(Some(action)) => action.parse::<DefaultAction>().unwrap_or_else(|e| {
                last_err = Some(e);
                DefaultAction::NotSet
            }),
            Ok(None) => DefaultAction::NotSet,
            Err(e) => {
                last_err = Some(e.into());
                DefaultAction::NotSet
            }
        };

        let mut compile = |key: &str| -> Option<Arc<dyn EndpointMatcher>> {
            let rules = match perspective.get_as_string_array(key) {
                Ok(rules) => rules?,
                Err(e) => {
                    last_err = Some(e.into());
                    return None;
                }
            };
            match env.compiler.compile(&rules) {
                Ok(matcher) => Some(matcher),
                Err(e) => {
                    last_err = Some(e.into());
                    None
                }
            }
        };
        let endpoints = compile(CFG_ENDPOINTS_KEY);
        let service_endpoints = compile(CFG_SERVICE_ENDPOINTS_KEY);

        let filter_list_ids = match perspective.get_as_string_array(CFG_FILTER_LISTS_KEY) {
            Ok(Some(names)) => env.list_ids.resolve_list_ids(&names).unwrap_or_else(|e| {
                last_err = Some(e.into());
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                last_err = Some(e.into());
                Vec::new()
            }
        };

        self.default_action = default_action;
        self.endpoints = endpoints;
        self.service_endpoints = service_endpoints;
        self.filter_list_ids = filter_list_ids;
        self.parsed = true;
        self.last_parse_error = last_err.as_ref().map(ToString::to_string);

        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Rules, settings and metadata of one application.
#[derive(Debug)]
pub struct Profile {
    id: String,
    source: ProfileSource,
    internal: bool,

    state: RwLock<ProfileState>,
    layered: Mutex<Weak<LayeredProfile>>,

    last_active: AtomicI64,
    outdated: AtomicBool,

    env: ProfileEnv,
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

impl Profile {
    /// Create a profile. A random ID is generated if `id` is empty.
    pub fn new(env: ProfileEnv, source: ProfileSource, id: &str, linked_path: &str) -> Self {
        let id = if id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            id.to_string()
        };

        let record = ProfileRecord {
            id,
            source,
            linked_path: linked_path.to_string(),
            created: now_unix(),
            ..Default::default()
        };

        Self::from_parts(env, record)
    }

    /// Restore a profile from a stored record.
    pub fn from_record(env: ProfileEnv, record: ProfileRecord) -> Self {
        Self::from_parts(env, record)
    }

    /// Load a profile from the store.
    pub fn load(env: ProfileEnv, source: ProfileSource, id: &str) -> Result<Option<Self>, ProfileError> {
        let record = env.store.get(&make_profile_key(source, id))?;
        Ok(record.map(|record| Self::from_record(env, record)))
    }

    fn from_parts(env: ProfileEnv, record: ProfileRecord) -> Self {
        let id = record.id.clone();
        let source = record.source;
        let internal = record.internal;

        let mut state = ProfileState::new(record);
        if let Err(e) = state.parse(&env) {
            warn!(profile = %make_scoped_id(source, &id), error = %e, "profile: invalid config");
        }

        Self {
            id,
            source,
            internal,
            state: RwLock::new(state),
            layered: Mutex::new(Weak::new()),
            last_active: AtomicI64::new(0),
            outdated: AtomicBool::new(false),
            env,
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, ProfileState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, ProfileState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> ProfileSource {
        self.source
    }

    /// `source/id`.
    pub fn scoped_id(&self) -> String {
        make_scoped_id(self.source, &self.id)
    }

    /// Storage key.
    pub fn key(&self) -> String {
        make_profile_key(self.source, &self.id)
    }

    /// Whether the profile belongs to the daemon itself.
    pub fn is_internal(&self) -> bool {
        self.internal
    }

    pub fn name(&self) -> String {
        self.read_state().record.name.clone()
    }

    pub fn linked_path(&self) -> String {
        self.read_state().record.linked_path.clone()
    }

    pub fn created(&self) -> i64 {
        self.read_state().record.created
    }

    pub fn approx_last_used(&self) -> i64 {
        self.read_state().record.approx_last_used
    }

    /// Snapshot of the persisted form.
    pub fn record(&self) -> ProfileRecord {
        self.read_state().record.clone()
    }

    /// Persist the profile.
    pub fn save(&self) -> Result<(), ProfileError> {
        let state = self.read_state();
        self.persist(&state.record)
    }

    // Callers hold the state lock so stores happen in edit order.
    fn persist(&self, record: &ProfileRecord) -> Result<(), ProfileError> {
        if self.id.is_empty() {
            return Err(ProfileError::MissingId);
        }
        self.env.store.put(record)?;
        Ok(())
    }

    /// Record that the profile is still in use. Does not lock.
    pub fn mark_still_active(&self) {
        self.last_active.store(now_unix(), Ordering::Relaxed);
    }

    /// Unix timestamp of the last [`mark_still_active`](Self::mark_still_active).
    pub fn last_active(&self) -> i64 {
        self.last_active.load(Ordering::Relaxed)
    }

    /// Update the last used timestamp if the last update is older than the
    /// threshold. Returns whether it changed; saving is up to the caller.
    pub fn mark_used(&self) -> bool {
        self.mark_used_at(now_unix())
    }

    /// [`mark_used`](Self::mark_used) with an explicit current time.
    pub fn mark_used_at(&self, now: i64) -> bool {
        let mut state = self.write_state();
        if now - LAST_USED_UPDATE_THRESHOLD_SECS > state.record.approx_last_used {
            state.record.approx_last_used = now;
            return true;
        }
        false
    }

    /// Mark this instance as superseded by a newer stored version.
    pub fn mark_outdated(&self) {
        self.outdated.store(true, Ordering::SeqCst);
    }

    pub fn is_outdated(&self) -> bool {
        self.outdated.load(Ordering::SeqCst)
    }

    /// The layered profile this profile is the main layer of.
    pub fn layered_profile(&self) -> Option<Arc<LayeredProfile>> {
        self.layered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade()
    }

    pub(crate) fn set_layered_profile(&self, layered: &Arc<LayeredProfile>) {
        *self.layered.lock().unwrap_or_else(PoisonError::into_inner) = Arc::downgrade(layered);
    }

    /// The raw settings mapping.
    pub fn config(&self) -> Map<String, Value> {
        self.read_state().record.config.clone()
    }

    /// Replace the settings mapping. It is interpreted on the next read.
    pub fn replace_config(&self, config: Map<String, Value>) {
        let mut state = self.write_state();
        state.record.config = config;
        state.prepare();
    }

    /// Whether the current settings have been interpreted.
    pub fn is_parsed(&self) -> bool {
        self.read_state().parsed
    }

    /// The error of the last interpretation pass, if any.
    pub fn last_parse_error(&self) -> Option<String> {
        self.read_state().last_parse_error.clone()
    }

    fn with_parsed<T>(&self, read: impl FnOnce(&ProfileState) -> T) -> Result<T, ProfileError> {
        {
            let state = self.read_state();
            if state.parsed {
                return Ok(read(&state));
            }
        }

        let mut state = self.write_state();
        match state.parse(&self.env) {
            Err(ProfileError::NotPrepared) => return Err(ProfileError::NotPrepared),
            Err(e) => warn!(profile = %self.scoped_id(), error = %e, "profile: invalid config"),
            Ok(()) => {}
        }
        Ok(read(&state))
    }

    pub fn default_action(&self) -> Result<DefaultAction, ProfileError> {
        self.with_parsed(|s| s.default_action)
    }

    pub fn endpoints(&self) -> Result<Option<Arc<dyn EndpointMatcher>>, ProfileError> {
        self.with_parsed(|s| s.endpoints.clone())
    }

    pub fn service_endpoints(&self) -> Result<Option<Arc<dyn EndpointMatcher>>, ProfileError> {
        self.with_parsed(|s| s.service_endpoints.clone())
    }

    /// Resolved filter list IDs.
    pub fn filter_list_ids(&self) -> Result<Vec<String>, ProfileError> {
        self.with_parsed(|s| s.filter_list_ids.clone())
    }

    /// Add an endpoint rule, save the profile and reinterpret the settings.
    pub fn add_endpoint(&self, rule: &str) {
        self.add_endpoint_entry(CFG_ENDPOINTS_KEY, rule);
    }

    /// Add a service endpoint rule, save the profile and reinterpret the
    /// settings.
    pub fn add_service_endpoint(&self, rule: &str) {
        self.add_endpoint_entry(CFG_SERVICE_ENDPOINTS_KEY, rule);
    }

    fn add_endpoint_entry(&self, key: &str, rule: &str) {
        let mut state = self.write_state();

        let Some(perspective) = state.perspective.as_ref() else {
            warn!(profile = %self.scoped_id(), "profile: cannot add endpoint rule, config not prepared");
            return;
        };
        let current = perspective.get_as_string_array(key).unwrap_or_else(|e| {
            debug!(profile = %self.scoped_id(), error = %e, "profile: replacing malformed rule list");
            None
        });

        let Some(rules) = insert_endpoint_rule(current, rule) else {
            debug!(
                profile = %self.scoped_id(),
                rule = rule,
                "profile: ignoring new endpoint rule, identical one already present"
            );
            return;
        };

        let rules = Value::Array(rules.into_iter().map(Value::String).collect());
        if let Err(e) = put_value(&mut state.record.config, key, rules) {
            error!(profile = %self.scoped_id(), error = %e, "profile: failed to store endpoint rule");
            return;
        }

        state.prepare();
        if let Err(e) = state.parse(&self.env) {
            error!(
                profile = %self.scoped_id(),
                error = %e,
                "profile: failed to parse config after adding endpoint"
            );
        }

        if let Err(e) = self.persist(&state.record) {
            warn!(
                profile = %self.scoped_id(),
                error = %e,
                "profile: failed to save profile after adding an endpoint rule"
            );
        }
    }

    /// Sync name and linked path with a running process.
    ///
    /// Only local profiles are updated. Without a binary path only the name
    /// is synced. When a name has to be generated from the path, a
    /// background task asks the operating system for a better one and saves
    /// the profile if it finds one.
    pub fn update_metadata(self: &Arc<Self>, process_name: &str, binary_path: &str) -> MetadataUpdate {
        if self.source != ProfileSource::Local {
            warn!(profile = %self.scoped_id(), "tried to update metadata for non-local profile");
            return MetadataUpdate::default();
        }

        let mut changed = false;
        let mut needs_refinement = false;
        {
            let mut state = self.write_state();
            let record = &mut state.record;

            if binary_path.is_empty() {
                if record.name != process_name {
                    record.name = process_name.to_string();
                    changed = true;
                }
                return MetadataUpdate {
                    changed,
                    refinement: None,
                };
            }

            if record.linked_path != binary_path {
                record.linked_path = binary_path.to_string();
                changed = true;
            }

            let filename = file_name(&record.linked_path).to_string();
            if record.name.trim().is_empty() || record.name == filename {
                record.name = distinct_from_filename(generate_binary_name(&record.linked_path), &filename);
                changed = true;
                needs_refinement = true;
            }
        }

        let refinement = needs_refinement.then(|| self.spawn_refinement()).flatten();
        MetadataUpdate {
            changed,
            refinement,
        }
    }

    fn spawn_refinement(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                debug!(profile = %self.scoped_id(), "profile: no runtime, skipping metadata lookup");
                return None;
            }
        };
        let profile = Arc::clone(self);
        Some(handle.spawn(async move { profile.update_metadata_from_system().await }))
    }

    async fn update_metadata_from_system(&self) {
        let linked_path = self.linked_path();
        if self.source != ProfileSource::Local || linked_path.is_empty() {
            warn!(
                profile = %self.scoped_id(),
                "tried to update metadata for non-local or non-linked profile"
            );
            return;
        }

        let new_name = match self.env.metadata.binary_name(Path::new(&linked_path)).await {
            Ok(name) => name,
            Err(e) => {
                if !e.is_expected() {
                    warn!(path = %linked_path, error = %e, "profile: error while getting binary name");
                }
                return;
            }
        };
        if new_name.trim().is_empty() {
            return;
        }
        let new_name = distinct_from_filename(new_name, file_name(&linked_path));

        let mut state = self.write_state();
        if state.record.name == new_name {
            return;
        }
        state.record.name = new_name;

        if let Err(e) = self.persist(&state.record) {
            warn!(
                profile = %self.scoped_id(),
                error = %e,
                "profile: failed to save after metadata update"
            );
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} {}/{}>", self.name(), self.source, self.id)
    }
}

// A name equal to the filename marks a profile whose name was never
// generated, so a trailing space keeps the two apart.
fn distinct_from_filename(mut name: String, filename: &str) -> String {
    if name == filename {
        name.push(' ');
    }
    name
}

/// Insert `new_rule` at the head of `rules`.
///
/// Returns `None` if an identical rule exists in the leading run of rules
/// sharing the new rule's first token. Rules past that run are not checked.
pub fn insert_endpoint_rule(rules: Option<Vec<String>>, new_rule: &str) -> Option<Vec<String>> {
    let Some(rules) = rules.filter(|r| !r.is_empty()) else {
        return Some(vec![new_rule.to_string()]);
    };

    let prefix = format!("{} ", new_rule.split(' ').next().unwrap_or_default());
    for rule in &rules {
        if !rule.starts_with(&prefix) {
            break;
        }
        if rule == new_rule {
            return None;
        }
    }

    let mut updated = Vec::with_capacity(rules.len() + 1);
    updated.push(new_rule.to_string());
    updated.extend(rules);
    Some(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{profile_env, FakeMetadata};
    use super::metadata::{MetadataError, NoSystemMetadata};
    use serde_json::json;

    fn rules(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn env() -> (ProfileEnv, Arc<store::MemoryProfileStore>) {
        profile_env(Arc::new(NoSystemMetadata))
    }

    fn config(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_insert_into_empty() {
        assert_eq!(insert_endpoint_rule(None, "+ a.com"), Some(rules(&["+ a.com"])));
        assert_eq!(
            insert_endpoint_rule(Some(vec![]), "+ a.com"),
            Some(rules(&["+ a.com"]))
        );
    }

    #[test]
    fn test_insert_duplicate_in_leading_run() {
        let existing = rules(&["+ a.com", "+ b.com", "- c.com"]);
        assert_eq!(insert_endpoint_rule(Some(existing), "+ b.com"), None);
    }

    #[test]
    fn test_insert_duplicate_past_leading_run() {
        let existing = rules(&["+ a.com", "- x.com", "+ b.com"]);
        assert_eq!(
            insert_endpoint_rule(Some(existing), "+ b.com"),
            Some(rules(&["+ b.com", "+ a.com", "- x.com", "+ b.com"]))
        );
    }

    #[test]
    fn test_insert_duplicate_and_new_head() {
        let existing = rules(&["+ 1.2.3.0/24", "+ 1.2.3.0/24", "- 5.6.7.8"]);
        assert_eq!(insert_endpoint_rule(Some(existing.clone()), "+ 1.2.3.0/24"), None);
        assert_eq!(
            insert_endpoint_rule(Some(existing), "+ 9.9.9.9"),
            Some(rules(&["+ 9.9.9.9", "+ 1.2.3.0/24", "+ 1.2.3.0/24", "- 5.6.7.8"]))
        );
    }

    #[test]
    fn test_insert_different_prefix() {
        let existing = rules(&["+ a.com"]);
        assert_eq!(
            insert_endpoint_rule(Some(existing), "- a.com"),
            Some(rules(&["- a.com", "+ a.com"]))
        );
    }

    #[test]
    fn test_new_profile() {
        let (env, _) = env();
        let profile = Profile::new(env.clone(), ProfileSource::Local, "", "/usr/bin/curl");

        assert!(uuid::Uuid::parse_str(profile.id()).is_ok());
        assert!(profile.is_parsed());
        assert!(profile.config().is_empty());
        assert_eq!(profile.default_action().unwrap(), DefaultAction::NotSet);
        assert!(profile.endpoints().unwrap().is_none());
        assert!(profile.last_parse_error().is_none());
        assert!(profile.created() > 0);

        let named = Profile::new(env, ProfileSource::Special, "system", "");
        assert_eq!(named.scoped_id(), "special/system");
        assert_eq!(named.key(), "core:profiles/special/system");
        assert_eq!(named.to_string(), "< special/system>");
    }

    #[test]
    fn test_save_and_load() {
        let (env, store) = env();
        let profile = Profile::new(env.clone(), ProfileSource::Local, "curl", "/usr/bin/curl");
        profile.save().unwrap();
        assert_eq!(store.len(), 1);

        let loaded = Profile::load(env.clone(), ProfileSource::Local, "curl")
            .unwrap()
            .unwrap();
        assert_eq!(loaded.linked_path(), "/usr/bin/curl");
        assert!(Profile::load(env, ProfileSource::Local, "wget").unwrap().is_none());
    }

    #[test]
    fn test_save_without_id_fails() {
        let (env, store) = env();
        let profile = Profile::from_record(env, ProfileRecord::default());
        assert!(matches!(profile.save(), Err(ProfileError::MissingId)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_parse_config() {
        let (env, _) = env();
        let record = ProfileRecord {
            id: "app".to_string(),
            config: config(json!({
                "filter": {
                    "defaultAction": "block",
                    "endpoints": ["+ example.com", "- *"],
                    "serviceEndpoints": ["+ 192.168.0.0/16"],
                    "lists": ["MAL", "ADS"]
                }
            })),
            ..Default::default()
        };
        let profile = Profile::from_record(env, record);

        assert_eq!(profile.default_action().unwrap(), DefaultAction::Block);
        assert!(!profile.endpoints().unwrap().unwrap().is_empty());
        assert!(profile.service_endpoints().unwrap().is_some());
        assert_eq!(profile.filter_list_ids().unwrap(), rules(&["MAL", "ADS"]));
        assert!(profile.last_parse_error().is_none());
    }

    #[test]
    fn test_parse_errors_are_partial() {
        let (env, _) = env();
        let record = ProfileRecord {
            id: "app".to_string(),
            config: config(json!({
                "filter": {
                    "defaultAction": "maybe",
                    "endpoints": ["+ example.com"],
                    "lists": ["NOPE"]
                }
            })),
            ..Default::default()
        };
        let profile = Profile::from_record(env, record);

        assert_eq!(profile.default_action().unwrap(), DefaultAction::NotSet);
        assert!(profile.endpoints().unwrap().is_some());
        assert!(profile.filter_list_ids().unwrap().is_empty());
        assert!(profile.last_parse_error().unwrap().contains("NOPE"));
    }

    #[test]
    fn test_replace_config_reparses_lazily() {
        let (env, _) = env();
        let profile = Profile::new(env, ProfileSource::Local, "app", "");

        profile.replace_config(config(json!({"filter": {"defaultAction": "ask"}})));
        assert!(!profile.is_parsed());
        assert_eq!(profile.default_action().unwrap(), DefaultAction::Ask);
        assert!(profile.is_parsed());
    }

    #[test]
    fn test_unprepared_config() {
        let (env, _) = env();
        let profile = Profile::new(env, ProfileSource::Local, "app", "");

        profile.replace_config(config(json!({"filter/defaultAction": "ask"})));
        assert!(matches!(profile.default_action(), Err(ProfileError::NotPrepared)));
        assert!(profile.last_parse_error().is_some());

        profile.add_endpoint("+ example.com");
        assert!(profile.config().get("filter").is_none());
    }

    #[test]
    fn test_add_endpoint_persists_and_reparses() {
        let (env, store) = env();
        let profile = Profile::new(env, ProfileSource::Local, "app", "");

        profile.add_endpoint("+ example.com");
        profile.add_endpoint("- *");
        profile.add_endpoint("- *");

        assert!(profile.is_parsed());
        let stored = store.get(&profile.key()).unwrap().unwrap();
        assert_eq!(
            stored.config["filter"]["endpoints"],
            json!(["- *", "+ example.com"])
        );
        assert!(profile.endpoints().unwrap().is_some());
        assert!(profile.service_endpoints().unwrap().is_none());

        profile.add_service_endpoint("+ 10.0.0.0/8");
        let stored = store.get(&profile.key()).unwrap().unwrap();
        assert_eq!(stored.config["filter"]["serviceEndpoints"], json!(["+ 10.0.0.0/8"]));
        assert!(profile.service_endpoints().unwrap().is_some());
    }

    #[test]
    fn test_add_invalid_endpoint_records_error() {
        let (env, _) = env();
        let profile = Profile::new(env, ProfileSource::Local, "app", "");

        profile.add_endpoint("? nonsense");
        assert!(profile.is_parsed());
        assert!(profile.endpoints().unwrap().is_none());
        assert!(profile.last_parse_error().unwrap().contains("nonsense"));
    }

    #[test]
    fn test_concurrent_add_endpoint() {
        let (env, store) = env();
        let profile = Arc::new(Profile::new(env, ProfileSource::Local, "app", ""));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let profile = Arc::clone(&profile);
                std::thread::spawn(move || profile.add_endpoint(&format!("+ host{}.example.com", i)))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let endpoints = profile.config()["filter"]["endpoints"].as_array().unwrap().len();
        assert_eq!(endpoints, 8);

        let stored = store.get(&profile.key()).unwrap().unwrap();
        assert_eq!(stored.config, profile.config());
    }

    /// Store whose first write is slow.
    struct SlowFirstPutStore {
        inner: store::MemoryProfileStore,
        slowed: std::sync::atomic::AtomicBool,
    }

    impl ProfileStore for SlowFirstPutStore {
        fn put(&self, record: &ProfileRecord) -> Result<(), StoreError> {
            if !self.slowed.swap(true, Ordering::SeqCst) {
                std::thread::sleep(std::time::Duration::from_millis(300));
            }
            self.inner.put(record)
        }

        fn get(&self, key: &str) -> Result<Option<ProfileRecord>, StoreError> {
            self.inner.get(key)
        }
    }

    #[test]
    fn test_edits_are_stored_in_order() {
        let (mut env, _) = env();
        let store = Arc::new(SlowFirstPutStore {
            inner: store::MemoryProfileStore::new(),
            slowed: std::sync::atomic::AtomicBool::new(false),
        });
        env.store = store.clone();
        let profile = Arc::new(Profile::new(env, ProfileSource::Local, "app", ""));

        let first = {
            let profile = Arc::clone(&profile);
            std::thread::spawn(move || profile.add_endpoint("+ a.example.com"))
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        profile.add_endpoint("+ b.example.com");
        first.join().unwrap();

        let stored = store.get(&profile.key()).unwrap().unwrap();
        assert_eq!(
            stored.config["filter"]["endpoints"],
            json!(["+ b.example.com", "+ a.example.com"])
        );
        assert_eq!(stored.config, profile.config());
    }

    #[test]
    fn test_mark_used_threshold() {
        let (env, _) = env();
        let profile = Profile::new(env, ProfileSource::Local, "app", "");
        let now = 1_700_000_000;

        assert!(profile.mark_used_at(now));
        assert!(!profile.mark_used_at(now));
        assert!(!profile.mark_used_at(now + LAST_USED_UPDATE_THRESHOLD_SECS));
        assert!(profile.mark_used_at(now + LAST_USED_UPDATE_THRESHOLD_SECS + 1));
        assert_eq!(profile.approx_last_used(), now + LAST_USED_UPDATE_THRESHOLD_SECS + 1);
        assert!(profile.mark_used());
    }

    #[test]
    fn test_still_active_and_outdated() {
        let (env, _) = env();
        let profile = Profile::new(env, ProfileSource::Local, "app", "");

        assert_eq!(profile.last_active(), 0);
        profile.mark_still_active();
        assert!(profile.last_active() > 0);

        assert!(!profile.is_outdated());
        profile.mark_outdated();
        assert!(profile.is_outdated());
    }

    #[test]
    fn test_layered_profile_is_weak() {
        let (env, _) = env();
        let profile = Arc::new(Profile::new(env, ProfileSource::Local, "app", ""));
        assert!(profile.layered_profile().is_none());

        let layered = LayeredProfile::new(Arc::clone(&profile), vec![]);
        let linked = profile.layered_profile().unwrap();
        assert!(Arc::ptr_eq(&linked, &layered));
        assert_eq!(linked.profiles().count(), 1);
        drop(linked);

        drop(layered);
        assert!(profile.layered_profile().is_none());
    }

    #[tokio::test]
    async fn test_update_metadata_generates_name() {
        let metadata = Arc::new(FakeMetadata::error(MetadataError::NotFound));
        let (env, store) = profile_env(metadata.clone());
        let profile = Arc::new(Profile::new(env, ProfileSource::Local, "app", ""));

        let update = profile.update_metadata("chrome", "/usr/bin/chrome");
        assert!(update.changed);
        assert_eq!(profile.name(), "Chrome");
        assert_eq!(profile.linked_path(), "/usr/bin/chrome");

        update.refinement.unwrap().await.unwrap();
        assert_eq!(metadata.calls(), 1);
        assert_eq!(profile.name(), "Chrome");
        assert!(store.is_empty());

        // Name is no longer the filename: nothing to regenerate.
        let update = profile.update_metadata("chrome", "/usr/bin/chrome");
        assert!(!update.changed);
        assert!(update.refinement.is_none());
    }

    #[tokio::test]
    async fn test_update_metadata_name_never_equals_filename() {
        let (env, _) = profile_env(Arc::new(NoSystemMetadata));
        let profile = Arc::new(Profile::new(env, ProfileSource::Local, "app", ""));

        let update = profile.update_metadata("ABC", "/opt/ABC");
        assert!(update.changed);
        assert_eq!(profile.name(), "ABC ");
        update.refinement.unwrap().await.unwrap();
        assert_eq!(profile.name(), "ABC ");
    }

    #[tokio::test]
    async fn test_update_metadata_refines_from_system() {
        let (env, store) = profile_env(Arc::new(FakeMetadata::name("Google Chrome")));
        let profile = Arc::new(Profile::new(env, ProfileSource::Local, "app", ""));

        let update = profile.update_metadata("chrome", "/usr/bin/chrome");
        update.refinement.unwrap().await.unwrap();

        assert_eq!(profile.name(), "Google Chrome");
        assert_eq!(store.get(&profile.key()).unwrap().unwrap().name, "Google Chrome");
    }

    #[tokio::test]
    async fn test_update_metadata_system_name_equals_filename() {
        let (env, _) = profile_env(Arc::new(FakeMetadata::name("chrome")));
        let profile = Arc::new(Profile::new(env, ProfileSource::Local, "app", ""));

        let update = profile.update_metadata("chrome", "/usr/bin/chrome");
        update.refinement.unwrap().await.unwrap();
        assert_eq!(profile.name(), "chrome ");
    }

    #[tokio::test]
    async fn test_update_metadata_unexpected_error_is_not_fatal() {
        let (env, store) = profile_env(Arc::new(FakeMetadata::error(MetadataError::Other(
            "permission denied".to_string(),
        ))));
        let profile = Arc::new(Profile::new(env, ProfileSource::Local, "app", ""));

        let update = profile.update_metadata("chrome", "/usr/bin/chrome");
        update.refinement.unwrap().await.unwrap();
        assert_eq!(profile.name(), "Chrome");
        assert!(store.is_empty());
    }

    #[test]
    fn test_update_metadata_special_and_non_local() {
        let (env, _) = env();
        let special = Arc::new(Profile::new(env.clone(), ProfileSource::Local, "system", ""));
        let update = special.update_metadata("Operating System", "");
        assert!(update.changed);
        assert!(update.refinement.is_none());
        assert_eq!(special.name(), "Operating System");
        assert!(!special.update_metadata("Operating System", "").changed);

        let community = Arc::new(Profile::new(env, ProfileSource::Community, "app", ""));
        let update = community.update_metadata("chrome", "/usr/bin/chrome");
        assert!(!update.changed);
        assert_eq!(community.name(), "");
        assert_eq!(community.linked_path(), "");
    }

    #[test]
    fn test_update_metadata_without_runtime() {
        let (env, _) = env();
        let profile = Arc::new(Profile::new(env, ProfileSource::Local, "app", ""));
        let update = profile.update_metadata("chrome", "/usr/bin/chrome");
        assert!(update.changed);
        assert!(update.refinement.is_none());
    }

    #[test]
    fn test_default_action_from_str() {
        assert_eq!("permit".parse::<DefaultAction>().unwrap(), DefaultAction::Permit);
        assert_eq!("ask".parse::<DefaultAction>().unwrap(), DefaultAction::Ask);
        assert_eq!("block".parse::<DefaultAction>().unwrap(), DefaultAction::Block);
        assert!("allow".parse::<DefaultAction>().is_err());
    }
}
