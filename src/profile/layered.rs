//! Composition of a local profile with further profiles.
//!
//! The layered profile owns its profiles. A profile only keeps a weak
//! back-reference to the layered profile it is the main layer of.

use super::Profile;
use std::sync::Arc;

/// Profiles evaluated together for one application, local profile first.
#[derive(Debug)]
pub struct LayeredProfile {
    local: Arc<Profile>,
    layers: Vec<Arc<Profile>>,
}

impl LayeredProfile {
    /// Build a layered profile and register it with its local profile.
    pub fn new(local: Arc<Profile>, layers: Vec<Arc<Profile>>) -> Arc<Self> {
        let layered = Arc::new(Self { local, layers });
        layered.local.set_layered_profile(&layered);
        layered
    }

    pub fn local_profile(&self) -> &Arc<Profile> {
        &self.local
    }

    /// All profiles, local first.
    pub fn profiles(&self) -> impl Iterator<Item = &Arc<Profile>> {
        std::iter::once(&self.local).chain(self.layers.iter())
    }
}
