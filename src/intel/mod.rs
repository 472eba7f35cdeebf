//! Entity intelligence: enrichment, list occurrences and block reasons.

pub mod block_reason;
pub mod domain;
pub mod entity;
pub mod geo;
pub mod memo;
pub mod netutils;
pub mod sources;

pub use block_reason::{ListBlockReason, ListMatch};
pub use entity::{Entity, EntityBuilder, EntityGuard, EntityState, ListDimension};
pub use sources::{
    GeoLookup, IntelSources, Location, LookupError, ReverseResolver, SecurityLevel,
    ThreatListLookup,
};
