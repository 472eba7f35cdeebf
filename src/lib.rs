//! Endpoint policy core for Zentinel.
//!
//! Decides whether a remote endpoint may be reached by an application and,
//! if not, explains why.
//!
//! # Features
//!
//! - **Entity Intelligence** - Lazily enrich endpoints with reverse DNS,
//!   geo/ASN data and filter list membership, each fetched at most once
//! - **Filter Lists** - Domain, sub-domain, CNAME, IP, ASN and country lists
//!   loaded from plain, CSV or JSON files
//! - **Block Reasons** - Explain which keys matched which enforced lists
//! - **Profiles** - Per-application endpoint rules, default action and
//!   filter list selection with safe concurrent editing
//! - **Entity Caching** - Reuse enrichment for repeated connections
//!
//! # Example Configuration
//!
//! ```yaml
//! settings:
//!   default_action: permit
//!
//! intel:
//!   resolve_subdomains: true
//!   check_cnames: true
//!
//! lists:
//!   - id: "MAL"
//!     path: "/etc/zentinel/lists/malware.txt"
//!
//! active_lists:
//!   - "MAL"
//! ```

pub mod cache;
pub mod config;
pub mod engine;
pub mod intel;
pub mod lists;
pub mod profile;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use engine::{build_sources, Decision, DecisionReason, Flow, PolicyEngine, Verdict};
pub use intel::{Entity, EntityState, IntelSources, ListBlockReason};
pub use lists::FileListIndex;
pub use profile::{DefaultAction, Profile, ProfileEnv, ProfileSource};
