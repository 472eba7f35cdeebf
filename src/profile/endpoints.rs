//! Endpoint rules: compiling ordered rule strings into matchers.
//!
//! A rule is `<+|-> <target>`, where `+` permits and `-` blocks. Targets:
//!
//! - `*` matches everything
//! - `example.com` matches the domain exactly
//! - `*.example.com` or `.example.com` matches the domain and its sub-domains
//! - `203.0.113.7` or `203.0.113.0/24` matches the IP
//! - `AS64500` matches the autonomous system
//! - `DE` matches the country
//!
//! Rules are evaluated head first and the first matching rule wins.

use crate::intel::EntityState;
use async_trait::async_trait;
use ipnet::IpNet;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

/// Result of evaluating an entity against endpoint rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", content = "rule", rename_all = "snake_case")]
pub enum EndpointVerdict {
    NoMatch,
    Permitted(String),
    Denied(String),
}

impl EndpointVerdict {
    /// The rule that decided, if any.
    pub fn rule(&self) -> Option<&str> {
        match self {
            EndpointVerdict::NoMatch => None,
            EndpointVerdict::Permitted(rule) | EndpointVerdict::Denied(rule) => Some(rule),
        }
    }
}

/// A rule that could not be compiled.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid endpoint rule {rule:?}: {reason}")]
pub struct EndpointParseError {
    pub rule: String,
    pub reason: String,
}

/// Compiled endpoint rules.
#[async_trait]
pub trait EndpointMatcher: Send + Sync + fmt::Debug {
    /// Evaluate the entity. Enrichment is pulled in on demand.
    async fn match_entity(&self, entity: &mut EntityState) -> EndpointVerdict;

    fn is_empty(&self) -> bool;
}

/// Compiles ordered rule strings.
pub trait EndpointCompiler: Send + Sync {
    fn compile(&self, rules: &[String]) -> Result<Arc<dyn EndpointMatcher>, EndpointParseError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Any,
    Domain(String),
    DomainTree(String),
    Network(IpNet),
    Asn(u32),
    Country(String),
}

#[derive(Debug, Clone)]
struct Rule {
    text: String,
    permit: bool,
    target: Target,
}

fn parse_rule(text: &str) -> Result<Rule, EndpointParseError> {
    let fail = |reason: &str| EndpointParseError {
        rule: text.to_string(),
        reason: reason.to_string(),
    };

    let mut fields = text.split_whitespace();
    let permit = match fields.next() {
        Some("+") => true,
        Some("-") => false,
        Some(_) => return Err(fail("must start with + or -")),
        None => return Err(fail("empty rule")),
    };
    let target = fields.next().ok_or_else(|| fail("missing target"))?;
    if fields.next().is_some() {
        return Err(fail("unexpected trailing fields"));
    }

    Ok(Rule {
        text: text.to_string(),
        permit,
        target: parse_target(target).ok_or_else(|| fail("unrecognized target"))?,
    })
}

fn parse_target(target: &str) -> Option<Target> {
    if target == "*" {
        return Some(Target::Any);
    }
    if let Ok(ip) = target.parse::<IpAddr>() {
        return Some(Target::Network(IpNet::from(ip)));
    }
    if let Ok(net) = target.parse::<IpNet>() {
        return Some(Target::Network(net.trunc()));
    }
    if let Some(asn) = target
        .strip_prefix("AS")
        .and_then(|n| n.parse::<u32>().ok())
    {
        return Some(Target::Asn(asn));
    }
    if target.len() == 2 && target.chars().all(|c| c.is_ascii_uppercase()) {
        return Some(Target::Country(target.to_string()));
    }

    let (tree, domain) = match target.strip_prefix("*.").or_else(|| target.strip_prefix('.')) {
        Some(rest) => (true, rest),
        None => (false, target),
    };
    let domain = domain.trim_end_matches('.').to_ascii_lowercase();
    let valid = !domain.is_empty()
        && domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'));
    if !valid {
        return None;
    }
    Some(if tree {
        Target::DomainTree(domain)
    } else {
        Target::Domain(domain)
    })
}

/// Compiler for the built-in rule syntax.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleCompiler;

impl EndpointCompiler for RuleCompiler {
    fn compile(&self, rules: &[String]) -> Result<Arc<dyn EndpointMatcher>, EndpointParseError> {
        let rules = rules
            .iter()
            .map(|r| parse_rule(r))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Arc::new(RuleMatcher { rules }))
    }
}

/// Matcher produced by [`RuleCompiler`].
#[derive(Debug)]
pub struct RuleMatcher {
    rules: Vec<Rule>,
}

fn normalized_domain(entity: &EntityState) -> Option<String> {
    entity
        .domain()
        .map(|d| d.trim_end_matches('.').to_ascii_lowercase())
}

impl RuleMatcher {
    async fn matches(target: &Target, entity: &mut EntityState) -> bool {
        match target {
            Target::Any => true,
            Target::Domain(d) => normalized_domain(entity).as_deref() == Some(d.as_str()),
            Target::DomainTree(d) => normalized_domain(entity).is_some_and(|own| {
                own == *d
                    || own
                        .strip_suffix(d.as_str())
                        .is_some_and(|head| head.ends_with('.'))
            }),
            Target::Network(net) => entity.get_ip().is_some_and(|ip| net.contains(&ip)),
            Target::Asn(asn) => entity.get_asn().await == Some(*asn),
            Target::Country(cc) => entity.get_country().await.as_deref() == Some(cc.as_str()),
        }
    }
}

#[async_trait]
impl EndpointMatcher for RuleMatcher {
    async fn match_entity(&self, entity: &mut EntityState) -> EndpointVerdict {
        for rule in &self.rules {
            if Self::matches(&rule.target, entity).await {
                return if rule.permit {
                    EndpointVerdict::Permitted(rule.text.clone())
                } else {
                    EndpointVerdict::Denied(rule.text.clone())
                };
            }
        }
        EndpointVerdict::NoMatch
    }

    fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
