//! Parsing of list source files.

use crate::config::ListFormat;
use crate::intel::LookupError;
use ipnet::IpNet;
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;

/// One entry of a list source.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum ListEntry {
    Network(IpNet),
    Asn(String),
    Country(String),
    Domain(String),
}

/// All entries of a list source, indexed by kind.
#[derive(Debug, Default)]
pub struct ListEntries {
    pub domains: HashSet<String>,
    pub networks: Vec<IpNet>,
    pub asns: HashSet<String>,
    pub countries: HashSet<String>,
}

impl ListEntries {
    pub fn len(&self) -> usize {
        self.domains.len() + self.networks.len() + self.asns.len() + self.countries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_domain(&self, domain: &str) -> bool {
        self.domains.contains(&normalize_domain(domain))
    }

    pub fn contains_ip(&self, ip: &IpAddr) -> bool {
        self.networks.iter().any(|net| net.contains(ip))
    }

    pub fn contains_asn(&self, asn: &str) -> bool {
        self.asns.contains(asn)
    }

    pub fn contains_country(&self, country: &str) -> bool {
        self.countries.contains(&country.to_ascii_uppercase())
    }
}

impl FromIterator<ListEntry> for ListEntries {
    fn from_iter<I: IntoIterator<Item = ListEntry>>(iter: I) -> Self {
        let mut entries = ListEntries::default();
        for entry in iter {
            match entry {
                ListEntry::Network(net) => entries.networks.push(net),
                ListEntry::Asn(asn) => {
                    entries.asns.insert(asn);
                }
                ListEntry::Country(cc) => {
                    entries.countries.insert(cc);
                }
                ListEntry::Domain(d) => {
                    entries.domains.insert(d);
                }
            }
        }
        entries
    }
}

fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_matches('.').to_ascii_lowercase()
}

/// Load a list source from a file.
pub fn load_list(path: &Path, format: ListFormat) -> Result<ListEntries, LookupError> {
    let content = std::fs::read_to_string(path)?;

    match format {
        ListFormat::Plain => load_plain_list(&content),
        ListFormat::Csv => load_csv_list(&content),
        ListFormat::Json => load_json_list(&content),
    }
}

fn is_content_line(line: &&str) -> bool {
    let trimmed = line.trim();
    !trimmed.is_empty() && !trimmed.starts_with('#')
}

/// One entry per line.
pub fn load_plain_list(content: &str) -> Result<ListEntries, LookupError> {
    Ok(content
        .lines()
        .filter(is_content_line)
        .filter_map(|line| parse_entry(line.trim()))
        .collect())
}

/// First column is the entry.
pub fn load_csv_list(content: &str) -> Result<ListEntries, LookupError> {
    Ok(content
        .lines()
        .filter(is_content_line)
        .filter_map(|line| parse_entry(line.split(',').next()?.trim()))
        .collect())
}

/// JSON array of entry strings.
pub fn load_json_list(content: &str) -> Result<ListEntries, LookupError> {
    let values: Vec<String> = serde_json::from_str(content)
        .map_err(|e| LookupError::InvalidData(format!("Invalid JSON: {}", e)))?;

    Ok(values.iter().filter_map(|v| parse_entry(v.trim())).collect())
}

/// Parse one list entry: an IP, a CIDR network, `AS<number>`,
/// `country:<CC>` or a domain.
pub fn parse_entry(s: &str) -> Option<ListEntry> {
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Some(ListEntry::Network(IpNet::from(ip)));
    }

    if let Ok(net) = s.parse::<IpNet>() {
        return Some(ListEntry::Network(net.trunc()));
    }

    if let Some(asn) = s
        .strip_prefix("AS")
        .or_else(|| s.strip_prefix("as"))
        .and_then(|number| number.parse::<u32>().ok())
    {
        return Some(ListEntry::Asn(asn.to_string()));
    }

    if let Some(cc) = s.strip_prefix("country:") {
        let cc = cc.trim();
        if cc.len() == 2 && cc.chars().all(|c| c.is_ascii_alphabetic()) {
            return Some(ListEntry::Country(cc.to_ascii_uppercase()));
        }
        return None;
    }

    let domain = normalize_domain(s);
    let valid = domain.contains('.')
        && domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'));
    valid.then_some(ListEntry::Domain(domain))
}
