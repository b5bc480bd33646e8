//! DNS policy mapping between the abstract record model and Route 53
//! resource record sets.
//!
//! [`to_native`] and [`from_native`] are inverses: reading back a written
//! record yields the record that was written, and writing a record read
//! from the provider yields the same native set.

use crate::config::is_region_name;
use crate::error::{AwsError, AwsResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

const SERVICE: &str = "route53";

// ── Record model ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordType {
    A,
    AAAA,
    CAA,
    CNAME,
    DS,
    MX,
    NAPTR,
    NS,
    PTR,
    SOA,
    SPF,
    SRV,
    TXT,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A => "A",
            Self::AAAA => "AAAA",
            Self::CAA => "CAA",
            Self::CNAME => "CNAME",
            Self::DS => "DS",
            Self::MX => "MX",
            Self::NAPTR => "NAPTR",
            Self::NS => "NS",
            Self::PTR => "PTR",
            Self::SOA => "SOA",
            Self::SPF => "SPF",
            Self::SRV => "SRV",
            Self::TXT => "TXT",
        }
    }

    pub fn parse(value: &str) -> AwsResult<Self> {
        let parsed = match value.to_ascii_uppercase().as_str() {
            "A" => Self::A,
            "AAAA" => Self::AAAA,
            "CAA" => Self::CAA,
            "CNAME" => Self::CNAME,
            "DS" => Self::DS,
            "MX" => Self::MX,
            "NAPTR" => Self::NAPTR,
            "NS" => Self::NS,
            "PTR" => Self::PTR,
            "SOA" => Self::SOA,
            "SPF" => Self::SPF,
            "SRV" => Self::SRV,
            "TXT" => Self::TXT,
            other => {
                return Err(AwsError::not_supported(
                    SERVICE,
                    &format!("record type {}", other),
                ))
            }
        };
        Ok(parsed)
    }

    fn is_quoted(&self) -> bool {
        matches!(self, Self::TXT | Self::SPF)
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FailoverRole {
    Primary,
    Secondary,
}

impl FailoverRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "PRIMARY",
            Self::Secondary => "SECONDARY",
        }
    }

    fn parse(value: &str) -> AwsResult<Self> {
        match value {
            "PRIMARY" => Ok(Self::Primary),
            "SECONDARY" => Ok(Self::Secondary),
            other => Err(AwsError::invalid_parameter(
                SERVICE,
                &format!("failover must be PRIMARY or SECONDARY, got {}", other),
            )),
        }
    }
}

/// A geographic location as Route 53 encodes it. Two codes are the same
/// location exactly when all three fields are equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GeoCode {
    #[serde(rename = "ContinentCode", skip_serializing_if = "Option::is_none")]
    pub continent: Option<String>,
    #[serde(rename = "CountryCode", skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(rename = "SubdivisionCode", skip_serializing_if = "Option::is_none")]
    pub subdivision: Option<String>,
}

impl GeoCode {
    /// The catch-all location.
    pub fn default_location() -> Self {
        Self::country("*")
    }

    pub fn continent(code: &str) -> Self {
        Self {
            continent: Some(code.to_string()),
            ..Default::default()
        }
    }

    pub fn country(code: &str) -> Self {
        Self {
            country: Some(code.to_string()),
            ..Default::default()
        }
    }

    pub fn subdivision(country: &str, code: &str) -> Self {
        Self {
            continent: None,
            country: Some(country.to_string()),
            subdivision: Some(code.to_string()),
        }
    }

    fn specificity(&self) -> u8 {
        if self.subdivision.is_some() {
            3
        } else if self.country.is_some() {
            2
        } else if self.continent.is_some() {
            1
        } else {
            0
        }
    }

    /// Whether every field set on `self` agrees with `query`.
    fn covers(&self, query: &GeoCode) -> bool {
        let agrees = |mine: &Option<String>, theirs: &Option<String>| match (mine, theirs) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            (Some(_), None) => false,
            (None, _) => true,
        };
        agrees(&self.continent, &query.continent)
            && agrees(&self.country, &query.country)
            && agrees(&self.subdivision, &query.subdivision)
    }
}

/// One row of the geo-location catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoLocation {
    pub name: &'static str,
    pub code: GeoCode,
}

const CONTINENTS: &[(&str, &str)] = &[
    ("AF", "Africa"),
    ("AN", "Antarctica"),
    ("AS", "Asia"),
    ("EU", "Europe"),
    ("NA", "North America"),
    ("OC", "Oceania"),
    ("SA", "South America"),
];

const COUNTRIES: &[(&str, &str)] = &[
    ("AE", "United Arab Emirates"),
    ("AR", "Argentina"),
    ("AT", "Austria"),
    ("AU", "Australia"),
    ("BE", "Belgium"),
    ("BR", "Brazil"),
    ("CA", "Canada"),
    ("CH", "Switzerland"),
    ("CL", "Chile"),
    ("CN", "China"),
    ("CO", "Colombia"),
    ("CZ", "Czechia"),
    ("DE", "Germany"),
    ("DK", "Denmark"),
    ("EG", "Egypt"),
    ("ES", "Spain"),
    ("FI", "Finland"),
    ("FR", "France"),
    ("GB", "United Kingdom"),
    ("GR", "Greece"),
    ("HK", "Hong Kong"),
    ("ID", "Indonesia"),
    ("IE", "Ireland"),
    ("IL", "Israel"),
    ("IN", "India"),
    ("IT", "Italy"),
    ("JP", "Japan"),
    ("KE", "Kenya"),
    ("KR", "South Korea"),
    ("MX", "Mexico"),
    ("MY", "Malaysia"),
    ("NG", "Nigeria"),
    ("NL", "Netherlands"),
    ("NO", "Norway"),
    ("NZ", "New Zealand"),
    ("PH", "Philippines"),
    ("PL", "Poland"),
    ("PT", "Portugal"),
    ("RU", "Russia"),
    ("SA", "Saudi Arabia"),
    ("SE", "Sweden"),
    ("SG", "Singapore"),
    ("TH", "Thailand"),
    ("TR", "Turkey"),
    ("TW", "Taiwan"),
    ("UA", "Ukraine"),
    ("US", "United States"),
    ("VN", "Vietnam"),
    ("ZA", "South Africa"),
];

/// Route 53 only resolves subdivisions for these countries.
const SUBDIVISIONS: &[(&str, &str, &str)] = &[
    ("US", "CA", "California"),
    ("US", "NY", "New York"),
    ("US", "TX", "Texas"),
    ("US", "VA", "Virginia"),
    ("US", "WA", "Washington"),
    ("US", "OR", "Oregon"),
    ("US", "OH", "Ohio"),
    ("US", "FL", "Florida"),
    ("US", "IL", "Illinois"),
    ("UA", "43", "Crimea"),
];

lazy_static::lazy_static! {
    static ref GEO_LOCATIONS: Vec<GeoLocation> = {
        let mut rows = vec![GeoLocation { name: "Default", code: GeoCode::default_location() }];
        rows.extend(CONTINENTS.iter().map(|&(code, name)| GeoLocation { name, code: GeoCode::continent(code) }));
        rows.extend(COUNTRIES.iter().map(|&(code, name)| GeoLocation { name, code: GeoCode::country(code) }));
        rows.extend(SUBDIVISIONS.iter().map(|&(country, code, name)| GeoLocation {
            name,
            code: GeoCode::subdivision(country, code),
        }));
        rows
    };
}

pub fn geo_locations() -> &'static [GeoLocation] {
    &GEO_LOCATIONS
}

/// The most specific catalog row consistent with `query`. The catalog
/// names common locations only; [`native_geo`] accepts any well-formed code.
pub fn lookup_geo(query: &GeoCode) -> AwsResult<&'static GeoLocation> {
    GEO_LOCATIONS
        .iter()
        .filter(|row| row.code.covers(query))
        .max_by_key(|row| row.code.specificity())
        .filter(|row| row.code.specificity() > 0)
        .ok_or_else(|| {
            AwsError::invalid_parameter(SERVICE, &format!("unknown geo location {:?}", query))
        })
}

/// The code written to the provider for `query`: the catalog row when the
/// catalog knows the location at the same precision, otherwise the code
/// itself once it is well formed.
pub fn native_geo(query: &GeoCode) -> AwsResult<GeoCode> {
    if let Ok(row) = lookup_geo(query) {
        if row.code.specificity() == query.specificity() {
            return Ok(row.code.clone());
        }
    }
    well_formed_geo(query)
}

fn is_country_code(code: &str) -> bool {
    code == "*" || (code.len() == 2 && code.bytes().all(|b| b.is_ascii_uppercase()))
}

fn is_subdivision_code(code: &str) -> bool {
    (1..=3).contains(&code.len()) && code.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// ISO 3166 country plus optional subdivision, or a continent alone.
fn well_formed_geo(query: &GeoCode) -> AwsResult<GeoCode> {
    let upper = |field: &Option<String>| field.as_deref().map(|v| v.trim().to_ascii_uppercase());
    let code = match (upper(&query.continent), upper(&query.country), upper(&query.subdivision)) {
        (_, Some(country), subdivision)
            if is_country_code(&country)
                && subdivision.as_deref().map_or(true, is_subdivision_code)
                && !(country == "*" && subdivision.is_some()) =>
        {
            GeoCode {
                continent: None,
                country: Some(country),
                subdivision,
            }
        }
        (Some(continent), None, None) if CONTINENTS.iter().any(|(c, _)| *c == continent) => {
            GeoCode::continent(&continent)
        }
        _ => {
            return Err(AwsError::invalid_parameter(
                SERVICE,
                &format!("unknown geo location {:?}", query),
            ))
        }
    };
    Ok(code)
}

/// How the provider chooses among record sets sharing a name and type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum DnsPolicy {
    Simple,
    Weighted(i64),
    Latency(String),
    Failover(FailoverRole),
    Geo(GeoCode),
    MultiValue,
}

impl DnsPolicy {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Weighted(_) => "weighted",
            Self::Latency(_) => "latency",
            Self::Failover(_) => "failover",
            Self::Geo(_) => "geo",
            Self::MultiValue => "multiValue",
        }
    }

    /// The part of the policy that distinguishes sibling record sets.
    /// Weights are tunable and therefore excluded.
    fn selector(&self) -> String {
        match self {
            Self::Latency(region) => region.clone(),
            Self::Failover(role) => role.as_str().to_string(),
            Self::Geo(code) => format!(
                "{}/{}/{}",
                code.continent.as_deref().unwrap_or(""),
                code.country.as_deref().unwrap_or(""),
                code.subdivision.as_deref().unwrap_or("")
            ),
            _ => String::new(),
        }
    }
}

/// A record set in provider-neutral form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub zone_id: String,
    /// Fully-qualified name without the trailing dot.
    pub fqdn: String,
    pub record_type: RecordType,
    pub ttl: i64,
    /// Unquoted values; MX values without their priority.
    pub values: Vec<String>,
    pub identifier: Option<String>,
    pub policy: DnsPolicy,
    pub mx_priority: Option<i64>,
}

impl DnsRecord {
    pub fn simple(zone_id: &str, fqdn: &str, record_type: RecordType, ttl: i64, values: Vec<String>) -> Self {
        Self {
            zone_id: zone_id.to_string(),
            fqdn: fqdn.trim_end_matches('.').to_string(),
            record_type,
            ttl,
            values,
            identifier: None,
            policy: DnsPolicy::Simple,
            mx_priority: None,
        }
    }

    pub fn with_policy(mut self, identifier: &str, policy: DnsPolicy) -> Self {
        self.identifier = Some(identifier.to_string());
        self.policy = policy;
        self
    }

    pub fn with_mx_priority(mut self, priority: i64) -> Self {
        self.mx_priority = Some(priority);
        self
    }

    /// Identity used when comparing desired and actual record sets.
    pub fn key(&self) -> String {
        format!(
            "{}-{}-{}-{}-{}",
            self.record_type,
            self.fqdn.to_lowercase(),
            self.values.join(","),
            self.policy.kind(),
            self.policy.selector()
        )
    }
}

// ── Native form ─────────────────────────────────────────────────────────

/// Route 53 `ResourceRecordSet`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceRecordSet {
    pub name: String,
    pub record_type: String,
    pub set_identifier: Option<String>,
    pub weight: Option<i64>,
    pub region: Option<String>,
    pub geo_location: Option<GeoCode>,
    pub failover: Option<String>,
    pub multi_value_answer: Option<bool>,
    pub ttl: Option<i64>,
    pub resource_records: Vec<String>,
}

const MAX_WEIGHT: i64 = 255;

fn quote(value: &str) -> String {
    format!("\"{}\"", value)
}

fn unquote(value: &str) -> String {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
        .to_string()
}

/// Check the policy and identifier of one record.
pub fn validate_record(record: &DnsRecord) -> AwsResult<()> {
    let identifier = record.identifier.as_deref().unwrap_or("");
    match (&record.policy, identifier.is_empty()) {
        (DnsPolicy::Simple, false) => {
            return Err(AwsError::invalid_parameter(
                SERVICE,
                &format!("{}: simple records take no identifier", record.fqdn),
            ))
        }
        (DnsPolicy::Simple, true) => {}
        (policy, true) => {
            return Err(AwsError::invalid_parameter(
                SERVICE,
                &format!("{}: {} records need an identifier", record.fqdn, policy.kind()),
            ))
        }
        _ => {}
    }
    match &record.policy {
        DnsPolicy::Weighted(weight) if !(0..=MAX_WEIGHT).contains(weight) => {
            Err(AwsError::invalid_parameter(
                SERVICE,
                &format!("weight {} outside 0..={}", weight, MAX_WEIGHT),
            ))
        }
        DnsPolicy::Latency(region) if !is_region_name(region) => Err(AwsError::invalid_parameter(
            SERVICE,
            &format!("unknown latency region {}", region),
        )),
        _ => {
            if record.record_type == RecordType::MX && record.mx_priority.is_none() {
                return Err(AwsError::invalid_parameter(
                    SERVICE,
                    &format!("{}: MX records need a priority", record.fqdn),
                ));
            }
            Ok(())
        }
    }
}

/// Non-simple identifiers must be unique within (zone, name, type).
pub fn validate_identifiers(records: &[DnsRecord]) -> AwsResult<()> {
    let mut seen = HashSet::new();
    for record in records {
        validate_record(record)?;
        let Some(identifier) = record.identifier.as_deref() else {
            continue;
        };
        let scope = (
            record.zone_id.as_str(),
            record.fqdn.to_lowercase(),
            record.record_type,
            identifier,
        );
        if !seen.insert(scope) {
            return Err(AwsError::invalid_parameter(
                SERVICE,
                &format!(
                    "identifier '{}' used twice for {} {}",
                    identifier, record.record_type, record.fqdn
                ),
            ));
        }
    }
    Ok(())
}

/// Abstract record to Route 53 record set.
pub fn to_native(record: &DnsRecord) -> AwsResult<ResourceRecordSet> {
    validate_record(record)?;
    let mut native = ResourceRecordSet {
        name: format!("{}.", record.fqdn.trim_end_matches('.')),
        record_type: record.record_type.as_str().to_string(),
        ttl: Some(record.ttl),
        ..Default::default()
    };
    native.resource_records = record
        .values
        .iter()
        .map(|value| match record.record_type {
            t if t.is_quoted() => quote(value),
            RecordType::MX => format!("{} {}", record.mx_priority.unwrap_or_default(), value),
            _ => value.clone(),
        })
        .collect();

    if record.policy != DnsPolicy::Simple {
        native.set_identifier = record.identifier.clone();
    }
    match &record.policy {
        DnsPolicy::Simple => {}
        DnsPolicy::Weighted(weight) => native.weight = Some(*weight),
        DnsPolicy::Latency(region) => native.region = Some(region.clone()),
        DnsPolicy::Failover(role) => native.failover = Some(role.as_str().to_string()),
        DnsPolicy::Geo(code) => native.geo_location = Some(native_geo(code)?),
        DnsPolicy::MultiValue => native.multi_value_answer = Some(true),
    }
    Ok(native)
}

/// Route 53 record set to abstract record.
pub fn from_native(zone_id: &str, native: &ResourceRecordSet) -> AwsResult<DnsRecord> {
    let record_type = RecordType::parse(&native.record_type)?;
    let policy = if let Some(weight) = native.weight {
        DnsPolicy::Weighted(weight)
    } else if let Some(region) = &native.region {
        DnsPolicy::Latency(region.clone())
    } else if let Some(code) = &native.geo_location {
        DnsPolicy::Geo(code.clone())
    } else if let Some(role) = &native.failover {
        DnsPolicy::Failover(FailoverRole::parse(role)?)
    } else if native.multi_value_answer == Some(true) {
        DnsPolicy::MultiValue
    } else {
        DnsPolicy::Simple
    };

    let mut mx_priority = None;
    let mut values = Vec::with_capacity(native.resource_records.len());
    for raw in &native.resource_records {
        let value = match record_type {
            t if t.is_quoted() => unquote(raw),
            RecordType::MX => {
                let (priority, host) = raw.trim().split_once(' ').ok_or_else(|| {
                    AwsError::malformed(SERVICE, &format!("MX value '{}' has no priority", raw), 200)
                })?;
                let priority: i64 = priority.parse().map_err(|_| {
                    AwsError::malformed(SERVICE, &format!("MX priority '{}' is not a number", priority), 200)
                })?;
                if mx_priority.is_some_and(|p| p != priority) {
                    return Err(AwsError::not_supported(
                        SERVICE,
                        &format!("{}: MX values with differing priorities", native.name),
                    ));
                }
                mx_priority = Some(priority);
                host.trim().to_string()
            }
            _ => raw.clone(),
        };
        values.push(value);
    }

    Ok(DnsRecord {
        zone_id: zone_id.to_string(),
        fqdn: native.name.trim_end_matches('.').replace("\\052", "*"),
        record_type,
        ttl: native.ttl.unwrap_or_default(),
        values,
        identifier: if policy == DnsPolicy::Simple {
            None
        } else {
            native.set_identifier.clone()
        },
        policy,
        mx_priority,
    })
}

// ── Changes and comparison ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Create,
    Delete,
    Upsert,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Delete => "DELETE",
            Self::Upsert => "UPSERT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordChange {
    pub action: ChangeAction,
    pub record: DnsRecord,
}

/// Outcome of comparing desired records with what the provider has.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecordSetDiff {
    pub common: Vec<DnsRecord>,
    pub added: Vec<DnsRecord>,
    pub removed: Vec<DnsRecord>,
    pub updated: Vec<DnsRecord>,
}

impl RecordSetDiff {
    /// Changes that bring the provider in line with the desired set.
    pub fn changes(&self) -> Vec<RecordChange> {
        let change = |action: ChangeAction| move |record: &DnsRecord| RecordChange { action, record: record.clone() };
        self.removed
            .iter()
            .map(change(ChangeAction::Delete))
            .chain(self.updated.iter().map(change(ChangeAction::Upsert)))
            .chain(self.added.iter().map(change(ChangeAction::Create)))
            .collect()
    }
}

/// Match `local` against `remote` by [`DnsRecord::key`]. Matched records
/// that differ in TTL, priority, identifier or policy details are updated.
pub fn compare_record_sets(remote: &[DnsRecord], local: &[DnsRecord]) -> RecordSetDiff {
    let remote_by_key: HashMap<String, &DnsRecord> = remote.iter().map(|r| (r.key(), r)).collect();
    let local_keys: HashSet<String> = local.iter().map(DnsRecord::key).collect();

    let mut diff = RecordSetDiff::default();
    for record in local {
        match remote_by_key.get(&record.key()) {
            Some(existing) => {
                let same = existing.ttl == record.ttl
                    && existing.mx_priority == record.mx_priority
                    && existing.identifier == record.identifier
                    && existing.policy == record.policy;
                if same {
                    diff.common.push(record.clone());
                } else {
                    diff.updated.push(record.clone());
                }
            }
            None => diff.added.push(record.clone()),
        }
    }
    diff.removed = remote
        .iter()
        .filter(|r| !local_keys.contains(&r.key()))
        .cloned()
        .collect();
    diff
}

// ── TTL ranges ──────────────────────────────────────────────────────────

/// TTL values a DNS product accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TtlRange {
    Continuous { min: i64, max: i64 },
    /// Sorted ascending.
    Discrete(Vec<i64>),
}

/// Route 53 accepts any 32-bit non-negative TTL.
pub const ROUTE53_TTL_RANGE: TtlRange = TtlRange::Continuous {
    min: 0,
    max: 2_147_483_647,
};

impl TtlRange {
    /// The nearest TTL the product accepts. Ties go to the larger value.
    pub fn supported_ttl(&self, ttl: i64) -> i64 {
        match self {
            Self::Continuous { min, max } => ttl.clamp(*min, *max),
            Self::Discrete(allowed) => {
                let (Some(first), Some(last)) = (allowed.first(), allowed.last()) else {
                    return ttl;
                };
                if ttl <= *first {
                    return *first;
                }
                if ttl >= *last {
                    return *last;
                }
                for pair in allowed.windows(2) {
                    let (lo, hi) = (pair[0], pair[1]);
                    if ttl == lo || ttl == hi {
                        return ttl;
                    }
                    if ttl > lo && ttl < hi {
                        return if ttl - lo < hi - ttl { lo } else { hi };
                    }
                }
                *last
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn weighted() -> DnsRecord {
        DnsRecord::simple("Z1", "app.example.com", RecordType::A, 60, vec!["10.0.0.1".into()])
            .with_policy("w1", DnsPolicy::Weighted(30))
    }

    #[test]
    fn weighted_record_round_trips() {
        let record = weighted();
        let native = to_native(&record).unwrap();
        assert_eq!(native.weight, Some(30));
        assert_eq!(native.set_identifier.as_deref(), Some("w1"));
        assert_eq!(native.ttl, Some(60));
        assert_eq!(native.name, "app.example.com.");
        assert_eq!(native.resource_records, vec!["10.0.0.1".to_string()]);
        assert_eq!(from_native("Z1", &native).unwrap(), record);
    }

    #[test]
    fn every_policy_round_trips_both_ways() {
        let base = DnsRecord::simple("Z1", "svc.example.com", RecordType::CNAME, 300, vec!["lb.example.net".into()]);
        let policies = vec![
            DnsPolicy::Weighted(0),
            DnsPolicy::Latency("eu-west-1".into()),
            DnsPolicy::Failover(FailoverRole::Secondary),
            DnsPolicy::Geo(GeoCode::subdivision("US", "CA")),
            DnsPolicy::Geo(GeoCode::default_location()),
            DnsPolicy::MultiValue,
        ];
        for policy in policies {
            let record = base.clone().with_policy("id-1", policy);
            let native = to_native(&record).unwrap();
            let read = from_native("Z1", &native).unwrap();
            assert_eq!(read, record);
            assert_eq!(to_native(&read).unwrap(), native);
        }
    }

    #[test]
    fn codes_outside_the_catalog_round_trip() {
        let base = DnsRecord::simple("Z1", "svc.example.com", RecordType::A, 60, vec!["10.0.0.9".into()]);
        let policies = vec![
            DnsPolicy::Geo(GeoCode::country("FJ")),
            DnsPolicy::Geo(GeoCode::subdivision("US", "MA")),
            DnsPolicy::Geo(GeoCode::subdivision("GB", "SCT")),
            DnsPolicy::Latency("mx-central-1".into()),
            DnsPolicy::Latency("ap-southeast-7".into()),
        ];
        for policy in policies {
            let native = ResourceRecordSet {
                name: "svc.example.com.".into(),
                record_type: "A".into(),
                set_identifier: Some("edge".into()),
                ttl: Some(60),
                resource_records: vec!["10.0.0.9".into()],
                ..Default::default()
            };
            let native = match &policy {
                DnsPolicy::Geo(code) => ResourceRecordSet { geo_location: Some(code.clone()), ..native },
                DnsPolicy::Latency(region) => ResourceRecordSet { region: Some(region.clone()), ..native },
                _ => native,
            };
            let read = from_native("Z1", &native).unwrap();
            assert_eq!(read, base.clone().with_policy("edge", policy));
            assert_eq!(to_native(&read).unwrap(), native);
        }
    }

    #[test]
    fn malformed_locations_are_rejected() {
        let record = |policy| weighted().with_policy("g1", policy);
        for code in [
            GeoCode::country("FJI"),
            GeoCode::continent("XX"),
            GeoCode::subdivision("*", "CA"),
            GeoCode::default(),
        ] {
            let err = to_native(&record(DnsPolicy::Geo(code))).unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidParameter);
        }
        let err = to_native(&record(DnsPolicy::Latency("moon-base".into()))).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParameter);
    }

    #[test]
    fn quoting_and_mx_priority() {
        let txt = DnsRecord::simple("Z1", "example.com", RecordType::TXT, 300, vec!["v=spf1 -all".into()]);
        let native = to_native(&txt).unwrap();
        assert_eq!(native.resource_records, vec!["\"v=spf1 -all\"".to_string()]);
        assert_eq!(from_native("Z1", &native).unwrap(), txt);

        let mx = DnsRecord::simple("Z1", "example.com", RecordType::MX, 300, vec!["mail.example.com".into()])
            .with_mx_priority(10);
        let native = to_native(&mx).unwrap();
        assert_eq!(native.resource_records, vec!["10 mail.example.com".to_string()]);
        assert_eq!(from_native("Z1", &native).unwrap(), mx);
    }

    #[test]
    fn identifiers_are_required_and_unique() {
        let mut record = weighted();
        record.identifier = None;
        assert_eq!(to_native(&record).unwrap_err().kind, ErrorKind::InvalidParameter);

        let simple_with_id = DnsRecord {
            identifier: Some("x".into()),
            ..DnsRecord::simple("Z1", "a.example.com", RecordType::A, 60, vec![])
        };
        assert_eq!(validate_record(&simple_with_id).unwrap_err().kind, ErrorKind::InvalidParameter);

        let mut twin = weighted();
        twin.values = vec!["10.0.0.2".into()];
        let err = validate_identifiers(&[weighted(), twin.clone()]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParameter);

        twin.identifier = Some("w2".into());
        validate_identifiers(&[weighted(), twin]).unwrap();
    }

    #[test]
    fn geo_lookup_prefers_most_specific_row() {
        let query = GeoCode {
            continent: Some("EU".into()),
            country: Some("DE".into()),
            subdivision: None,
        };
        assert_eq!(lookup_geo(&query).unwrap().name, "Germany");
        assert_eq!(lookup_geo(&GeoCode::continent("AS")).unwrap().name, "Asia");
        assert_eq!(lookup_geo(&GeoCode::subdivision("US", "WA")).unwrap().name, "Washington");
        assert_eq!(lookup_geo(&GeoCode::default_location()).unwrap().name, "Default");
        assert!(lookup_geo(&GeoCode::country("XX")).is_err());
        assert!(lookup_geo(&GeoCode::default()).is_err());
    }

    #[test]
    fn geo_write_emits_catalog_code() {
        let query = GeoCode {
            continent: Some("EU".into()),
            country: Some("FR".into()),
            subdivision: None,
        };
        let record = weighted().with_policy("g1", DnsPolicy::Geo(query));
        let native = to_native(&record).unwrap();
        assert_eq!(native.geo_location, Some(GeoCode::country("FR")));
    }

    #[test]
    fn compare_classifies_records() {
        let keep = DnsRecord::simple("Z1", "a.example.com", RecordType::A, 60, vec!["1.1.1.1".into()]);
        let stale = DnsRecord::simple("Z1", "b.example.com", RecordType::A, 60, vec!["2.2.2.2".into()]);
        let retuned_remote = weighted();
        let mut retuned_local = weighted();
        retuned_local.policy = DnsPolicy::Weighted(70);
        let fresh = DnsRecord::simple("Z1", "c.example.com", RecordType::A, 60, vec!["3.3.3.3".into()]);

        let diff = compare_record_sets(
            &[keep.clone(), stale.clone(), retuned_remote],
            &[keep.clone(), retuned_local.clone(), fresh.clone()],
        );
        assert_eq!(diff.common, vec![keep]);
        assert_eq!(diff.updated, vec![retuned_local]);
        assert_eq!(diff.added, vec![fresh]);
        assert_eq!(diff.removed, vec![stale]);

        let actions: Vec<ChangeAction> = diff.changes().iter().map(|c| c.action).collect();
        assert_eq!(actions, vec![ChangeAction::Delete, ChangeAction::Upsert, ChangeAction::Create]);
    }

    #[test]
    fn ttl_ranges() {
        let continuous = TtlRange::Continuous { min: 60, max: 86400 };
        assert_eq!(continuous.supported_ttl(1), 60);
        assert_eq!(continuous.supported_ttl(600), 600);
        assert_eq!(continuous.supported_ttl(100_000), 86400);

        let discrete = TtlRange::Discrete(vec![5, 10, 60, 300, 3600]);
        assert_eq!(discrete.supported_ttl(1), 5);
        assert_eq!(discrete.supported_ttl(60), 60);
        assert_eq!(discrete.supported_ttl(40), 60);
        assert_eq!(discrete.supported_ttl(20), 10);
        assert_eq!(discrete.supported_ttl(99_999), 3600);
        assert_eq!(ROUTE53_TTL_RANGE.supported_ttl(-5), 0);
    }
}
