//! Route 53 hosted zones and record sets over REST-XML.
//!
//! Record sets cross this module in native form; [`crate::dns`] maps them
//! to and from the abstract record model.
//!
//! Reference: <https://docs.aws.amazon.com/Route53/latest/APIReference/>

use crate::dispatcher::{Dispatcher, RawCall};
use crate::dns::{self, compare_record_sets, DnsRecord, GeoCode, RecordChange, ResourceRecordSet};
use crate::error::{AwsError, AwsResult};
use crate::transport::{CallContext, HttpMethod};
use crate::xml::{self, XmlNode};
use serde::{Deserialize, Serialize};

const SERVICE: &str = "route53";
const API_PREFIX: &str = "/2013-04-01";
const XMLNS: &str = "https://route53.amazonaws.com/doc/2013-04-01/";

// ── Types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostedZone {
    pub id: String,
    pub name: String,
    pub caller_reference: String,
    pub comment: Option<String>,
    pub private_zone: bool,
    pub resource_record_set_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeInfo {
    pub id: String,
    pub status: String,
    pub submitted_at: String,
    pub comment: Option<String>,
}

fn zone_path(zone_id: &str) -> String {
    format!(
        "{}/hostedzone/{}",
        API_PREFIX,
        zone_id.trim_start_matches("/hostedzone/")
    )
}

// ── Route53 Client ──────────────────────────────────────────────────────

pub struct Route53Client<'a> {
    dispatcher: &'a Dispatcher,
}

impl<'a> Route53Client<'a> {
    pub fn new(dispatcher: &'a Dispatcher) -> Self {
        Self { dispatcher }
    }

    async fn send(&self, ctx: &CallContext, call: RawCall) -> AwsResult<XmlNode> {
        let response = self.dispatcher.send_raw(ctx, &call).await?;
        xml::parse(&response.body_text())
    }

    /// Every hosted zone of the account.
    pub async fn list_hosted_zones(&self, ctx: &CallContext) -> AwsResult<Vec<HostedZone>> {
        let mut zones = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let mut call = RawCall::new(
                SERVICE,
                "ListHostedZones",
                HttpMethod::Get,
                &format!("{}/hostedzone", API_PREFIX),
            );
            if let Some(marker) = &marker {
                call = call.query("marker", marker);
            }
            let root = self.send(ctx, call).await?;
            let page: Vec<HostedZone> = root
                .child("HostedZones")
                .map(|list| list.children_named("HostedZone").map(parse_hosted_zone).collect())
                .unwrap_or_default();
            if page.is_empty() {
                break;
            }
            zones.extend(page);
            marker = match root.child_text("NextMarker") {
                Some(next) if !next.is_empty() && root.child_text("IsTruncated") == Some("true") => {
                    Some(next.to_string())
                }
                _ => break,
            };
        }
        Ok(zones)
    }

    pub async fn get_hosted_zone(&self, ctx: &CallContext, zone_id: &str) -> AwsResult<HostedZone> {
        let call = RawCall::new(SERVICE, "GetHostedZone", HttpMethod::Get, &zone_path(zone_id));
        let root = self.send(ctx, call).await?;
        root.child("HostedZone")
            .map(parse_hosted_zone)
            .ok_or_else(|| AwsError::not_found(SERVICE, &format!("hosted zone {}", zone_id)))
    }

    /// All record sets of a zone, following `NextRecordName`/`NextRecordType`.
    pub async fn list_record_sets(&self, ctx: &CallContext, zone_id: &str) -> AwsResult<Vec<ResourceRecordSet>> {
        let path = format!("{}/rrset", zone_path(zone_id));
        let mut sets = Vec::new();
        let mut start: Option<(String, String, Option<String>)> = None;
        loop {
            let mut call = RawCall::new(SERVICE, "ListResourceRecordSets", HttpMethod::Get, &path);
            if let Some((name, record_type, identifier)) = &start {
                call = call.query("name", name).query("type", record_type);
                if let Some(identifier) = identifier {
                    call = call.query("identifier", identifier);
                }
            }
            let root = self.send(ctx, call).await?;
            let page: Vec<ResourceRecordSet> = root
                .child("ResourceRecordSets")
                .map(|list| list.children_named("ResourceRecordSet").map(parse_record_set).collect())
                .unwrap_or_default();
            if page.is_empty() {
                break;
            }
            sets.extend(page);

            let truncated = root.child_text("IsTruncated") == Some("true");
            match root.child_text("NextRecordName") {
                Some(name) if truncated && !name.is_empty() => {
                    start = Some((
                        name.to_string(),
                        root.child_text("NextRecordType").unwrap_or_default().to_string(),
                        root.child_text("NextRecordIdentifier").map(str::to_string),
                    ));
                }
                _ => break,
            }
        }
        Ok(sets)
    }

    /// Record sets of a zone in abstract form. Alias records and sets the
    /// abstract model cannot hold are skipped.
    pub async fn list_records(&self, ctx: &CallContext, zone_id: &str) -> AwsResult<Vec<DnsRecord>> {
        Ok(self.read_zone(ctx, zone_id).await?.0)
    }

    /// Abstract records plus the native sets that have no abstract form.
    async fn read_zone(
        &self,
        ctx: &CallContext,
        zone_id: &str,
    ) -> AwsResult<(Vec<DnsRecord>, Vec<ResourceRecordSet>)> {
        let mut records = Vec::new();
        let mut unmanaged = Vec::new();
        for set in self.list_record_sets(ctx, zone_id).await? {
            if set.resource_records.is_empty() {
                log::debug!("skipping alias record set {} {}", set.record_type, set.name);
                unmanaged.push(set);
                continue;
            }
            match dns::from_native(zone_id, &set) {
                Ok(record) => records.push(record),
                Err(err) => {
                    log::warn!("skipping record set {} {}: {}", set.record_type, set.name, err);
                    unmanaged.push(set);
                }
            }
        }
        Ok((records, unmanaged))
    }

    /// Submit one change batch.
    pub async fn change_record_sets(
        &self,
        ctx: &CallContext,
        zone_id: &str,
        changes: &[RecordChange],
        comment: Option<&str>,
    ) -> AwsResult<ChangeInfo> {
        if changes.is_empty() {
            return Err(AwsError::invalid_parameter(SERVICE, "empty change batch"));
        }
        let body = change_batch_xml(changes, comment)?;
        let call = RawCall::new(
            SERVICE,
            "ChangeResourceRecordSets",
            HttpMethod::Post,
            &format!("{}/rrset", zone_path(zone_id)),
        )
        .header("content-type", "application/xml")
        .body(body);
        let root = self.send(ctx, call).await?;
        parse_change_info(&root)
            .ok_or_else(|| AwsError::malformed(SERVICE, "no ChangeInfo in response", 200))
    }

    /// Bring the zone's records in line with `desired`. Returns `None` when
    /// nothing had to change.
    pub async fn sync_records(
        &self,
        ctx: &CallContext,
        zone_id: &str,
        desired: &[DnsRecord],
    ) -> AwsResult<Option<ChangeInfo>> {
        dns::validate_identifiers(desired)?;
        let (current, unmanaged) = self.read_zone(ctx, zone_id).await?;
        // Writing over a set we could not read would duplicate or clobber it.
        for set in &unmanaged {
            let (name, record_type) = set_scope(set);
            let clash = desired.iter().any(|record| {
                record.record_type.as_str() == record_type
                    && record.fqdn.trim_end_matches('.').eq_ignore_ascii_case(&name)
            });
            if clash {
                return Err(AwsError::not_supported(
                    SERVICE,
                    &format!("{} {} exists in a form that cannot be synchronised", record_type, name),
                )
                .with_action("ChangeResourceRecordSets"));
            }
        }
        let diff = compare_record_sets(&current, desired);
        let changes = diff.changes();
        if changes.is_empty() {
            return Ok(None);
        }
        log::info!(
            "zone {}: {} to add, {} to update, {} to remove",
            zone_id,
            diff.added.len(),
            diff.updated.len(),
            diff.removed.len()
        );
        self.change_record_sets(ctx, zone_id, &changes, None)
            .await
            .map(Some)
    }
}

/// Name and type of a native set, in the abstract model's spelling.
fn set_scope(set: &ResourceRecordSet) -> (String, String) {
    (
        set.name.trim_end_matches('.').replace("\\052", "*"),
        set.record_type.to_ascii_uppercase(),
    )
}

// ── XML ─────────────────────────────────────────────────────────────────

fn parse_hosted_zone(node: &XmlNode) -> HostedZone {
    let config = node.child("Config");
    HostedZone {
        id: node.child_text("Id").unwrap_or_default().to_string(),
        name: node.child_text("Name").unwrap_or_default().to_string(),
        caller_reference: node.child_text("CallerReference").unwrap_or_default().to_string(),
        comment: config.and_then(|c| c.child_text("Comment")).map(str::to_string),
        private_zone: config.and_then(|c| c.child_text("PrivateZone")) == Some("true"),
        resource_record_set_count: node
            .child_text("ResourceRecordSetCount")
            .and_then(|v| v.parse().ok()),
    }
}

pub fn parse_record_set(node: &XmlNode) -> ResourceRecordSet {
    let text = |name: &str| node.child_text(name).map(str::to_string);
    ResourceRecordSet {
        name: text("Name").unwrap_or_default(),
        record_type: text("Type").unwrap_or_default(),
        set_identifier: text("SetIdentifier"),
        weight: node.child_text("Weight").and_then(|v| v.parse().ok()),
        region: text("Region"),
        geo_location: node.child("GeoLocation").map(|geo| GeoCode {
            continent: geo.child_text("ContinentCode").map(str::to_string),
            country: geo.child_text("CountryCode").map(str::to_string),
            subdivision: geo.child_text("SubdivisionCode").map(str::to_string),
        }),
        failover: text("Failover"),
        multi_value_answer: node.child_text("MultiValueAnswer").map(|v| v == "true"),
        ttl: node.child_text("TTL").and_then(|v| v.parse().ok()),
        resource_records: node
            .child("ResourceRecords")
            .map(|list| {
                list.children_named("ResourceRecord")
                    .filter_map(|rr| rr.child_text("Value"))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    }
}

fn parse_change_info(root: &XmlNode) -> Option<ChangeInfo> {
    let block = root.find("ChangeInfo")?;
    Some(ChangeInfo {
        id: block.child_text("Id")?.to_string(),
        status: block.child_text("Status")?.to_string(),
        submitted_at: block.child_text("SubmittedAt").unwrap_or_default().to_string(),
        comment: block.child_text("Comment").map(str::to_string),
    })
}

fn record_set_xml(set: &ResourceRecordSet) -> String {
    let mut xml = String::from("<ResourceRecordSet>");
    xml.push_str(&format!("<Name>{}</Name>", xml::escape(&set.name)));
    xml.push_str(&format!("<Type>{}</Type>", set.record_type));
    if let Some(id) = &set.set_identifier {
        xml.push_str(&format!("<SetIdentifier>{}</SetIdentifier>", xml::escape(id)));
    }
    if let Some(weight) = set.weight {
        xml.push_str(&format!("<Weight>{}</Weight>", weight));
    }
    if let Some(region) = &set.region {
        xml.push_str(&format!("<Region>{}</Region>", region));
    }
    if let Some(geo) = &set.geo_location {
        xml.push_str("<GeoLocation>");
        if let Some(c) = &geo.continent {
            xml.push_str(&format!("<ContinentCode>{}</ContinentCode>", c));
        }
        if let Some(c) = &geo.country {
            xml.push_str(&format!("<CountryCode>{}</CountryCode>", c));
        }
        if let Some(c) = &geo.subdivision {
            xml.push_str(&format!("<SubdivisionCode>{}</SubdivisionCode>", c));
        }
        xml.push_str("</GeoLocation>");
    }
    if let Some(failover) = &set.failover {
        xml.push_str(&format!("<Failover>{}</Failover>", failover));
    }
    if let Some(multi) = set.multi_value_answer {
        xml.push_str(&format!("<MultiValueAnswer>{}</MultiValueAnswer>", multi));
    }
    if let Some(ttl) = set.ttl {
        xml.push_str(&format!("<TTL>{}</TTL>", ttl));
    }
    if !set.resource_records.is_empty() {
        xml.push_str("<ResourceRecords>");
        for value in &set.resource_records {
            xml.push_str(&format!(
                "<ResourceRecord><Value>{}</Value></ResourceRecord>",
                xml::escape(value)
            ));
        }
        xml.push_str("</ResourceRecords>");
    }
    xml.push_str("</ResourceRecordSet>");
    xml
}

/// `ChangeResourceRecordSetsRequest` document for `changes`.
pub fn change_batch_xml(changes: &[RecordChange], comment: Option<&str>) -> AwsResult<String> {
    let mut xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><ChangeResourceRecordSetsRequest xmlns="{}"><ChangeBatch>"#,
        XMLNS
    );
    if let Some(c) = comment {
        xml.push_str(&format!("<Comment>{}</Comment>", xml::escape(c)));
    }
    xml.push_str("<Changes>");
    for change in changes {
        let native = dns::to_native(&change.record)?;
        xml.push_str(&format!("<Change><Action>{}</Action>", change.action.as_str()));
        xml.push_str(&record_set_xml(&native));
        xml.push_str("</Change>");
    }
    xml.push_str("</Changes></ChangeBatch></ChangeResourceRecordSetsRequest>");
    Ok(xml)
}
