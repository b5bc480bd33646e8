//! Image naming decoder.
//!
//! Public images from the well-known publishers encode the distribution,
//! version and build in the image name. Each publisher gets an
//! [`ImagePublisher`] implementation, looked up by owner account id.
//! Everything here is pure except [`ImageClient`], which lists images.

use crate::dispatcher::{ApiCall, Dispatcher};
use crate::error::{AwsError, AwsResult};
use crate::pagination::Paginator;
use crate::params::{ParamValue, Params};
use crate::transport::CallContext;
use crate::xml::de;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

lazy_static::lazy_static! {
    static ref DEBIAN_DATE: Option<Regex> = Regex::new(r"-\d{4}-\d{2}-\d{2}-").ok();
    static ref CENTOS_DATE: Option<Regex> = Regex::new(r"\s+\d{4,8}(_\d+)?").ok();
    static ref UBUNTU_VERSION: Option<Regex> = Regex::new(r"-\d+\.\d+-").ok();
    static ref SQL_SERVER: Option<Regex> = Regex::new(r"-SQL_(\d+)_(\w+)-").ok();
    static ref DOTNET_CORE: Option<Regex> = Regex::new(r"-dotnetcore-").ok();
    static ref AMAZON_VERSION: Option<Regex> =
        Regex::new(r"-(\d{4})\.(\d{2})\.(rc-\d+|\d+)(\.(\d+))?").ok();
    static ref AMAZON_VERSION_DATED: Option<Regex> =
        Regex::new(r"-(\d{1,2})\.(\d{1,2})\.(\d{8})(\.(\d+))?").ok();
    static ref SUSE_FAMILIES: Vec<(SuseFamily, Regex)> = SuseFamily::ALL
        .iter()
        .filter_map(|family| Regex::new(family.pattern()).ok().map(|re| (*family, re)))
        .collect();
}

fn find<'a>(re: &Option<Regex>, haystack: &'a str) -> Option<&'a str> {
    re.as_ref()?.find(haystack).map(|m| m.as_str())
}

fn captures<'a>(re: &Option<Regex>, haystack: &'a str) -> Option<regex::Captures<'a>> {
    re.as_ref()?.captures(haystack)
}

fn group<'a>(caps: &regex::Captures<'a>, i: usize) -> &'a str {
    caps.get(i).map(|m| m.as_str()).unwrap_or("")
}

fn part<'a>(parts: &[&'a str], i: usize) -> &'a str {
    parts.get(i).copied().unwrap_or("")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OsType {
    Linux,
    Windows,
}

/// Which catalog an image belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    System,
    Customized,
    Market,
}

/// The fields of an image the decoder looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageFingerprint {
    #[serde(default)]
    pub image_id: String,
    #[serde(default, rename = "imageOwnerId")]
    pub owner_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub root_device_name: String,
    #[serde(default, rename = "blockDeviceMapping", deserialize_with = "block_device_names")]
    pub block_devices: Vec<String>,
    #[serde(default, rename = "isPublic", deserialize_with = "de::bool_from_str")]
    pub public: bool,
}

fn block_device_names<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Mapping {
        #[serde(default)]
        device_name: String,
    }
    let mappings: Vec<Mapping> = de::one_or_many(d)?;
    Ok(mappings.into_iter().map(|m| m.device_name).collect())
}

/// Decoded operating system of an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsInfo {
    pub os_type: OsType,
    pub distro: String,
    pub version: String,
    pub build_id: String,
}

impl OsInfo {
    /// `(distro, version)` when both are known.
    pub fn family(&self) -> Option<(String, String)> {
        if self.distro.is_empty() || self.version.is_empty() {
            None
        } else {
            Some((self.distro.clone(), self.version.clone()))
        }
    }
}

/// Decodes one publisher's naming scheme.
pub trait ImagePublisher: Send + Sync {
    fn os_type(&self, _name: &str) -> OsType {
        OsType::Linux
    }

    fn distro(&self, name: &str) -> String;

    fn version(&self, name: &str) -> String;

    fn build_id(&self, name: &str) -> String;

    /// Orders two build ids of the same family.
    fn compare_builds(&self, a: &str, b: &str) -> Ordering {
        a.cmp(b)
    }

    fn decode(&self, name: &str) -> OsInfo {
        OsInfo {
            os_type: self.os_type(name),
            distro: self.distro(name),
            version: self.version(name),
            build_id: self.build_id(name),
        }
    }
}

pub struct Rhel;

impl ImagePublisher for Rhel {
    fn distro(&self, _name: &str) -> String {
        "RHEL".to_string()
    }

    fn version(&self, name: &str) -> String {
        let parts: Vec<&str> = name.split('-').collect();
        if parts.len() < 2 {
            return String::new();
        }
        part(&parts, 1).split('_').next().unwrap_or("").to_string()
    }

    fn build_id(&self, name: &str) -> String {
        let parts: Vec<&str> = name.split('-').collect();
        part(&parts, 2).to_string()
    }
}

pub struct Debian;

impl ImagePublisher for Debian {
    fn distro(&self, _name: &str) -> String {
        "Debian".to_string()
    }

    fn version(&self, name: &str) -> String {
        let parts: Vec<&str> = name.split('-').collect();
        if parts.len() >= 5 {
            part(&parts, 1).to_string()
        } else {
            String::new()
        }
    }

    fn build_id(&self, name: &str) -> String {
        find(&DEBIAN_DATE, name)
            .map(|date| date.trim_matches('-').to_string())
            .unwrap_or_default()
    }
}

pub struct CentOs;

impl CentOs {
    fn is_atomic(name: &str) -> bool {
        matches!(name.find("Atomic"), Some(i) if i > 0)
    }
}

impl ImagePublisher for CentOs {
    fn distro(&self, name: &str) -> String {
        if Self::is_atomic(name) {
            "CentOS Atomic".to_string()
        } else {
            "CentOS".to_string()
        }
    }

    fn version(&self, name: &str) -> String {
        let parts: Vec<&str> = name.split(' ').collect();
        if Self::is_atomic(name) {
            let candidate = part(&parts, 3);
            if !candidate.is_empty() && candidate.parse::<i64>().is_ok() {
                candidate.to_string()
            } else {
                "7".to_string()
            }
        } else if name.starts_with("CentOS Linux ") {
            part(&parts, 2).to_string()
        } else {
            part(&parts, 1).to_string()
        }
    }

    fn build_id(&self, name: &str) -> String {
        let Some(date) = find(&CENTOS_DATE, name) else {
            return String::new();
        };
        let date = date.trim();
        match date.strip_prefix("201") {
            Some(_) => date.get(2..).unwrap_or("").to_string(),
            None => date.to_string(),
        }
    }
}

const UBUNTU_RELEASES: &[(&str, &str)] = &[
    ("warty", "4.10"),
    ("hoary", "5.04"),
    ("breezy", "5.10"),
    ("dapper", "6.06"),
    ("edgy", "6.10"),
    ("feisty", "7.04"),
    ("gutsy", "7.10"),
    ("hardy", "8.04"),
    ("intrepid", "8.10"),
    ("jaunty", "9.04"),
    ("karmic", "9.10"),
    ("lucid", "10.04"),
    ("maverick", "10.10"),
    ("natty", "11.04"),
    ("oneiric", "11.10"),
    ("precise", "12.04"),
    ("quantal", "12.10"),
    ("raring", "13.04"),
    ("saucy", "13.10"),
    ("trusty", "14.04"),
    ("utopic", "14.10"),
    ("vivid", "15.04"),
    ("wily", "15.10"),
    ("xenial", "16.04"),
    ("yakkety", "16.10"),
    ("zesty", "17.04"),
    ("artful", "17.10"),
    ("bionic", "18.04"),
    ("cosmic", "18.10"),
    ("disco", "19.04"),
    ("focal", "20.04"),
    ("jammy", "22.04"),
    ("lunar", "23.04"),
];

pub struct Ubuntu;

impl ImagePublisher for Ubuntu {
    fn distro(&self, name: &str) -> String {
        let core = name.starts_with("ubuntu-rolling-")
            || name.starts_with("ubuntu-core")
            || matches!(name.find("core-edge"), Some(i) if i > 0);
        if name.starts_with("ubuntu-minimal/") {
            "Ubuntu Minimal"
        } else if name.starts_with("ubuntu/") {
            "Ubuntu"
        } else if core {
            "Ubuntu Core"
        } else {
            "Ubuntu"
        }
        .to_string()
    }

    fn version(&self, name: &str) -> String {
        if let Some(version) = find(&UBUNTU_VERSION, name) {
            return version.trim_matches('-').to_string();
        }
        let parts: Vec<&str> = name.split('/').collect();
        if parts.len() >= 4 {
            let codename = part(&parts, 3)
                .split('-')
                .nth(1)
                .unwrap_or("")
                .to_lowercase();
            return UBUNTU_RELEASES
                .iter()
                .find(|(name, _)| *name == codename)
                .map(|(_, version)| version.to_string())
                .unwrap_or(codename);
        }
        let parts: Vec<&str> = name.split('-').collect();
        if name.starts_with("ubuntu-rolling-") && parts.len() > 3 {
            return part(&parts, 2).to_lowercase();
        }
        String::new()
    }

    fn build_id(&self, name: &str) -> String {
        name.rsplit('-').next().unwrap_or("").to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SuseFamily {
    Sles,
    SlesSp,
    Rightlink,
    RightlinkSp,
    Sapcal,
    SapcalSp,
    Byos,
    ByosSp,
    Sap,
    SapSp,
    SapByos,
    SapByosSp,
    CaaspCluster,
    CaaspAdmin,
    ManagerServer,
    ManagerProxy,
}

impl SuseFamily {
    /// Match order matters: the first family whose pattern matches wins.
    const ALL: [SuseFamily; 16] = [
        Self::Sles,
        Self::SlesSp,
        Self::Rightlink,
        Self::RightlinkSp,
        Self::Sapcal,
        Self::SapcalSp,
        Self::Byos,
        Self::ByosSp,
        Self::Sap,
        Self::SapSp,
        Self::SapByos,
        Self::SapByosSp,
        Self::CaaspCluster,
        Self::CaaspAdmin,
        Self::ManagerServer,
        Self::ManagerProxy,
    ];

    fn pattern(&self) -> &'static str {
        match self {
            Self::Sles => r"suse-sles-\d+-v?\d+-",
            Self::SlesSp => r"suse-sles-\d+-sp\d+-v?\d+-",
            Self::Rightlink => r"suse-sles-\d+-rightscale-v?\d+-",
            Self::RightlinkSp => r"suse-sles-\d+-sp\d+-rightscale-v?\d+-",
            Self::Sapcal => r"suse-sles-\d+-sapcal-v?\d+-",
            Self::SapcalSp => r"suse-sles-\d+-sp\d+-sapcal-v?\d+-",
            Self::Byos => r"suse-sles-\d+-byos-v?\d+-",
            Self::ByosSp => r"suse-sles-\d+-sp\d+-byos-v?\d+-",
            Self::Sap => r"suse-sles-sap-\d+-v\d+-",
            Self::SapSp => r"suse-sles-sap-\d+-sp\d+-v\d+-",
            Self::SapByos => r"suse-sles-sap-\d+-byos-v?\d+-",
            Self::SapByosSp => r"suse-sles-sap-\d+-sp\d+-byos-v?\d+-",
            Self::CaaspCluster => r"suse-caasp-\d+-\d+-cluster-byos-v?\d+-",
            Self::CaaspAdmin => r"suse-caasp-\d+-\d+-admin-byos-v?\d+-",
            Self::ManagerServer => r"suse-manager-\d+-\d+-server-byos-v?\d+-",
            Self::ManagerProxy => r"suse-manager-\d+-\d+-proxy-byos-v?\d+-",
        }
    }

    fn detect(name: &str) -> Option<Self> {
        SUSE_FAMILIES
            .iter()
            .find(|(_, re)| re.is_match(name))
            .map(|(family, _)| *family)
    }

    fn distro(&self) -> &'static str {
        match self {
            Self::Sles | Self::SlesSp => "SUSE Linux Enterprise Server",
            Self::Rightlink | Self::RightlinkSp => "SUSE Linux Enterprise Server with RightLink",
            Self::Sapcal | Self::SapcalSp => "SUSE Linux Enterprise Server for SAP CAL",
            Self::Byos | Self::ByosSp => "SUSE Linux Enterprise Server BYOS",
            Self::Sap | Self::SapSp => "SUSE Linux Enterprise Server for SAP Application",
            Self::SapByos | Self::SapByosSp => {
                "SUSE Linux Enterprise Server for SAP Application BYOS"
            }
            Self::CaaspCluster => "SUSE CaaSP Cluster Node",
            Self::CaaspAdmin => "SUSE CaaSP Admin Node",
            Self::ManagerServer => "SUSE Manager Server",
            Self::ManagerProxy => "SUSE Manager Proxy",
        }
    }

    fn version(&self, parts: &[&str]) -> String {
        let service_pack = |i: usize| part(parts, i).get(2..).unwrap_or("").to_string();
        match self {
            Self::Sles | Self::Rightlink | Self::Sapcal | Self::Byos => part(parts, 2).to_string(),
            Self::SlesSp | Self::RightlinkSp | Self::SapcalSp | Self::ByosSp => {
                format!("{}.{}", part(parts, 2), service_pack(3))
            }
            Self::Sap | Self::SapByos => part(parts, 3).to_string(),
            Self::SapSp | Self::SapByosSp => format!("{}.{}", part(parts, 3), service_pack(4)),
            Self::CaaspCluster | Self::CaaspAdmin | Self::ManagerServer | Self::ManagerProxy => {
                format!("{}.{}", part(parts, 2), part(parts, 3))
            }
        }
    }

    fn build_index(&self) -> usize {
        match self {
            Self::Sles => 3,
            Self::SlesSp | Self::Rightlink | Self::Sapcal | Self::Byos | Self::Sap => 4,
            Self::RightlinkSp | Self::SapcalSp | Self::ByosSp | Self::SapSp | Self::SapByos => 5,
            Self::SapByosSp
            | Self::CaaspCluster
            | Self::CaaspAdmin
            | Self::ManagerServer
            | Self::ManagerProxy => 6,
        }
    }
}

pub struct Suse;

impl ImagePublisher for Suse {
    fn distro(&self, name: &str) -> String {
        SuseFamily::detect(name)
            .map(|f| f.distro())
            .unwrap_or("SUSE")
            .to_string()
    }

    fn version(&self, name: &str) -> String {
        let parts: Vec<&str> = name.split('-').collect();
        SuseFamily::detect(name)
            .map(|f| f.version(&parts))
            .unwrap_or_default()
    }

    fn build_id(&self, name: &str) -> String {
        let parts: Vec<&str> = name.split('-').collect();
        SuseFamily::detect(name)
            .map(|f| {
                let build = part(&parts, f.build_index());
                build.strip_prefix('v').unwrap_or(build).to_string()
            })
            .unwrap_or_default()
    }
}

pub struct CoreOs;

fn coreos_channel_rank(channel: &str) -> i32 {
    match channel {
        "alpha" => 0,
        "beta" => 1,
        "stable" => 2,
        _ => -1,
    }
}

impl ImagePublisher for CoreOs {
    fn distro(&self, _name: &str) -> String {
        "CoreOS".to_string()
    }

    fn version(&self, name: &str) -> String {
        let parts: Vec<&str> = name.split('-').collect();
        part(&parts, 2).split('.').next().unwrap_or("").to_string()
    }

    fn build_id(&self, name: &str) -> String {
        let parts: Vec<&str> = name.split('-').collect();
        format!("{}-{}", part(&parts, 1), part(&parts, 2))
    }

    /// `<channel>-<major.minor.patch>`: channel rank first, then numerically.
    fn compare_builds(&self, a: &str, b: &str) -> Ordering {
        let (channel_a, release_a) = a.split_once('-').unwrap_or((a, ""));
        let (channel_b, release_b) = b.split_once('-').unwrap_or((b, ""));
        let by_channel = coreos_channel_rank(channel_a).cmp(&coreos_channel_rank(channel_b));
        if by_channel != Ordering::Equal {
            return by_channel;
        }
        let nums_a: Vec<i64> = release_a.split('.').map(|n| n.parse().unwrap_or(0)).collect();
        let nums_b: Vec<i64> = release_b.split('.').map(|n| n.parse().unwrap_or(0)).collect();
        for (x, y) in nums_a.iter().zip(nums_b.iter()) {
            if x != y {
                return x.cmp(y);
            }
        }
        nums_a.len().cmp(&nums_b.len())
    }
}

/// Amazon's "Windows" owner also publishes Ubuntu and Amazon Linux images.
pub struct WindowsServer;

impl WindowsServer {
    fn is_ubuntu(name: &str) -> bool {
        name.starts_with("ubuntu-")
    }

    fn is_amazon(name: &str) -> bool {
        name.starts_with("amzn-ami-") || name.starts_with("amzn2-ami-")
    }
}

impl ImagePublisher for WindowsServer {
    fn os_type(&self, name: &str) -> OsType {
        if Self::is_ubuntu(name) || Self::is_amazon(name) {
            OsType::Linux
        } else {
            OsType::Windows
        }
    }

    fn distro(&self, name: &str) -> String {
        let os = if Self::is_ubuntu(name) {
            "Ubuntu"
        } else if Self::is_amazon(name) {
            "Amazon Linux"
        } else {
            "Windows Server"
        };
        let mut apps = Vec::new();
        if let Some(caps) = captures(&SQL_SERVER, name) {
            apps.push(format!("SQL Server {} {}", group(&caps, 1), group(&caps, 2)));
        }
        if find(&DOTNET_CORE, name).is_some() {
            apps.push(".Net Core".to_string());
        }
        if apps.is_empty() {
            os.to_string()
        } else {
            format!("{} with {}", os, apps.join(" "))
        }
    }

    fn version(&self, name: &str) -> String {
        if Self::is_ubuntu(name) {
            return Ubuntu.version(name);
        }
        if Self::is_amazon(name) {
            return AmazonLinux.version(name);
        }
        let parts: Vec<&str> = name.split('-').collect();
        if parts.len() < 2 {
            return String::new();
        }
        parts[1..parts.len() - 1].join(" ")
    }

    fn build_id(&self, name: &str) -> String {
        if Self::is_ubuntu(name) {
            return Ubuntu.build_id(name);
        }
        if Self::is_amazon(name) {
            return AmazonLinux.build_id(name);
        }
        name.rsplit('-').next().unwrap_or("").to_string()
    }
}

pub struct AmazonLinux;

impl ImagePublisher for AmazonLinux {
    fn distro(&self, name: &str) -> String {
        if name.starts_with("amzn-ami-minimal-") || name.starts_with("amzn2-ami-minimal-") {
            "Amazon Linux Minimal".to_string()
        } else {
            "Amazon Linux".to_string()
        }
    }

    fn version(&self, name: &str) -> String {
        if let Some(caps) = captures(&AMAZON_VERSION_DATED, name) {
            let date = group(&caps, 3);
            return format!(
                "{}.{}.{}",
                group(&caps, 1),
                group(&caps, 2),
                date.get(..6).unwrap_or(date)
            );
        }
        if let Some(caps) = captures(&AMAZON_VERSION, name) {
            return format!("{}.{}.{}", group(&caps, 1), group(&caps, 2), group(&caps, 3));
        }
        String::new()
    }

    fn build_id(&self, name: &str) -> String {
        if let Some(caps) = captures(&AMAZON_VERSION_DATED, name) {
            let patch = group(&caps, 5);
            return if patch.is_empty() {
                group(&caps, 3).to_string()
            } else {
                format!("{}.{}", group(&caps, 3), patch)
            };
        }
        captures(&AMAZON_VERSION, name)
            .map(|caps| group(&caps, 5).to_string())
            .unwrap_or_default()
    }
}

/// Owner account ids of the publishers, global and China partitions.
const PUBLISHERS: &[(&str, &dyn ImagePublisher)] = &[
    ("841258680906", &Rhel),
    ("309956199498", &Rhel),
    ("673060587306", &Debian),
    ("379101102735", &Debian),
    ("718707510307", &CentOs),
    ("410186602215", &CentOs),
    ("837727238323", &Ubuntu),
    ("099720109477", &Ubuntu),
    ("841869936221", &Suse),
    ("013907871322", &Suse),
    ("280032941352", &CoreOs),
    ("595879546273", &CoreOs),
    ("016951021795", &WindowsServer),
    ("801119661308", &WindowsServer),
    ("141808717104", &AmazonLinux),
    ("137112412989", &AmazonLinux),
];

pub fn publisher_for(owner_id: &str) -> Option<&'static dyn ImagePublisher> {
    PUBLISHERS
        .iter()
        .find(|(id, _)| *id == owner_id)
        .map(|(_, publisher)| *publisher)
}

/// Owner ids whose images count as system images.
pub fn system_owner_ids() -> Vec<&'static str> {
    PUBLISHERS.iter().map(|(id, _)| *id).collect()
}

/// Decode the operating system of `image`.
pub fn normalize(image: &ImageFingerprint) -> OsInfo {
    match publisher_for(&image.owner_id) {
        Some(publisher) => publisher.decode(&image.name),
        None => OsInfo {
            os_type: if image.platform.to_lowercase().contains("windows") {
                OsType::Windows
            } else {
                OsType::Linux
            },
            distro: String::new(),
            version: String::new(),
            build_id: String::new(),
        },
    }
}

pub fn image_type(image: &ImageFingerprint) -> ImageType {
    if publisher_for(&image.owner_id).is_some() {
        ImageType::System
    } else if !image.public {
        ImageType::Customized
    } else {
        ImageType::Market
    }
}

fn compare_builds(image: &ImageFingerprint, a: &str, b: &str) -> Ordering {
    match publisher_for(&image.owner_id) {
        Some(publisher) => publisher.compare_builds(a, b),
        None => a.cmp(b),
    }
}

/// Newest image of every `(distro, version)` family, families in key order,
/// followed by the images that have no family in their input order.
pub fn latest_per_family(images: &[ImageFingerprint]) -> Vec<ImageFingerprint> {
    let mut latest: BTreeMap<(String, String), (&ImageFingerprint, String)> = BTreeMap::new();
    let mut ungrouped = Vec::new();
    for image in images {
        let info = normalize(image);
        let Some(family) = info.family() else {
            ungrouped.push(image.clone());
            continue;
        };
        match latest.get(&family) {
            Some((best, best_build)) => {
                let newer = match compare_builds(image, &info.build_id, best_build) {
                    Ordering::Greater => true,
                    Ordering::Less => false,
                    Ordering::Equal => image.image_id > best.image_id,
                };
                if newer {
                    latest.insert(family, (image, info.build_id));
                }
            }
            None => {
                latest.insert(family, (image, info.build_id));
            }
        }
    }
    latest
        .into_values()
        .map(|(image, _)| image.clone())
        .chain(ungrouped)
        .collect()
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeImagesResult {
    #[serde(default, deserialize_with = "de::one_or_many")]
    images_set: Vec<ImageFingerprint>,
}

/// Image listing scoped to one region.
pub struct ImageClient<'a> {
    dispatcher: &'a Dispatcher,
    region: String,
}

impl<'a> ImageClient<'a> {
    pub fn new(dispatcher: &'a Dispatcher, region: &str) -> Self {
        Self {
            dispatcher,
            region: region.to_string(),
        }
    }

    /// Images published by the known system owners.
    pub async fn list_system_images(&self, ctx: &CallContext) -> AwsResult<Vec<ImageFingerprint>> {
        let owners: Vec<ParamValue> = system_owner_ids().into_iter().map(ParamValue::from).collect();
        self.describe(ctx, Params::new().with("Owner", ParamValue::List(owners)))
            .await
    }

    /// A single image by id.
    pub async fn get_image(&self, ctx: &CallContext, image_id: &str) -> AwsResult<ImageFingerprint> {
        let params = Params::new().with("ImageId", vec![image_id]);
        self.describe(ctx, params)
            .await?
            .into_iter()
            .find(|image| image.image_id == image_id)
            .ok_or_else(|| AwsError::not_found("ec2", &format!("image {}", image_id)))
    }

    async fn describe(&self, ctx: &CallContext, params: Params) -> AwsResult<Vec<ImageFingerprint>> {
        let call = ApiCall::new("ec2", "DescribeImages")
            .region(&self.region)
            .params(params);
        // DescribeImages pages only when MaxResults is given, and then
        // rejects image ids; owner listings page, lookups do not.
        if call.params.contains_key("ImageId") {
            let result: DescribeImagesResult = self.dispatcher.fetch(ctx, &call).await?;
            return Ok(result.images_set);
        }
        let items = self
            .dispatcher
            .paginate(ctx, &call, Paginator::ec2("imagesSet"), Some(1000))
            .await?;
        items
            .into_iter()
            .map(|item| serde_json::from_value::<ImageFingerprint>(item).map_err(AwsError::from))
            .collect()
    }
}
