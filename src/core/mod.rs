/// Cluster topology and request types shared by the workflows
pub mod connection;
pub mod gparray;
pub mod rpc;

pub use gparray::GpArray;

use crate::error::{HubError, HubResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

/// Content id of the coordinator
pub const COORDINATOR_CONTENT_ID: i32 = -1;

/// Catalog identity the coordinator is always registered with
pub const COORDINATOR_DBID: i32 = 1;

/// Role a segment is acting in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Primary,
    Mirror,
}

impl Role {
    /// Single character used by the catalog
    pub fn as_char(&self) -> char {
        match self {
            Role::Primary => 'p',
            Role::Mirror => 'm',
        }
    }

    pub fn from_char(c: char) -> HubResult<Self> {
        match c {
            'p' => Ok(Role::Primary),
            'm' => Ok(Role::Mirror),
            other => Err(HubError::catalog(format!("unknown segment role '{}'", other))),
        }
    }
}

/// One database node instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Assigned by the catalog at registration, 0 until then
    #[serde(default)]
    pub dbid: i32,
    #[serde(default)]
    pub content_id: i32,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub preferred_role: Role,
    pub hostname: String,
    pub address: String,
    pub port: u16,
    pub data_directory: String,
}

impl Segment {
    pub fn new<H: Into<String>, A: Into<String>, D: Into<String>>(
        hostname: H,
        address: A,
        port: u16,
        data_directory: D,
    ) -> Self {
        Self {
            dbid: 0,
            content_id: 0,
            role: Role::Primary,
            preferred_role: Role::Primary,
            hostname: hostname.into(),
            address: address.into(),
            port,
            data_directory: data_directory.into(),
        }
    }

    pub fn is_coordinator(&self) -> bool {
        self.content_id == COORDINATOR_CONTENT_ID
    }

    /// Segment holding data and acting as primary
    pub fn is_primary(&self) -> bool {
        self.content_id >= 0 && self.role == Role::Primary
    }

    pub fn is_mirror(&self) -> bool {
        self.content_id >= 0 && self.role == Role::Mirror
    }

    /// Standby coordinator
    pub fn is_standby(&self) -> bool {
        self.is_coordinator() && self.role == Role::Mirror
    }

    /// Same physical location: host, address, directory and port all equal
    pub fn same_location(&self, other: &Segment) -> bool {
        self.hostname == other.hostname
            && self.address == other.address
            && self.data_directory == other.data_directory
            && self.port == other.port
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dbid={} content={} role={} host={} address={} port={} datadir={}",
            self.dbid,
            self.content_id,
            self.role.as_char(),
            self.hostname,
            self.address,
            self.port,
            self.data_directory
        )
    }
}

/// A primary and its optional mirror sharing one content id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentPair {
    pub primary: Segment,
    #[serde(default)]
    pub mirror: Option<Segment>,
}

/// Locale settings used for every segment of a new cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locale {
    #[serde(default)]
    pub lc_all: String,
    #[serde(default)]
    pub lc_collate: String,
    #[serde(default)]
    pub lc_ctype: String,
    #[serde(default)]
    pub lc_messages: String,
    #[serde(default)]
    pub lc_monetary: String,
    #[serde(default)]
    pub lc_numeric: String,
    #[serde(default)]
    pub lc_time: String,
}

/// Immutable configuration snapshot for one bring-up
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterParams {
    #[serde(default)]
    pub common_config: BTreeMap<String, String>,
    #[serde(default)]
    pub coordinator_config: BTreeMap<String, String>,
    #[serde(default)]
    pub segment_config: BTreeMap<String, String>,
    #[serde(default)]
    pub locale: Locale,
    #[serde(default)]
    pub encoding: String,
    #[serde(default)]
    pub su_password: String,
    /// Database created once the cluster is up, if any
    #[serde(default)]
    pub db_name: Option<String>,
    /// Use hostnames rather than addresses in host-based access entries
    #[serde(default)]
    pub hba_hostnames: bool,
    #[serde(default)]
    pub data_checksums: bool,
}

impl ClusterParams {
    /// Server settings for one segment: the common tier overlaid with the
    /// coordinator or segment tier.
    pub fn config_for(&self, segment: &Segment) -> BTreeMap<String, String> {
        let mut config = self.common_config.clone();
        let overlay = if segment.is_coordinator() {
            &self.coordinator_config
        } else {
            &self.segment_config
        };
        config.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
        config
    }
}

/// Request to bring up a brand new cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MakeClusterRequest {
    pub coordinator: Segment,
    pub segment_pairs: Vec<SegmentPair>,
    #[serde(default)]
    pub cluster_params: ClusterParams,
    /// Clear non-empty data directories instead of failing validation
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub verbose: bool,
}

impl MakeClusterRequest {
    pub fn primary_segments(&self) -> Vec<&Segment> {
        self.segment_pairs.iter().map(|pair| &pair.primary).collect()
    }

    pub fn mirror_segments(&self) -> Vec<&Segment> {
        self.segment_pairs
            .iter()
            .filter_map(|pair| pair.mirror.as_ref())
            .collect()
    }

    pub fn is_mirrorless(&self) -> bool {
        self.mirror_segments().is_empty()
    }

    /// Every segment of the request, coordinator first
    pub fn all_segments(&self) -> Vec<&Segment> {
        let mut segments = vec![&self.coordinator];
        segments.extend(self.primary_segments());
        segments.extend(self.mirror_segments());
        segments
    }

    /// Distinct hosts referenced by the request
    pub fn hostnames(&self) -> BTreeSet<String> {
        self.all_segments()
            .into_iter()
            .map(|seg| seg.hostname.clone())
            .collect()
    }

    /// Reject layouts that reuse a data directory on a host or a port on an
    /// address.
    pub fn validate_layout(&self) -> HubResult<()> {
        if self.segment_pairs.is_empty() {
            return Err(HubError::validation("no primary segments requested"));
        }

        let mirrors = self.mirror_segments().len();
        if mirrors != 0 && mirrors != self.segment_pairs.len() {
            return Err(HubError::validation(format!(
                "number of mirrors {} is not equal to the number of primaries {}",
                mirrors,
                self.segment_pairs.len()
            )));
        }

        let mut directories = HashSet::new();
        let mut ports = HashSet::new();
        for seg in self.all_segments() {
            if !directories.insert((seg.hostname.as_str(), seg.data_directory.as_str())) {
                return Err(HubError::validation(format!(
                    "duplicate data directory {} on host {}",
                    seg.data_directory, seg.hostname
                )));
            }
            if !ports.insert((seg.address.as_str(), seg.port)) {
                return Err(HubError::validation(format!(
                    "duplicate port {} on address {}",
                    seg.port, seg.address
                )));
            }
        }

        Ok(())
    }
}

/// Request to attach mirrors to a running mirrorless cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddMirrorsRequest {
    pub coordinator_data_dir: String,
    /// Mirrors carrying the content id of the primary they follow
    pub mirrors: Vec<Segment>,
    #[serde(default)]
    pub hba_hostnames: bool,
}
