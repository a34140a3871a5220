/// Cluster topology as read back from the catalog
use super::{Segment, SegmentPair};
use crate::error::{HubError, HubResult};
use std::collections::{BTreeMap, HashSet};

/// Coordinator plus every primary/mirror pair ordered by content id.
///
/// Always built from a full set of catalog rows; a topology change is
/// observed by reading the catalog again, never by editing a `GpArray`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpArray {
    pub coordinator: Segment,
    pub segment_pairs: Vec<SegmentPair>,
}

impl GpArray {
    /// Build the topology from catalog rows, checking the placement
    /// invariants on the way.
    pub fn from_segments(segments: Vec<Segment>) -> HubResult<Self> {
        let mut directories = HashSet::new();
        let mut ports = HashSet::new();
        for seg in &segments {
            if !directories.insert((seg.hostname.clone(), seg.data_directory.clone())) {
                return Err(HubError::catalog(format!(
                    "more than one segment uses data directory {} on host {}",
                    seg.data_directory, seg.hostname
                )));
            }
            if !ports.insert((seg.address.clone(), seg.port)) {
                return Err(HubError::catalog(format!(
                    "more than one segment uses port {} on address {}",
                    seg.port, seg.address
                )));
            }
        }

        let mut coordinator = None;
        let mut primaries: BTreeMap<i32, Segment> = BTreeMap::new();
        let mut mirrors: BTreeMap<i32, Segment> = BTreeMap::new();

        for seg in segments {
            if seg.is_coordinator() {
                // A standby coordinator shares content -1 but acts as mirror
                if seg.is_standby() {
                    continue;
                }
                if coordinator.replace(seg).is_some() {
                    return Err(HubError::catalog("more than one coordinator registered"));
                }
            } else if seg.is_primary() {
                let content = seg.content_id;
                if primaries.insert(content, seg).is_some() {
                    return Err(HubError::catalog(format!(
                        "more than one primary registered for content {}",
                        content
                    )));
                }
            } else if seg.is_mirror() {
                let content = seg.content_id;
                if mirrors.insert(content, seg).is_some() {
                    return Err(HubError::catalog(format!(
                        "more than one mirror registered for content {}",
                        content
                    )));
                }
            } else {
                return Err(HubError::catalog(format!("invalid segment row: {}", seg)));
            }
        }

        let coordinator =
            coordinator.ok_or_else(|| HubError::catalog("no coordinator registered"))?;

        if let Some(content) = mirrors.keys().find(|c| !primaries.contains_key(c)) {
            return Err(HubError::catalog(format!(
                "mirror registered for content {} without a primary",
                content
            )));
        }

        let segment_pairs = primaries
            .into_iter()
            .map(|(content, primary)| SegmentPair {
                primary,
                mirror: mirrors.remove(&content),
            })
            .collect();

        Ok(Self {
            coordinator,
            segment_pairs,
        })
    }

    pub fn primary_segments(&self) -> Vec<&Segment> {
        self.segment_pairs.iter().map(|pair| &pair.primary).collect()
    }

    pub fn mirror_segments(&self) -> Vec<&Segment> {
        self.segment_pairs
            .iter()
            .filter_map(|pair| pair.mirror.as_ref())
            .collect()
    }

    pub fn has_mirrors(&self) -> bool {
        self.segment_pairs.iter().any(|pair| pair.mirror.is_some())
    }

    /// Pair for a content id
    pub fn segment_pair_for_content(&self, content_id: i32) -> HubResult<&SegmentPair> {
        self.segment_pairs
            .iter()
            .find(|pair| pair.primary.content_id == content_id)
            .ok_or_else(|| {
                HubError::catalog(format!("no segment pair found for content {}", content_id))
            })
    }

    /// Content id of the registered primary living at the same location as
    /// `seg`
    pub fn content_id_of(&self, seg: &Segment) -> HubResult<i32> {
        self.primary_segments()
            .into_iter()
            .find(|primary| primary.same_location(seg))
            .map(|primary| primary.content_id)
            .ok_or_else(|| {
                HubError::validation(format!(
                    "did not find any primary segment with configuration {}",
                    seg
                ))
            })
    }

    /// Total number of segment rows, coordinator included
    pub fn segment_count(&self) -> usize {
        1 + self.primary_segments().len() + self.mirror_segments().len()
    }
}
