// src/anchor.rs
//
// Keeps host anchors in step with the markers seen in each frame.
//
// Per marker id the lifecycle is `Absent -> Active` on first sight,
// `Active -> Active` (transform update, same handle) while it stays visible,
// and `Active -> Absent` once the `PrunePolicy` says it is gone.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{AnchorError, AnchorHostError};
use crate::pipeline::FrameOutcome;
use crate::pose::{Pose, PoseMap};
use crate::MarkerId;

/// Row-major 4x4 marker-to-camera transform.
pub type Transform = [[f32; 4]; 4];

/// Opaque anchor reference issued by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AnchorHandle(pub u64);

/// Opaque reference to content the host attached to an anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHandle(pub u64);

/// Rendering side that owns the actual anchors.
pub trait AnchorHost {
    fn create_anchor(&mut self, transform: &Transform) -> Result<AnchorHandle, AnchorHostError>;

    fn update_anchor(
        &mut self,
        handle: AnchorHandle,
        transform: &Transform,
    ) -> Result<(), AnchorHostError>;

    fn remove_anchor(&mut self, handle: AnchorHandle) -> Result<(), AnchorHostError>;

    fn attach_content(
        &mut self,
        handle: AnchorHandle,
        content: &ContentSpec,
    ) -> Result<ContentHandle, AnchorHostError>;
}

/// Content to place on a marker's anchor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentSpec {
    /// Host-defined content reference (asset path, model id, ...).
    pub content_ref: String,
    pub scale: f32,
    /// Offset from the marker centre, in marker units.
    pub local_offset: [f32; 3],
}

impl ContentSpec {
    pub fn new(content_ref: impl Into<String>) -> Self {
        Self {
            content_ref: content_ref.into(),
            scale: 1.0,
            local_offset: [0.0; 3],
        }
    }
}

/// When an anchor whose marker is missing gets removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrunePolicy {
    /// On the first result without the marker.
    #[default]
    Immediate,
    /// After more than `max_missed` consecutive results without it.
    Hysteresis { max_missed: u32 },
}

impl PrunePolicy {
    fn should_remove(self, missed: u32) -> bool {
        match self {
            PrunePolicy::Immediate => missed > 0,
            PrunePolicy::Hysteresis { max_missed } => missed > max_missed,
        }
    }
}

/// An active anchor.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorRecord {
    pub marker_id: MarkerId,
    pub handle: AnchorHandle,
    pub content: Option<ContentHandle>,
    /// Sequence number of the last frame the marker was seen in.
    pub last_seen: u64,
    /// Consecutive results without the marker.
    pub missed: u32,
}

/// What one reconciliation did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub created: Vec<MarkerId>,
    pub updated: Vec<MarkerId>,
    pub removed: Vec<MarkerId>,
    /// Missing markers kept alive by the prune policy.
    pub retained: Vec<MarkerId>,
    /// Host calls that failed; those anchors are left as they were.
    pub failed: Vec<(MarkerId, AnchorHostError)>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Owns the anchor records and drives the host from frame outcomes.
pub struct AnchorLifecycleManager<H: AnchorHost> {
    host: H,
    policy: PrunePolicy,
    anchors: BTreeMap<MarkerId, AnchorRecord>,
    content: BTreeMap<MarkerId, ContentSpec>,
    default_content: Option<ContentSpec>,
    last_sequence: Option<u64>,
}

impl<H: AnchorHost> AnchorLifecycleManager<H> {
    pub fn new(host: H) -> Self {
        Self::with_policy(host, PrunePolicy::default())
    }

    pub fn with_policy(host: H, policy: PrunePolicy) -> Self {
        Self {
            host,
            policy,
            anchors: BTreeMap::new(),
            content: BTreeMap::new(),
            default_content: None,
            last_sequence: None,
        }
    }

    /// Content for `marker_id`, taking precedence over the default.
    pub fn set_content(&mut self, marker_id: MarkerId, spec: ContentSpec) {
        self.content.insert(marker_id, spec);
    }

    /// Content for markers without their own.
    pub fn set_default_content(&mut self, spec: Option<ContentSpec>) {
        self.default_content = spec;
    }

    pub fn policy(&self) -> PrunePolicy {
        self.policy
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn get(&self, marker_id: MarkerId) -> Option<&AnchorRecord> {
        self.anchors.get(&marker_id)
    }

    pub fn is_active(&self, marker_id: MarkerId) -> bool {
        self.anchors.contains_key(&marker_id)
    }

    /// Active marker ids, ascending.
    pub fn active_ids(&self) -> impl Iterator<Item = MarkerId> + '_ {
        self.anchors.keys().copied()
    }

    pub fn records(&self) -> impl Iterator<Item = &AnchorRecord> {
        self.anchors.values()
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// Sequence number of the last outcome applied.
    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    /// Reconcile against one worker outcome. Failed outcomes leave every
    /// anchor as it is.
    pub fn apply(&mut self, outcome: &FrameOutcome) -> Result<ReconcileReport, AnchorError> {
        if let Some(last) = self.last_sequence {
            if outcome.sequence < last {
                return Err(AnchorError::OutOfOrder {
                    sequence: outcome.sequence,
                    last,
                });
            }
        }
        self.last_sequence = Some(outcome.sequence);

        match &outcome.result {
            Ok(poses) => Ok(self.reconcile(outcome.sequence, poses)),
            Err(err) => {
                debug!(
                    sequence = outcome.sequence,
                    kind = err.kind(),
                    "failed frame leaves anchors unchanged"
                );
                Ok(ReconcileReport::default())
            }
        }
    }

    fn reconcile(&mut self, sequence: u64, poses: &PoseMap) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for (&id, pose) in poses {
            let transform = pose.transform();
            let result = match self.anchors.get_mut(&id) {
                Some(record) => self
                    .host
                    .update_anchor(record.handle, &transform)
                    .map(|()| {
                        record.last_seen = sequence;
                        record.missed = 0;
                        report.updated.push(id);
                    }),
                None => self.create(id, &transform, sequence).map(|()| report.created.push(id)),
            };
            if let Err(err) = result {
                warn!(marker = id, sequence, error = %err, "anchor host call failed");
                report.failed.push((id, err));
                continue;
            }
            self.ensure_content(id);
        }

        let missing: Vec<MarkerId> = self
            .anchors
            .keys()
            .copied()
            .filter(|id| !poses.contains_key(id))
            .collect();
        for id in missing {
            let Some(record) = self.anchors.get_mut(&id) else {
                continue;
            };
            record.missed = record.missed.saturating_add(1);
            if !self.policy.should_remove(record.missed) {
                report.retained.push(id);
                continue;
            }
            let handle = record.handle;
            match self.host.remove_anchor(handle) {
                Ok(()) => {
                    self.anchors.remove(&id);
                    report.removed.push(id);
                }
                Err(err) => {
                    warn!(marker = id, sequence, error = %err, "anchor removal failed");
                    report.failed.push((id, err));
                }
            }
        }

        debug!(
            sequence,
            created = report.created.len(),
            updated = report.updated.len(),
            removed = report.removed.len(),
            active = self.anchors.len(),
            "anchors reconciled"
        );
        report
    }

    fn create(
        &mut self,
        id: MarkerId,
        transform: &Transform,
        sequence: u64,
    ) -> Result<(), AnchorHostError> {
        let handle = self.host.create_anchor(transform)?;
        self.anchors.insert(
            id,
            AnchorRecord {
                marker_id: id,
                handle,
                content: None,
                last_seen: sequence,
                missed: 0,
            },
        );
        Ok(())
    }

    /// Attach configured content if the anchor has none yet. Failures are
    /// logged and retried on the next update.
    fn ensure_content(&mut self, id: MarkerId) {
        let Some(record) = self.anchors.get_mut(&id) else {
            return;
        };
        if record.content.is_some() {
            return;
        }
        let Some(spec) = self.content.get(&id).or(self.default_content.as_ref()) else {
            return;
        };
        match self.host.attach_content(record.handle, spec) {
            Ok(content) => record.content = Some(content),
            Err(err) => warn!(marker = id, error = %err, "content attach failed"),
        }
    }

    /// Create an anchor outside the per-frame flow.
    pub fn activate(
        &mut self,
        marker_id: MarkerId,
        pose: &Pose,
        sequence: u64,
    ) -> Result<&AnchorRecord, AnchorError> {
        if self.anchors.contains_key(&marker_id) {
            return Err(AnchorError::AlreadyActive(marker_id));
        }
        self.create(marker_id, &pose.transform(), sequence)?;
        self.ensure_content(marker_id);
        self.anchors
            .get(&marker_id)
            .ok_or_else(|| {
                AnchorError::Host(AnchorHostError(format!(
                    "anchor for marker {marker_id} vanished"
                )))
            })
    }

    /// Remove a marker's anchor. Returns whether one existed; absent ids are
    /// a no-op.
    pub fn deactivate(&mut self, marker_id: MarkerId) -> Result<bool, AnchorError> {
        let Some(record) = self.anchors.get(&marker_id) else {
            return Ok(false);
        };
        self.host.remove_anchor(record.handle)?;
        self.anchors.remove(&marker_id);
        Ok(true)
    }

    /// Remove every anchor. Anchors whose removal fails stay registered; the
    /// first failure is returned.
    pub fn clear(&mut self) -> Result<(), AnchorError> {
        let mut first_error = None;
        let ids: Vec<MarkerId> = self.anchors.keys().copied().collect();
        for id in ids {
            if let Err(err) = self.deactivate(id) {
                first_error.get_or_insert(err);
            }
        }
        self.last_sequence = None;
        first_error.map_or(Ok(()), Err)
    }
}
