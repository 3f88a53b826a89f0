//! Stage planning and global percent partitioning
//!
//! The list of stages that will actually run depends on the request: a
//! cache hit skips download and decompress, a raw image skips decompress,
//! a request without a configuration document skips the configure stage.
//! Each planned stage owns a disjoint sub-range of the global 0–100
//! percent, sized by its weight relative to the other planned stages, so
//! a shorter pipeline stretches to fill the full range.

use provd_types::StageKind;

fn weight(kind: StageKind) -> u64 {
    match kind {
        StageKind::CacheLookup => 0, // in-process, instantaneous
        StageKind::Download => 50,
        StageKind::Decompress => 15,
        StageKind::ChecksumVerify => 5,
        StageKind::DeviceFormat => 10,
        StageKind::ImageWrite => 25,
        StageKind::PostInstallConfigure => 5,
    }
}

/// One stage with its slice of the global percentage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedStage {
    pub kind: StageKind,
    /// Global percent when this stage starts
    pub start: u8,
    /// Global percent when this stage completes
    pub end: u8,
}

impl PlannedStage {
    /// Rescale a stage-local 0–100 percent into this stage's global range
    #[must_use]
    pub fn rescale(&self, stage_percent: u8) -> u8 {
        let span = u64::from(self.end - self.start);
        let local = u64::from(stage_percent.min(100));
        #[allow(clippy::cast_possible_truncation)]
        let offset = ((local * span) / 100) as u8;
        self.start + offset
    }
}

/// Inputs that decide which stages run
#[derive(Debug, Clone, Copy)]
pub struct PlanInputs {
    /// Image must be fetched (no cache hit, not a local path)
    pub fresh_download: bool,
    /// Fetched image is gzip-compressed
    pub compressed: bool,
    /// Request carries a first-boot configuration document
    pub has_configuration: bool,
}

/// The ordered list of stages for one request
#[derive(Debug, Clone)]
pub struct StagePlan {
    stages: Vec<PlannedStage>,
}

impl StagePlan {
    /// Build the plan for a request
    #[must_use]
    pub fn build(inputs: PlanInputs) -> Self {
        let mut kinds = Vec::new();
        if inputs.fresh_download {
            kinds.push(StageKind::Download);
            if inputs.compressed {
                kinds.push(StageKind::Decompress);
            }
            // Verifies the freshly stored cache object against its
            // recorded hash before it touches a device
            kinds.push(StageKind::ChecksumVerify);
        }
        kinds.push(StageKind::DeviceFormat);
        kinds.push(StageKind::ImageWrite);
        if inputs.has_configuration {
            kinds.push(StageKind::PostInstallConfigure);
        }

        let total: u64 = kinds.iter().map(|k| weight(*k)).sum();
        let mut stages = Vec::with_capacity(kinds.len());
        let mut cumulative: u64 = 0;
        for kind in kinds {
            #[allow(clippy::cast_possible_truncation)]
            let start = ((cumulative * 100) / total) as u8;
            cumulative += weight(kind);
            #[allow(clippy::cast_possible_truncation)]
            let end = ((cumulative * 100) / total) as u8;
            stages.push(PlannedStage { kind, start, end });
        }

        Self { stages }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlannedStage> {
        self.stages.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    #[must_use]
    pub fn contains(&self, kind: StageKind) -> bool {
        self.stages.iter().any(|s| s.kind == kind)
    }
}
