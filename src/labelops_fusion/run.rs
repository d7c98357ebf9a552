//! Bookkeeping of one fusion run and the summary handed back to callers.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use super::volume::{Interval, LabelValue, LabelVolume};

/// Number of histogram buckets: ten 10% bins plus an exact 100% bin.
pub const HISTOGRAM_BINS: usize = 11;

/// Voxel counts of one marker's inserted segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MarkerVolume {
    pub colliding: u64,
    pub not_colliding: u64,
}

impl MarkerVolume {
    pub const fn total(&self) -> u64 {
        self.colliding + self.not_colliding
    }

    /// Colliding share of the volume, `None` for an empty segment.
    pub fn collision_ratio(&self) -> Option<f32> {
        let total = self.total();
        (total > 0).then(|| self.colliding as f32 / total as f32)
    }

    /// Moves one voxel from the non-colliding into the colliding count.
    pub(crate) fn convert_one_to_colliding(&mut self) {
        self.not_colliding = self.not_colliding.saturating_sub(1);
        self.colliding += 1;
    }
}

/// Histogram of per-marker collision ratios in 10% steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CollisionHistogram {
    pub bins: [usize; HISTOGRAM_BINS],
}

impl CollisionHistogram {
    /// Counts `ratio` into bucket `floor(ratio * 10)`.
    pub fn record(&mut self, ratio: f32) {
        let bin = ((ratio * 10.0) as usize).min(HISTOGRAM_BINS - 1);
        self.bins[bin] += 1;
    }

    pub fn total(&self) -> usize {
        self.bins.iter().sum()
    }
}

impl fmt::Display for CollisionHistogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, count) in self.bins.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}%:{}", i * 10, count)?;
        }
        Ok(())
    }
}

/// Claimants of every voxel that ended up in a collision.
///
/// Voxels are keyed by their linear index in the output image.
#[derive(Debug, Clone)]
pub struct CollisionRegistry<L> {
    claims: HashMap<usize, Vec<L>>,
}

impl<L> Default for CollisionRegistry<L> {
    fn default() -> Self {
        Self {
            claims: HashMap::new(),
        }
    }
}

impl<L: LabelValue> CollisionRegistry<L> {
    /// Records `marker` as a claimant of voxel `index`.
    pub fn claim(&mut self, index: usize, marker: L) {
        let claimants = self.claims.entry(index).or_default();
        if !claimants.contains(&marker) {
            claimants.push(marker);
        }
    }

    /// Claimants of voxel `index` in order of arrival.
    pub fn claimants(&self, index: usize) -> &[L] {
        self.claims.get(&index).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    /// Forgets all claims but keeps the allocation.
    pub fn clear(&mut self) {
        self.claims.clear();
    }
}

/// Mutable state shared by the stages during one fusion run.
#[derive(Debug, Clone)]
pub struct FusionRun<L> {
    pub(crate) volumes: BTreeMap<L, MarkerVolume>,
    pub(crate) no_match: BTreeSet<L>,
    pub(crate) at_border: BTreeSet<L>,
    pub(crate) colliding: BTreeSet<L>,
    pub(crate) fused_rois: HashMap<L, Interval>,
    pub(crate) registry: CollisionRegistry<L>,
    pub(crate) pending: Vec<usize>,
    pub(crate) hidden: Vec<(usize, L)>,
    pub(crate) discovered: usize,
    pub(crate) unresolved: usize,
}

impl<L: LabelValue> Default for FusionRun<L> {
    fn default() -> Self {
        Self::with_scratch(CollisionRegistry::default(), Vec::new(), Vec::new())
    }
}

impl<L: LabelValue> FusionRun<L> {
    /// Starts a run on recycled scratch containers; they are cleared first.
    pub fn with_scratch(
        mut registry: CollisionRegistry<L>,
        mut pending: Vec<usize>,
        mut hidden: Vec<(usize, L)>,
    ) -> Self {
        registry.clear();
        pending.clear();
        hidden.clear();
        Self {
            volumes: BTreeMap::new(),
            no_match: BTreeSet::new(),
            at_border: BTreeSet::new(),
            colliding: BTreeSet::new(),
            fused_rois: HashMap::new(),
            registry,
            pending,
            hidden,
            discovered: 0,
            unresolved: 0,
        }
    }

    /// Gives the scratch containers back for reuse.
    pub fn into_scratch(self) -> (CollisionRegistry<L>, Vec<usize>, Vec<(usize, L)>) {
        (self.registry, self.pending, self.hidden)
    }

    /// Adds to the recorded volume of `marker`.
    pub fn record_volumes(&mut self, marker: L, colliding: u64, not_colliding: u64) {
        let volume = self.volumes.entry(marker).or_default();
        volume.colliding += colliding;
        volume.not_colliding += not_colliding;
    }

    pub fn volume(&self, marker: L) -> MarkerVolume {
        self.volumes.get(&marker).copied().unwrap_or_default()
    }

    pub fn volumes(&self) -> &BTreeMap<L, MarkerVolume> {
        &self.volumes
    }

    pub fn registry(&self) -> &CollisionRegistry<L> {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut CollisionRegistry<L> {
        &mut self.registry
    }

    pub fn no_match(&self) -> &BTreeSet<L> {
        &self.no_match
    }

    pub fn at_border(&self) -> &BTreeSet<L> {
        &self.at_border
    }

    pub fn colliding(&self) -> &BTreeSet<L> {
        &self.colliding
    }

    pub fn fused_roi(&self, marker: L) -> Option<&Interval> {
        self.fused_rois.get(&marker)
    }

    /// Voxels left unresolved by collision resolution.
    pub fn unresolved(&self) -> usize {
        self.unresolved
    }

    pub(crate) fn report(&self, histogram: CollisionHistogram) -> FusionReport<L> {
        FusionReport {
            total_markers: self.discovered,
            no_match: self.no_match.clone(),
            at_border: self.at_border.clone(),
            colliding: self.colliding.clone(),
            volumes: self.volumes.clone(),
            histogram,
            unresolved_voxels: self.unresolved,
        }
    }
}

/// Summary statistics of a finished fusion run.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FusionReport<L: Ord> {
    /// Markers processed (ignored markers excluded).
    pub total_markers: usize,
    pub no_match: BTreeSet<L>,
    pub at_border: BTreeSet<L>,
    pub colliding: BTreeSet<L>,
    pub volumes: BTreeMap<L, MarkerVolume>,
    pub histogram: CollisionHistogram,
    pub unresolved_voxels: usize,
}

impl<L: Ord> FusionReport<L> {
    /// Markers that neither failed to match nor were removed.
    pub fn secured(&self) -> usize {
        self.total_markers
            .saturating_sub(self.no_match.len())
            .saturating_sub(self.at_border.len())
            .saturating_sub(self.colliding.len())
    }

    fn percent(&self, count: usize) -> f64 {
        if self.total_markers == 0 {
            0.0
        } else {
            100.0 * count as f64 / self.total_markers as f64
        }
    }

    /// Writes the summary lines to the log at info level.
    pub fn log_summary(&self) {
        log::info!("HIST: {}", self.histogram);
        log::info!(
            "not found markers    = {} = {:.1} %",
            self.no_match.len(),
            self.percent(self.no_match.len())
        );
        log::info!(
            "markers at border    = {} = {:.1} %",
            self.at_border.len(),
            self.percent(self.at_border.len())
        );
        log::info!(
            "markers in collision = {} = {:.1} %",
            self.colliding.len(),
            self.percent(self.colliding.len())
        );
        log::info!(
            "secured markers      = {} = {:.1} %",
            self.secured(),
            self.percent(self.secured())
        );
        if self.unresolved_voxels > 0 {
            log::info!("unresolved voxels    = {}", self.unresolved_voxels);
        }
    }
}

/// Fused image together with the run's summary.
#[derive(Debug, Clone, PartialEq)]
pub struct FusionOutcome<L: Ord> {
    pub output: LabelVolume<L>,
    pub report: FusionReport<L>,
}
