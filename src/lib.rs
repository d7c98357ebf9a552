mod error;
mod labelops_fusion;
mod utils;

#[cfg(test)]
mod test_utils;

pub use error::FusionError;
pub use labelops_fusion::bounding_box::{BoundingBoxes, BoxIndex, BoxIndexSet};
pub use labelops_fusion::config::{FusionConfig, SimpleParams};
pub use labelops_fusion::extract::{
    add_given_label, find_all_matching_labels, isolate_given_label, LabelExtractor,
    MajorityOverlapExtractor,
};
pub use labelops_fusion::fuse::{
    best_weight_index, is_candidate_empty, CombinationPicker, CombinationScore, FailSafe,
    FlatThreshold, FlatVotingFuser, FuseContext, LabelFuser, LabelPicker, LabelledReference,
    MatchedLabel, ReferenceMask, ReferenceSource, SimpleFuser, SimpleTrace, WeightedVotingFuser,
    FUSION_LABEL, MAJORITY_EPSILON,
};
pub use labelops_fusion::insert::{
    CollisionsAwareInsertor, CollisionsManagingInsertor, InsertionStatus, LabelInsertor,
    OverwriteInsertor,
};
pub use labelops_fusion::memory::{BorrowerId, MemoryPools, PoolLease, ReusableMemory, SlotBuffers};
pub use labelops_fusion::pipeline::{FusionPipeline, FusionPipelineBuilder, BIC_COLLISION_THRESHOLD};
pub use labelops_fusion::postprocess::{
    ComponentScratch, KeepLargestComponent, LabelPostprocessor, VoidPostprocessor,
};
pub use labelops_fusion::resolve::{
    classify_colliding_markers, insert_marker_footprints, resolve_collisions, EROSION_SAFETY_CAP,
};
pub use labelops_fusion::run::{
    CollisionHistogram, CollisionRegistry, FusionOutcome, FusionReport, FusionRun, MarkerVolume,
    HISTOGRAM_BINS,
};
pub use labelops_fusion::volume::{
    coord_of, linear_index, shape_of, touches_border, Coord, Interval, LabelImageConvert,
    LabelValue, LabelVolume,
};
