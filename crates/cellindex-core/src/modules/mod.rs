pub mod document;
pub mod generator;
pub mod instrument;
pub mod refine;
pub mod scoring;
pub mod search;
pub mod serialization;
pub mod spacegroup;
pub mod subgroups;

pub use document::{
    CellScore, DocumentControls, RefineReport, SubgroupSearchOptions, SubgroupStep,
    UnitCellsDocument,
};
pub use generator::generate_reflections;
pub use instrument::{InstrumentGeometry, InstrumentModel};
pub use refine::{Refinement, refine_cell};
pub use scoring::{MatchOutcome, match_and_score, rank_candidates};
pub use search::{
    LatticeReport, RunToCompletion, SearchDriver, SearchObserver, SearchOutcome, SearchProgress,
    SearchReport, SearchState,
};
pub use spacegroup::{BuiltinSpaceGroups, SpaceGroup, SpaceGroupService, SymOp};
pub use subgroups::{
    FilterMode, PseudoLatticeRecord, PseudoLatticeRequest, PseudoLatticeService,
    ServiceResponse, SubgroupRecord, SubgroupRequest, SubgroupService,
};
