pub mod errors;
pub mod lattice;
pub mod records;

pub use errors::{IndexError, IndexErrorCategory, IndexResult};
pub use lattice::{
    BravaisLattice, CellParameterKind, CellParameters, Centering, LaueClass, ReciprocalMetric,
    TrialCell, q_coefficients, q_value, reciprocal_tensor,
};
pub use records::{
    AtomSite, CandidateList, IndexedCell, ModulationSpec, ObservedPeak, ParentPhase,
    ReflectionHkl, SortKey, SubgroupList, SubgroupPhase,
};
