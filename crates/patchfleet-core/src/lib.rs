mod arch;
mod build;
mod error;
mod model;
mod version;

pub use arch::Architecture;
pub use build::{parse_kb, walk_family, BuildRecord, BuildTable, ReferenceDocument, WalkStep};
pub use error::{ErrorKind, PatchError};
pub use model::{
    Component, ComputerPlan, ExecutionResult, FleetReport, InstallerPath, Outcome, PlannedHost,
    UpdateAction,
};
pub use version::{
    cumulative_update_rank, normalize_label, service_pack_rank, BuildVersion, FamilyKey,
};
