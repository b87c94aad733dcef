//! Pure lookups over an explicit [`patchfleet_core::BuildTable`]: builds by
//! version, KB or patch level, and compliance targets.

mod compliance;
mod resolve;
mod types;

pub use compliance::{compute_compliance_target, test_compliance};
pub use resolve::{latest_build, resolve_by_family, resolve_by_kb, resolve_by_version};
pub use types::{ComplianceReport, ComplianceTarget, MatchType, Policy, ResolvedBuild};
