mod fs_ops;
mod source;
mod store;

pub use source::{FetchedReference, HttpReferenceSource, ReferenceSource};
pub use store::{
    parse_reference, BuildReferenceStore, BundledReference, LoadedReference, ReferenceOrigin,
    RefreshOutcome, RefreshStatus, STALE_AFTER_DAYS,
};
