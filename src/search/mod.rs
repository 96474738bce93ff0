//! GAL search engine: per-request parameters, directory configuration,
//! result callbacks, sync admission and the orchestrating control.

pub mod callback;
pub mod config;
pub mod control;
pub mod group;
pub mod params;
pub mod registry;

pub use callback::{
    CallbackOptions, FilteredGalSearchResultCallback, GalEntry, GalResponse,
    GalSearchResultCallback, ResultCallback,
};
pub use control::{can_expand_gal_group, GalAccountResolution, GalSearchControl, GalServices};
pub use params::GalSearchParams;
pub use registry::SyncClientRegistry;
