//! Specification document model and the in-memory store holding the active set.
pub mod id_lists;
pub mod models;
pub mod store;

pub use id_lists::{IdList, IdListMetadata};
pub use models::{CmabSpec, Condition, KeyEntities, Rule, SessionReplayInfo, Spec, SpecsResponse};
pub use store::{SpecStore, Specs, SpecsSource, SpecsUpdate, StoreSnapshot};
