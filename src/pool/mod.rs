//! Pool Module
//!
//! Credential registry, selection and shared key model types.

pub mod key;
pub mod registry;
pub mod selector;

pub use key::{
    mask_key, AddOutcome, AggregationMode, CredentialView, KeyExport, KeyStatus, PersistedKeyState,
};
pub use registry::{AddMode, DisabledMeta, KeyRegistry};
pub use selector::{KeySelector, DEFAULT_FAILURE_TIMEOUT};
