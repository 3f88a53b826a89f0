#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Shared data model for the provd provisioning daemon

pub mod request;
pub mod stage;

pub use request::{ConfigDocument, ImageSource, ProvisioningRequest, RawProvisioningRequest};
pub use stage::StageKind;
