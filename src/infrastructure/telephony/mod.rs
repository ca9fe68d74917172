//! PBX control plane adapters
pub mod ari_client;

pub use ari_client::{AriClient, AriError};
