//! Device transport interface.
//!
//! The transport owns the wire protocol: authenticating, querying and setting
//! the device state, and retrieving a fresh credential over the side channel.
//! The engine drives it exclusively through this trait, one call at a time.

use async_trait::async_trait;

use crate::credential::Credential;
use crate::error::TransportError;

/// Interface to the device, implemented by the host.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Authenticate against the device with the given credential.
    async fn login(&self, credential: &Credential) -> Result<(), TransportError>;

    /// Read the device's current on/off state.
    async fn query_state(&self) -> Result<bool, TransportError>;

    /// Set the device's on/off state.
    async fn set_state(&self, on: bool) -> Result<(), TransportError>;

    /// Retrieve a fresh credential over the side channel.
    ///
    /// `Ok(None)` means the channel answered but had no token to give out.
    async fn fetch_credential_out_of_band(&self)
        -> Result<Option<Credential>, TransportError>;

    /// Release the underlying connection.
    async fn close(&self);
}
