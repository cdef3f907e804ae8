//! Startup errors.

use fastrpc_transport::ListenAddress;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: ListenAddress,
        #[source]
        source: std::io::Error,
    },
}
