use thiserror::Error;

/// Fatal errors that abort broker startup, reported at the binary's boundary.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to bind listening socket on port {port}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}
