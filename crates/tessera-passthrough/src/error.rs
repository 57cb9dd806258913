/// Errors from the passthrough server handle.
#[derive(Debug, thiserror::Error)]
pub enum PassthroughError {
    /// The server actor has stopped.
    #[error("passthrough server unavailable")]
    Unavailable,

    /// The server is not accepting connections right now.
    #[error("passthrough server refused the connection")]
    Refused,
}
