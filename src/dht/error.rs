use thiserror::Error;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid node id length")]
    InvalidNodeId,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("item too large: {0} bytes")]
    ItemTooLarge(usize),

    #[error("timeout")]
    Timeout,

    #[error("too many outstanding requests")]
    Congestion,

    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("operation cancelled")]
    Cancelled,
}
