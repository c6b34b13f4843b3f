use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("value metadata must not be empty")]
    EmptyMetadata,

    #[error("invalid multihash: {0}")]
    InvalidMultihash(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{op}: {source}")]
    Storage {
        op: &'static str,
        #[source]
        source: Box<IndexerError>,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("store is closed")]
    Closed,
}

impl IndexerError {
    /// Wrap a storage failure with the operation that observed it.
    pub(crate) fn storage(op: &'static str) -> impl FnOnce(IndexerError) -> IndexerError {
        move |source| IndexerError::Storage {
            op,
            source: Box::new(source),
        }
    }
}
