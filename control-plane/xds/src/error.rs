use crate::callbacks::StreamId;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown generator profile {0:?}")]
    UnknownProfile(String),

    #[error("unknown stream {0}")]
    UnknownStream(StreamId),
}
