use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("corrupt metadata record: {0}")]
    CorruptMetadata(String),

    #[error("corrupt content record: {0}")]
    CorruptContent(String),

    #[error("invalid digest: {0}")]
    InvalidDigest(String),
}
