pub mod digest;
pub mod error;
pub mod key;
pub mod record;

pub use digest::BodyDigest;
pub use error::{Error, Result};
pub use key::{ContentKey, MetadataKey};
pub use record::{ContentRecord, MetadataRecord, CONTENT_VERSION, METADATA_VERSION};
