pub mod document;
pub mod key_record;

pub use document::Document;
pub use key_record::{KeyMaterial, KeyMetadata, KeyRecord, KeyRecordError};
