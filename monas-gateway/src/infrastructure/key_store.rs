//! In-memory key store built once at startup.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::domain::{KeyRecord, KeyRecordError};

/// Longest accepted serialized record (one line of a key collection).
pub const MAX_RECORD_LEN: usize = 250 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    #[error("failed to read keys: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: {source}")]
    InvalidRecord {
        line: usize,
        #[source]
        source: KeyRecordError,
    },
    #[error("line {line}: record exceeds {max} bytes")]
    RecordTooLong { line: usize, max: usize },
}

/// Read-only mapping from key ID to key record.
///
/// There is no way to mutate a store after it has been built, so it can be
/// shared behind an `Arc` by every connection without locking.
#[derive(Debug, Clone, Default)]
pub struct KeyStore {
    keys: HashMap<String, KeyRecord>,
}

impl KeyStore {
    /// Build a store from already parsed records. A later record replaces an
    /// earlier one with the same ID.
    pub fn from_records(records: impl IntoIterator<Item = KeyRecord>) -> Self {
        let keys = records
            .into_iter()
            .map(|record| (record.id().to_string(), record))
            .collect();
        Self { keys }
    }

    /// Load a key collection: one JSON key record per line.
    ///
    /// Blank lines are skipped. Any unparsable record fails the whole load.
    pub fn load<R: BufRead>(mut reader: R) -> Result<Self, KeyStoreError> {
        let mut keys = HashMap::new();
        let mut buf = Vec::new();
        let mut line = 0;

        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            line += 1;

            let record = trim_line_ending(&buf);
            if record.len() > MAX_RECORD_LEN {
                return Err(KeyStoreError::RecordTooLong {
                    line,
                    max: MAX_RECORD_LEN,
                });
            }
            if record.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let record = KeyRecord::from_json(record)
                .map_err(|source| KeyStoreError::InvalidRecord { line, source })?;
            keys.insert(record.id().to_string(), record);
        }

        Ok(Self { keys })
    }

    /// Load a key collection file.
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self, KeyStoreError> {
        let file = File::open(path)?;
        Self::load(BufReader::new(file))
    }

    /// Load a standalone key file holding exactly one record.
    pub fn load_single_file<P: AsRef<Path>>(path: P) -> Result<KeyRecord, KeyStoreError> {
        let bytes = std::fs::read(path)?;
        KeyRecord::from_json(&bytes).map_err(|source| KeyStoreError::InvalidRecord { line: 1, source })
    }

    pub fn lookup(&self, key_id: &str) -> Option<&KeyRecord> {
        self.keys.get(key_id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use tempfile::NamedTempFile;

    const TWO_KEYS: &str = concat!(
        r#"{"kty":"oct","kid":"a","k":"AA","mime":"text/plain","ipfs":{"cid":"bafkqaaa"}}"#,
        "\n",
        "\n",
        r#"{"kty":"oct","kid":"b","k":"AQ"}"#,
        "\r\n",
    );

    #[test]
    fn test_load_json_lines() {
        let store = KeyStore::load(Cursor::new(TWO_KEYS)).unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(
            store.lookup("a").unwrap().metadata().mime(),
            Some("text/plain")
        );
        assert!(store.lookup("b").is_some());
        assert!(store.lookup("c").is_none());
    }

    #[test]
    fn test_load_empty_source() {
        let store = KeyStore::load(Cursor::new("")).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_one_bad_record_fails_the_load() {
        let source = format!("{TWO_KEYS}{{\"kid\":\"no-kty\"}}\n");
        let err = KeyStore::load(Cursor::new(source)).unwrap_err();

        assert!(matches!(
            err,
            KeyStoreError::InvalidRecord {
                line: 4,
                source: KeyRecordError::MissingKeyType
            }
        ));
    }

    #[test]
    fn test_overlong_record_is_rejected() {
        let source = format!(
            r#"{{"kty":"oct","kid":"big","pad":"{}"}}"#,
            "x".repeat(MAX_RECORD_LEN)
        );
        let err = KeyStore::load(Cursor::new(source)).unwrap_err();

        assert!(matches!(err, KeyStoreError::RecordTooLong { line: 1, .. }));
    }

    #[test]
    fn test_duplicate_kid_last_wins() {
        let source = concat!(
            r#"{"kty":"oct","kid":"dup","k":"AA","mime":"text/plain"}"#,
            "\n",
            r#"{"kty":"oct","kid":"dup","k":"AA","mime":"text/gemini"}"#,
        );
        let store = KeyStore::load(Cursor::new(source)).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(
            store.lookup("dup").unwrap().metadata().mime(),
            Some("text/gemini")
        );
    }

    #[test]
    fn test_load_files() {
        let mut collection = NamedTempFile::new().unwrap();
        collection.write_all(TWO_KEYS.as_bytes()).unwrap();
        let store = KeyStore::load_file(collection.path()).unwrap();
        assert_eq!(store.len(), 2);

        let mut single = NamedTempFile::new().unwrap();
        single
            .write_all(b"{\n  \"kty\": \"oct\",\n  \"kid\": \"solo\",\n  \"k\": \"AA\"\n}\n")
            .unwrap();
        let record = KeyStore::load_single_file(single.path()).unwrap();
        assert_eq!(record.id(), "solo");
    }

    #[test]
    fn test_missing_file_is_an_io_error() {
        let err = KeyStore::load_file("/nonexistent/keys.jsonarray").unwrap_err();
        assert!(matches!(err, KeyStoreError::Io(_)));
    }
}
