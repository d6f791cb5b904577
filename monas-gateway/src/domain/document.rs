/// A decrypted document ready to be served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Content type declared by the key record's metadata.
    pub mime: String,
    /// Decrypted payload.
    pub body: Vec<u8>,
}

impl Document {
    pub fn new(mime: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            mime: mime.into(),
            body,
        }
    }
}
