use serde::{Deserialize, Serialize};

use crate::client::ProjsyncError;

/// One file as it travels over the wire. Binary content is base64,
/// text content is sent as-is.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub content: String,
    #[serde(rename = "isBinary", default)]
    pub is_binary: bool,
}

impl FileEntry {
    pub fn from_bytes(path: impl Into<String>, content: &[u8], is_binary: bool) -> Self {
        let content = if is_binary {
            base64::encode(content)
        } else {
            String::from_utf8_lossy(content).into_owned()
        };
        Self {
            path: path.into(),
            content,
            is_binary,
        }
    }

    pub fn text(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            is_binary: false,
        }
    }

    pub fn decode(&self) -> Result<Vec<u8>, ProjsyncError> {
        if self.is_binary {
            Ok(base64::decode(&self.content)?)
        } else {
            Ok(self.content.as_bytes().to_vec())
        }
    }
}
