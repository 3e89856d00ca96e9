//! Task file references.
//!
//! A task may attach files by URI. Local files are checked at load time;
//! remote files are fetched lazily with a bounded timeout. Content, its
//! base64 form and the MIME type are resolved once per file and memoized:
//! the first caller performs the work, concurrent callers wait on the same
//! cell, later callers read the cached value.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use url::Url;

/// Errors raised while resolving task file references.
#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("invalid task file URI '{0}'")]
    InvalidUri(String),

    #[error("task file does not exist: {0}")]
    NotFound(PathBuf),

    #[error("task file is not a regular file: {0}")]
    NotAFile(PathBuf),

    #[error("failed to read task file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to download task file {uri}")]
    Download {
        uri: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("download of task file {uri} failed with status {status}")]
    DownloadStatus { uri: String, status: u16 },
}

/// How long a remote fetch may take before it is abandoned.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Where a task file lives, derived from its URI.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FileLocation {
    Local(PathBuf),
    Remote(Url),
}

/// Resolved content of a task file.
#[derive(Debug, Clone)]
pub struct FileContent {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub base64: String,
}

/// A file attached to a task, identified by name and URI. Supported schemes
/// are plain paths, `file:`, `http:` and `https:`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskFile {
    pub name: String,
    pub uri: String,
    /// Explicit MIME type; wins over inference.
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(skip)]
    content: Arc<OnceCell<FileContent>>,
}

impl TaskFile {
    pub fn new(name: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uri: uri.into(),
            mime_type: None,
            content: Arc::new(OnceCell::new()),
        }
    }

    fn location(&self) -> Result<FileLocation, FileError> {
        if let Some((scheme, _)) = self.uri.split_once("://") {
            let url =
                Url::parse(&self.uri).map_err(|_| FileError::InvalidUri(self.uri.clone()))?;
            return match scheme {
                "http" | "https" => Ok(FileLocation::Remote(url)),
                "file" => url
                    .to_file_path()
                    .map(FileLocation::Local)
                    .map_err(|()| FileError::InvalidUri(self.uri.clone())),
                _ => Err(FileError::InvalidUri(self.uri.clone())),
            };
        }
        if self.uri.is_empty() {
            return Err(FileError::InvalidUri(self.uri.clone()));
        }
        Ok(FileLocation::Local(PathBuf::from(&self.uri)))
    }

    /// True when the URI points at a remote resource.
    pub fn is_remote(&self) -> bool {
        matches!(self.location(), Ok(FileLocation::Remote(_)))
    }

    /// Load-time check: the URI must be well-formed, and a local target must
    /// exist and be a regular file. Remote files are only checked for URI
    /// validity; their availability surfaces at execution time.
    pub fn validate_local(&self) -> Result<(), FileError> {
        match self.location()? {
            FileLocation::Local(path) => {
                let meta = std::fs::metadata(&path).map_err(|_| FileError::NotFound(path.clone()))?;
                if !meta.is_file() {
                    return Err(FileError::NotAFile(path));
                }
                Ok(())
            }
            FileLocation::Remote(_) => Ok(()),
        }
    }

    /// Resolved content; fetched on first use and memoized. A failed fetch
    /// is not cached, so a later call retries.
    pub async fn content(&self) -> Result<&FileContent, FileError> {
        self.content.get_or_try_init(|| self.fetch()).await
    }

    async fn fetch(&self) -> Result<FileContent, FileError> {
        let (bytes, header_mime) = match self.location()? {
            FileLocation::Local(path) => (read_local(&path)?, None),
            FileLocation::Remote(url) => fetch_remote(&url).await?,
        };
        let mime_type = self
            .mime_type
            .clone()
            .or(header_mime)
            .unwrap_or_else(|| infer_mime(&self.uri));
        let base64 = base64::engine::general_purpose::STANDARD.encode(&bytes);
        Ok(FileContent {
            bytes,
            mime_type,
            base64,
        })
    }
}

fn read_local(path: &Path) -> Result<Vec<u8>, FileError> {
    std::fs::read(path).map_err(|source| FileError::Read {
        path: path.to_path_buf(),
        source,
    })
}

async fn fetch_remote(url: &Url) -> Result<(Vec<u8>, Option<String>), FileError> {
    let client = reqwest::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
        .map_err(|source| FileError::Download {
            uri: url.to_string(),
            source,
        })?;
    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|source| FileError::Download {
            uri: url.to_string(),
            source,
        })?;
    if !response.status().is_success() {
        return Err(FileError::DownloadStatus {
            uri: url.to_string(),
            status: response.status().as_u16(),
        });
    }
    let header_mime = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());
    let bytes = response
        .bytes()
        .await
        .map_err(|source| FileError::Download {
            uri: url.to_string(),
            source,
        })?;
    Ok((bytes.to_vec(), header_mime))
}

fn infer_mime(uri: &str) -> String {
    mime_guess::from_path(uri)
        .first()
        .map(|m| m.essence_str().to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string())
}
