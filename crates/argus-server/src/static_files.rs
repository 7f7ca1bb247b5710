//! Static file serving for the web UI and recorded media.
//!
//! - Index file for directory requests (`index.html`)
//! - Single-page-app fallback for extension-less misses
//! - `ETag`, `Last-Modified` and conditional `304` answers
//! - Single byte ranges, so browsers can seek in recordings
//! - HLS types: playlists are never cached, segments are `video/mp2t`
//!
//! # Security
//!
//! Paths containing `..` or hidden components are refused, and the resolved
//! file must lie inside the root after symlinks are followed.
//!
//! # Example
//!
//! ```rust
//! use argus_server::static_files::StaticFiles;
//!
//! let files = StaticFiles::new("./www")
//!     .index("index.html")
//!     .spa_fallback("index.html");
//! assert_eq!(files.index_file(), Some("index.html"));
//! ```

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use bytes::Bytes;
use http::{header, HeaderMap, Method, Response, StatusCode};
use http_body_util::Full;
use thiserror::Error;

use crate::HttpResponse;

/// HLS playlists change every segment and must not be cached.
const NO_CACHE: &str = "no-cache";

/// Why a static file could not be served.
#[derive(Debug, Error)]
pub enum StaticFileError {
    /// Nothing at this path, and no fallback applies.
    #[error("no file for {0}")]
    NotFound(String),

    /// Traversal, hidden file, or a symlink leaving the root.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Anything but `GET` or `HEAD`.
    #[error("static files are read-only")]
    MethodNotAllowed,

    /// Reading the file failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The `Range` header cannot be satisfied.
    #[error("bad range {0}")]
    InvalidRange(String),
}

impl StaticFileError {
    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InvalidRange(_) => StatusCode::RANGE_NOT_SATISFIABLE,
        }
    }
}

/// Static file server rooted at one directory.
#[derive(Debug, Clone)]
pub struct StaticFiles {
    root: PathBuf,
    index_file: Option<String>,
    spa_fallback: Option<String>,
    cache_control: Option<String>,
    serve_hidden: bool,
}

impl StaticFiles {
    /// Creates a server for the given root directory.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            index_file: Some("index.html".to_string()),
            spa_fallback: None,
            cache_control: None,
            serve_hidden: false,
        }
    }

    /// Sets the file served for directory requests.
    pub fn index<S: Into<String>>(mut self, index: S) -> Self {
        self.index_file = Some(index.into());
        self
    }

    /// Sets the file served when an extension-less path does not exist.
    pub fn spa_fallback<S: Into<String>>(mut self, file: S) -> Self {
        self.spa_fallback = Some(file.into());
        self
    }

    /// Sets the `Cache-Control` value for everything except HLS playlists.
    pub fn cache_control<S: Into<String>>(mut self, value: S) -> Self {
        self.cache_control = Some(value.into());
        self
    }

    /// Allows files and directories starting with `.`.
    pub fn serve_hidden(mut self, enabled: bool) -> Self {
        self.serve_hidden = enabled;
        self
    }

    /// Returns the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the index file name.
    pub fn index_file(&self) -> Option<&str> {
        self.index_file.as_deref()
    }

    /// Serves `request_path`.
    pub fn handle(
        &self,
        request_path: &str,
        headers: &HeaderMap,
        method: &Method,
    ) -> Result<HttpResponse, StaticFileError> {
        if method != Method::GET && method != Method::HEAD {
            return Err(StaticFileError::MethodNotAllowed);
        }

        match self.resolve_path(request_path) {
            Ok(path) if path.is_dir() => {
                let index = self
                    .index_file
                    .as_ref()
                    .map(|index| path.join(index))
                    .filter(|index| index.is_file())
                    .ok_or_else(|| StaticFileError::NotFound(request_path.to_string()))?;
                self.serve_file(&index, headers, method)
            }
            Ok(path) => self.serve_file(&path, headers, method),
            Err(StaticFileError::NotFound(_)) if self.wants_spa_fallback(request_path) => {
                let fallback = self
                    .spa_fallback
                    .as_deref()
                    .map(|file| self.root.join(file))
                    .filter(|file| file.is_file())
                    .ok_or_else(|| StaticFileError::NotFound(request_path.to_string()))?;
                self.serve_file(&fallback, headers, method)
            }
            Err(e) => Err(e),
        }
    }

    fn wants_spa_fallback(&self, request_path: &str) -> bool {
        self.spa_fallback.is_some()
            && Path::new(request_path.trim_end_matches('/'))
                .extension()
                .is_none()
    }

    fn resolve_path(&self, request_path: &str) -> Result<PathBuf, StaticFileError> {
        let path = request_path.trim_start_matches('/');

        for component in Path::new(path).components() {
            match component {
                Component::ParentDir => {
                    return Err(StaticFileError::Forbidden(
                        "parent directory component".to_string(),
                    ));
                }
                Component::Normal(name) => {
                    let hidden = name.to_str().is_some_and(|n| n.starts_with('.'));
                    if hidden && !self.serve_hidden {
                        return Err(StaticFileError::Forbidden(
                            "hidden path".to_string(),
                        ));
                    }
                }
                _ => {}
            }
        }

        let canonical = self
            .root
            .join(path)
            .canonicalize()
            .map_err(|_| StaticFileError::NotFound(request_path.to_string()))?;
        let canonical_root = self.root.canonicalize()?;
        if !canonical.starts_with(&canonical_root) {
            return Err(StaticFileError::Forbidden(
                "outside the web root".to_string(),
            ));
        }
        Ok(canonical)
    }

    fn serve_file(
        &self,
        path: &Path,
        headers: &HeaderMap,
        method: &Method,
    ) -> Result<HttpResponse, StaticFileError> {
        let metadata = std::fs::metadata(path)?;
        let file_size = metadata.len();
        let modified = metadata.modified().ok();
        let etag = generate_etag(&metadata, path);
        let mime_type = detect_mime_type(path);
        let cache_control = if mime_type == "application/vnd.apple.mpegurl" {
            Some(NO_CACHE)
        } else {
            self.cache_control.as_deref()
        };

        if not_modified(headers, etag.as_deref(), modified) {
            let mut builder = Response::builder().status(StatusCode::NOT_MODIFIED);
            if let Some(etag) = &etag {
                builder = builder.header(header::ETAG, etag.as_str());
            }
            if let Some(cache_control) = cache_control {
                builder = builder.header(header::CACHE_CONTROL, cache_control);
            }
            return builder
                .body(Full::new(Bytes::new()))
                .map_err(|e| StaticFileError::Io(std::io::Error::other(e.to_string())));
        }

        let range = headers
            .get(header::RANGE)
            .map(|v| {
                let v = v
                    .to_str()
                    .map_err(|_| StaticFileError::InvalidRange("non-ASCII Range header".into()))?;
                ByteRange::parse(v, file_size)
            })
            .transpose()?;

        let (status, body, content_range) = if method == Method::HEAD {
            (StatusCode::OK, Bytes::new(), None)
        } else if let Some(range) = range {
            (
                StatusCode::PARTIAL_CONTENT,
                range.read(path)?,
                Some(format!("bytes {}-{}/{file_size}", range.first, range.last)),
            )
        } else {
            (StatusCode::OK, Bytes::from(std::fs::read(path)?), None)
        };

        let content_length = if method == Method::HEAD {
            file_size
        } else {
            body.len() as u64
        };
        let mut builder = Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, mime_type)
            .header(header::ACCEPT_RANGES, "bytes")
            .header(header::CONTENT_LENGTH, content_length);
        if let Some(cache_control) = cache_control {
            builder = builder.header(header::CACHE_CONTROL, cache_control);
        }
        if let Some(etag) = &etag {
            builder = builder.header(header::ETAG, etag.as_str());
        }
        if let Some(modified) = modified {
            builder = builder.header(header::LAST_MODIFIED, httpdate::fmt_http_date(modified));
        }
        if let Some(content_range) = content_range {
            builder = builder.header(header::CONTENT_RANGE, content_range);
        }

        builder
            .body(Full::new(body))
            .map_err(|e| StaticFileError::Io(std::io::Error::other(e.to_string())))
    }
}

fn not_modified(headers: &HeaderMap, etag: Option<&str>, modified: Option<SystemTime>) -> bool {
    if let (Some(etag), Some(value)) = (etag, headers.get(header::IF_NONE_MATCH)) {
        return value
            .to_str()
            .is_ok_and(|v| v == "*" || v.split(',').any(|tag| tag.trim() == etag));
    }
    let Some(since) = headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| httpdate::parse_http_date(v).ok())
    else {
        return false;
    };
    // HTTP dates have whole-second resolution.
    modified.is_some_and(|m| unix_secs(m) <= unix_secs(since))
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Weak validator from mtime, size and a short path hash.
fn generate_etag(metadata: &std::fs::Metadata, path: &Path) -> Option<String> {
    let mtime = unix_secs(metadata.modified().ok()?);
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    let tag = hasher.finish() & 0xffff;
    Some(format!("\"{mtime:x}-{:x}-{tag:x}\"", metadata.len()))
}

/// An inclusive byte range within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ByteRange {
    first: u64,
    last: u64,
}

impl ByteRange {
    /// Parses a single `bytes=` range against a file of `size` bytes.
    ///
    /// Multi-range requests are not supported.
    fn parse(value: &str, size: u64) -> Result<Self, StaticFileError> {
        let bad = |what: &str| StaticFileError::InvalidRange(format!("{what}: {value:?}"));

        let (from, to) = value
            .strip_prefix("bytes=")
            .and_then(|r| r.split_once('-'))
            .ok_or_else(|| bad("expected bytes=FIRST-LAST"))?;
        let number = |s: &str| s.trim().parse::<u64>().map_err(|_| bad("not a number"));
        if size == 0 {
            return Err(bad("empty file"));
        }
        let end = size - 1;

        let range = match (from.trim().is_empty(), to.trim().is_empty()) {
            // bytes=-N: the last N bytes
            (true, false) => Self {
                first: size.saturating_sub(number(to)?),
                last: end,
            },
            (false, true) => Self {
                first: number(from)?,
                last: end,
            },
            (false, false) => Self {
                first: number(from)?,
                last: number(to)?.min(end),
            },
            (true, true) => return Err(bad("empty range")),
        };
        if range.first > range.last || range.first > end {
            return Err(bad("not satisfiable"));
        }
        Ok(range)
    }

    fn len(self) -> u64 {
        self.last - self.first + 1
    }

    fn read(self, path: &Path) -> Result<Bytes, StaticFileError> {
        let len = usize::try_from(self.len())
            .map_err(|_| StaticFileError::InvalidRange("range exceeds address space".into()))?;
        let mut file = std::fs::File::open(path)?;
        file.seek(SeekFrom::Start(self.first))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }
}

/// Returns the content type for a file by extension.
pub fn detect_mime_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match extension.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "json" | "map" => "application/json",
        "txt" | "log" => "text/plain; charset=utf-8",
        "xml" => "application/xml",

        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "ico" => "image/x-icon",

        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",

        "m3u8" => "application/vnd.apple.mpegurl",
        "ts" => "video/mp2t",
        "m4s" => "video/iso.segment",
        "mp4" => "video/mp4",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",

        "wasm" => "application/wasm",
        "webmanifest" => "application/manifest+json",
        _ => "application/octet-stream",
    }
}
