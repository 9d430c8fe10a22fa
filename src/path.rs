//! Command-line path arguments: local files or `host[:port]:path` targets

use std::fs::File;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("invalid remote path `{raw}`: {reason}")]
    RemotePathInvalid { raw: String, reason: &'static str },
    #[error("cannot open local file {path:?}: {source}")]
    LocalUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug)]
pub enum ParsedPath {
    Local(LocalPath),
    Remote(RemotePath),
}

#[derive(Debug)]
pub struct LocalPath {
    pub raw: String,
    pub path: PathBuf,
    pub filename: Option<String>,
    pub directory: PathBuf,
    pub exists: bool,
    pub is_dir: bool,
    /// Present only for an existing regular file.
    pub source: Option<LocalSource>,
}

/// Size and eagerly opened read handle of an existing local file.
#[derive(Debug)]
pub struct LocalSource {
    pub size: u64,
    pub file: File,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePath {
    pub raw: String,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
}

impl ParsedPath {
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let parts: Vec<&str> = raw.split(':').collect();
        match parts.as_slice() {
            [_] => LocalPath::probe(raw).map(ParsedPath::Local),
            [host, path] => RemotePath::new(raw, host, None, path).map(ParsedPath::Remote),
            [host, port, path] => {
                let port = port.parse::<u16>().map_err(|_| PathError::RemotePathInvalid {
                    raw: raw.to_string(),
                    reason: "port is not a number",
                })?;
                RemotePath::new(raw, host, Some(port), path).map(ParsedPath::Remote)
            }
            _ => Err(PathError::RemotePathInvalid {
                raw: raw.to_string(),
                reason: "too many `:` separators",
            }),
        }
    }

    pub fn raw(&self) -> &str {
        match self {
            ParsedPath::Local(local) => &local.raw,
            ParsedPath::Remote(remote) => &remote.raw,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, ParsedPath::Remote(_))
    }

    /// Whether the path names something on local disk. Remote paths never do.
    pub fn exists(&self) -> bool {
        match self {
            ParsedPath::Local(local) => local.exists,
            ParsedPath::Remote(_) => false,
        }
    }
}

impl LocalPath {
    fn probe(raw: &str) -> Result<Self, PathError> {
        let path = PathBuf::from(raw);
        let filename = path.file_name().map(|f| f.to_string_lossy().into_owned());
        let directory = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let metadata = std::fs::metadata(&path).ok();
        let exists = metadata.is_some();
        let is_dir = metadata.as_ref().is_some_and(|m| m.is_dir());

        let source = match metadata {
            Some(m) if m.is_file() => {
                let file = File::open(&path).map_err(|source| PathError::LocalUnreadable {
                    path: path.clone(),
                    source,
                })?;
                Some(LocalSource { size: m.len(), file })
            }
            _ => None,
        };

        Ok(Self {
            raw: raw.to_string(),
            path,
            filename,
            directory,
            exists,
            is_dir,
            source,
        })
    }
}

impl RemotePath {
    fn new(raw: &str, host: &str, port: Option<u16>, path: &str) -> Result<Self, PathError> {
        if host.is_empty() {
            return Err(PathError::RemotePathInvalid {
                raw: raw.to_string(),
                reason: "missing host",
            });
        }
        if path.is_empty() {
            return Err(PathError::RemotePathInvalid {
                raw: raw.to_string(),
                reason: "missing remote path",
            });
        }
        Ok(Self {
            raw: raw.to_string(),
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }

    pub fn port_or(&self, default_port: u16) -> u16 {
        self.port.unwrap_or(default_port)
    }

    /// Last component of the remote path, if it names a file.
    pub fn filename(&self) -> Option<&str> {
        self.path
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty() && *name != "." && *name != "..")
    }
}

/// Parse every argument, failing on the first invalid one.
pub fn parse_all<S: AsRef<str>>(raw: &[S]) -> Result<Vec<ParsedPath>, PathError> {
    raw.iter().map(|r| ParsedPath::parse(r.as_ref())).collect()
}
