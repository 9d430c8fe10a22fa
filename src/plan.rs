//! Turn parsed path arguments into exactly one upload or download

use std::path::PathBuf;

use crate::path::{LocalPath, LocalSource, ParsedPath, RemotePath};
use crate::session::Intent;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("need a source and a destination path")]
    InsufficientPaths,
    #[error("uploading multiple files is not supported")]
    MultipleUploadsUnsupported,
    #[error("only one remote path may be given")]
    MultipleRemotePaths,
    #[error("one of the paths must be remote (host[:port]:/path)")]
    NoRemotePath,
    #[error("local file {0} does not exist")]
    LocalFileMissing(String),
    #[error("expected exactly two paths, got {0}")]
    ExcessPaths(usize),
    #[error("{0} is not a regular file")]
    SourceNotAFile(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

/// Decide what the argument list asks for without consuming it.
pub fn classify(paths: &[ParsedPath]) -> Result<Direction, PlanError> {
    if paths.len() < 2 {
        return Err(PlanError::InsufficientPaths);
    }
    if paths.len() > 2 && !paths[0].is_remote() {
        return Err(PlanError::MultipleUploadsUnsupported);
    }
    let remotes = paths.iter().filter(|p| p.is_remote()).count();
    if remotes > 1 {
        return Err(PlanError::MultipleRemotePaths);
    }
    if remotes == 0 {
        return Err(PlanError::NoRemotePath);
    }
    if paths.len() == 2 && paths[1].is_remote() && !paths[0].exists() {
        return Err(PlanError::LocalFileMissing(paths[0].raw().to_string()));
    }
    if paths.len() > 2 {
        return Err(PlanError::ExcessPaths(paths.len()));
    }

    if paths[1].is_remote() {
        if let ParsedPath::Local(local) = &paths[0] {
            if local.source.is_none() {
                return Err(PlanError::SourceNotAFile(local.raw.clone()));
            }
        }
        Ok(Direction::Upload)
    } else {
        Ok(Direction::Download)
    }
}

#[derive(Debug)]
pub enum TransferPlan {
    Upload {
        source: LocalPath,
        file: LocalSource,
        destination: RemotePath,
    },
    Download {
        source: RemotePath,
        destination: LocalPath,
    },
}

impl TransferPlan {
    pub fn from_paths(paths: Vec<ParsedPath>) -> Result<Self, PlanError> {
        let direction = classify(&paths)?;
        let mut paths = paths.into_iter();
        let (Some(first), Some(second)) = (paths.next(), paths.next()) else {
            return Err(PlanError::InsufficientPaths);
        };

        match (direction, first, second) {
            (Direction::Upload, ParsedPath::Local(mut source), ParsedPath::Remote(destination)) => {
                let file = source
                    .source
                    .take()
                    .ok_or_else(|| PlanError::SourceNotAFile(source.raw.clone()))?;
                Ok(TransferPlan::Upload {
                    source,
                    file,
                    destination,
                })
            }
            (Direction::Download, ParsedPath::Remote(source), ParsedPath::Local(destination)) => {
                Ok(TransferPlan::Download { source, destination })
            }
            _ => Err(PlanError::NoRemotePath),
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            TransferPlan::Upload { .. } => Direction::Upload,
            TransferPlan::Download { .. } => Direction::Download,
        }
    }

    pub fn remote(&self) -> &RemotePath {
        match self {
            TransferPlan::Upload { destination, .. } => destination,
            TransferPlan::Download { source, .. } => source,
        }
    }

    /// Remote path the server will be asked for, after `dir/` shorthand.
    pub fn remote_path(&self) -> String {
        match self {
            TransferPlan::Upload {
                source, destination, ..
            } => match (&source.filename, destination.path.ends_with('/')) {
                (Some(name), true) => format!("{}{}", destination.path, name),
                _ => destination.path.clone(),
            },
            TransferPlan::Download { source, .. } => source.path.clone(),
        }
    }

    /// Local path the download will be written to, after directory shorthand.
    pub fn local_destination(&self) -> Option<PathBuf> {
        match self {
            TransferPlan::Upload { .. } => None,
            TransferPlan::Download { source, destination } => {
                let target = match (destination.is_dir, source.filename(), &destination.filename) {
                    (true, Some(name), _) => destination.path.join(name),
                    (false, _, Some(name)) => destination.directory.join(name),
                    _ => destination.path.clone(),
                };
                Some(target)
            }
        }
    }

    /// Hand the plan's resources over to a client session.
    pub fn into_intent(self) -> Intent {
        let remote_path = self.remote_path();
        let local_destination = self.local_destination();
        match self {
            TransferPlan::Upload { file, .. } => Intent::Upload {
                source: tokio::fs::File::from_std(file.file),
                size: file.size,
                destination: remote_path,
            },
            TransferPlan::Download { destination, .. } => Intent::Download {
                source: remote_path,
                destination: local_destination.unwrap_or(destination.path),
            },
        }
    }
}
