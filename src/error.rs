use thiserror::Error;

use crate::instance::InstanceId;
use crate::pae::ScriptError;

/// Failure while decoding one of the binary asset formats.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("{format}: invalid magic {found:?}")]
    BadMagic { format: &'static str, found: Vec<u8> },
    #[error("{format}: unsupported version {version}")]
    UnsupportedVersion { format: &'static str, version: u32 },
    #[error("{format}: unexpected end of data at offset {offset} ({wanted} more bytes needed)")]
    Truncated {
        format: &'static str,
        offset: usize,
        wanted: usize,
    },
    #[error("{format}: {message}")]
    Invalid {
        format: &'static str,
        message: String,
    },
}

/// Failure while resolving and building an asset through the cache.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("asset not found: {0}")]
    NotFound(String),
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: ParseError,
    },
    #[error("failed to parse particle script {path}: {source}")]
    Script {
        path: String,
        #[source]
        source: ScriptError,
    },
    #[error("failed to decode image {path}: {message}")]
    Image { path: String, message: String },
    #[error("material {material} of {path} is unusable: {reason}")]
    Material {
        path: String,
        material: String,
        reason: String,
    },
    #[error("motion {motion} has {found} bones but model {model} has {expected}")]
    BoneCountMismatch {
        model: String,
        motion: String,
        expected: usize,
        found: usize,
    },
    #[error("inconsistent skeleton in {path}: {message}")]
    Structural { path: String, message: String },
}

impl LoadError {
    /// Structural errors mean the asset pipeline produced data that would
    /// corrupt bone-indexed state; they are never silently recovered.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            LoadError::BoneCountMismatch { .. } | LoadError::Structural { .. }
        )
    }
}

/// Errors surfaced by the engine facade and the instance table.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("instance table is full (capacity {0})")]
    CapacityExceeded(usize),
    #[error("no live instance with id {0}")]
    UnknownInstance(InstanceId),
    #[error("instance {id} is a {kind} and cannot {action}")]
    WrongKind {
        id: InstanceId,
        kind: &'static str,
        action: &'static str,
    },
    #[error("instance {0} has no model loaded")]
    NoModel(InstanceId),
    #[error(transparent)]
    Load(#[from] LoadError),
}
