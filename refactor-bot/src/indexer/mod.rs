//! Repository indexing: per-file symbol extraction (§4.4) and the import
//! dependency graph (§4.5), both keyed to the scope excludes in [`Config`].
//!
//! [`Config`]: crate::config::Config

mod deps;
mod symbols;

pub use deps::{DependencyAnalyzer, DependencyGraph, DependencyNode, Import};
pub use symbols::{FileInfo, Symbol, SymbolExtractor, SymbolRegistry, SymbolType};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write index at {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize index: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}
