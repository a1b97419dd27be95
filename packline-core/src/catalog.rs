//! Named SQL statements loaded from a directory of `.sql` files.
//!
//! `catalog.statement("insertProductOrder")` reads
//! `<dir>/insertProductOrder.sql` the first time it is asked for and
//! serves the cached text afterwards.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

use crate::operation::Statement;

const SQL_EXTENSION: &str = "sql";

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("invalid query id '{0}'")]
    InvalidId(String),

    #[error("query '{id}' not found at {path:?}")]
    NotFound { id: String, path: PathBuf },

    #[error("failed to read query '{id}' from {path:?}: {source}")]
    Read {
        id: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("query file {path:?} is empty")]
    Empty { path: PathBuf },

    #[error("failed to scan query directory {dir:?}: {source}")]
    Scan {
        dir: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

#[derive(Debug)]
pub struct QueryCatalog {
    dir: PathBuf,
    cache: RwLock<BTreeMap<String, Statement>>,
}

impl QueryCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Statement for `id`, reading it from disk on first use.
    pub fn statement(&self, id: &str) -> Result<Statement, CatalogError> {
        validate_id(id)?;

        if let Some(stmt) = self.read_cache().get(id) {
            return Ok(stmt.clone());
        }

        let path = self.path_for(id);
        let stmt = load_file(id, &path)?;
        debug!(id, path = %path.display(), "loaded query");

        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        Ok(cache.entry(id.to_string()).or_insert(stmt).clone())
    }

    /// Read every `*.sql` file in the directory into the cache.
    ///
    /// Returns the number of statements now cached.
    pub fn preload(&self) -> Result<usize, CatalogError> {
        let mut loaded = BTreeMap::new();
        for entry in WalkDir::new(&self.dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|source| CatalogError::Scan {
                dir: self.dir.clone(),
                source,
            })?;
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().and_then(|e| e.to_str()) != Some(SQL_EXTENSION)
            {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if validate_id(id).is_err() {
                continue;
            }
            loaded.insert(id.to_string(), load_file(id, path)?);
        }

        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        for (id, stmt) in loaded {
            cache.entry(id).or_insert(stmt);
        }
        debug!(dir = %self.dir.display(), count = cache.len(), "preloaded queries");
        Ok(cache.len())
    }

    /// Ids currently cached, sorted.
    pub fn ids(&self) -> Vec<String> {
        self.read_cache().keys().cloned().collect()
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{SQL_EXTENSION}"))
    }

    fn read_cache(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Statement>> {
        self.cache.read().unwrap_or_else(|e| e.into_inner())
    }
}

fn validate_id(id: &str) -> Result<(), CatalogError> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(CatalogError::InvalidId(id.to_string()))
    }
}

fn load_file(id: &str, path: &Path) -> Result<Statement, CatalogError> {
    let text = fs::read_to_string(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            CatalogError::NotFound {
                id: id.to_string(),
                path: path.to_path_buf(),
            }
        } else {
            CatalogError::Read {
                id: id.to_string(),
                path: path.to_path_buf(),
                source,
            }
        }
    })?;

    let sql = text.trim();
    if sql.is_empty() {
        return Err(CatalogError::Empty {
            path: path.to_path_buf(),
        });
    }
    Ok(Statement::named(id, sql))
}
