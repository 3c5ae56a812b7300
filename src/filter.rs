//! Tenant, container and object selection.

use crate::model::Tenant;
use std::collections::BTreeSet;
use std::io;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("unknown tenants: {0:?}")]
    UnknownTenants(Vec<String>),
    #[error("reading tenant list {path}: {source}")]
    ListFile {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Include or exclude by exact name. Include wins when both are given.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NameFilter {
    include: BTreeSet<String>,
    exclude: BTreeSet<String>,
}

impl NameFilter {
    pub fn new<I, E>(include: I, exclude: E) -> Self
    where
        I: IntoIterator<Item = String>,
        E: IntoIterator<Item = String>,
    {
        Self {
            include: include.into_iter().collect(),
            exclude: exclude.into_iter().collect(),
        }
    }

    pub fn allows(&self, name: &str) -> bool {
        if !self.include.is_empty() {
            return self.include.contains(name);
        }
        !self.exclude.contains(name)
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanFilter {
    pub tenants: NameFilter,
    pub containers: NameFilter,
    pub objects: NameFilter,
}

impl ScanFilter {
    /// Applies the tenant filter to a store listing.
    ///
    /// Explicitly included tenants must exist; the listing order is kept so
    /// that partitioning stays stable between runs.
    pub fn select_tenants(&self, all: Vec<Tenant>) -> Result<Vec<Tenant>, FilterError> {
        let unknown: Vec<String> = self
            .tenants
            .include
            .iter()
            .filter(|name| !all.iter().any(|t| &t.name == *name))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(FilterError::UnknownTenants(unknown));
        }

        Ok(all
            .into_iter()
            .filter(|t| self.tenants.allows(&t.name))
            .collect())
    }
}

/// Reads one tenant name per line, skipping blanks and `#` comments.
pub fn read_name_list(path: &Path) -> Result<Vec<String>, FilterError> {
    let text = std::fs::read_to_string(path).map_err(|source| FilterError::ListFile {
        path: path.display().to_string(),
        source,
    })?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}
