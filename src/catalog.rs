//! Operation identity and the generated-catalog lookup table.
//!
//! Generated stubs hand both engines an [`OperationCatalog`] built from the
//! full set of operation definitions. The catalog answers one question in
//! O(1) -- "what kind of operation is `(rpc, op)`?" -- which lets both sides
//! reject typos before touching the network.

use crate::error::{category, Error, Result};
use std::collections::HashMap;
use std::fmt;
use url::Url;

/// Kind of a callable operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Unary request/response.
    Proc,
    /// One request, many server-pushed events.
    Stream,
}

/// Immutable identity of one operation: `(rpc, name, kind)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationId {
    pub rpc: String,
    pub name: String,
    pub kind: OperationKind,
}

impl OperationId {
    pub fn proc(rpc: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            rpc: rpc.into(),
            name: name.into(),
            kind: OperationKind::Proc,
        }
    }

    pub fn stream(rpc: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            rpc: rpc.into(),
            name: name.into(),
            kind: OperationKind::Stream,
        }
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.rpc, self.name)
    }
}

/// Lookup table over all generated operation definitions.
#[derive(Debug, Clone, Default)]
pub struct OperationCatalog {
    kinds: HashMap<(String, String), OperationKind>,
    defs: Vec<OperationId>,
}

impl OperationCatalog {
    /// Build the catalog once from the generated definitions.
    pub fn new(defs: impl IntoIterator<Item = OperationId>) -> Self {
        let defs: Vec<OperationId> = defs.into_iter().collect();
        let kinds = defs
            .iter()
            .map(|d| ((d.rpc.clone(), d.name.clone()), d.kind))
            .collect();
        Self { kinds, defs }
    }

    /// Kind of `(rpc, op)`, or `None` when the operation is unknown.
    pub fn kind_of(&self, rpc: &str, op: &str) -> Option<OperationKind> {
        self.kinds.get(&(rpc.to_string(), op.to_string())).copied()
    }

    /// Iterate over every definition, e.g. for URL-path generation.
    pub fn iter(&self) -> impl Iterator<Item = &OperationId> {
        self.defs.iter()
    }

    /// Call URL for one operation: `<base>/<rpc>/<op>`.
    ///
    /// Both engines derive operation URLs through this helper so the path
    /// layout lives in exactly one place.
    pub fn path(&self, base: &Url, rpc: &str, op: &str) -> Result<Url> {
        let mut url = base.clone();
        url.path_segments_mut()
            .map_err(|_| {
                Error::new("base URL cannot carry operation paths")
                    .with_category(category::CLIENT)
            })?
            .pop_if_empty()
            .push(rpc)
            .push(op);
        Ok(url)
    }

    /// Inverse of [`OperationCatalog::path`]: split a request path into its
    /// `(rpc, op)` segments. `None` for anything but exactly two non-empty
    /// segments.
    pub fn split_path(path: &str) -> Option<(&str, &str)> {
        let mut segments = path.trim_matches('/').split('/');
        match (segments.next(), segments.next(), segments.next()) {
            (Some(rpc), Some(op), None) if !rpc.is_empty() && !op.is_empty() => Some((rpc, op)),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}
