//! Path resolution across the layers of one stack.
//!
//! A `PathIndex` is a cheap, borrowed view over the layers of a stack in
//! precedence order. It holds no state of its own: every call consults the
//! layers and their whiteout indexes directly.

use crate::error::{CanopyError, Result};
use crate::overlay::layer::{BaseLayer, WritableLayer};
use crate::overlay::types::{DirEntryInfo, EntryKind, EntryStat, LayerKind};
use crate::overlay::whiteout::WhiteoutSet;
use std::collections::{BTreeMap, HashSet};
use std::ffi::OsString;
use std::path::Path;

struct LayerRef<'a> {
    kind: LayerKind,
    source: &'a dyn BaseLayer,
    whiteouts: Option<&'a WhiteoutSet>,
}

/// One layer holding an entry for a resolved path.
#[derive(Debug, Clone)]
pub struct LayerHit {
    pub layer: LayerKind,
    pub stat: EntryStat,
    /// The same layer also records a whiteout for the path, so nothing below
    /// shows through.
    pub opaque: bool,
}

/// Result of resolving one path: every visible entry, highest precedence first.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    hits: Vec<LayerHit>,
}

impl Resolution {
    pub fn is_visible(&self) -> bool {
        !self.hits.is_empty()
    }

    pub fn top(&self) -> Option<&LayerHit> {
        self.hits.first()
    }

    pub fn hits(&self) -> &[LayerHit] {
        &self.hits
    }

    pub fn in_layer(&self, kind: LayerKind) -> Option<&LayerHit> {
        self.hits.iter().find(|h| h.layer == kind)
    }

    /// True if some layer below `kind` contributes a visible entry.
    pub fn visible_below(&self, kind: LayerKind) -> bool {
        self.hits.iter().any(|h| h.layer > kind)
    }

    pub fn kind(&self) -> Option<EntryKind> {
        self.top().map(|h| h.stat.kind)
    }
}

pub struct PathIndex<'a> {
    layers: Vec<LayerRef<'a>>,
}

impl<'a> PathIndex<'a> {
    /// Index over `[upper, changelist?, base]`.
    pub fn new(
        upper: &'a WritableLayer,
        changelist: Option<&'a WritableLayer>,
        base: &'a dyn BaseLayer,
    ) -> Self {
        let mut index = PathIndex { layers: Vec::with_capacity(3) };
        index.push_writable(upper);
        if let Some(changelist) = changelist {
            index.push_writable(changelist);
        }
        index.layers.push(LayerRef {
            kind: LayerKind::Base,
            source: base,
            whiteouts: None,
        });
        index
    }

    /// Index over `[changelist, base]`, used for writes that land in the
    /// shared changelist itself.
    pub fn below_upper(changelist: &'a WritableLayer, base: &'a dyn BaseLayer) -> Self {
        let mut index = PathIndex { layers: Vec::with_capacity(2) };
        index.push_writable(changelist);
        index.layers.push(LayerRef {
            kind: LayerKind::Base,
            source: base,
            whiteouts: None,
        });
        index
    }

    fn push_writable(&mut self, layer: &'a WritableLayer) {
        self.layers.push(LayerRef {
            kind: layer.kind(),
            source: layer,
            whiteouts: Some(layer.whiteouts()),
        });
    }

    /// Read surface of the layer of the given kind, if it is part of this index.
    pub fn source(&self, kind: LayerKind) -> Option<&'a dyn BaseLayer> {
        self.layers.iter().find(|l| l.kind == kind).map(|l| l.source)
    }

    pub fn resolve(&self, rel: &Path) -> Result<Resolution> {
        let mut hits = Vec::new();

        for layer in &self.layers {
            let covered = layer.whiteouts.map(|w| w.covers(rel)).unwrap_or(false);
            if let Some(stat) = layer.source.stat(rel)? {
                hits.push(LayerHit {
                    layer: layer.kind,
                    stat,
                    opaque: covered,
                });
            }
            if covered {
                break;
            }
        }

        if let Some((first, rest)) = hits.split_first() {
            let top_is_dir = first.stat.kind.is_dir();
            if let Some(other) = rest.iter().find(|h| h.stat.kind.is_dir() != top_is_dir) {
                return Err(CanopyError::LayerConflict {
                    path: rel.to_path_buf(),
                    detail: format!(
                        "{:?} in {} but {:?} in {}",
                        first.stat.kind,
                        first.layer.as_str(),
                        other.stat.kind,
                        other.layer.as_str()
                    ),
                });
            }
        }

        Ok(Resolution { hits })
    }

    /// Merged listing of the directory at `rel`, sorted by name.
    pub fn list(&self, rel: &Path) -> Result<Vec<DirEntryInfo>> {
        let resolution = self.resolve(rel)?;
        match resolution.kind() {
            None => return Err(CanopyError::not_found(rel)),
            Some(kind) if !kind.is_dir() => {
                return Err(CanopyError::NotADirectory(rel.to_path_buf()))
            }
            Some(_) => {}
        }

        let mut merged: BTreeMap<OsString, DirEntryInfo> = BTreeMap::new();
        let mut hidden: HashSet<OsString> = HashSet::new();

        for layer in &self.layers {
            if resolution.in_layer(layer.kind).is_some() {
                for item in layer.source.read_dir(rel)? {
                    if hidden.contains(&item.name) || merged.contains_key(&item.name) {
                        continue;
                    }
                    merged.insert(
                        item.name.clone(),
                        DirEntryInfo {
                            name: item.name,
                            kind: item.kind,
                            layer: layer.kind,
                        },
                    );
                }
            }

            if let Some(whiteouts) = layer.whiteouts {
                if whiteouts.covers(rel) {
                    break;
                }
                hidden.extend(whiteouts.children(rel));
            }
        }

        Ok(merged.into_values().collect())
    }

    /// True if the merged directory at `rel` has no visible entries.
    pub fn is_empty_dir(&self, rel: &Path) -> Result<bool> {
        Ok(self.list(rel)?.is_empty())
    }
}
