//! Structural grouping of parameters by transformer block.
//!
//! Parameter names are classified with two patterns:
//!
//! | pattern                                    | tower    |
//! |--------------------------------------------|----------|
//! | `visual.transformer.resblocks.<N>.`        | `visual` |
//! | `^(text.)?transformer.resblocks.<N>.`      | `text`   |
//!
//! Everything else (embeddings, projections, final norms) belongs to no group.
//! Groups store indices into the parameter list returned alongside them, so
//! that list must not be re-enumerated between grouping and use.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::params::{NamedParam, NamedParameters};

/// Major sub-network a block belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tower {
    /// Image encoder.
    Visual,
    /// Text encoder.
    Text,
}

impl Tower {
    /// Tower name as used in group keys.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Visual => "visual",
            Self::Text => "text",
        }
    }
}

impl fmt::Display for Tower {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transformer block within a tower.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId {
    /// Owning tower.
    pub tower: Tower,
    /// Block index within the tower.
    pub index: usize,
}

impl BlockId {
    /// Group key, e.g. `visual/block_3`.
    #[must_use]
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/block_{}", self.tower, self.index)
    }
}

fn visual_block_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"visual\.transformer\.resblocks\.(\d+)\.").expect("valid visual block regex")
    })
}

fn text_block_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:text\.)?transformer\.resblocks\.(\d+)\.").expect("valid text block regex")
    })
}

fn capture_index(pattern: &Regex, name: &str) -> Option<usize> {
    pattern.captures(name)?.get(1)?.as_str().parse().ok()
}

/// Classify a parameter name into its transformer block.
///
/// The visual pattern is checked first, so `visual.transformer.resblocks.0.x`
/// is never mistaken for a text block.
///
/// # Example
///
/// ```
/// use grad_conflict_rs::grouping::{classify_block, Tower};
///
/// let block = classify_block("visual.transformer.resblocks.7.mlp.c_fc.weight").unwrap();
/// assert_eq!((block.tower, block.index), (Tower::Visual, 7));
///
/// let block = classify_block("transformer.resblocks.2.ln_1.bias").unwrap();
/// assert_eq!(block.key(), "text/block_2");
///
/// assert!(classify_block("token_embedding.weight").is_none());
/// ```
#[must_use]
pub fn classify_block(name: &str) -> Option<BlockId> {
    if let Some(index) = capture_index(visual_block_pattern(), name) {
        return Some(BlockId {
            tower: Tower::Visual,
            index,
        });
    }
    if let Some(index) = capture_index(text_block_pattern(), name) {
        return Some(BlockId {
            tower: Tower::Text,
            index,
        });
    }
    None
}

/// Mapping from transformer block to parameter indices.
///
/// Iteration order is by tower (visual first), then numeric block index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamGroups {
    groups: BTreeMap<BlockId, Vec<usize>>,
}

impl ParamGroups {
    /// Group a parameter list by block. Indices refer to positions in `params`.
    #[must_use]
    pub fn from_params(params: &[NamedParam]) -> Self {
        let mut groups: BTreeMap<BlockId, Vec<usize>> = BTreeMap::new();
        for (idx, param) in params.iter().enumerate() {
            if let Some(block) = classify_block(&param.name) {
                groups.entry(block).or_default().push(idx);
            }
        }
        Self { groups }
    }

    /// Indices for one block.
    #[must_use]
    pub fn get(&self, block: &BlockId) -> Option<&[usize]> {
        self.groups.get(block).map(Vec::as_slice)
    }

    /// Indices for a group key such as `text/block_0`.
    #[must_use]
    pub fn get_key(&self, key: &str) -> Option<&[usize]> {
        self.iter()
            .find(|(block, _)| block.key() == key)
            .map(|(_, idxs)| idxs)
    }

    /// Iterate over `(block, indices)` in deterministic order.
    pub fn iter(&self) -> impl Iterator<Item = (&BlockId, &[usize])> {
        self.groups.iter().map(|(block, idxs)| (block, idxs.as_slice()))
    }

    /// Group keys in iteration order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.groups.keys().map(BlockId::key).collect()
    }

    /// Keep only the groups of one tower.
    #[must_use]
    pub fn retain_tower(mut self, tower: Tower) -> Self {
        self.groups.retain(|block, _| block.tower == tower);
        self
    }

    /// Drop the groups of one tower.
    #[must_use]
    pub fn without_tower(mut self, tower: Tower) -> Self {
        self.groups.retain(|block, _| block.tower != tower);
        self
    }

    /// Number of groups.
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether there are no groups.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Enumerate a model's trainable parameters and group them by block.
///
/// Returns the groups together with the parameter list their indices refer to.
pub fn build_block_groups<M: NamedParameters + ?Sized>(model: &M) -> (ParamGroups, Vec<NamedParam>) {
    let params = model.trainable_parameters();
    let groups = ParamGroups::from_params(&params);
    tracing::debug!(
        params = params.len(),
        groups = groups.len(),
        "built block parameter groups"
    );
    (groups, params)
}
