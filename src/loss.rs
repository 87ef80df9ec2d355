//! Named loss values.
//!
//! Training loops often compute some objectives only conditionally. Each loss
//! is therefore classified once, when it enters a [`LossMap`], as absent,
//! invalid, or a valid differentiable scalar.

use candle_core::{DType, Tensor};

/// One named objective as supplied by the training loop.
#[derive(Debug, Clone)]
pub enum LossValue {
    /// The objective was not computed this step.
    Absent,
    /// The value cannot be differentiated as a scalar; the reason is kept for logs.
    Invalid(String),
    /// A single-element floating-point tensor attached to the graph.
    Valid(Tensor),
}

impl LossValue {
    /// Classify a tensor. Only single-element floating-point tensors are valid.
    #[must_use]
    pub fn classify(tensor: Tensor) -> Self {
        if !is_float(tensor.dtype()) {
            return Self::Invalid(format!("non-float dtype {:?}", tensor.dtype()));
        }
        if tensor.elem_count() != 1 {
            return Self::Invalid(format!("not a scalar, shape {:?}", tensor.dims()));
        }
        Self::Valid(tensor)
    }

    /// The tensor, if valid.
    #[must_use]
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Self::Valid(t) => Some(t),
            _ => None,
        }
    }

    /// Whether this loss takes part in gradient measurement.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }
}

fn is_float(dtype: DType) -> bool {
    matches!(dtype, DType::F16 | DType::BF16 | DType::F32 | DType::F64)
}

impl From<Tensor> for LossValue {
    fn from(tensor: Tensor) -> Self {
        Self::classify(tensor)
    }
}

impl From<&Tensor> for LossValue {
    fn from(tensor: &Tensor) -> Self {
        Self::classify(tensor.clone())
    }
}

impl From<Option<Tensor>> for LossValue {
    fn from(tensor: Option<Tensor>) -> Self {
        tensor.map_or(Self::Absent, Self::classify)
    }
}

/// Plain numbers carry no graph.
impl From<f32> for LossValue {
    fn from(value: f32) -> Self {
        Self::Invalid(format!("plain number {value} is not a tensor"))
    }
}

/// Plain numbers carry no graph.
impl From<f64> for LossValue {
    fn from(value: f64) -> Self {
        Self::Invalid(format!("plain number {value} is not a tensor"))
    }
}

/// Insertion-ordered mapping from loss label to value.
///
/// Order matters: cosine pairs are enumerated `i < j` in this order, so
/// `cos_task__ckd` is emitted rather than `cos_ckd__task` when `task` was
/// inserted first.
///
/// # Example
///
/// ```
/// use candle_core::{Device, Tensor};
/// use grad_conflict_rs::LossMap;
///
/// let device = Device::Cpu;
/// let mut losses = LossMap::new();
/// losses.insert("task", Tensor::new(0.7f32, &device)?);
/// losses.insert("fd", None::<Tensor>);
/// losses.insert("icl", 0.3f32);
///
/// assert_eq!(losses.len(), 3);
/// assert_eq!(losses.active().count(), 1);
/// # Ok::<(), candle_core::Error>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct LossMap {
    entries: Vec<(String, LossValue)>,
}

impl LossMap {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a loss. A replaced entry keeps its original position.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<LossValue>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<LossValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Look up a loss by label.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&LossValue> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// All entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &LossValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Valid entries in insertion order. Absent and invalid entries are
    /// skipped with a debug log.
    pub fn active(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.entries.iter().filter_map(|(name, value)| match value {
            LossValue::Valid(t) => Some((name.as_str(), t)),
            LossValue::Absent => {
                tracing::trace!(loss = %name, "skipping absent loss");
                None
            }
            LossValue::Invalid(reason) => {
                tracing::debug!(loss = %name, %reason, "skipping invalid loss");
                None
            }
        })
    }

    /// Number of entries, including absent and invalid ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<LossValue>> FromIterator<(K, V)> for LossMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (name, value) in iter {
            map.insert(name, value);
        }
        map
    }
}
