//! Named parameter enumeration.
//!
//! The analyzer never owns model weights. It asks the model for an ordered
//! list of [`NamedParam`]s, each holding a reference-counted [`Var`] handle,
//! and keeps that list fixed for the duration of one logging call.

use candle_core::{Tensor, Var};
use candle_nn::VarMap;

use crate::error::Result;

/// A model parameter with its dotted-path name.
#[derive(Debug, Clone)]
pub struct NamedParam {
    /// Dotted path, e.g. `visual.transformer.resblocks.3.attn.in_proj_weight`.
    pub name: String,
    /// Parameter handle. Cloning shares storage.
    pub var: Var,
    /// Whether the parameter receives optimizer updates.
    pub trainable: bool,
}

impl NamedParam {
    /// Number of scalar elements in the parameter.
    #[must_use]
    pub fn elem_count(&self) -> usize {
        self.var.elem_count()
    }
}

/// Capability of enumerating a model's parameters in a fixed order.
///
/// Implementations must return the same names in the same order on every call
/// as long as the model structure does not change.
pub trait NamedParameters {
    /// All parameters, trainable or not, in natural traversal order.
    fn named_parameters(&self) -> Vec<NamedParam>;

    /// Only the trainable parameters, in natural traversal order.
    fn trainable_parameters(&self) -> Vec<NamedParam> {
        self.named_parameters()
            .into_iter()
            .filter(|p| p.trainable)
            .collect()
    }
}

/// `VarMap` keeps variables in a hash map, so they are enumerated sorted by
/// name. Every variable in a `VarMap` is trainable.
impl NamedParameters for VarMap {
    fn named_parameters(&self) -> Vec<NamedParam> {
        let data = self
            .data()
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let mut params: Vec<NamedParam> = data
            .iter()
            .map(|(name, var)| NamedParam {
                name: name.clone(),
                var: var.clone(),
                trainable: true,
            })
            .collect();
        params.sort_by(|a, b| a.name.cmp(&b.name));
        params
    }
}

/// Ordered parameter registry. Registration order is traversal order.
///
/// # Example
///
/// ```
/// use candle_core::{Device, Tensor};
/// use grad_conflict_rs::{NamedParameters, ParamStore};
///
/// let device = Device::Cpu;
/// let mut store = ParamStore::new();
/// store.add("visual.transformer.resblocks.0.mlp.weight", Tensor::zeros(4, candle_core::DType::F32, &device)?, true)?;
/// store.add("logit_scale", Tensor::ones(1, candle_core::DType::F32, &device)?, false)?;
///
/// assert_eq!(store.named_parameters().len(), 2);
/// assert_eq!(store.trainable_parameters().len(), 1);
/// # Ok::<(), grad_conflict_rs::AnalyzerError>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct ParamStore {
    params: Vec<NamedParam>,
}

impl ParamStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new variable initialized from `init` and return its handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the tensor cannot be turned into a variable.
    pub fn add(&mut self, name: impl Into<String>, init: Tensor, trainable: bool) -> Result<Var> {
        let var = Var::from_tensor(&init)?;
        self.push_var(name, var.clone(), trainable);
        Ok(var)
    }

    /// Register an existing variable handle.
    pub fn push_var(&mut self, name: impl Into<String>, var: Var, trainable: bool) {
        self.params.push(NamedParam {
            name: name.into(),
            var,
            trainable,
        });
    }

    /// Mark a parameter as frozen. Returns `false` if the name is unknown.
    pub fn freeze(&mut self, name: &str) -> bool {
        match self.params.iter_mut().find(|p| p.name == name) {
            Some(param) => {
                param.trainable = false;
                true
            }
            None => false,
        }
    }

    /// Look up a parameter handle by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Var> {
        self.params.iter().find(|p| p.name == name).map(|p| &p.var)
    }

    /// Number of registered parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether no parameters are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

impl NamedParameters for ParamStore {
    fn named_parameters(&self) -> Vec<NamedParam> {
        self.params.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{Init, VarBuilder};

    #[test]
    fn test_store_preserves_registration_order() {
        let device = Device::Cpu;
        let mut store = ParamStore::new();
        for name in ["z.weight", "a.weight", "m.weight"] {
            store
                .add(name, Tensor::zeros(2, DType::F32, &device).unwrap(), true)
                .unwrap();
        }

        let names: Vec<String> = store
            .named_parameters()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["z.weight", "a.weight", "m.weight"]);
    }

    #[test]
    fn test_freeze_filters_trainable() {
        let device = Device::Cpu;
        let mut store = ParamStore::new();
        store
            .add("a", Tensor::zeros(3, DType::F32, &device).unwrap(), true)
            .unwrap();
        store
            .add("b", Tensor::zeros(3, DType::F32, &device).unwrap(), true)
            .unwrap();

        assert!(store.freeze("a"));
        assert!(!store.freeze("missing"));

        let trainable = store.trainable_parameters();
        assert_eq!(trainable.len(), 1);
        assert_eq!(trainable[0].name, "b");
        assert_eq!(trainable[0].elem_count(), 3);
    }

    #[test]
    fn test_handles_share_storage() {
        let device = Device::Cpu;
        let mut store = ParamStore::new();
        let var = store
            .add("w", Tensor::zeros(2, DType::F32, &device).unwrap(), true)
            .unwrap();
        var.set(&Tensor::ones(2, DType::F32, &device).unwrap())
            .unwrap();

        let seen: Vec<f32> = store.get("w").unwrap().to_vec1().unwrap();
        assert_eq!(seen, vec![1.0, 1.0]);
    }

    #[test]
    fn test_varmap_enumeration_is_sorted() {
        let device = Device::Cpu;
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
        for name in ["text.b", "visual.a", "logit_scale"] {
            vb.get_with_hints(2, name, Init::Const(0.0)).unwrap();
        }

        let first: Vec<String> = var_map
            .named_parameters()
            .into_iter()
            .map(|p| p.name)
            .collect();
        let second: Vec<String> = var_map
            .trainable_parameters()
            .into_iter()
            .map(|p| p.name)
            .collect();

        assert_eq!(first, vec!["logit_scale", "text.b", "visual.a"]);
        assert_eq!(first, second);
    }
}
