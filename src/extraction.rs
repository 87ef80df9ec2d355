//! Per-objective gradient extraction.
//!
//! Each valid loss is differentiated on its own with `Tensor::backward`,
//! which walks the graph and returns a fresh `GradStore` without consuming
//! anything. The same graph therefore serves every loss in turn and is still
//! intact for the training loop's own combined backward pass.
//!
//! A parameter outside a loss's subgraph has no entry in that loss's
//! `GradStore`. That is recorded as `None` and treated as an exact zero when
//! vectors are assembled.

use candle_core::{DType, Device, Tensor};

use crate::error::{AnalyzerError, Result};
use crate::loss::LossMap;
use crate::params::NamedParam;

/// Gradients of every active loss with respect to one fixed parameter list.
#[derive(Debug, Clone)]
pub struct LossGradients {
    names: Vec<String>,
    /// `grads[loss][param]`, `None` when the parameter is unused by the loss.
    grads: Vec<Vec<Option<Tensor>>>,
    /// Element count, dtype and device per parameter, for zero-filling.
    layout: Vec<(usize, DType, Device)>,
}

/// Differentiate every active loss in `losses` with respect to `params`.
///
/// Absent and invalid losses are skipped. The order of the result follows the
/// insertion order of `losses`.
///
/// # Errors
///
/// Propagates tensor errors from the backward pass.
pub fn extract_loss_gradients(losses: &LossMap, params: &[NamedParam]) -> Result<LossGradients> {
    let mut names = Vec::new();
    let mut grads = Vec::new();

    for (name, loss) in losses.active() {
        let store = loss.backward()?;
        let per_param: Vec<Option<Tensor>> = params
            .iter()
            .map(|p| store.get(p.var.as_tensor()).map(Tensor::detach))
            .collect();

        let used = per_param.iter().filter(|g| g.is_some()).count();
        tracing::trace!(loss = %name, used, total = params.len(), "extracted loss gradients");

        names.push(name.to_string());
        grads.push(per_param);
    }

    let layout = params
        .iter()
        .map(|p| (p.elem_count(), p.var.dtype(), p.var.device().clone()))
        .collect();

    Ok(LossGradients {
        names,
        grads,
        layout,
    })
}

impl LossGradients {
    /// Loss labels in extraction order.
    #[must_use]
    pub fn loss_names(&self) -> &[String] {
        &self.names
    }

    /// Number of losses with extracted gradients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether no loss was active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Number of parameters the gradients refer to.
    #[must_use]
    pub fn param_count(&self) -> usize {
        self.layout.len()
    }

    /// Indices of every parameter, for the whole-model scope.
    #[must_use]
    pub fn all_indices(&self) -> Vec<usize> {
        (0..self.layout.len()).collect()
    }

    /// Raw gradient of loss `loss` for parameter `param`; `None` when unused.
    #[must_use]
    pub fn gradient(&self, loss: usize, param: usize) -> Option<&Tensor> {
        self.grads.get(loss)?.get(param)?.as_ref()
    }

    /// Whether loss `loss` reaches at least one of `indices`.
    #[must_use]
    pub fn reaches(&self, loss: usize, indices: &[usize]) -> bool {
        self.grads.get(loss).is_some_and(|per_param| {
            indices
                .iter()
                .any(|&i| per_param.get(i).is_some_and(Option::is_some))
        })
    }

    /// Flattened gradient vector of one loss over `indices`.
    ///
    /// The vector is F64 when any parameter in scope is F64 and F32
    /// otherwise. Unused parameters contribute zeros so that every loss
    /// shares one layout. Returns `None` when the loss reaches none of the
    /// parameters or the vector would be empty. With `max_elements`, only the
    /// first N elements of the concatenation are kept.
    ///
    /// # Errors
    ///
    /// Returns [`AnalyzerError::ParamIndex`] for an index outside the
    /// parameter list. Propagates tensor errors.
    pub fn flatten(
        &self,
        loss: usize,
        indices: &[usize],
        max_elements: Option<usize>,
    ) -> Result<Option<Tensor>> {
        if let Some(&index) = indices.iter().find(|&&i| i >= self.layout.len()) {
            return Err(AnalyzerError::ParamIndex {
                index,
                count: self.layout.len(),
            });
        }
        if !self.reaches(loss, indices) {
            return Ok(None);
        }

        let dtype = if indices.iter().any(|&i| self.layout[i].1 == DType::F64) {
            DType::F64
        } else {
            DType::F32
        };

        let mut remaining = max_elements.unwrap_or(usize::MAX);
        let mut parts = Vec::with_capacity(indices.len());

        for &idx in indices {
            if remaining == 0 {
                break;
            }
            let (count, _, device) = &self.layout[idx];
            let take = (*count).min(remaining);
            if take == 0 {
                continue;
            }

            let part = match self.gradient(loss, idx) {
                Some(grad) => {
                    let flat = grad.flatten_all()?.to_dtype(dtype)?;
                    if take < *count {
                        flat.narrow(0, 0, take)?
                    } else {
                        flat
                    }
                }
                None => Tensor::zeros(take, dtype, device)?,
            };
            parts.push(part);
            remaining -= take;
        }

        if parts.is_empty() {
            return Ok(None);
        }
        Ok(Some(Tensor::cat(&parts, 0)?))
    }

    /// Gradient vectors of every loss over one scope, in loss order.
    /// Losses that do not reach the scope are left out.
    ///
    /// # Errors
    ///
    /// Propagates tensor errors.
    pub fn scope_vectors(
        &self,
        indices: &[usize],
        max_elements: Option<usize>,
    ) -> Result<Vec<(String, Tensor)>> {
        let mut vectors = Vec::with_capacity(self.names.len());
        for (loss, name) in self.names.iter().enumerate() {
            if let Some(v) = self.flatten(loss, indices, max_elements)? {
                vectors.push((name.clone(), v));
            }
        }
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{NamedParameters, ParamStore};
    use candle_core::Device;

    /// Two parameters `a` (len 2) and `b` (len 3).
    /// `left = sum(a * [1, 2])`, `right = sum(b * [3, 4, 5]) + sum(a)`.
    fn fixture() -> (ParamStore, LossMap) {
        let device = Device::Cpu;
        let mut store = ParamStore::new();
        let a = store
            .add("a", Tensor::new(&[0.5f32, -1.0], &device).unwrap(), true)
            .unwrap();
        let b = store
            .add("b", Tensor::new(&[1.0f32, 1.0, 1.0], &device).unwrap(), true)
            .unwrap();

        let wa = Tensor::new(&[1.0f32, 2.0], &device).unwrap();
        let wb = Tensor::new(&[3.0f32, 4.0, 5.0], &device).unwrap();

        let left = a.as_tensor().mul(&wa).unwrap().sum_all().unwrap();
        let right = b
            .as_tensor()
            .mul(&wb)
            .unwrap()
            .sum_all()
            .unwrap()
            .add(&a.as_tensor().sum_all().unwrap())
            .unwrap();

        let losses = LossMap::new()
            .with("left", left)
            .with("missing", None::<Tensor>)
            .with("right", right);
        (store, losses)
    }

    fn values(t: &Tensor) -> Vec<f32> {
        t.to_vec1().unwrap()
    }

    #[test]
    fn test_extracts_each_active_loss() {
        let (store, losses) = fixture();
        let params = store.trainable_parameters();
        let grads = extract_loss_gradients(&losses, &params).unwrap();

        assert_eq!(grads.loss_names(), &["left".to_string(), "right".to_string()]);
        assert_eq!(grads.param_count(), 2);

        assert_eq!(values(grads.gradient(0, 0).unwrap()), vec![1.0, 2.0]);
        assert!(grads.gradient(0, 1).is_none());
        assert_eq!(values(grads.gradient(1, 0).unwrap()), vec![1.0, 1.0]);
        assert_eq!(values(grads.gradient(1, 1).unwrap()), vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_unused_params_zero_fill() {
        let (store, losses) = fixture();
        let params = store.trainable_parameters();
        let grads = extract_loss_gradients(&losses, &params).unwrap();

        let left = grads.flatten(0, &grads.all_indices(), None).unwrap().unwrap();
        assert_eq!(values(&left), vec![1.0, 2.0, 0.0, 0.0, 0.0]);

        let right = grads.flatten(1, &grads.all_indices(), None).unwrap().unwrap();
        assert_eq!(values(&right), vec![1.0, 1.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_unreached_scope_has_no_vector() {
        let (store, losses) = fixture();
        let params = store.trainable_parameters();
        let grads = extract_loss_gradients(&losses, &params).unwrap();

        assert!(!grads.reaches(0, &[1]));
        assert!(grads.flatten(0, &[1], None).unwrap().is_none());
        assert!(grads.flatten(0, &[], None).unwrap().is_none());

        let vectors = grads.scope_vectors(&[1], None).unwrap();
        assert_eq!(vectors.len(), 1);
        assert_eq!(vectors[0].0, "right");
    }

    #[test]
    fn test_prefix_truncation() {
        let (store, losses) = fixture();
        let params = store.trainable_parameters();
        let grads = extract_loss_gradients(&losses, &params).unwrap();

        let right = grads.flatten(1, &grads.all_indices(), Some(3)).unwrap().unwrap();
        assert_eq!(values(&right), vec![1.0, 1.0, 3.0]);

        // truncation shorter than the first parameter
        let left = grads.flatten(0, &grads.all_indices(), Some(1)).unwrap().unwrap();
        assert_eq!(values(&left), vec![1.0]);

        // a limit larger than the vector keeps everything
        let right = grads.flatten(1, &grads.all_indices(), Some(100)).unwrap().unwrap();
        assert_eq!(right.elem_count(), 5);
    }

    #[test]
    fn test_out_of_range_index_is_an_error() {
        let (store, losses) = fixture();
        let params = store.trainable_parameters();
        let grads = extract_loss_gradients(&losses, &params).unwrap();

        // a valid index alongside does not hide the bad one
        let result = grads.flatten(0, &[0, 5], None);
        assert!(matches!(
            result,
            Err(AnalyzerError::ParamIndex { index: 5, count: 2 })
        ));
        assert!(grads.scope_vectors(&[7], None).is_err());
    }

    #[test]
    fn test_f64_params_keep_f64_vectors() {
        let device = Device::Cpu;
        let mut store = ParamStore::new();
        let a = store
            .add("a", Tensor::new(&[1.0f64, 2.0], &device).unwrap(), true)
            .unwrap();
        store
            .add("b", Tensor::new(&[0.0f64], &device).unwrap(), true)
            .unwrap();
        let w = Tensor::new(&[1.0f64 + 1e-10, 3.0], &device).unwrap();
        let losses = LossMap::new().with("l", a.as_tensor().mul(&w).unwrap().sum_all().unwrap());

        let params = store.trainable_parameters();
        let grads = extract_loss_gradients(&losses, &params).unwrap();
        let v = grads.flatten(0, &grads.all_indices(), None).unwrap().unwrap();
        assert_eq!(v.dtype(), DType::F64);
        let values: Vec<f64> = v.to_vec1().unwrap();
        assert_eq!(values, vec![1.0 + 1e-10, 3.0, 0.0]);
    }

    #[test]
    fn test_graph_survives_for_combined_backward() {
        let (store, losses) = fixture();
        let params = store.trainable_parameters();
        let grads = extract_loss_gradients(&losses, &params).unwrap();

        // the caller's combined backward still works afterwards
        let left = losses.get("left").and_then(|l| l.as_tensor()).unwrap();
        let right = losses.get("right").and_then(|l| l.as_tensor()).unwrap();
        let total = left.add(right).unwrap();
        let combined = total.backward().unwrap();

        let a = store.get("a").unwrap();
        let combined_a = values(combined.get(a.as_tensor()).unwrap());
        let left_a = values(grads.gradient(0, 0).unwrap());
        let right_a = values(grads.gradient(1, 0).unwrap());
        for i in 0..2 {
            assert!((combined_a[i] - (left_a[i] + right_a[i])).abs() < 1e-6);
        }

        // and extraction itself is repeatable
        let again = extract_loss_gradients(&losses, &params).unwrap();
        assert_eq!(values(again.gradient(1, 1).unwrap()), vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_constant_loss_reaches_nothing() {
        let (store, _) = fixture();
        let params = store.trainable_parameters();
        let losses =
            LossMap::new().with("const", Tensor::new(2.0f32, &Device::Cpu).unwrap());

        let grads = extract_loss_gradients(&losses, &params).unwrap();
        assert_eq!(grads.len(), 1);
        assert!(grads.scope_vectors(&grads.all_indices(), None).unwrap().is_empty());
    }
}
