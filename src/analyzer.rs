//! The gradient conflict analyzer.
//!
//! Three logging entry points share one gating order: master switch, process
//! role, step stride, then presence of a sink. Each returns `Ok(())` without
//! touching the graph when any gate is closed.

use std::collections::BTreeMap;

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor};

use crate::config::{on_stride, AnalyzerConfig};
use crate::error::{AnalyzerError, Result};
use crate::extraction::extract_loss_gradients;
use crate::grouping::{build_block_groups, Tower};
use crate::loss::LossMap;
use crate::params::NamedParameters;
use crate::rank::{EnvRank, ProcessRole, SingleProcess};
use crate::sink::ScalarSink;
use crate::stats::{squared_norm, ScopeStats, RATIO_EPS};
use crate::tracker::ExperimentTracker;

/// Per-loss gradient diagnostics for multi-objective training.
///
/// # Example
///
/// ```
/// use candle_core::{Device, Tensor};
/// use grad_conflict_rs::{
///     AnalyzerConfig, ConflictConfig, ConflictMode, GradientConflictAnalyzer, LossMap,
///     MemorySink, ParamStore,
/// };
///
/// # fn main() -> grad_conflict_rs::Result<()> {
/// let device = Device::Cpu;
/// let mut model = ParamStore::new();
/// let w = model.add("head.weight", Tensor::new(&[1.0f32, 2.0], &device)?, true)?;
///
/// let task = w.as_tensor().sum_all()?;
/// let reg = w.as_tensor().sqr()?.sum_all()?.neg()?;
/// let losses = LossMap::new().with("task", task).with("reg", reg);
///
/// let config = AnalyzerConfig::default()
///     .with_conflict(ConflictConfig::default().with_every(1).with_mode(ConflictMode::Global));
/// let analyzer = GradientConflictAnalyzer::new(config)?;
///
/// let mut sink = MemorySink::new();
/// analyzer.log_per_loss_conflict(Some(&mut sink), &model, &losses, 0)?;
/// assert_eq!(sink.last("train/losswise/conflict_ratio_negcos"), Some(1.0));
/// # Ok(())
/// # }
/// ```
pub struct GradientConflictAnalyzer {
    config: AnalyzerConfig,
    role: Box<dyn ProcessRole>,
}

impl std::fmt::Debug for GradientConflictAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GradientConflictAnalyzer")
            .field("config", &self.config)
            .field("primary", &self.role.is_primary())
            .finish()
    }
}

impl GradientConflictAnalyzer {
    /// Create an analyzer for a single-process run.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: AnalyzerConfig) -> Result<Self> {
        Self::with_role(config, SingleProcess)
    }

    /// Create an analyzer whose rank is read from `RANK` / `WORLD_SIZE`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn from_env(config: AnalyzerConfig) -> Result<Self> {
        Self::with_role(config, EnvRank::from_env())
    }

    /// Create an analyzer with an explicit process role.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn with_role(config: AnalyzerConfig, role: impl ProcessRole + 'static) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            role: Box::new(role),
        })
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Whether this process writes metrics.
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.role.is_primary()
    }

    /// Log the whole-model gradient norm and its ratio to the weight norm.
    ///
    /// Call after the combined backward pass (and after unscaling, with mixed
    /// precision). The gradient norm covers every parameter that has an entry
    /// in `grads`; the weight norm covers trainable parameters.
    ///
    /// Emits `{tag}/grad_norm_total` and `{tag}/grad_to_weight`.
    ///
    /// # Errors
    ///
    /// Propagates tensor and sink errors.
    pub fn log_total_gradient<M: NamedParameters + ?Sized>(
        &self,
        sink: Option<&mut dyn ScalarSink>,
        model: &M,
        grads: &GradStore,
        step: u64,
    ) -> Result<()> {
        let cfg = &self.config.total_gradient;
        if !cfg.enabled || !self.role.is_primary() || !on_stride(step, cfg.every) {
            return Ok(());
        }
        let Some(sink) = sink else {
            tracing::debug!(step, "no sink, skipping total gradient");
            return Ok(());
        };

        let mut grad_sq = 0.0;
        let mut weight_sq = 0.0;
        let mut with_grad = 0usize;
        for param in model.named_parameters() {
            if let Some(g) = grads.get(param.var.as_tensor()) {
                grad_sq += squared_norm(g)?;
                with_grad += 1;
            }
            if param.trainable {
                weight_sq += squared_norm(param.var.as_tensor())?;
            }
        }

        let grad_norm = grad_sq.sqrt();
        let weight_norm = weight_sq.sqrt();
        if grad_norm.is_nan() {
            tracing::warn!(step, "NaN total gradient norm");
        }

        let tag = &cfg.tag;
        sink.add_scalar(&format!("{tag}/grad_norm_total"), grad_norm, step)?;
        sink.add_scalar(
            &format!("{tag}/grad_to_weight"),
            grad_norm / (weight_norm + RATIO_EPS),
            step,
        )?;
        sink.flush()?;

        tracing::debug!(step, grad_norm, weight_norm, params = with_grad, "logged total gradient");
        Ok(())
    }

    /// Log per-loss gradient norms, pairwise cosines and conflict ratios.
    ///
    /// Each valid loss in `losses` is differentiated separately against the
    /// model's trainable parameters. The losses must still be attached to
    /// their graph; the graph stays usable for the caller's combined
    /// backward pass.
    ///
    /// Scopes follow [`ConflictMode`](crate::ConflictMode): the whole model
    /// (tags without a scope suffix) and/or one scope per transformer block
    /// (`/{tower}/block_{i}` suffix).
    ///
    /// # Errors
    ///
    /// Propagates tensor and sink errors.
    pub fn log_per_loss_conflict<M: NamedParameters + ?Sized>(
        &self,
        sink: Option<&mut dyn ScalarSink>,
        model: &M,
        losses: &LossMap,
        step: u64,
    ) -> Result<()> {
        let cfg = &self.config.conflict;
        if !cfg.enabled || !self.role.is_primary() || !on_stride(step, cfg.every) {
            return Ok(());
        }
        let Some(sink) = sink else {
            tracing::debug!(step, "no sink, skipping per-loss conflict");
            return Ok(());
        };

        if losses.active().next().is_none() {
            tracing::debug!(step, "no active losses");
            return Ok(());
        }

        let (mut groups, params) = build_block_groups(model);
        if !cfg.include_text_tower {
            groups = groups.without_tower(Tower::Text);
        }
        if !cfg.mode.includes_global() && groups.is_empty() {
            tracing::debug!(step, "no block groups");
            return Ok(());
        }

        let grads = extract_loss_gradients(losses, &params)?;
        if grads.is_empty() {
            return Ok(());
        }

        let mut written = 0;
        if cfg.mode.includes_global() {
            let vectors = grads.scope_vectors(&grads.all_indices(), cfg.max_elements)?;
            written += ScopeStats::compute(&vectors)?.emit(sink, &cfg.tag, None, step)?;
        }
        if cfg.mode.includes_blocks() {
            for (block, indices) in groups.iter() {
                let vectors = grads.scope_vectors(indices, cfg.max_elements)?;
                if vectors.is_empty() {
                    continue;
                }
                let scope = block.key();
                written += ScopeStats::compute(&vectors)?.emit(sink, &cfg.tag, Some(&scope), step)?;
            }
        }
        sink.flush()?;

        tracing::debug!(
            step,
            losses = grads.len(),
            groups = groups.len(),
            written,
            "logged per-loss conflict"
        );
        Ok(())
    }

    /// Log the final per-loss values of a step.
    ///
    /// Each valid loss goes to the sink as `{prefix}/{loss}`. With
    /// `mirror_to_tracker`, the same values plus `{prefix}/total` are sent to
    /// the tracker in a single call.
    ///
    /// # Errors
    ///
    /// Returns [`AnalyzerError::TrackerUnavailable`] if mirroring is enabled
    /// and `tracker` is `None`. Propagates tensor, sink and tracker errors.
    pub fn log_final_losses(
        &self,
        sink: Option<&mut dyn ScalarSink>,
        tracker: Option<&mut dyn ExperimentTracker>,
        step: u64,
        total_loss: Option<&Tensor>,
        losses: &LossMap,
    ) -> Result<()> {
        let cfg = &self.config.final_losses;
        if !self.role.is_primary() || !on_stride(step, cfg.every) {
            return Ok(());
        }

        let tracker = match (cfg.mirror_to_tracker, tracker) {
            (true, None) => {
                return Err(AnalyzerError::TrackerUnavailable(
                    "mirror_to_tracker is set but no tracker was supplied".to_string(),
                ))
            }
            (true, Some(t)) => Some(t),
            (false, _) => None,
        };

        let prefix = &cfg.tag_prefix;
        let mut values = Vec::new();
        for (name, loss) in losses.active() {
            values.push((format!("{prefix}/{name}"), scalar_value(loss)?));
        }

        if let Some(sink) = sink {
            for (tag, value) in &values {
                sink.add_scalar(tag, *value, step)?;
            }
            sink.flush()?;
        }

        if let Some(tracker) = tracker {
            let mut batch: BTreeMap<String, f64> = values.into_iter().collect();
            if let Some(total) = total_loss {
                batch.insert(format!("{prefix}/total"), scalar_value(total)?);
            }
            tracker.log(&batch, step)?;
        }

        Ok(())
    }
}

/// Read a one-element tensor as f64.
fn scalar_value(t: &Tensor) -> Result<f64> {
    let value = t
        .to_dtype(DType::F64)?
        .flatten_all()?
        .get(0)?
        .to_scalar::<f64>()?;
    Ok(value)
}
