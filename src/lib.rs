//! # grad-conflict-rs
//!
//! Per-loss gradient diagnostics for multi-objective training with candle.
//!
//! When a model is trained on a weighted sum of several losses (task loss,
//! distillation terms, regularizers), the individual gradients can pull the
//! shared parameters in different directions. This crate measures that
//! interference without disturbing the training step:
//!
//! - each loss is differentiated on its own against the model's trainable
//!   parameters, leaving the graph intact for the combined backward pass
//! - per-loss gradient norms, pairwise cosine similarities and two conflict
//!   ratios are computed for the whole model and/or per transformer block
//! - everything is written as scalar time series to a [`ScalarSink`]
//!
//! ## Quick Start
//!
//! ```ignore
//! use grad_conflict_rs::{AnalyzerConfig, GradientConflictAnalyzer, JsonlSink, LossMap};
//!
//! let analyzer = GradientConflictAnalyzer::from_env(AnalyzerConfig::from_file("analyzer.toml")?)?;
//! let mut sink = JsonlSink::open("runs/exp1/scalars.jsonl")?;
//!
//! for step in 0..num_steps {
//!     let (task, kd) = model.losses(&batch)?;
//!     let losses = LossMap::new().with("task", task.clone()).with("kd", kd.clone());
//!
//!     // before the combined backward
//!     analyzer.log_per_loss_conflict(Some(&mut sink), &varmap, &losses, step)?;
//!
//!     let total = (task + kd)?;
//!     let grads = total.backward()?;
//!     analyzer.log_total_gradient(Some(&mut sink), &varmap, &grads, step)?;
//!     optimizer.step(&grads)?;
//!
//!     analyzer.log_final_losses(Some(&mut sink), None, step, Some(&total), &losses)?;
//! }
//! ```
//!
//! ## Conflict Metrics
//!
//! ```text
//! cos_ij        = <g_i, g_j> / (||g_i|| ||g_j||)
//! negcos_ratio  = #{cos_ij < 0} / #pairs
//! cancel_ratio  = 1 - ||sum g_i|| / (sum ||g_i|| + 1e-12)
//! ```
//!
//! ## Modules
//!
//! - [`analyzer`]: the three logging entry points
//! - [`grouping`]: parameter grouping by transformer block
//! - [`extraction`]: per-loss gradient extraction
//! - [`stats`]: norms, cosines and conflict ratios
//! - [`sink`], [`tracker`], [`rank`]: output and gating seams
//! - [`config`], [`error`]

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]

pub mod analyzer;
pub mod config;
pub mod error;
pub mod extraction;
pub mod grouping;
pub mod loss;
pub mod params;
pub mod rank;
pub mod sink;
pub mod stats;
pub mod tracker;

// Re-export main types at crate root for convenience
pub use analyzer::GradientConflictAnalyzer;
pub use config::{AnalyzerConfig, ConflictConfig, ConflictMode, FinalLossConfig, TotalGradientConfig};
pub use error::{AnalyzerError, Result};
pub use grouping::{build_block_groups, classify_block, BlockId, ParamGroups, Tower};
pub use loss::{LossMap, LossValue};
pub use params::{NamedParam, NamedParameters, ParamStore};
pub use rank::{EnvRank, ProcessRole, SingleProcess, StaticRank};
pub use sink::{JsonlSink, MemorySink, ScalarRecord, ScalarSink};
pub use stats::ScopeStats;
pub use tracker::{ExperimentTracker, RecordingTracker, RerunTracker};
