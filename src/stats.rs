//! Norm, cosine and conflict statistics over gradient vectors.
//!
//! For one scope (the whole model or one transformer block) with per-loss
//! gradient vectors `g_1..g_n`:
//!
//! ```text
//! norm_i        = ||g_i||
//! cos_ij        = <g_i, g_j> / (||g_i|| ||g_j||)            for i < j
//! negcos_ratio  = #{cos_ij < 0} / #pairs
//! cancel_ratio  = 1 - ||sum_i g_i|| / (sum_i ||g_i|| + eps)
//! ```
//!
//! `cancel_ratio` is 0 when all gradients point the same way and approaches 1
//! when they cancel out, which also captures multi-way interference that the
//! pairwise sign test misses.

use candle_core::{DType, Tensor};

use crate::error::Result;
use crate::sink::ScalarSink;

/// Guard added to denominators of ratio metrics.
pub const RATIO_EPS: f64 = 1e-12;

/// F64 stays F64; every other dtype is accumulated in F32.
fn accumulation_dtype(dtype: DType) -> DType {
    if dtype == DType::F64 {
        DType::F64
    } else {
        DType::F32
    }
}

fn sum_to_f64(t: &Tensor) -> Result<f64> {
    let sum = t.sum_all()?;
    let value = match sum.dtype() {
        DType::F64 => sum.to_scalar::<f64>()?,
        _ => f64::from(sum.to_dtype(DType::F32)?.to_scalar::<f32>()?),
    };
    Ok(value)
}

/// Sum of squares of all elements.
///
/// F64 input is reduced in F64, everything else in F32.
///
/// # Errors
///
/// Propagates tensor errors.
pub fn squared_norm(t: &Tensor) -> Result<f64> {
    sum_to_f64(&t.to_dtype(accumulation_dtype(t.dtype()))?.sqr()?)
}

/// Euclidean norm of all elements.
///
/// # Errors
///
/// Propagates tensor errors.
pub fn l2_norm(t: &Tensor) -> Result<f64> {
    Ok(squared_norm(t)?.sqrt())
}

/// Inner product of two equally shaped tensors.
///
/// # Errors
///
/// Returns a tensor error on shape mismatch.
pub fn dot(a: &Tensor, b: &Tensor) -> Result<f64> {
    let dtype = if a.dtype() == DType::F64 || b.dtype() == DType::F64 {
        DType::F64
    } else {
        DType::F32
    };
    sum_to_f64(&a.to_dtype(dtype)?.mul(&b.to_dtype(dtype)?)?)
}

/// Cosine from a precomputed dot product and norms, clamped to `[-1, 1]`.
/// `None` when either norm is zero.
#[must_use]
pub fn cosine_from_parts(dot: f64, norm_a: f64, norm_b: f64) -> Option<f64> {
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some((dot / (norm_a * norm_b)).clamp(-1.0, 1.0))
}

/// Cosine similarity of two vectors. `None` when either is all zeros.
///
/// # Errors
///
/// Returns a tensor error on shape mismatch.
pub fn cosine_similarity(a: &Tensor, b: &Tensor) -> Result<Option<f64>> {
    Ok(cosine_from_parts(dot(a, b)?, l2_norm(a)?, l2_norm(b)?))
}

/// Fraction of cosines that are strictly negative. `None` for no pairs.
#[must_use]
pub fn negcos_ratio(cosines: &[f64]) -> Option<f64> {
    if cosines.is_empty() {
        return None;
    }
    let negative = cosines.iter().filter(|&&c| c < 0.0).count();
    Some(negative as f64 / cosines.len() as f64)
}

/// `1 - ||sum|| / (sum of norms + eps)`.
#[must_use]
pub fn cancellation_ratio(sum_norm: f64, norms: &[f64]) -> f64 {
    let denom: f64 = norms.iter().sum();
    1.0 - sum_norm / (denom + RATIO_EPS)
}

/// Cosine similarity of one loss pair.
#[derive(Debug, Clone, PartialEq)]
pub struct PairCosine {
    /// Earlier loss in enumeration order.
    pub a: String,
    /// Later loss in enumeration order.
    pub b: String,
    /// Cosine similarity in `[-1, 1]`.
    pub cos: f64,
}

/// Statistics for one scope.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeStats {
    /// `(loss, ||g||)` for every loss with a vector in scope.
    pub norms: Vec<(String, f64)>,
    /// Pairwise cosines, `i < j`, skipping pairs with a zero vector.
    pub cosines: Vec<PairCosine>,
    /// Fraction of negative cosines. `None` with fewer than two vectors or
    /// when no pair could be evaluated.
    pub negcos_ratio: Option<f64>,
    /// Cancellation ratio. `None` with fewer than two vectors.
    pub cancel_ratio: Option<f64>,
}

impl ScopeStats {
    /// Compute statistics for the given `(loss, vector)` list.
    ///
    /// All vectors must have the same length.
    ///
    /// # Errors
    ///
    /// Returns a tensor error if vector lengths differ.
    pub fn compute(vectors: &[(String, Tensor)]) -> Result<Self> {
        let mut norms = Vec::with_capacity(vectors.len());
        for (name, v) in vectors {
            norms.push((name.clone(), l2_norm(v)?));
        }

        if vectors.len() < 2 {
            return Ok(Self {
                norms,
                cosines: Vec::new(),
                negcos_ratio: None,
                cancel_ratio: None,
            });
        }

        let mut cosines = Vec::new();
        for i in 0..vectors.len() {
            for j in (i + 1)..vectors.len() {
                let d = dot(&vectors[i].1, &vectors[j].1)?;
                if let Some(cos) = cosine_from_parts(d, norms[i].1, norms[j].1) {
                    cosines.push(PairCosine {
                        a: vectors[i].0.clone(),
                        b: vectors[j].0.clone(),
                        cos,
                    });
                }
            }
        }

        let dtype = if vectors.iter().any(|(_, v)| v.dtype() == DType::F64) {
            DType::F64
        } else {
            DType::F32
        };
        let mut sum = vectors[0].1.to_dtype(dtype)?;
        for (_, v) in &vectors[1..] {
            sum = sum.add(&v.to_dtype(dtype)?)?;
        }
        let norm_values: Vec<f64> = norms.iter().map(|(_, n)| *n).collect();
        let cancel = cancellation_ratio(l2_norm(&sum)?, &norm_values);

        let values: Vec<f64> = cosines.iter().map(|p| p.cos).collect();
        Ok(Self {
            norms,
            negcos_ratio: negcos_ratio(&values),
            cosines,
            cancel_ratio: Some(cancel),
        })
    }

    /// Cosine for a pair, in either order.
    #[must_use]
    pub fn cosine(&self, a: &str, b: &str) -> Option<f64> {
        self.cosines
            .iter()
            .find(|p| (p.a == a && p.b == b) || (p.a == b && p.b == a))
            .map(|p| p.cos)
    }

    /// Norm for one loss.
    #[must_use]
    pub fn norm(&self, loss: &str) -> Option<f64> {
        self.norms.iter().find(|(n, _)| n == loss).map(|(_, v)| *v)
    }

    fn has_nan(&self) -> bool {
        self.norms.iter().any(|(_, n)| n.is_nan())
            || self.cosines.iter().any(|p| p.cos.is_nan())
            || self.cancel_ratio.is_some_and(f64::is_nan)
    }

    /// Write the statistics under `tag`, suffixed with `/{scope}` when given.
    /// Returns the number of scalars written.
    ///
    /// # Errors
    ///
    /// Propagates sink errors.
    pub fn emit(
        &self,
        sink: &mut dyn ScalarSink,
        tag: &str,
        scope: Option<&str>,
        step: u64,
    ) -> Result<usize> {
        let suffix = scope.map(|s| format!("/{s}")).unwrap_or_default();
        let mut written = 0;

        if self.has_nan() {
            tracing::warn!(scope = scope.unwrap_or("model"), step, "NaN in gradient statistics");
        }

        for (loss, norm) in &self.norms {
            sink.add_scalar(&format!("{tag}/grad_norm_from_{loss}{suffix}"), *norm, step)?;
            written += 1;
        }
        for pair in &self.cosines {
            sink.add_scalar(&format!("{tag}/cos_{}__{}{suffix}", pair.a, pair.b), pair.cos, step)?;
            written += 1;
        }
        if let Some(ratio) = self.negcos_ratio {
            sink.add_scalar(&format!("{tag}/conflict_ratio_negcos{suffix}"), ratio, step)?;
            written += 1;
        }
        if let Some(ratio) = self.cancel_ratio {
            sink.add_scalar(&format!("{tag}/conflict_ratio_cancel{suffix}"), ratio, step)?;
            written += 1;
        }

        Ok(written)
    }
}
