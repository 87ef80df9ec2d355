//! Configuration types for gradient diagnostics.
//!
//! One section per logging entry point:
//! - [`TotalGradientConfig`]: whole-model gradient norm logging
//! - [`ConflictConfig`]: per-loss norm, cosine and conflict logging
//! - [`FinalLossConfig`]: final per-loss scalar logging
//!
//! [`AnalyzerConfig`] bundles the three and can be loaded from TOML.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AnalyzerError, Result};

/// Which scopes the conflict logger measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictMode {
    /// One scope per transformer block (`visual/block_3`, `text/block_0`, ...).
    #[default]
    Blockwise,
    /// A single whole-model scope; tags carry no scope suffix.
    Global,
    /// Both the whole-model scope and every block scope.
    Both,
}

impl ConflictMode {
    /// Whether the whole-model scope is measured.
    #[must_use]
    pub const fn includes_global(self) -> bool {
        matches!(self, Self::Global | Self::Both)
    }

    /// Whether per-block scopes are measured.
    #[must_use]
    pub const fn includes_blocks(self) -> bool {
        matches!(self, Self::Blockwise | Self::Both)
    }
}

/// Settings for [`log_total_gradient`](crate::GradientConflictAnalyzer::log_total_gradient).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TotalGradientConfig {
    /// Log only on steps divisible by this stride.
    pub every: u64,

    /// Tag prefix for emitted scalars.
    pub tag: String,

    /// Master switch.
    pub enabled: bool,
}

impl Default for TotalGradientConfig {
    fn default() -> Self {
        Self {
            every: 50,
            tag: "train/grad".to_string(),
            enabled: true,
        }
    }
}

impl TotalGradientConfig {
    /// Set the logging stride.
    #[must_use]
    pub fn with_every(mut self, every: u64) -> Self {
        self.every = every;
        self
    }

    /// Set the tag prefix.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// Enable or disable logging.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Settings for [`log_per_loss_conflict`](crate::GradientConflictAnalyzer::log_per_loss_conflict).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    /// Log only on steps divisible by this stride.
    pub every: u64,

    /// Tag prefix for emitted scalars.
    pub tag: String,

    /// Keep only the first N elements of each gradient vector.
    /// `None` keeps the full vector; written as `0` in TOML.
    #[serde(with = "truncation")]
    pub max_elements: Option<usize>,

    /// Master switch.
    pub enabled: bool,

    /// Measure text-tower blocks as well as visual-tower blocks.
    pub include_text_tower: bool,

    /// Which scopes to measure.
    pub mode: ConflictMode,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            every: 1000,
            tag: "train/losswise".to_string(),
            max_elements: Some(500_000),
            enabled: true,
            include_text_tower: true,
            mode: ConflictMode::Blockwise,
        }
    }
}

impl ConflictConfig {
    /// Set the logging stride.
    #[must_use]
    pub fn with_every(mut self, every: u64) -> Self {
        self.every = every;
        self
    }

    /// Set the tag prefix.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// Set the per-vector truncation length.
    #[must_use]
    pub fn with_max_elements(mut self, max_elements: Option<usize>) -> Self {
        self.max_elements = max_elements;
        self
    }

    /// Enable or disable logging.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Include or exclude text-tower block scopes.
    #[must_use]
    pub fn with_text_tower(mut self, include: bool) -> Self {
        self.include_text_tower = include;
        self
    }

    /// Set the scope mode.
    #[must_use]
    pub fn with_mode(mut self, mode: ConflictMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Settings for [`log_final_losses`](crate::GradientConflictAnalyzer::log_final_losses).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalLossConfig {
    /// Log only on steps divisible by this stride.
    pub every: u64,

    /// Tag prefix for emitted scalars.
    pub tag_prefix: String,

    /// Mirror values (plus the total) to the experiment tracker.
    /// A missing tracker is then a hard error.
    pub mirror_to_tracker: bool,
}

impl Default for FinalLossConfig {
    fn default() -> Self {
        Self {
            every: 1,
            tag_prefix: "train/loss".to_string(),
            mirror_to_tracker: false,
        }
    }
}

impl FinalLossConfig {
    /// Set the logging stride.
    #[must_use]
    pub fn with_every(mut self, every: u64) -> Self {
        self.every = every;
        self
    }

    /// Set the tag prefix.
    #[must_use]
    pub fn with_tag_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.tag_prefix = prefix.into();
        self
    }

    /// Enable or disable tracker mirroring.
    #[must_use]
    pub fn with_tracker(mut self, mirror: bool) -> Self {
        self.mirror_to_tracker = mirror;
        self
    }
}

/// Full analyzer configuration.
///
/// # Example
///
/// ```
/// use grad_conflict_rs::{AnalyzerConfig, ConflictConfig, ConflictMode};
///
/// let config = AnalyzerConfig::default().with_conflict(
///     ConflictConfig::default()
///         .with_every(200)
///         .with_mode(ConflictMode::Both),
/// );
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Whole-model gradient norm logging.
    pub total_gradient: TotalGradientConfig,

    /// Per-loss conflict logging.
    pub conflict: ConflictConfig,

    /// Final per-loss scalar logging.
    pub final_losses: FinalLossConfig,
}

impl AnalyzerConfig {
    /// Replace the total-gradient section.
    #[must_use]
    pub fn with_total_gradient(mut self, section: TotalGradientConfig) -> Self {
        self.total_gradient = section;
        self
    }

    /// Replace the conflict section.
    #[must_use]
    pub fn with_conflict(mut self, section: ConflictConfig) -> Self {
        self.conflict = section;
        self
    }

    /// Replace the final-loss section.
    #[must_use]
    pub fn with_final_losses(mut self, section: FinalLossConfig) -> Self {
        self.final_losses = section;
        self
    }

    /// Parse a configuration from TOML text. Missing keys take defaults.
    ///
    /// # Errors
    ///
    /// Returns [`AnalyzerError::ConfigParse`] if the text is not valid TOML
    /// for this schema.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| AnalyzerError::ConfigParse(format!("failed to parse config: {e}")))
    }

    /// Load a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Save the configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| AnalyzerError::ConfigParse(format!("failed to serialize config: {e}")))?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Validate all sections.
    ///
    /// # Errors
    ///
    /// Returns [`AnalyzerError::InvalidConfig`] for a zero stride, an empty
    /// tag, or `max_elements == Some(0)` (set through the builder).
    pub fn validate(&self) -> Result<()> {
        if self.total_gradient.every == 0 {
            return Err(AnalyzerError::invalid_config("total_gradient.every must be > 0"));
        }
        if self.total_gradient.tag.is_empty() {
            return Err(AnalyzerError::invalid_config("total_gradient.tag is required"));
        }

        if self.conflict.every == 0 {
            return Err(AnalyzerError::invalid_config("conflict.every must be > 0"));
        }
        if self.conflict.tag.is_empty() {
            return Err(AnalyzerError::invalid_config("conflict.tag is required"));
        }
        if self.conflict.max_elements == Some(0) {
            return Err(AnalyzerError::invalid_config(
                "conflict.max_elements must be > 0 when set",
            ));
        }

        if self.final_losses.every == 0 {
            return Err(AnalyzerError::invalid_config("final_losses.every must be > 0"));
        }
        if self.final_losses.tag_prefix.is_empty() {
            return Err(AnalyzerError::invalid_config("final_losses.tag_prefix is required"));
        }

        Ok(())
    }
}

/// `Option<usize>` encoded as a plain integer where `0` means "no limit".
mod truncation {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<usize>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.unwrap_or(0) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<usize>, D::Error> {
        let raw = u64::deserialize(deserializer)?;
        Ok(usize::try_from(raw).ok().filter(|&n| n > 0))
    }
}

/// Whether `step` falls on the logging stride. A zero stride never fires.
#[must_use]
pub(crate) const fn on_stride(step: u64, every: u64) -> bool {
    every != 0 && step % every == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = AnalyzerConfig::default();
        assert_eq!(config.total_gradient.every, 50);
        assert_eq!(config.total_gradient.tag, "train/grad");
        assert_eq!(config.conflict.every, 1000);
        assert_eq!(config.conflict.max_elements, Some(500_000));
        assert_eq!(config.conflict.mode, ConflictMode::Blockwise);
        assert!(config.conflict.include_text_tower);
        assert_eq!(config.final_losses.tag_prefix, "train/loss");
        assert!(!config.final_losses.mirror_to_tracker);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_stride() {
        let config = AnalyzerConfig::default()
            .with_conflict(ConflictConfig::default().with_every(0));
        assert!(matches!(
            config.validate(),
            Err(AnalyzerError::InvalidConfig(_))
        ));

        let config = AnalyzerConfig::default()
            .with_total_gradient(TotalGradientConfig::default().with_every(0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_truncation() {
        let config = AnalyzerConfig::default()
            .with_conflict(ConflictConfig::default().with_max_elements(Some(0)));
        assert!(config.validate().is_err());

        let config = AnalyzerConfig::default()
            .with_conflict(ConflictConfig::default().with_max_elements(None));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = AnalyzerConfig::from_toml_str(
            r#"
            [conflict]
            every = 10
            mode = "both"
            include_text_tower = false
            "#,
        )
        .unwrap();

        assert_eq!(config.conflict.every, 10);
        assert_eq!(config.conflict.mode, ConflictMode::Both);
        assert!(!config.conflict.include_text_tower);
        assert_eq!(config.conflict.tag, "train/losswise");
        assert_eq!(config.total_gradient, TotalGradientConfig::default());
    }

    #[test]
    fn test_bad_toml_is_parse_error() {
        let result = AnalyzerConfig::from_toml_str("[conflict]\nmode = \"sideways\"");
        assert!(matches!(result, Err(AnalyzerError::ConfigParse(_))));
    }

    #[test]
    fn test_file_round_trip() {
        let config = AnalyzerConfig::default()
            .with_final_losses(FinalLossConfig::default().with_tracker(true));
        let file = NamedTempFile::new().unwrap();

        config.to_file(file.path()).unwrap();
        let restored = AnalyzerConfig::from_file(file.path()).unwrap();
        assert_eq!(config, restored);
    }

    #[test]
    fn test_unlimited_truncation_round_trip() {
        let config = AnalyzerConfig::default()
            .with_conflict(ConflictConfig::default().with_max_elements(None));
        let file = NamedTempFile::new().unwrap();

        config.to_file(file.path()).unwrap();
        let text = std::fs::read_to_string(file.path()).unwrap();
        assert!(text.contains("max_elements = 0"));

        let restored = AnalyzerConfig::from_file(file.path()).unwrap();
        assert_eq!(restored.conflict.max_elements, None);
    }

    #[test]
    fn test_mode_scopes() {
        assert!(ConflictMode::Global.includes_global());
        assert!(!ConflictMode::Global.includes_blocks());
        assert!(ConflictMode::Blockwise.includes_blocks());
        assert!(ConflictMode::Both.includes_global() && ConflictMode::Both.includes_blocks());
    }

    #[test]
    fn test_on_stride() {
        assert!(on_stride(0, 50));
        assert!(on_stride(100, 50));
        assert!(!on_stride(101, 50));
        assert!(!on_stride(100, 0));
    }
}
