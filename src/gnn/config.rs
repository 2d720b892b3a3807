//! Construction-time configuration for heads, layers and networks.

use crate::core::{Activation, Error, HeadOutput, MergeMode, Result};
use crate::nn::Dropout;
use serde::{Deserialize, Serialize};

/// Configuration of one diffusion attention head.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadConfig {
    /// Input feature width
    pub in_dim: usize,
    /// Output feature width (also the required relation embedding width)
    pub out_dim: usize,
    /// Number of propagation steps
    pub k: usize,
    /// Teleport probability of the PPR decay used to initialise `temp`
    pub alpha: f32,
    /// Activation of the last-hop branch, `None` to skip it
    pub activation: Option<Activation>,
    /// Layer-normalize the input before the residual projection
    pub layer_norm: bool,
    /// Batch-normalize the last-hop features
    pub batch_norm: bool,
    /// Add a residual projection of the input to the last-hop branch
    pub residual: bool,
    /// Dropout rate on normalized edge weights
    pub dropout: f32,
    /// Learn an `in_dim → out_dim` map in front of the diffusion
    pub project_input: bool,
    /// Which value the head returns
    pub output: HeadOutput,
    /// Width of the graph's relation embeddings, when known up front
    pub relation_dim: Option<usize>,
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            in_dim: 64,
            out_dim: 64,
            k: 3,
            alpha: 0.1,
            activation: Some(Activation::Elu),
            layer_norm: false,
            batch_norm: false,
            residual: false,
            dropout: 0.0,
            project_input: false,
            output: HeadOutput::Diffused,
            relation_dim: None,
        }
    }
}

impl HeadConfig {
    /// Check the configuration for errors that would surface mid-forward.
    pub fn validate(&self) -> Result<()> {
        if self.in_dim == 0 || self.out_dim == 0 {
            return Err(Error::InvalidConfig(format!(
                "feature widths must be positive, got in_dim={} out_dim={}",
                self.in_dim, self.out_dim
            )));
        }
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(Error::InvalidConfig(format!(
                "alpha must be in [0, 1], got {}",
                self.alpha
            )));
        }
        Dropout::new(self.dropout)?;

        // Diffusion keeps the width, so attention sees in_dim-wide features
        // unless they are projected first.
        if self.in_dim != self.out_dim && !self.project_input {
            return Err(Error::DimensionMismatch(format!(
                "in_dim {} differs from out_dim {} and project_input is disabled",
                self.in_dim, self.out_dim
            )));
        }
        if let Some(relation_dim) = self.relation_dim {
            if relation_dim != self.out_dim {
                return Err(Error::RelationWidthMismatch {
                    expected: self.out_dim,
                    actual: relation_dim,
                });
            }
        }
        Ok(())
    }
}

/// Configuration of a multi-head layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerConfig {
    pub head: HeadConfig,
    pub num_heads: usize,
    pub merge: MergeMode,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            head: HeadConfig::default(),
            num_heads: 1,
            merge: MergeMode::Concat,
        }
    }
}

impl LayerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_heads == 0 {
            return Err(Error::InvalidConfig("num_heads must be at least 1".to_string()));
        }
        self.head.validate()
    }
}

/// Configuration of the full stacked network.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Input node feature width
    pub num_feats: usize,
    /// Expected number of relation rows in the graph, 0 to skip the check
    pub num_rels: usize,
    pub num_hidden: usize,
    /// Output width of the last layer
    pub num_classes: usize,
    pub num_layers: usize,
    pub k: usize,
    pub alpha: f32,
    pub num_heads: usize,
    pub merge: MergeMode,
    pub activation: Option<Activation>,
    pub layer_norm: bool,
    pub batch_norm: bool,
    pub residual: bool,
    pub dropout: f32,
    pub project_input: bool,
    pub output: HeadOutput,
    pub relation_dim: Option<usize>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            num_feats: 64,
            num_rels: 0,
            num_hidden: 64,
            num_classes: 64,
            num_layers: 2,
            k: 3,
            alpha: 0.1,
            num_heads: 1,
            merge: MergeMode::Concat,
            activation: Some(Activation::Elu),
            layer_norm: false,
            batch_norm: false,
            residual: false,
            dropout: 0.5,
            project_input: false,
            output: HeadOutput::Diffused,
            relation_dim: None,
        }
    }
}

impl NetworkConfig {
    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// `(in_dim, out_dim)` of every layer in stacking order.
    ///
    /// The input layer (`num_feats → num_hidden`) and the output layer
    /// (`num_hidden → num_classes`) are always separate, so `num_layers = 1`
    /// builds the same two layers as `num_layers = 2`.
    pub fn layer_dims(&self) -> Vec<(usize, usize)> {
        match self.num_layers {
            0 => Vec::new(),
            n => {
                let n = n.max(2);
                let mut dims = Vec::with_capacity(n);
                dims.push((self.num_feats, self.num_hidden));
                dims.extend((1..n - 1).map(|_| (self.num_hidden, self.num_hidden)));
                dims.push((self.num_hidden, self.num_classes));
                dims
            }
        }
    }

    /// Per-layer configurations sharing every setting except the widths.
    pub fn layer_configs(&self) -> Vec<LayerConfig> {
        self.layer_dims()
            .into_iter()
            .map(|(in_dim, out_dim)| LayerConfig {
                head: HeadConfig {
                    in_dim,
                    out_dim,
                    k: self.k,
                    alpha: self.alpha,
                    activation: self.activation,
                    layer_norm: self.layer_norm,
                    batch_norm: self.batch_norm,
                    residual: self.residual,
                    dropout: self.dropout,
                    project_input: self.project_input,
                    output: self.output,
                    relation_dim: self.relation_dim,
                },
                num_heads: self.num_heads,
                merge: self.merge,
            })
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_layers == 0 {
            return Err(Error::InvalidConfig("num_layers must be at least 1".to_string()));
        }
        self.layer_configs().iter().try_for_each(LayerConfig::validate)
    }
}
