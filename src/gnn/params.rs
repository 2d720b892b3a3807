//! Named parameter snapshots.
//!
//! The training loop lives outside this crate. It reads the weights through
//! [`GatNet::parameters`], updates them, and writes them back with
//! [`GatNet::load_parameters`]. Snapshots encode to bincode or JSON.

use crate::core::{Error, Result};
use crate::gnn::layer::{HeadGrads, ResidualMap, SingleHeadGatLayer};
use crate::gnn::multihead::{GatLayer, LayerGrads};
use crate::gnn::network::GatNet;
use crate::nn::{BatchNorm1d, LayerNorm, Linear, NormGrads, RunningStats};
use ndarray::{Array, Array1, Array2, Dimension, IntoDimension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Dense tensor in row-major order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn from_array<D: Dimension>(array: &Array<f32, D>) -> Self {
        Self {
            shape: array.shape().to_vec(),
            data: array.iter().copied().collect(),
        }
    }

    fn into_array<D: Dimension>(self, name: &str, shape: D) -> Result<Array<f32, D>> {
        if self.shape != shape.slice() {
            return Err(Error::shape(name, shape.slice(), &self.shape));
        }
        Array::from_shape_vec(shape, self.data)
            .map_err(|e| Error::DeserializationError(format!("{}: {}", name, e)))
    }
}

/// Ordered map from parameter name to tensor.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    tensors: BTreeMap<String, Tensor>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<D: Dimension>(&mut self, name: impl Into<String>, array: &Array<f32, D>) {
        self.tensors.insert(name.into(), Tensor::from_array(array));
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Tensor> {
        self.tensors.get_mut(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Total number of scalar values.
    pub fn num_values(&self) -> usize {
        self.tensors.values().map(|t| t.data.len()).sum()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::DeserializationError(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Write the bincode encoding to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_bytes(&std::fs::read(path)?)
    }

    fn take<D: Dimension>(
        &self,
        name: &str,
        shape: impl IntoDimension<Dim = D>,
    ) -> Result<Array<f32, D>> {
        self.get(name)
            .cloned()
            .ok_or_else(|| Error::MissingParameter(name.to_string()))?
            .into_array(name, shape.into_dimension())
    }

    fn take_vec(&self, name: &str, len: usize) -> Result<Array1<f32>> {
        self.take(name, len)
    }

    fn take_matrix(&self, name: &str, rows: usize, cols: usize) -> Result<Array2<f32>> {
        self.take(name, (rows, cols))
    }
}

/// Export and import of named parameters under a prefix.
pub trait Parameterized {
    fn export(&self, prefix: &str, set: &mut ParameterSet);

    /// Replace parameters from `set`; shapes must match the current ones.
    fn import(&mut self, prefix: &str, set: &ParameterSet) -> Result<()>;
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

impl Parameterized for Linear {
    fn export(&self, prefix: &str, set: &mut ParameterSet) {
        set.insert(join(prefix, "weight"), &self.weight);
        if let Some(b) = &self.bias {
            set.insert(join(prefix, "bias"), b);
        }
    }

    fn import(&mut self, prefix: &str, set: &ParameterSet) -> Result<()> {
        let (rows, cols) = self.weight.dim();
        let weight = set.take_matrix(&join(prefix, "weight"), rows, cols)?;
        let bias = match &self.bias {
            Some(b) => Some(set.take_vec(&join(prefix, "bias"), b.len())?),
            None => None,
        };
        self.weight = weight;
        self.bias = bias;
        Ok(())
    }
}

impl Parameterized for LayerNorm {
    fn export(&self, prefix: &str, set: &mut ParameterSet) {
        set.insert(join(prefix, "weight"), &self.gamma);
        set.insert(join(prefix, "bias"), &self.beta);
    }

    fn import(&mut self, prefix: &str, set: &ParameterSet) -> Result<()> {
        let gamma = set.take_vec(&join(prefix, "weight"), self.dim())?;
        let beta = set.take_vec(&join(prefix, "bias"), self.dim())?;
        self.gamma = gamma;
        self.beta = beta;
        Ok(())
    }
}

impl Parameterized for BatchNorm1d {
    fn export(&self, prefix: &str, set: &mut ParameterSet) {
        set.insert(join(prefix, "weight"), &self.gamma);
        set.insert(join(prefix, "bias"), &self.beta);
        let stats = self.running_stats();
        set.insert(join(prefix, "running_mean"), &stats.mean);
        set.insert(join(prefix, "running_var"), &stats.var);
    }

    fn import(&mut self, prefix: &str, set: &ParameterSet) -> Result<()> {
        let dim = self.dim();
        let gamma = set.take_vec(&join(prefix, "weight"), dim)?;
        let beta = set.take_vec(&join(prefix, "bias"), dim)?;
        let stats = RunningStats {
            mean: set.take_vec(&join(prefix, "running_mean"), dim)?,
            var: set.take_vec(&join(prefix, "running_var"), dim)?,
        };
        self.set_running_stats(stats)?;
        self.gamma = gamma;
        self.beta = beta;
        Ok(())
    }
}

impl Parameterized for SingleHeadGatLayer {
    fn export(&self, prefix: &str, set: &mut ParameterSet) {
        set.insert(join(prefix, "temp"), &self.kernel.temp);
        self.attention.fc.export(&join(prefix, "attn_fc"), set);
        if let Some(fc) = &self.input_proj {
            fc.export(&join(prefix, "fc"), set);
        }
        if let Some(ResidualMap::Projection(fc)) = &self.residual {
            fc.export(&join(prefix, "res_fc"), set);
        }
        if let Some(ln) = &self.layer_norm {
            ln.export(&join(prefix, "ln"), set);
        }
        if let Some(bn) = &self.batch_norm {
            bn.export(&join(prefix, "bn"), set);
        }
    }

    fn import(&mut self, prefix: &str, set: &ParameterSet) -> Result<()> {
        self.kernel.temp = set.take_vec(&join(prefix, "temp"), self.kernel.k() + 1)?;
        self.attention.fc.import(&join(prefix, "attn_fc"), set)?;
        if let Some(fc) = &mut self.input_proj {
            fc.import(&join(prefix, "fc"), set)?;
        }
        if let Some(ResidualMap::Projection(fc)) = &mut self.residual {
            fc.import(&join(prefix, "res_fc"), set)?;
        }
        if let Some(ln) = &mut self.layer_norm {
            ln.import(&join(prefix, "ln"), set)?;
        }
        if let Some(bn) = &mut self.batch_norm {
            bn.import(&join(prefix, "bn"), set)?;
        }
        Ok(())
    }
}

impl Parameterized for GatLayer {
    fn export(&self, prefix: &str, set: &mut ParameterSet) {
        self.wo.export(&join(prefix, "wo"), set);
        for (i, head) in self.heads.iter().enumerate() {
            head.export(&join(prefix, &format!("heads.{}", i)), set);
        }
    }

    fn import(&mut self, prefix: &str, set: &ParameterSet) -> Result<()> {
        self.wo.import(&join(prefix, "wo"), set)?;
        for (i, head) in self.heads.iter_mut().enumerate() {
            head.import(&join(prefix, &format!("heads.{}", i)), set)?;
        }
        Ok(())
    }
}

impl Parameterized for GatNet {
    fn export(&self, prefix: &str, set: &mut ParameterSet) {
        for (i, layer) in self.layers.iter().enumerate() {
            layer.export(&join(prefix, &format!("layers.{}", i)), set);
        }
    }

    fn import(&mut self, prefix: &str, set: &ParameterSet) -> Result<()> {
        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.import(&join(prefix, &format!("layers.{}", i)), set)?;
        }
        Ok(())
    }
}

impl GatNet {
    /// Snapshot of every parameter and running statistic.
    pub fn parameters(&self) -> ParameterSet {
        let mut set = ParameterSet::new();
        self.export("", &mut set);
        set
    }

    /// Load a snapshot taken from a network with the same configuration.
    ///
    /// On error the network may be partially updated.
    pub fn load_parameters(&mut self, set: &ParameterSet) -> Result<()> {
        self.import("", set)
    }
}

impl NormGrads {
    pub fn export(&self, prefix: &str, set: &mut ParameterSet) {
        set.insert(join(prefix, "weight"), &self.gamma);
        set.insert(join(prefix, "bias"), &self.beta);
    }
}

impl HeadGrads {
    /// Export under the names [`SingleHeadGatLayer`] uses for its parameters.
    pub fn export(&self, prefix: &str, set: &mut ParameterSet) {
        set.insert(join(prefix, "temp"), &self.temp);
        self.attn_fc.export(&join(prefix, "attn_fc"), set);
        if let Some(fc) = &self.input_proj {
            fc.export(&join(prefix, "fc"), set);
        }
        if let Some(fc) = &self.residual {
            fc.export(&join(prefix, "res_fc"), set);
        }
        if let Some(ln) = &self.layer_norm {
            ln.export(&join(prefix, "ln"), set);
        }
        if let Some(bn) = &self.batch_norm {
            bn.export(&join(prefix, "bn"), set);
        }
    }
}

impl LayerGrads {
    pub fn export(&self, prefix: &str, set: &mut ParameterSet) {
        self.wo.export(&join(prefix, "wo"), set);
        for (i, head) in self.heads.iter().enumerate() {
            head.export(&join(prefix, &format!("heads.{}", i)), set);
        }
    }
}
