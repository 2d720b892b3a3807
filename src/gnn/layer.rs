//! Single-head diffusion attention layer.

use crate::core::{Error, HeadOutput, Matrix, Mode, Result};
use crate::gnn::attention::EdgeAttention;
use crate::gnn::config::HeadConfig;
use crate::gnn::diffusion::{Diffusion, DiffusionKernel, DiffusionTape, PropagationTrace};
use crate::graph::RelationalGraph;
use crate::nn::{
    calculate_gain, BatchNorm1d, Dropout, LayerNorm, Linear, NormCache, NormGrads, Nonlinearity,
};
use ndarray::{Array1, Zip};
use rand::Rng;
use tracing::debug;

/// Residual path from the (normalized) input to the head output width.
#[derive(Clone, Debug)]
pub enum ResidualMap {
    Identity,
    /// Bias-free `in_dim → out_dim` projection
    Projection(Linear),
}

impl ResidualMap {
    fn new<R: Rng + ?Sized>(in_dim: usize, out_dim: usize, rng: &mut R) -> Result<Self> {
        if in_dim == out_dim {
            return Ok(ResidualMap::Identity);
        }
        let mut fc = Linear::new(in_dim, out_dim, false, rng);
        fc.reset_xavier_normal(calculate_gain(Nonlinearity::Relu), rng)?;
        Ok(ResidualMap::Projection(fc))
    }

    pub fn forward(&self, x: &Matrix) -> Result<Matrix> {
        match self {
            ResidualMap::Identity => Ok(x.clone()),
            ResidualMap::Projection(fc) => fc.forward(x),
        }
    }
}

/// One attention head: edge attention + K-hop diffusion, with optional
/// input layer norm, batch norm, activation and residual on the last hop.
///
/// With [`HeadOutput::Diffused`] the head returns the diffusion accumulator
/// and the normalization/activation/residual branch only runs for its
/// batch-norm statistics. [`HeadOutput::Connected`] feeds the accumulator
/// through that branch instead and returns the result.
#[derive(Clone, Debug)]
pub struct SingleHeadGatLayer {
    config: HeadConfig,
    pub(crate) input_proj: Option<Linear>,
    pub(crate) attention: EdgeAttention,
    pub(crate) kernel: DiffusionKernel,
    pub(crate) layer_norm: Option<LayerNorm>,
    pub(crate) batch_norm: Option<BatchNorm1d>,
    pub(crate) residual: Option<ResidualMap>,
}

/// Values of a head forward pass kept for [`SingleHeadGatLayer::backward`].
#[derive(Clone, Debug, Default)]
pub struct HeadTape {
    input: Matrix,
    layer_norm: Option<NormCache>,
    /// Layer-normed input feeding the residual
    residual_input: Matrix,
    diffusion: DiffusionTape,
    /// Only recorded when the branch reaches the output
    branch: Option<BranchTape>,
}

impl HeadTape {
    pub fn diffusion(&self) -> &DiffusionTape {
        &self.diffusion
    }
}

#[derive(Clone, Debug, Default)]
struct BranchTape {
    batch_norm: Option<NormCache>,
    activation_input: Option<Matrix>,
}

/// Gradients of one head's parameters. Parameters the head does not own
/// are `None`.
#[derive(Clone, Debug)]
pub struct HeadGrads {
    pub temp: Array1<f32>,
    pub attn_fc: Linear,
    pub input_proj: Option<Linear>,
    pub residual: Option<Linear>,
    pub layer_norm: Option<NormGrads>,
    pub batch_norm: Option<NormGrads>,
}

impl SingleHeadGatLayer {
    pub fn new(config: HeadConfig) -> Result<Self> {
        Self::with_rng(config, &mut rand::thread_rng())
    }

    pub fn with_rng<R: Rng + ?Sized>(config: HeadConfig, rng: &mut R) -> Result<Self> {
        config.validate()?;
        let (in_dim, out_dim) = (config.in_dim, config.out_dim);

        let input_proj = if config.project_input {
            Some(Linear::new(in_dim, out_dim, true, rng))
        } else {
            None
        };
        let attention = EdgeAttention::new(out_dim, rng)?;
        let residual = if config.residual {
            Some(ResidualMap::new(in_dim, out_dim, rng)?)
        } else {
            None
        };

        Ok(Self {
            input_proj,
            attention,
            kernel: DiffusionKernel::new(config.k, config.alpha)
                .with_dropout(Dropout::new(config.dropout)?),
            layer_norm: config.layer_norm.then(|| LayerNorm::new(in_dim)),
            batch_norm: config.batch_norm.then(|| BatchNorm1d::new(out_dim)),
            residual,
            config,
        })
    }

    pub fn config(&self) -> &HeadConfig {
        &self.config
    }

    pub fn in_dim(&self) -> usize {
        self.config.in_dim
    }

    pub fn out_dim(&self) -> usize {
        self.config.out_dim
    }

    /// Learned hop coefficients.
    pub fn temp(&self) -> &ndarray::Array1<f32> {
        &self.kernel.temp
    }

    pub fn kernel_mut(&mut self) -> &mut DiffusionKernel {
        &mut self.kernel
    }

    pub fn attention(&self) -> &EdgeAttention {
        &self.attention
    }

    /// Forward pass; training dropout draws from the thread RNG.
    pub fn forward(
        &self,
        graph: &RelationalGraph,
        features: &Matrix,
        mode: Mode,
    ) -> Result<Matrix> {
        self.run(graph, features, mode, &mut rand::thread_rng(), None)
    }

    pub fn forward_with_rng<R: Rng + ?Sized>(
        &self,
        graph: &RelationalGraph,
        features: &Matrix,
        mode: Mode,
        rng: &mut R,
    ) -> Result<Matrix> {
        self.run(graph, features, mode, rng, None)
    }

    /// Forward pass that also returns the edge weights used at each hop.
    pub fn forward_traced(
        &self,
        graph: &RelationalGraph,
        features: &Matrix,
        mode: Mode,
    ) -> Result<(Matrix, PropagationTrace)> {
        let (out, tape) = self.forward_recorded(graph, features, mode, &mut rand::thread_rng())?;
        Ok((out, tape.diffusion.trace()))
    }

    /// Forward pass that keeps what [`backward`](Self::backward) needs.
    pub fn forward_recorded<R: Rng + ?Sized>(
        &self,
        graph: &RelationalGraph,
        features: &Matrix,
        mode: Mode,
        rng: &mut R,
    ) -> Result<(Matrix, HeadTape)> {
        let mut tape = HeadTape::default();
        let out = self.run(graph, features, mode, rng, Some(&mut tape))?;
        Ok((out, tape))
    }

    fn run<R: Rng + ?Sized>(
        &self,
        graph: &RelationalGraph,
        features: &Matrix,
        mode: Mode,
        rng: &mut R,
        mut tape: Option<&mut HeadTape>,
    ) -> Result<Matrix> {
        if features.ncols() != self.in_dim() || features.nrows() != graph.num_nodes() {
            return Err(Error::shape(
                "head input",
                &[graph.num_nodes(), self.in_dim()],
                features.shape(),
            ));
        }

        let (h_tilde, ln_cache) = match &self.layer_norm {
            Some(ln) => {
                let (h, cache) = ln.forward_cached(features)?;
                (h, Some(cache))
            }
            None => (features.clone(), None),
        };
        let x = match &self.input_proj {
            Some(fc) => fc.forward(features)?,
            None => features.clone(),
        };

        let Diffusion {
            accumulated,
            last_hop,
        } = self.kernel.propagate(
            graph,
            x,
            &self.attention,
            mode,
            rng,
            tape.as_deref_mut().map(|t| &mut t.diffusion),
        )?;
        debug!(k = self.kernel.k(), nodes = graph.num_nodes(), "head diffused");

        let (out, branch) = match self.config.output {
            HeadOutput::Diffused => {
                // Still run for the batch-norm statistics; the value is dropped.
                self.branch(last_hop, &h_tilde, mode)?;
                (accumulated, None)
            }
            HeadOutput::Connected => {
                let (h, branch) = self.branch(accumulated, &h_tilde, mode)?;
                (h, Some(branch))
            }
        };

        if let Some(tape) = tape {
            tape.input = features.clone();
            tape.layer_norm = ln_cache;
            tape.residual_input = h_tilde;
            tape.branch = branch;
        }
        Ok(out)
    }

    fn branch(&self, mut h: Matrix, h_tilde: &Matrix, mode: Mode) -> Result<(Matrix, BranchTape)> {
        let mut tape = BranchTape::default();
        if let Some(bn) = &self.batch_norm {
            let (out, cache) = bn.forward_cached(&h, mode)?;
            h = out;
            tape.batch_norm = Some(cache);
        }
        if let Some(act) = self.config.activation {
            let out = act.apply_matrix(&h);
            tape.activation_input = Some(std::mem::replace(&mut h, out));
        }
        if let Some(res) = &self.residual {
            h += &res.forward(h_tilde)?;
        }
        Ok((h, tape))
    }

    /// Zero gradients shaped like this head's parameters.
    pub fn zero_grads(&self) -> HeadGrads {
        HeadGrads {
            temp: Array1::zeros(self.kernel.temp.len()),
            attn_fc: self.attention.fc.zeros_like(),
            input_proj: self.input_proj.as_ref().map(Linear::zeros_like),
            residual: match &self.residual {
                Some(ResidualMap::Projection(fc)) => Some(fc.zeros_like()),
                _ => None,
            },
            layer_norm: self.layer_norm.as_ref().map(|ln| NormGrads::zeros(ln.dim())),
            batch_norm: self.batch_norm.as_ref().map(|bn| NormGrads::zeros(bn.dim())),
        }
    }

    /// Gradients of a recorded forward pass for `grad_output`, the gradient of
    /// the head output.
    ///
    /// Relation embedding gradients are added into `grad_relations`. Returns
    /// the parameter gradients and the gradient w.r.t. the input features.
    pub fn backward(
        &self,
        graph: &RelationalGraph,
        tape: &HeadTape,
        grad_output: &Matrix,
        grad_relations: &mut Matrix,
    ) -> Result<(HeadGrads, Matrix)> {
        let expected = [tape.input.nrows(), self.out_dim()];
        if grad_output.shape() != expected.as_slice() {
            return Err(Error::shape("head output gradient", &expected, grad_output.shape()));
        }
        let mut grads = self.zero_grads();
        let mut grad_features = Matrix::zeros(tape.input.raw_dim());

        let grad_accumulated = match &tape.branch {
            None => grad_output.clone(),
            Some(branch) => {
                if let Some(res) = &self.residual {
                    let grad_tilde = match res {
                        ResidualMap::Identity => grad_output.clone(),
                        ResidualMap::Projection(fc) => {
                            let mut g = fc.zeros_like();
                            let dx = fc.backward(&tape.residual_input, grad_output, &mut g)?;
                            grads.residual = Some(g);
                            dx
                        }
                    };
                    match (&self.layer_norm, &tape.layer_norm) {
                        (Some(ln), Some(cache)) => {
                            let (dx, g) = ln.backward(cache, &grad_tilde)?;
                            grads.layer_norm = Some(g);
                            grad_features += &dx;
                        }
                        (None, None) => grad_features += &grad_tilde,
                        _ => return Err(Error::TapeMismatch("layer norm".to_string())),
                    }
                }
                self.branch_backward(branch, grad_output.clone(), &mut grads)?
            }
        };

        let diffusion = self.kernel.backward(
            graph,
            &self.attention,
            &tape.diffusion,
            &grad_accumulated,
            &mut grads.attn_fc,
            grad_relations,
        )?;
        grads.temp = diffusion.temp;
        match &self.input_proj {
            Some(fc) => {
                let mut g = fc.zeros_like();
                grad_features += &fc.backward(&tape.input, &diffusion.features, &mut g)?;
                grads.input_proj = Some(g);
            }
            None => grad_features += &diffusion.features,
        }
        Ok((grads, grad_features))
    }

    /// Back through the activation and batch norm of the branch.
    fn branch_backward(
        &self,
        tape: &BranchTape,
        mut grad: Matrix,
        grads: &mut HeadGrads,
    ) -> Result<Matrix> {
        match (self.config.activation, &tape.activation_input) {
            (Some(act), Some(pre)) => {
                Zip::from(&mut grad)
                    .and(pre)
                    .for_each(|g, &x| *g *= act.derivative(x));
            }
            (None, None) => {}
            _ => return Err(Error::TapeMismatch("activation".to_string())),
        }
        match (&self.batch_norm, &tape.batch_norm) {
            (Some(bn), Some(cache)) => {
                let (dx, g) = bn.backward(cache, &grad)?;
                grads.batch_norm = Some(g);
                Ok(dx)
            }
            (None, None) => Ok(grad),
            _ => Err(Error::TapeMismatch("batch norm".to_string())),
        }
    }
}
