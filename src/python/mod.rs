use crate::core::{Matrix, Mode};
use crate::gnn::{GatNet, NetworkConfig, ParameterSet};
use crate::graph::RelationalGraph;
use crate::monitoring::{self, LoggerConfig};
use ndarray::Array2;
use pyo3::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use pyo3::types::PyBytes;

fn value_error(e: impl ToString) -> PyErr {
    PyErr::new::<pyo3::exceptions::PyValueError, _>(e.to_string())
}

fn to_matrix(rows: Vec<Vec<f32>>, what: &str) -> PyResult<Matrix> {
    let n = rows.len();
    let width = rows.first().map_or(0, Vec::len);
    if rows.iter().any(|r| r.len() != width) {
        return Err(value_error(format!("{} rows have different lengths", what)));
    }
    let flat: Vec<f32> = rows.into_iter().flatten().collect();
    Array2::from_shape_vec((n, width), flat).map_err(value_error)
}

fn from_matrix(m: &Matrix) -> Vec<Vec<f32>> {
    m.rows().into_iter().map(|r| r.to_vec()).collect()
}

fn seeded(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

fn mode(training: bool) -> Mode {
    if training {
        Mode::Training
    } else {
        Mode::Inference
    }
}

// --- Graph Bindings ---

#[pyclass(name = "RelationalGraph")]
pub struct PyRelationalGraph {
    inner: RelationalGraph,
}

#[pymethods]
impl PyRelationalGraph {
    #[new]
    fn new(
        num_nodes: usize,
        src: Vec<usize>,
        rel: Vec<usize>,
        dst: Vec<usize>,
        relation_embeddings: Vec<Vec<f32>>,
    ) -> PyResult<Self> {
        if src.len() != rel.len() || src.len() != dst.len() {
            return Err(value_error("src, rel and dst must have the same length"));
        }
        let edges: Vec<(usize, usize, usize)> = src
            .into_iter()
            .zip(rel)
            .zip(dst)
            .map(|((s, r), d)| (s, r, d))
            .collect();
        let table = to_matrix(relation_embeddings, "relation_embeddings")?;
        let inner = RelationalGraph::new(num_nodes, &edges, table, None).map_err(value_error)?;
        Ok(PyRelationalGraph { inner })
    }

    #[getter]
    fn num_nodes(&self) -> usize {
        self.inner.num_nodes()
    }

    #[getter]
    fn num_edges(&self) -> usize {
        self.inner.num_edges()
    }
}

// --- Model Bindings ---

#[pyclass(name = "GatNet")]
pub struct PyGatNet {
    inner: GatNet,
}

#[pymethods]
impl PyGatNet {
    #[new]
    fn new(config_json: &str) -> PyResult<Self> {
        let config = NetworkConfig::from_json(config_json).map_err(value_error)?;
        let inner = GatNet::new(config).map_err(value_error)?;
        Ok(PyGatNet { inner })
    }

    #[pyo3(signature = (graph, features, training, seed=None))]
    fn forward(
        &self,
        graph: PyRef<'_, PyRelationalGraph>,
        features: Vec<Vec<f32>>,
        training: bool,
        seed: Option<u64>,
    ) -> PyResult<Vec<Vec<f32>>> {
        let x = to_matrix(features, "features")?;
        let out = self
            .inner
            .forward_with_rng(&graph.inner, &x, mode(training), &mut seeded(seed))
            .map_err(value_error)?;
        Ok(from_matrix(&out))
    }

    /// Returns `(output, parameter gradient bytes, feature gradients,
    /// relation embedding gradients)` for `Σ grad_output ⊙ output`.
    #[pyo3(signature = (graph, features, grad_output, training, seed=None))]
    fn backward(
        &self,
        py: Python,
        graph: PyRef<'_, PyRelationalGraph>,
        features: Vec<Vec<f32>>,
        grad_output: Vec<Vec<f32>>,
        training: bool,
        seed: Option<u64>,
    ) -> PyResult<(Vec<Vec<f32>>, PyObject, Vec<Vec<f32>>, Vec<Vec<f32>>)> {
        let x = to_matrix(features, "features")?;
        let upstream = to_matrix(grad_output, "grad_output")?;
        let (out, tape) = self
            .inner
            .forward_recorded(&graph.inner, &x, mode(training), &mut seeded(seed))
            .map_err(value_error)?;
        let grads = self
            .inner
            .backward(&graph.inner, &tape, &upstream)
            .map_err(value_error)?;
        let bytes = grads.params.to_bytes().map_err(value_error)?;
        Ok((
            from_matrix(&out),
            PyBytes::new(py, &bytes).into(),
            from_matrix(&grads.features),
            from_matrix(&grads.relation_embeddings),
        ))
    }

    fn config_json(&self) -> PyResult<String> {
        self.inner.config().to_json().map_err(value_error)
    }

    fn parameters(&self, py: Python) -> PyResult<PyObject> {
        let bytes = self.inner.parameters().to_bytes().map_err(value_error)?;
        Ok(PyBytes::new(py, &bytes).into())
    }

    fn load_parameters(&mut self, bytes: Vec<u8>) -> PyResult<()> {
        let set = ParameterSet::from_bytes(&bytes).map_err(value_error)?;
        self.inner.load_parameters(&set).map_err(value_error)
    }
}

// --- Module ---

#[pyfunction]
fn init_logging(config_json: Option<&str>) -> PyResult<bool> {
    let config = match config_json {
        Some(json) => serde_json::from_str(json).map_err(value_error)?,
        None => LoggerConfig::default(),
    };
    Ok(monitoring::init(&config))
}

#[pymodule]
fn diffgat(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<PyRelationalGraph>()?;
    m.add_class::<PyGatNet>()?;
    m.add_function(wrap_pyfunction!(init_logging, m)?)?;
    Ok(())
}
