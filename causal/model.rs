//! # Componentwise Autoregressive Model
//!
//! One small multilayer perceptron per target series, each reading the full
//! flattened lag window of every series. The sub-networks share nothing: a
//! candidate series can be pruned from one target's first layer while staying
//! active for another, which is exactly the asymmetry Granger structure
//! needs. This module also owns the saved-model artifact (TOML, like every
//! other artifact this crate writes).

use crate::layout::{ConfigError, Flattening, GroupLayout};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::distributions::Uniform;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write as _};
use std::path::Path;
use thiserror::Error;

/// Structural hyperparameters, fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Number of observed series; also the number of sub-networks.
    pub num_series: usize,
    /// Longest lag considered causal.
    pub lag: usize,
    /// Hidden layer widths shared by every sub-network.
    pub hidden: Vec<usize>,
    /// How the lag window flattens into first-layer columns.
    pub flattening: Flattening,
}

impl ModelConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hidden.is_empty() {
            return Err(ConfigError::NoHiddenLayers);
        }
        // GroupLayout::new re-checks the series/lag counts.
        self.layout().map(|_| ())
    }

    pub fn layout(&self) -> Result<GroupLayout, ConfigError> {
        GroupLayout::new(self.num_series, self.lag, self.flattening)
    }
}

/// One dense layer: `out = input . weight^T + bias`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dense {
    /// Shape (fan_out, fan_in).
    pub weight: Array2<f64>,
    pub bias: Array1<f64>,
}

impl Dense {
    fn init(fan_out: usize, fan_in: usize, rng: &mut StdRng) -> Self {
        // Uniform fan-in bound, the usual dense-layer default.
        let bound = (1.0 / fan_in as f64).sqrt();
        let dist = Uniform::new(-bound, bound);
        Self {
            weight: Array2::from_shape_fn((fan_out, fan_in), |_| rng.sample(dist)),
            bias: Array1::from_shape_fn(fan_out, |_| rng.sample(dist)),
        }
    }

    pub(crate) fn zeros_like(other: &Dense) -> Self {
        Self {
            weight: Array2::zeros(other.weight.raw_dim()),
            bias: Array1::zeros(other.bias.raw_dim()),
        }
    }
}

/// The sub-network for a single target series: dense layers with ReLU
/// between them and a scalar linear output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesMlp {
    pub layers: Vec<Dense>,
}

impl SeriesMlp {
    fn init(input_width: usize, hidden: &[usize], rng: &mut StdRng) -> Self {
        let mut layers = Vec::with_capacity(hidden.len() + 1);
        let mut fan_in = input_width;
        for &width in hidden {
            layers.push(Dense::init(width, fan_in, rng));
            fan_in = width;
        }
        layers.push(Dense::init(1, fan_in, rng));
        Self { layers }
    }

    /// First-layer weight matrix, the only tensor the group penalty touches.
    pub fn first_layer(&self) -> &Array2<f64> {
        &self.layers[0].weight
    }

    pub fn first_layer_mut(&mut self) -> &mut Array2<f64> {
        &mut self.layers[0].weight
    }

    /// One-step-ahead predictions for a batch of flattened lag windows
    /// (rows of `inputs`).
    pub fn forward_batch(&self, inputs: ArrayView2<'_, f64>) -> Array1<f64> {
        let last = self.layers.len() - 1;
        let first = &self.layers[0];
        let mut activation = inputs.dot(&first.weight.t()) + &first.bias;
        if last > 0 {
            activation.mapv_inplace(relu);
        }
        for (idx, layer) in self.layers.iter().enumerate().skip(1) {
            activation = activation.dot(&layer.weight.t()) + &layer.bias;
            if idx < last {
                activation.mapv_inplace(relu);
            }
        }
        activation.index_axis_move(Axis(1), 0)
    }
}

pub(crate) fn relu(z: f64) -> f64 {
    z.max(0.0)
}

/// The full componentwise model: configuration, layout, and one `SeriesMlp`
/// per target series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CMlp {
    pub config: ModelConfig,
    pub layout: GroupLayout,
    pub networks: Vec<SeriesMlp>,
}

/// Errors raised while persisting or restoring a model artifact.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("failed to read or write model file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML model file: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("failed to serialize model to TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl CMlp {
    /// Builds a freshly initialized model. The same `seed` always yields the
    /// same parameters, independent of platform.
    pub fn new(config: ModelConfig, seed: u64) -> Result<Self, ConfigError> {
        config.validate()?;
        let layout = config.layout()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let networks = (0..config.num_series)
            .map(|_| SeriesMlp::init(layout.input_width(), &config.hidden, &mut rng))
            .collect();
        Ok(Self {
            config,
            layout,
            networks,
        })
    }

    /// One-step-ahead forecast for every series from a trailing window of
    /// `lag` rows (oldest first), one column per series.
    pub fn forecast(&self, window: ArrayView2<'_, f64>) -> Result<Array1<f64>, ConfigError> {
        let lag = self.config.lag;
        let p = self.config.num_series;
        if window.nrows() != lag || window.ncols() != p {
            return Err(ConfigError::WindowShape {
                lag,
                series: p,
                rows: window.nrows(),
                cols: window.ncols(),
            });
        }
        let mut flat = Array2::zeros((1, self.layout.input_width()));
        for j in 0..p {
            for k in 1..=lag {
                flat[[0, self.layout.column(j, k)]] = window[[lag - k, j]];
            }
        }
        let mut prediction = Array1::zeros(p);
        for (i, net) in self.networks.iter().enumerate() {
            prediction[i] = net.forward_batch(flat.view())[0];
        }
        Ok(prediction)
    }

    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        Ok(toml::from_str(&toml_string)?)
    }
}
