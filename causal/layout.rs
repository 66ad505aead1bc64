//! # First-Layer Group Layout
//!
//! Every sub-network's first layer maps the flattened lag window (one column
//! per (candidate series, lag) pair) to its hidden units. This module owns the
//! bookkeeping for that flattening: which columns belong to a candidate
//! series, and how those columns nest by lag cutoff. The penalty operators,
//! the causality extraction, and the support masks all index weights through
//! this layout, so the nesting here must match the order in which
//! `data::lagged_design` writes the window — a mismatch would silently break
//! the lag structure of the learned sparsity pattern.

use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Invalid hyperparameters or mismatched shapes. Raised before any state is
/// touched, so a failed call never leaves a partial update behind.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("series count must be at least 1, got {0}")]
    NoSeries(usize),
    #[error("lag window must be at least 1, got {0}")]
    NoLags(usize),
    #[error("the hidden layer width list must not be empty")]
    NoHiddenLayers,
    #[error("group penalty strength must be non-negative, got {0}")]
    NegativePenalty(f64),
    #[error("ridge penalty strength must be non-negative, got {0}")]
    NegativeRidge(f64),
    #[error("step size must be positive, got {0}")]
    NonPositiveStep(f64),
    #[error("learning rate must be positive, got {0}")]
    NonPositiveLearningRate(f64),
    #[error("line search shrink factor must lie strictly between 0 and 1, got {0}")]
    BadShrinkFactor(f64),
    #[error("step growth factor must be at least 1, got {0}")]
    BadGrowthFactor(f64),
    #[error("check interval must be at least 1")]
    ZeroCheckInterval,
    #[error("convergence tolerance must be non-negative, got {0}")]
    NegativeTolerance(f64),
    #[error("line search must be allowed at least 1 attempt")]
    NoLineSearchBudget,
    #[error("first layer has {got} input columns, layout expects {expected}")]
    FirstLayerShape { got: usize, expected: usize },
    #[error("series dimension mismatch: expected {expected}, got {got}")]
    SeriesMismatch { expected: usize, got: usize },
    #[error("sequence of length {len} leaves no usable rows for a lag window of {lag}")]
    SequenceTooShort { len: usize, lag: usize },
    #[error("forecast window must have shape ({lag}, {series}), got ({rows}, {cols})")]
    WindowShape {
        lag: usize,
        series: usize,
        rows: usize,
        cols: usize,
    },
    #[error("causality mask must be {expected}x{expected}, got {rows}x{cols}")]
    MaskShape {
        expected: usize,
        rows: usize,
        cols: usize,
    },
    #[error("support mask indexes column {column}, but the first layer has only {width} columns")]
    MaskLayoutMismatch { column: usize, width: usize },
    #[error("observation sequence contains a non-finite value at row {row}, column {col}")]
    NonFiniteData { row: usize, col: usize },
    #[error("edge fraction must lie in [0, 1], got {0}")]
    BadSparsity(f64),
    #[error("noise scale must be finite and non-negative, got {0}")]
    BadNoiseScale(f64),
    #[error("Lorenz-96 dynamics need at least 4 series, got {0}")]
    TooFewLorenzSeries(usize),
}

/// Order in which the lag window is flattened into first-layer columns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Flattening {
    /// All lags of series 0, then all lags of series 1, and so on.
    /// Groups and lag sub-groups are contiguous column ranges.
    SeriesMajor,
    /// All series at lag 1, then all series at lag 2, and so on.
    LagMajor,
}

/// Partition of the first-layer input columns into per-candidate-series
/// groups, each nested by lag cutoff. Pure index arithmetic; holds no weights.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupLayout {
    num_series: usize,
    max_lag: usize,
    flattening: Flattening,
}

impl GroupLayout {
    pub fn new(
        num_series: usize,
        max_lag: usize,
        flattening: Flattening,
    ) -> Result<Self, ConfigError> {
        if num_series == 0 {
            return Err(ConfigError::NoSeries(num_series));
        }
        if max_lag == 0 {
            return Err(ConfigError::NoLags(max_lag));
        }
        Ok(Self {
            num_series,
            max_lag,
            flattening,
        })
    }

    pub fn num_series(&self) -> usize {
        self.num_series
    }

    pub fn max_lag(&self) -> usize {
        self.max_lag
    }

    pub fn flattening(&self) -> Flattening {
        self.flattening
    }

    /// Total number of first-layer input columns.
    pub fn input_width(&self) -> usize {
        self.num_series * self.max_lag
    }

    /// Column carrying `series` at `lag` steps back (lag is 1-based; lag 1 is
    /// the most recent observation).
    pub fn column(&self, series: usize, lag: usize) -> usize {
        debug_assert!(series < self.num_series);
        debug_assert!(lag >= 1 && lag <= self.max_lag);
        match self.flattening {
            Flattening::SeriesMajor => series * self.max_lag + (lag - 1),
            Flattening::LagMajor => (lag - 1) * self.num_series + series,
        }
    }

    /// Candidate series owning `column`. Inverse of `column`.
    pub fn series_of(&self, column: usize) -> usize {
        debug_assert!(column < self.input_width());
        match self.flattening {
            Flattening::SeriesMajor => column / self.max_lag,
            Flattening::LagMajor => column % self.num_series,
        }
    }

    /// Every column of the group for `series`, lag ascending.
    pub fn group_columns(&self, series: usize) -> impl Iterator<Item = usize> {
        self.suffix_columns(series, 1)
    }

    /// Columns of the nested sub-group for lags `1..=lag_cutoff`.
    pub fn prefix_columns(&self, series: usize, lag_cutoff: usize) -> impl Iterator<Item = usize> {
        let me = *self;
        (1..=lag_cutoff).map(move |lag| me.column(series, lag))
    }

    /// Columns for lags `lag_cutoff..=max_lag`: the tail that the
    /// hierarchical proximal pass shrinks as one unit. The suffix for cutoff
    /// k+1 nests inside the suffix for cutoff k, mirroring the prefix
    /// nesting.
    pub fn suffix_columns(&self, series: usize, lag_cutoff: usize) -> impl Iterator<Item = usize> {
        let me = *self;
        (lag_cutoff..=me.max_lag).map(move |lag| me.column(series, lag))
    }

    /// Rejects a first-layer weight matrix whose input dimension disagrees
    /// with this layout.
    pub fn check_first_layer(&self, weights: ArrayView2<'_, f64>) -> Result<(), ConfigError> {
        if weights.ncols() != self.input_width() {
            return Err(ConfigError::FirstLayerShape {
                got: weights.ncols(),
                expected: self.input_width(),
            });
        }
        Ok(())
    }
}
