//! Time-variant weight matrix, one row per frame.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{ErrorContext, Result, SearchError};

/// Row-major weight matrix. Zero frames means time-invariant search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Vec<f64>>", into = "Vec<Vec<f64>>")]
pub struct Weights {
    frames: usize,
    dims: usize,
    data: Vec<f64>,
    /// Sum of the per-frame minima removed by [`Weights::subtract_frame_minima`].
    offset: f64,
}

impl Weights {
    /// Build from a flat row-major buffer.
    pub fn new(frames: usize, dims: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != frames * dims {
            return Err(SearchError::InvalidInput(format!(
                "weight buffer has {} values, expected {}x{}",
                data.len(),
                frames,
                dims
            )));
        }
        Ok(Self {
            frames,
            dims,
            data,
            offset: 0.0,
        })
    }

    /// Build from rows of equal length.
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self> {
        let frames = rows.len();
        let dims = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|r| r.len() != dims) {
            return Err(SearchError::InvalidInput("weight rows differ in length".to_string()));
        }
        Self::new(frames, dims, rows.into_iter().flatten().collect())
    }

    /// No frames: time-invariant search.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn is_time_invariant(&self) -> bool {
        self.frames == 0
    }

    /// Weight row of frame `f`.
    pub fn frame(&self, f: usize) -> Option<&[f64]> {
        if f < self.frames {
            Some(&self.data[f * self.dims..(f + 1) * self.dims])
        } else {
            None
        }
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    /// Subtract each row's minimum from the row and accumulate the minima.
    pub fn subtract_frame_minima(&mut self) {
        if self.dims == 0 {
            return;
        }
        for row in self.data.chunks_mut(self.dims) {
            let min = row.iter().copied().fold(f64::INFINITY, f64::min);
            if min.is_finite() {
                row.iter_mut().for_each(|w| *w -= min);
                self.offset += min;
            }
        }
    }
}

/// Minimum of a weight row.
pub fn row_minimum(row: &[f64]) -> f64 {
    let min = row.iter().copied().fold(f64::INFINITY, f64::min);
    if min.is_finite() {
        min
    } else {
        0.0
    }
}

impl TryFrom<Vec<Vec<f64>>> for Weights {
    type Error = SearchError;

    fn try_from(rows: Vec<Vec<f64>>) -> Result<Self> {
        Self::from_rows(rows)
    }
}

impl From<Weights> for Vec<Vec<f64>> {
    fn from(w: Weights) -> Self {
        if w.dims == 0 {
            return vec![Vec::new(); w.frames];
        }
        w.data.chunks(w.dims).map(<[f64]>::to_vec).collect()
    }
}
