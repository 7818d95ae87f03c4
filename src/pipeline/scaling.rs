use ndarray::{Array1, Array2, ArrayView2, Axis};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScaleError {
    #[error("cannot fit a scaler on an empty matrix")]
    Empty,

    #[error("column {column} has no non-null values")]
    AllNull { column: usize },
}

/// Z-score standardization with missing values encoded as NaN.
///
/// Means and population standard deviations are computed over the non-NaN
/// entries of each column. A constant column keeps a scale of 1, and NaN
/// entries become 0.0 (the column mean) after transformation.
#[derive(Debug, Clone, PartialEq)]
pub struct StandardScaler {
    mean: Array1<f64>,
    scale: Array1<f64>,
}

impl StandardScaler {
    pub fn fit(data: ArrayView2<'_, f64>) -> Result<Self, ScaleError> {
        if data.nrows() == 0 || data.ncols() == 0 {
            return Err(ScaleError::Empty);
        }

        let mut mean = Array1::zeros(data.ncols());
        let mut scale = Array1::ones(data.ncols());
        for (column, values) in data.axis_iter(Axis(1)).enumerate() {
            let present: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
            if present.is_empty() {
                return Err(ScaleError::AllNull { column });
            }
            let n = present.len() as f64;
            let m = present.iter().sum::<f64>() / n;
            let variance = present.iter().map(|v| (v - m).powi(2)).sum::<f64>() / n;
            let std = variance.sqrt();

            mean[column] = m;
            if std > 0.0 && std.is_finite() {
                scale[column] = std;
            }
        }
        Ok(Self { mean, scale })
    }

    pub fn transform(&self, data: ArrayView2<'_, f64>) -> Array2<f64> {
        let mut out = data.to_owned();
        for (column, mut values) in out.axis_iter_mut(Axis(1)).enumerate() {
            let (m, s) = (self.mean[column], self.scale[column]);
            values.mapv_inplace(|v| if v.is_nan() { 0.0 } else { (v - m) / s });
        }
        out
    }

    pub fn fit_transform(data: ArrayView2<'_, f64>) -> Result<Array2<f64>, ScaleError> {
        Ok(Self::fit(data)?.transform(data))
    }

    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    pub fn scale(&self) -> &Array1<f64> {
        &self.scale
    }
}
