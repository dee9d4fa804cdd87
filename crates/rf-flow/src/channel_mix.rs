//! Invertible channel mixing (learned 1x1 convolution)
//!
//! `y[b] = W · x[b]` at every time step. The Jacobian of the whole sequence is
//! block-diagonal with `L` copies of `W`, so one batch element contributes
//! `L · log|det W|` to the log-likelihood.

use nalgebra::{DMatrix, SVD};
use ndarray::{Array2, Array3, ArrayView3, Axis};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::error::{FlowError, FlowResult};
use crate::tensor::expect_channels;

/// Smallest accepted `σ_min / σ_max`, per channel; the mix runs in f32
const CONDITION_EPSILON: f64 = f32::EPSILON as f64;

/// Sweep cap for the singular value decomposition
const SVD_MAX_ITERATIONS: usize = 1_000;

/// Learned invertible `c x c` channel mix
#[derive(Debug, Clone)]
pub struct InvertibleChannelMix {
    weight: Array2<f32>,
}

impl InvertibleChannelMix {
    /// Random orthonormal init with determinant +1
    pub fn new<R: Rng + ?Sized>(channels: usize, rng: &mut R) -> FlowResult<Self> {
        if channels == 0 {
            return Err(FlowError::Configuration(
                "channel mix needs at least one channel".into(),
            ));
        }

        let gaussian = DMatrix::<f64>::from_fn(channels, channels, |_, _| {
            StandardNormal.sample(&mut *rng)
        });
        let mut q = gaussian.qr().q();
        if q.determinant() < 0.0 {
            // reflection -> rotation
            for v in q.column_mut(0).iter_mut() {
                *v = -*v;
            }
        }

        let weight = Array2::from_shape_fn((channels, channels), |(i, j)| q[(i, j)] as f32);
        Ok(Self { weight })
    }

    /// Build from an explicit matrix (validated like any update)
    pub fn from_weight(weight: Array2<f32>) -> FlowResult<Self> {
        Self::validate(&weight)?;
        Ok(Self { weight })
    }

    pub fn channels(&self) -> usize {
        self.weight.nrows()
    }

    pub fn weight(&self) -> &Array2<f32> {
        &self.weight
    }

    /// Replace the weight matrix.
    ///
    /// Rejects non-square, singular and orientation-flipping matrices; the
    /// current weight is kept on error.
    pub fn set_weight(&mut self, weight: Array2<f32>) -> FlowResult<()> {
        if weight.dim() != self.weight.dim() {
            return Err(FlowError::shape(
                format!("{:?}", self.weight.dim()),
                format!("{:?}", weight.dim()),
            ));
        }
        Self::validate(&weight)?;
        self.weight = weight;
        Ok(())
    }

    fn validate(weight: &Array2<f32>) -> FlowResult<()> {
        let (rows, cols) = weight.dim();
        if rows != cols || rows == 0 {
            return Err(FlowError::shape("non-empty square matrix", format!("{rows}x{cols}")));
        }
        let matrix = Self::to_matrix(weight);
        if Self::is_singular(&matrix) {
            return Err(FlowError::SingularMatrix { channels: rows });
        }
        let det = matrix.determinant();
        if det.is_nan() || det <= 0.0 {
            return Err(FlowError::NonPositiveDeterminant { determinant: det });
        }
        Ok(())
    }

    /// Singular when non-finite or when `σ_min / σ_max` falls below
    /// `CONDITION_EPSILON · channels`. Independent of the matrix scale.
    fn is_singular(matrix: &DMatrix<f64>) -> bool {
        if matrix.iter().any(|v| !v.is_finite()) {
            return true;
        }
        let svd = SVD::try_new(matrix.clone(), false, false, f64::EPSILON, SVD_MAX_ITERATIONS);
        let Some(svd) = svd else {
            return true;
        };
        let sigma_max = svd.singular_values.max();
        let sigma_min = svd.singular_values.min();
        let threshold = CONDITION_EPSILON * matrix.nrows() as f64;
        !(sigma_max > 0.0 && sigma_min / sigma_max > threshold)
    }

    fn to_matrix(weight: &Array2<f32>) -> DMatrix<f64> {
        let (rows, cols) = weight.dim();
        DMatrix::from_fn(rows, cols, |i, j| weight[[i, j]] as f64)
    }

    /// `det W`, computed in f64
    pub fn determinant(&self) -> f64 {
        Self::to_matrix(&self.weight).determinant()
    }

    /// `log|det W|`, the per-time-step log-Jacobian
    pub fn log_abs_det(&self) -> f64 {
        self.determinant().abs().ln()
    }

    /// Forward mix; returns the output and `L · log|det W|` per batch element
    pub fn forward(&self, x: ArrayView3<f32>) -> FlowResult<(Array3<f32>, f64)> {
        expect_channels(&x, self.channels())?;
        let len = x.len_of(Axis(2));
        let y = Self::apply(&self.weight, x);
        Ok((y, self.log_abs_det() * len as f64))
    }

    /// Inverse mix with a freshly computed `W⁻¹`
    pub fn inverse(&self, y: ArrayView3<f32>) -> FlowResult<Array3<f32>> {
        expect_channels(&y, self.channels())?;
        let inverse = self.inverse_weight()?;
        Ok(Self::apply(&inverse, y))
    }

    /// `W⁻¹` in f32; fails on a numerically singular matrix
    pub fn inverse_weight(&self) -> FlowResult<Array2<f32>> {
        let channels = self.channels();
        let matrix = Self::to_matrix(&self.weight);
        if Self::is_singular(&matrix) {
            return Err(FlowError::SingularMatrix { channels });
        }
        let inverse = matrix
            .try_inverse()
            .ok_or(FlowError::SingularMatrix { channels })?;
        Ok(Array2::from_shape_fn((channels, channels), |(i, j)| {
            inverse[(i, j)] as f32
        }))
    }

    fn apply(matrix: &Array2<f32>, x: ArrayView3<f32>) -> Array3<f32> {
        let mut y = Array3::<f32>::zeros(x.raw_dim());
        for (xb, mut yb) in x.outer_iter().zip(y.outer_iter_mut()) {
            yb.assign(&matrix.dot(&xb));
        }
        y
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array3, array};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use crate::tensor::max_abs_diff;

    #[test]
    fn test_init_is_orthonormal_rotation() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        for channels in [1, 2, 3, 8, 16] {
            let mix = InvertibleChannelMix::new(channels, &mut rng).unwrap();
            assert_abs_diff_eq!(mix.determinant(), 1.0, epsilon = 1e-5);
            assert_abs_diff_eq!(mix.log_abs_det(), 0.0, epsilon = 1e-5);

            let gram = mix.weight().t().dot(mix.weight());
            for i in 0..channels {
                for j in 0..channels {
                    let expected = if i == j { 1.0 } else { 0.0 };
                    assert_abs_diff_eq!(gram[[i, j]], expected, epsilon = 1e-5);
                }
            }
        }
    }

    #[test]
    fn test_determinant_positive_over_many_seeds() {
        for seed in 0..32 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let mix = InvertibleChannelMix::new(6, &mut rng).unwrap();
            assert!(mix.determinant() > 0.0, "seed {seed} flipped orientation");
        }
    }

    #[test]
    fn test_forward_inverse_roundtrip() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mix = InvertibleChannelMix::new(8, &mut rng).unwrap();
        let x = Array3::from_shape_fn((2, 8, 5), |(b, c, t)| ((b + 2 * c + 3 * t) as f32).sin());

        let (y, _) = mix.forward(x.view()).unwrap();
        let back = mix.inverse(y.view()).unwrap();
        assert!(max_abs_diff(x.view().into_dyn(), back.view().into_dyn()) < 1e-5);
    }

    #[test]
    fn test_log_det_scales_with_length() {
        let mix = InvertibleChannelMix::from_weight(array![[2.0, 0.0], [0.0, 3.0]]).unwrap();
        let x = Array3::<f32>::ones((1, 2, 7));
        let (y, log_det) = mix.forward(x.view()).unwrap();

        assert_abs_diff_eq!(log_det, 7.0 * 6.0f64.ln(), epsilon = 1e-9);
        assert_eq!(y[[0, 0, 3]], 2.0);
        assert_eq!(y[[0, 1, 3]], 3.0);
    }

    #[test]
    fn test_rejects_singular_and_flipped_updates() {
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let mut mix = InvertibleChannelMix::new(2, &mut rng).unwrap();
        let before = mix.weight().clone();

        assert_eq!(
            mix.set_weight(array![[1.0, 2.0], [2.0, 4.0]]),
            Err(FlowError::SingularMatrix { channels: 2 })
        );
        assert!(matches!(
            mix.set_weight(array![[0.0, 1.0], [1.0, 0.0]]),
            Err(FlowError::NonPositiveDeterminant { .. })
        ));
        assert!(matches!(
            mix.set_weight(Array2::eye(3)),
            Err(FlowError::ShapeMismatch { .. })
        ));
        assert_eq!(mix.weight(), &before);

        mix.set_weight(array![[1.0, 0.5], [0.0, 1.0]]).unwrap();
        assert_abs_diff_eq!(mix.determinant(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_singularity_ignores_scale() {
        // tiny determinant, perfectly conditioned
        let small = InvertibleChannelMix::from_weight(Array2::eye(8) * 0.02).unwrap();
        assert!(small.determinant() < 1e-12);
        let y = Array3::from_shape_fn((1, 8, 4), |(_, c, t)| (c + t) as f32 * 0.01);
        let x = small.inverse(y.view()).unwrap();
        assert_abs_diff_eq!(x[[0, 3, 2]], 2.5, epsilon = 1e-5);

        // unremarkable determinant, hopelessly conditioned
        let skewed = array![[1.0, 1.0e7], [1.0e-7, 1.0 + 1.0e-6]];
        assert_eq!(
            InvertibleChannelMix::from_weight(skewed).unwrap_err(),
            FlowError::SingularMatrix { channels: 2 }
        );
    }

    #[test]
    fn test_rejects_non_finite_weight() {
        assert_eq!(
            InvertibleChannelMix::from_weight(array![[1.0, f32::NAN], [0.0, 1.0]]).unwrap_err(),
            FlowError::SingularMatrix { channels: 2 }
        );
    }

    #[test]
    fn test_inverse_of_degenerate_matrix_fails() {
        // bypass validation to model a weight corrupted in place
        let mix = InvertibleChannelMix {
            weight: array![[1.0, 1.0], [1.0, 1.0]],
        };
        let y = Array3::<f32>::zeros((1, 2, 3));
        assert_eq!(
            mix.inverse(y.view()).unwrap_err(),
            FlowError::SingularMatrix { channels: 2 }
        );
    }
}
