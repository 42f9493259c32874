//! The victim classifier under attack.
//!
//! A [`Target`] is a pure batched `images -> logits` function: deterministic
//! for identical input, queried by a single caller, and never asked for
//! gradients. Model zoo loading lives outside the crate; [`LinearTarget`]
//! covers the CLI demo and the test scenarios.

use crate::DarkBoxResult;
use anyhow::bail;
use ndarray::{Array1, Array2, Array4, Axis};
use rand::Rng;

pub trait Target {
    /// Returns one logit row per image. Images are `B x C x H x W` in [0, 1].
    fn predict(&self, images: &Array4<f32>) -> DarkBoxResult<Array2<f32>>;

    fn num_classes(&self) -> usize;
}

/// Row-wise softmax with the usual max-subtraction for stability.
pub fn softmax(logits: &Array2<f32>) -> Array2<f32> {
    let mut probs = logits.clone();
    for mut row in probs.axis_iter_mut(Axis(0)) {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|v| (v - max).exp());
        let sum: f32 = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    probs
}

/// Per-row argmax index and its probability.
pub fn top1(probs: &Array2<f32>) -> Vec<(usize, f32)> {
    probs
        .axis_iter(Axis(0))
        .map(|row| {
            let mut best = (0, f32::NEG_INFINITY);
            for (idx, &p) in row.iter().enumerate() {
                if p > best.1 {
                    best = (idx, p);
                }
            }
            best
        })
        .collect()
}

/// A classifier whose logits are a fixed linear function of the flattened
/// image: `logits = W x + b`.
pub struct LinearTarget {
    weights: Array2<f32>,
    bias: Array1<f32>,
}

impl LinearTarget {
    pub fn new(weights: Array2<f32>, bias: Array1<f32>) -> DarkBoxResult<Self> {
        if weights.nrows() != bias.len() {
            bail!(
                "weight rows {} do not match bias length {}",
                weights.nrows(),
                bias.len()
            );
        }
        if weights.nrows() < 2 {
            bail!("a classifier needs at least two classes");
        }
        Ok(Self { weights, bias })
    }

    /// A random Gaussian classifier over `channels x height x width` inputs.
    pub fn random<R: Rng>(
        classes: usize,
        input: (usize, usize, usize),
        rng: &mut R,
    ) -> DarkBoxResult<Self> {
        use rand_distr::{Distribution, Normal};
        let (c, h, w) = input;
        let normal = Normal::new(0.0f32, 1.0)?;
        let weights = Array2::from_shape_fn((classes, c * h * w), |_| normal.sample(rng));
        let bias = Array1::zeros(classes);
        Self::new(weights, bias)
    }

    fn features(&self) -> usize {
        self.weights.ncols()
    }
}

impl Target for LinearTarget {
    fn predict(&self, images: &Array4<f32>) -> DarkBoxResult<Array2<f32>> {
        let batch = images.shape()[0];
        let features: usize = images.shape()[1..].iter().product();
        if features != self.features() {
            bail!(
                "image has {} features, model expects {}",
                features,
                self.features()
            );
        }
        let flat = images
            .to_owned()
            .into_shape_with_order((batch, features))?;
        Ok(flat.dot(&self.weights.t()) + &self.bias)
    }

    fn num_classes(&self) -> usize {
        self.weights.nrows()
    }
}

/// A degenerate classifier that predicts the same class no matter the input.
/// Useful as the "adversary can never succeed" scenario model.
pub struct ConstantTarget {
    class: usize,
    classes: usize,
}

impl ConstantTarget {
    pub fn new(class: usize, classes: usize) -> DarkBoxResult<Self> {
        if class >= classes {
            bail!("class {} out of range for {} classes", class, classes);
        }
        Ok(Self { class, classes })
    }
}

impl Target for ConstantTarget {
    fn predict(&self, images: &Array4<f32>) -> DarkBoxResult<Array2<f32>> {
        let mut logits = Array2::zeros((images.shape()[0], self.classes));
        logits.column_mut(self.class).fill(10.0);
        Ok(logits)
    }

    fn num_classes(&self) -> usize {
        self.classes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2, Array4};

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let logits = arr2(&[[1.0_f32, 2.0, 3.0], [0.0, 0.0, 100.0]]);
        let probs = softmax(&logits);
        for row in probs.axis_iter(Axis(0)) {
            assert!((row.sum() - 1.0).abs() < 1e-5);
        }
        // large logits must not overflow
        assert!(probs[(1, 2)] > 0.99);
    }

    #[test]
    fn test_top1_picks_argmax() {
        let probs = arr2(&[[0.1_f32, 0.7, 0.2], [0.6, 0.3, 0.1]]);
        let top = top1(&probs);
        assert_eq!(top[0].0, 1);
        assert_eq!(top[1].0, 0);
        assert!((top[0].1 - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_linear_target_logits() {
        // y[0] = sum(x), y[1] = -sum(x) + 1
        let weights = arr2(&[[1.0_f32, 1.0, 1.0, 1.0], [-1.0, -1.0, -1.0, -1.0]]);
        let bias = arr1(&[0.0_f32, 1.0]);
        let target = LinearTarget::new(weights, bias).unwrap();

        let images = Array4::from_elem((1, 1, 2, 2), 0.5);
        let logits = target.predict(&images).unwrap();
        assert!((logits[(0, 0)] - 2.0).abs() < 1e-6);
        assert!((logits[(0, 1)] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_linear_target_rejects_wrong_resolution() {
        let weights = arr2(&[[1.0_f32, 1.0], [-1.0, -1.0]]);
        let bias = arr1(&[0.0_f32, 0.0]);
        let target = LinearTarget::new(weights, bias).unwrap();

        let images = Array4::from_elem((1, 1, 2, 2), 0.5);
        assert!(target.predict(&images).is_err());
    }

    #[test]
    fn test_constant_target_never_moves() {
        let target = ConstantTarget::new(3, 5).unwrap();
        let a = Array4::from_elem((2, 1, 4, 4), 0.0);
        let b = Array4::from_elem((2, 1, 4, 4), 1.0);
        for images in [a, b] {
            let probs = softmax(&target.predict(&images).unwrap());
            for (idx, _) in top1(&probs) {
                assert_eq!(idx, 3);
            }
        }
    }
}
