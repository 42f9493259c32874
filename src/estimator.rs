//! Zeroth-order gradient estimation of the attack objective.
//!
//! The estimator never sees model internals. It draws antithetic per-group
//! Gaussian perturbations, pushes them through the victim model in bounded
//! mini-batches, scores each sample with the attack loss, and aggregates the
//! scores into one scalar per group: the rectification vector.

use crate::grouping::EqualSplitGrouping;
use crate::target::{softmax, top1, Target};
use crate::DarkBoxResult;
use anyhow::bail;
use ndarray::{s, Array1, Array2, Array4, Axis};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use tracing::debug;

/// Sentinel loss assigned to unusable samples before ranking. Only the rank
/// order matters, so any value above every reachable loss works.
const UNUSABLE_SENTINEL: f32 = 1_000.0;

/// How per-sample losses are folded into the rectification vector.
///
/// Rank transformation trades estimator bias for robustness against
/// loss-scale outliers and is the default; raw aggregation is kept for
/// comparison runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    RankTransform,
    Raw,
}

pub struct GradientEstimator {
    sample_count: usize,
    sigma: f32,
    sub_batch: usize,
    aggregation: Aggregation,
}

impl GradientEstimator {
    /// The mini-batch size must be even (antithetic pairs) and divide the
    /// sample count. Violations are configuration errors caught at startup.
    pub fn new(
        sample_count: usize,
        sigma: f32,
        sub_batch: usize,
        aggregation: Aggregation,
    ) -> DarkBoxResult<Self> {
        if sub_batch == 0 || sub_batch % 2 != 0 {
            bail!("sub-batch size must be a positive even number, got {}", sub_batch);
        }
        if sample_count == 0 || sample_count % sub_batch != 0 {
            bail!(
                "sample count {} must be a positive multiple of sub-batch size {}",
                sample_count,
                sub_batch
            );
        }
        if !(sigma > 0.0) {
            bail!("sigma must be positive, got {}", sigma);
        }
        Ok(Self {
            sample_count,
            sigma,
            sub_batch,
            aggregation,
        })
    }

    /// Model queries consumed by one [`estimate`](Self::estimate) call.
    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    /// Estimates the group-space gradient of the attack objective at `image`.
    ///
    /// `objective_class` is the target class for targeted attacks and the
    /// true class for untargeted ones; a sample is usable only if the model's
    /// top-1 prediction under that perturbation equals it. Returns `None`
    /// when no sample is usable; the caller must redraw the tentative
    /// direction instead of stepping on a degenerate estimate.
    #[allow(clippy::too_many_arguments)]
    pub fn estimate<R: Rng>(
        &self,
        target: &dyn Target,
        image: &Array4<f32>,
        direction: &Array4<f32>,
        grouping: &EqualSplitGrouping,
        objective_class: usize,
        untargeted: bool,
        rng: &mut R,
    ) -> DarkBoxResult<Option<(f32, Array1<f32>)>> {
        if objective_class >= target.num_classes() {
            bail!(
                "objective class {} out of range for {} classes",
                objective_class,
                target.num_classes()
            );
        }
        let groups = grouping.len();
        let n = self.sample_count;
        let half = self.sub_batch / 2;
        let normal = Normal::new(0.0f32, 1.0)?;

        let mut noise = Array2::<f32>::zeros((n, groups));
        let mut losses = vec![0.0f32; n];
        let mut usable = vec![false; n];

        let base = image.index_axis(Axis(0), 0);
        for chunk in 0..n / self.sub_batch {
            let offset = chunk * self.sub_batch;
            let mut chunk_noise = Array2::<f32>::zeros((self.sub_batch, groups));
            for i in 0..half {
                for g in 0..groups {
                    let draw = normal.sample(rng) * self.sigma;
                    chunk_noise[(i, g)] = draw;
                    chunk_noise[(i + half, g)] = -draw;
                }
            }

            let mut batch = grouping.broadcast(direction, &chunk_noise)?;
            for mut sample in batch.axis_iter_mut(Axis(0)) {
                sample += &base;
            }

            let probs = softmax(&target.predict(&batch)?);
            let tops = top1(&probs);
            for i in 0..self.sub_batch {
                let row = offset + i;
                usable[row] = tops[i].0 == objective_class;
                losses[row] = if untargeted {
                    -tops[i].1
                } else {
                    -probs[(i, objective_class)].max(f32::MIN_POSITIVE).ln()
                };
            }
            noise
                .slice_mut(s![offset..offset + self.sub_batch, ..])
                .assign(&chunk_noise);
        }

        let usable_count = usable.iter().filter(|&&u| u).count();
        if usable_count == 0 {
            return Ok(None);
        }
        debug!(usable_count, total = n, "finite-difference sampling done");

        let weights = match self.aggregation {
            Aggregation::RankTransform => Array1::from_vec(rank_weights(&losses, &usable)),
            Aggregation::Raw => {
                let raw: Vec<f32> = losses
                    .iter()
                    .zip(&usable)
                    .map(|(&loss, &ok)| if ok { loss / usable_count as f32 } else { 0.0 })
                    .collect();
                Array1::from_vec(raw)
            }
        };

        let rectification = noise.t().dot(&weights) / self.sigma;
        let mean_loss = losses
            .iter()
            .zip(&usable)
            .filter(|(_, &ok)| ok)
            .map(|(&loss, _)| loss)
            .sum::<f32>()
            / usable_count as f32;
        Ok(Some((mean_loss, rectification)))
    }
}

/// Rank-based sample weights, ascending in loss.
///
/// Unusable samples are pushed past every real loss with a sentinel before
/// ranking and then receive the mean rank of the unusable set, so one
/// wayward direction cannot dominate the aggregate. The mean is guarded:
/// with zero unusable samples no plunger value is computed.
fn rank_weights(losses: &[f32], usable: &[bool]) -> Vec<f32> {
    let n = losses.len();
    let shifted: Vec<f32> = losses
        .iter()
        .zip(usable)
        .map(|(&loss, &ok)| if ok { loss } else { UNUSABLE_SENTINEL })
        .collect();

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        shifted[a]
            .partial_cmp(&shifted[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut rank = vec![0.0f32; n];
    for (position, &sample) in order.iter().enumerate() {
        rank[sample] = position as f32;
    }

    let unusable_count = usable.iter().filter(|&&ok| !ok).count();
    let unusable_rank = if unusable_count > 0 {
        let sum: f32 = rank
            .iter()
            .zip(usable)
            .filter(|(_, &ok)| !ok)
            .map(|(&r, _)| r)
            .sum();
        sum / unusable_count as f32
    } else {
        0.0
    };

    let denom = (n - 1) as f32;
    rank.iter()
        .zip(usable)
        .map(|(&r, &ok)| (if ok { r } else { unusable_rank }) / denom)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::LinearTarget;
    use ndarray::{arr1, arr2, Array4};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_estimator_validates_sampling_config() {
        assert!(GradientEstimator::new(48, 1e-6, 12, Aggregation::RankTransform).is_ok());
        // odd sub-batch breaks antithetic pairing
        assert!(GradientEstimator::new(48, 1e-6, 3, Aggregation::RankTransform).is_err());
        // sample count must be a multiple of the sub-batch
        assert!(GradientEstimator::new(50, 1e-6, 12, Aggregation::RankTransform).is_err());
        assert!(GradientEstimator::new(48, 0.0, 12, Aggregation::RankTransform).is_err());
    }

    #[test]
    fn test_rank_weights_invariant_to_affine_rescaling() {
        let losses = vec![3.0, 1.0, 2.0, 5.0];
        let rescaled: Vec<f32> = losses.iter().map(|&l| 7.5 * l + 2.0).collect();
        let usable = vec![true, true, false, true];

        assert_eq!(
            rank_weights(&losses, &usable),
            rank_weights(&rescaled, &usable)
        );
    }

    #[test]
    fn test_rank_weights_plunge_unusable_samples() {
        // two unusable samples share the mean rank of the unusable set
        let losses = vec![0.1, 0.4, 0.2, 0.3];
        let usable = vec![true, false, true, false];
        let weights = rank_weights(&losses, &usable);

        assert_eq!(weights[1], weights[3]);
        // usable losses keep their ascending order
        assert!(weights[0] < weights[2]);
    }

    #[test]
    fn test_rank_weights_all_usable_guard() {
        let losses = vec![0.3, 0.1, 0.2];
        let usable = vec![true, true, true];
        let weights = rank_weights(&losses, &usable);
        assert_eq!(weights, vec![1.0, 0.0, 0.5]);
    }

    /// Two-class linear model with logits `[w . x + 5, 0]`: class 0 always
    /// wins, so every sample is usable and the cross-entropy surface is
    /// smooth. Pixel weights are +1 on the main-diagonal blocks and -1 on
    /// the off-diagonal blocks of a 2x2 split.
    fn smooth_target() -> LinearTarget {
        let weights = Array2::from_shape_fn((2, 16), |(class, feature)| {
            if class == 1 {
                return 0.0;
            }
            let (h, w) = (feature / 4, feature % 4);
            let group = (h / 2) * 2 + w / 2;
            if group == 0 || group == 3 {
                1.0
            } else {
                -1.0
            }
        });
        LinearTarget::new(weights, arr1(&[5.0, 0.0])).unwrap()
    }

    fn cross_entropy(target: &LinearTarget, images: &Array4<f32>, class: usize) -> f32 {
        let probs = softmax(&target.predict(images).unwrap());
        -probs[(0, class)].max(f32::MIN_POSITIVE).ln()
    }

    #[test]
    fn test_small_sigma_estimate_matches_numerical_gradient_sign() {
        let target = smooth_target();
        let image = Array4::from_elem((1, 1, 4, 4), 0.5);
        let direction = Array4::from_elem((1, 1, 4, 4), 1.0);
        let mut grouping = EqualSplitGrouping::new(2);
        grouping.initialize(direction.shape()).unwrap();

        let estimator = GradientEstimator::new(512, 1e-3, 32, Aggregation::Raw).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let (_, estimate) = estimator
            .estimate(&target, &image, &direction, &grouping, 0, false, &mut rng)
            .unwrap()
            .expect("all samples usable");

        // coarse central difference over each group coefficient
        let h = 1e-2;
        for g in 0..grouping.len() {
            let mut coeffs = Array1::zeros(grouping.len());
            coeffs[g] = h;
            let plus = &image + &grouping.broadcast_one(&direction, &coeffs).unwrap();
            coeffs[g] = -h;
            let minus = &image + &grouping.broadcast_one(&direction, &coeffs).unwrap();
            let numerical =
                (cross_entropy(&target, &plus, 0) - cross_entropy(&target, &minus, 0)) / (2.0 * h);
            assert_eq!(
                estimate[g].signum(),
                numerical.signum(),
                "sign mismatch in group {}",
                g
            );
        }
    }

    #[test]
    fn test_no_usable_samples_yields_none() {
        // class 1 can never be top-1, so a targeted estimate toward it is
        // degenerate
        let weights = arr2(&[[0.0_f32; 16], [0.0; 16]]);
        let target = LinearTarget::new(weights, arr1(&[100.0, 0.0])).unwrap();

        let image = Array4::from_elem((1, 1, 4, 4), 0.5);
        let direction = Array4::from_elem((1, 1, 4, 4), 1.0);
        let mut grouping = EqualSplitGrouping::new(2);
        grouping.initialize(direction.shape()).unwrap();

        let estimator = GradientEstimator::new(16, 1e-3, 4, Aggregation::RankTransform).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let estimate = estimator
            .estimate(&target, &image, &direction, &grouping, 1, false, &mut rng)
            .unwrap();
        assert!(estimate.is_none());
    }

    #[test]
    fn test_rectification_vector_length_matches_grouping() {
        let target = smooth_target();
        let image = Array4::from_elem((1, 1, 4, 4), 0.5);
        let direction = Array4::from_elem((1, 1, 4, 4), 1.0);
        let mut grouping = EqualSplitGrouping::new(2);
        grouping.initialize(direction.shape()).unwrap();

        let estimator = GradientEstimator::new(16, 1e-3, 4, Aggregation::RankTransform).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let (_, rectification) = estimator
            .estimate(&target, &image, &direction, &grouping, 0, false, &mut rng)
            .unwrap()
            .unwrap();
        assert_eq!(rectification.len(), grouping.len());
    }
}
