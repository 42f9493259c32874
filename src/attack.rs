//! Per-image attack drivers.
//!
//! Two optimization loops share the estimator: the targeted controller walks
//! a target-class image back toward the original inside a shrinking trust
//! region, the untargeted controller pushes the original off its own class
//! inside a fixed epsilon box. Both are pure query-budgeted state machines:
//! non-convergence is a FAILURE outcome, never an error.

use crate::direction::DirectionGenerator;
use crate::estimator::{Aggregation, GradientEstimator};
use crate::grouping::{round_up_split, EqualSplitGrouping};
use crate::target::{softmax, top1, Target};
use crate::window::BoundedWindow;
use crate::DarkBoxResult;
use anyhow::bail;
use ndarray::{Array2, Array4, Zip};
use rand::Rng;
use tracing::{debug, info};

/// Trust-region shrink schedule: phase floors for `delta_eps`, consecutive
/// shrink failures tolerated per phase, and the shrink factor applied when
/// that tolerance is exceeded.
const DELTA_EPS_SCHEDULE: [f32; 4] = [0.01, 0.003, 0.001, 0.0];
const SHRINK_FAIL_THRESHOLDS: [u32; 4] = [1, 10, 100, 100];
const SHRINK_WEIGHTS: [f32; 4] = [2.0, 1.5, 1.5, 1.5];

/// Below this the trust region can no longer shrink meaningfully: give up.
const DELTA_EPS_FLOOR: f32 = 1e-5;
/// Learning-rate bounds are never halved past this.
const LR_BOUND_FLOOR: f32 = 1e-7;

const EXPLORE_WINDOW: usize = 5;
const ANNEAL_WINDOW: usize = 20;
const PLATEAU_WINDOW: usize = 200;

/// Knobs of the optimization core. Defaults mirror the reference attack
/// settings for linf attacks on image classifiers.
#[derive(Debug, Clone)]
pub struct AttackConfig {
    /// Final allowed perturbation radius.
    pub epsilon: f32,
    /// Initial trust-region radius for targeted attacks.
    pub starting_eps: f32,
    /// Initial trust-region shrink step per accepted move.
    pub delta_eps: f32,
    pub max_lr: f32,
    pub min_lr: f32,
    /// Gaussian scale of the finite-difference probes.
    pub sigma: f32,
    /// Model queries spent per gradient estimate.
    pub sample_count: usize,
    /// Mini-batch size bounding estimator memory.
    pub sub_batch: usize,
    /// Spatial split factor of the grouping (rounded up until it divides the
    /// image resolution).
    pub image_split: usize,
    /// Hard query budget per image.
    pub max_queries: u64,
    pub aggregation: Aggregation,
}

impl Default for AttackConfig {
    fn default() -> Self {
        Self {
            epsilon: 0.05,
            starting_eps: 1.0,
            delta_eps: 0.5,
            max_lr: 1e-2,
            min_lr: 1e-3,
            sigma: 1e-6,
            sample_count: 48,
            sub_batch: 12,
            image_split: 8,
            max_queries: 10_000,
            aggregation: Aggregation::RankTransform,
        }
    }
}

/// Result of one per-image attack.
pub struct AttackOutcome {
    pub success: bool,
    pub queries: u64,
    pub adversarial: Array4<f32>,
}

pub struct Attacker {
    config: AttackConfig,
    estimator: GradientEstimator,
}

impl Attacker {
    pub fn new(config: AttackConfig) -> DarkBoxResult<Self> {
        if !(config.epsilon > 0.0) {
            bail!("epsilon must be positive, got {}", config.epsilon);
        }
        if config.starting_eps < config.epsilon {
            bail!(
                "starting eps {} below final eps {}",
                config.starting_eps,
                config.epsilon
            );
        }
        if !(config.min_lr > 0.0) || config.max_lr < config.min_lr {
            bail!(
                "learning-rate bounds [{}, {}] are invalid",
                config.min_lr,
                config.max_lr
            );
        }
        let estimator = GradientEstimator::new(
            config.sample_count,
            config.sigma,
            config.sub_batch,
            config.aggregation,
        )?;
        Ok(Self { config, estimator })
    }

    pub fn config(&self) -> &AttackConfig {
        &self.config
    }

    fn query(
        &self,
        target: &dyn Target,
        images: &Array4<f32>,
    ) -> DarkBoxResult<(Vec<(usize, f32)>, Array2<f32>)> {
        let probs = softmax(&target.predict(images)?);
        Ok((top1(&probs), probs))
    }

    fn grouping_for(&self, image: &Array4<f32>) -> EqualSplitGrouping {
        let shape = image.shape();
        EqualSplitGrouping::new(round_up_split(shape[2], shape[3], self.config.image_split))
    }

    /// Drives `reference` (an image of the target class) back toward `image`
    /// while keeping the target class on top, shrinking the trust region
    /// from `starting_eps` down to `epsilon`.
    pub fn attack_targeted<R: Rng>(
        &self,
        target: &dyn Target,
        directions: &mut dyn DirectionGenerator,
        image: &Array4<f32>,
        reference: &Array4<f32>,
        target_label: usize,
        rng: &mut R,
    ) -> DarkBoxResult<AttackOutcome> {
        if target_label >= target.num_classes() {
            bail!(
                "target label {} out of range for {} classes",
                target_label,
                target.num_classes()
            );
        }
        if reference.shape() != image.shape() {
            bail!(
                "reference shape {:?} does not match image shape {:?}",
                reference.shape(),
                image.shape()
            );
        }

        let mut adv = reference.clone();
        let mut queries: u64 = 0;
        let mut cur_eps = self.config.starting_eps;
        let mut delta_eps = self.config.delta_eps;
        let mut cur_min_lr = self.config.min_lr;
        let mut cur_max_lr = self.config.max_lr;
        let mut explore = BoundedWindow::new(EXPLORE_WINDOW);
        let mut shrink_failures: u32 = 0;
        let mut phase = 0usize;
        let mut grouping = self.grouping_for(image);

        while queries < self.config.max_queries {
            let (tops, probs) = self.query(target, &adv)?;
            queries += 1;
            let top_class = tops[0].0;

            let direction = directions.propose(&adv)?;
            grouping.initialize(direction.shape())?;

            let estimate = self.estimator.estimate(
                target,
                &adv,
                &direction,
                &grouping,
                target_label,
                false,
                rng,
            )?;
            queries += self.estimator.sample_count() as u64;
            let (loss, rectification) = match estimate {
                Some(pair) => pair,
                None => {
                    debug!("degenerate estimate, redrawing tentative direction");
                    continue;
                }
            };
            if rectification.len() != grouping.len() {
                bail!(
                    "rectification vector has {} entries, expected {}",
                    rectification.len(),
                    grouping.len()
                );
            }
            let rectified = grouping.broadcast_one(&direction, &rectification.mapv(f32::signum))?;

            if top_class == target_label && cur_eps <= self.config.epsilon {
                info!(queries, "targeted attack converged");
                return Ok(AttackOutcome {
                    success: true,
                    queries,
                    adversarial: adv,
                });
            }
            debug!(
                target_prob = probs[(0, target_label)],
                cur_eps, loss, "outer iteration"
            );

            let mut cur_lr = cur_max_lr;
            let mut prop_de = delta_eps;
            loop {
                let mut proposed = &adv - &(&rectified * cur_lr);
                let proposed_eps = (cur_eps - prop_de).max(self.config.epsilon);
                project_into(&mut proposed, image, proposed_eps);

                let (tops, _) = self.query(target, &proposed)?;
                queries += 1;
                if tops[0].0 == target_label {
                    debug!(delta = prop_de, lr = cur_lr, "accepted step");
                    if prop_de > 0.0 {
                        // the region actually shrank: adaptive state restarts
                        cur_max_lr = self.config.max_lr;
                        cur_min_lr = self.config.min_lr;
                        explore.clear();
                        shrink_failures = 0;
                    } else {
                        explore.push(true);
                        shrink_failures += 1;
                    }
                    adv = proposed;
                    cur_eps = (cur_eps - prop_de).max(self.config.epsilon);
                    break;
                } else if cur_lr >= cur_min_lr * 2.0 {
                    cur_lr /= 2.0;
                } else if prop_de == 0.0 {
                    explore.push(false);
                    shrink_failures += 1;
                    debug!("learning rate exhausted, re-estimating gradient");
                    break;
                } else {
                    // one last attempt without shrinking the region
                    prop_de = 0.0;
                    cur_lr = cur_max_lr;
                }
            }

            if shrink_failures >= SHRINK_FAIL_THRESHOLDS[phase] {
                delta_eps = (delta_eps / SHRINK_WEIGHTS[phase]).max(DELTA_EPS_SCHEDULE[phase]);
                debug!(delta_eps, "shrink success rate too low, decreasing delta eps");
                if delta_eps <= DELTA_EPS_SCHEDULE[phase] {
                    phase = (phase + 1).min(DELTA_EPS_SCHEDULE.len() - 1);
                }
                if delta_eps < DELTA_EPS_FLOOR {
                    info!(queries, cur_eps, "trust region collapsed, giving up");
                    return Ok(AttackOutcome {
                        success: false,
                        queries,
                        adversarial: adv,
                    });
                }
                shrink_failures = 0;
            }

            if explore.is_full() && cur_min_lr > LR_BOUND_FLOOR && explore.success_ratio() < 0.5 {
                cur_min_lr /= 2.0;
                cur_max_lr /= 2.0;
                explore.clear();
                debug!(cur_min_lr, cur_max_lr, "lowering learning-rate bounds");
            }
        }
        Ok(AttackOutcome {
            success: false,
            queries,
            adversarial: adv,
        })
    }

    /// Pushes `image` off its true class inside a fixed epsilon box.
    pub fn attack_untargeted<R: Rng>(
        &self,
        target: &dyn Target,
        directions: &mut dyn DirectionGenerator,
        image: &Array4<f32>,
        true_label: usize,
        rng: &mut R,
    ) -> DarkBoxResult<AttackOutcome> {
        if true_label >= target.num_classes() {
            bail!(
                "true label {} out of range for {} classes",
                true_label,
                target.num_classes()
            );
        }
        let eps = self.config.epsilon;

        // random start inside the epsilon box
        let mut adv = image.clone();
        for v in adv.iter_mut() {
            *v = (*v + rng.random_range(-eps..=eps)).clamp(0.0, 1.0);
        }

        let mut queries: u64 = 0;
        let mut cur_lr = self.config.max_lr;
        let mut plateau = BoundedWindow::new(PLATEAU_WINDOW);
        let mut anneal = BoundedWindow::new(ANNEAL_WINDOW);
        let mut grouping = self.grouping_for(image);

        while queries < self.config.max_queries {
            let (tops, _) = self.query(target, &adv)?;
            queries += 1;
            let (top_class, top_prob) = tops[0];
            if top_class != true_label {
                info!(queries, "untargeted attack converged");
                return Ok(AttackOutcome {
                    success: true,
                    queries,
                    adversarial: adv,
                });
            }

            plateau.push(top_prob);
            if plateau.is_full() {
                if let (Some(&oldest), Some(&newest)) = (plateau.front(), plateau.back()) {
                    if newest >= oldest {
                        info!(queries, "no descent over the score window, giving up");
                        return Ok(AttackOutcome {
                            success: false,
                            queries,
                            adversarial: adv,
                        });
                    }
                }
            }

            anneal.push(top_prob);
            if anneal.is_full() {
                if let (Some(&oldest), Some(&newest)) = (anneal.front(), anneal.back()) {
                    if newest <= oldest {
                        if cur_lr > self.config.min_lr {
                            cur_lr = (cur_lr / 2.0).max(self.config.min_lr);
                            debug!(cur_lr, "annealing learning rate");
                        }
                        anneal.clear();
                    }
                }
            }

            let direction = directions.propose(&adv)?;
            grouping.initialize(direction.shape())?;

            let estimate = self.estimator.estimate(
                target,
                &adv,
                &direction,
                &grouping,
                true_label,
                true,
                rng,
            )?;
            queries += self.estimator.sample_count() as u64;
            let (loss, rectification) = match estimate {
                Some(pair) => pair,
                None => {
                    debug!("degenerate estimate, redrawing tentative direction");
                    continue;
                }
            };
            if rectification.len() != grouping.len() {
                bail!(
                    "rectification vector has {} entries, expected {}",
                    rectification.len(),
                    grouping.len()
                );
            }
            let rectified = grouping.broadcast_one(&direction, &rectification.mapv(f32::signum))?;

            // ascent on the loss (negative top-class probability)
            adv = &adv + &(&rectified * cur_lr);
            project_into(&mut adv, image, eps);
            debug!(queries, loss, lr = cur_lr, top_prob, "step");
        }
        Ok(AttackOutcome {
            success: false,
            queries,
            adversarial: adv,
        })
    }
}

/// Projects `proposed` into the radius-box around `original` intersected with
/// the valid pixel range.
fn project_into(proposed: &mut Array4<f32>, original: &Array4<f32>, radius: f32) {
    Zip::from(proposed).and(original).for_each(|p, &o| {
        *p = p.clamp(o - radius, o + radius).clamp(0.0, 1.0);
    });
}
