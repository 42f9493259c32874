//! # DarkBox
//!
//! **DarkBox** generates adversarial examples against image classifiers in the
//! strict black-box setting: the attacker observes only the victim model's
//! output scores, never its gradients.
//!
//! The engine refines an externally proposed *tentative direction* by
//! zeroth-order sampling: per-group Gaussian perturbations are pushed through
//! the model, the resulting losses are (optionally rank-transformed and)
//! aggregated into a per-group *rectification vector*, and the image is
//! stepped along the sign-rectified direction under an adaptively shrinking
//! epsilon-ball constraint.
//!
//! ## Core Architecture
//!
//! 1.  **[Target](crate::target::Target)**: the victim classifier under attack,
//!     queried as a pure batched `images -> logits` function.
//! 2.  **[DirectionGenerator](crate::direction::DirectionGenerator)**: proposes
//!     tentative perturbation directions, refined (not replaced) by the
//!     estimator.
//! 3.  **[EqualSplitGrouping](crate::grouping::EqualSplitGrouping)**: partitions
//!     the perturbation into equal spatial regions; the estimator works in the
//!     group subspace.
//! 4.  **[GradientEstimator](crate::estimator::GradientEstimator)**: antithetic
//!     finite-difference sampling of the attack objective, with rank-based
//!     robust aggregation.
//! 5.  **[Attacker](crate::attack::Attacker)**: per-image targeted/untargeted
//!     optimization loops with adaptive step-size and trust-region control.
//! 6.  **[Runner](crate::runner::Runner)**: batch orchestration, target-label
//!     selection, statistics, and report persistence.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use darkbox::attack::AttackConfig;
//! use darkbox::direction::ContrastDirectionGenerator;
//! use darkbox::runner::{Runner, TargetSelection};
//! use darkbox::target::LinearTarget;
//! use ndarray::Array4;
//! use rand::rngs::StdRng;
//! use rand::SeedableRng;
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut rng = StdRng::seed_from_u64(7);
//!     let target = LinearTarget::random(10, (3, 32, 32), &mut rng)?;
//!     let mut directions = ContrastDirectionGenerator::new(11);
//!
//!     let dataset: Vec<(Array4<f32>, usize)> = vec![/* images with labels */];
//!     let runner = Runner::new(AttackConfig::default(), true, TargetSelection::Increment)?;
//!     let summary = runner.run(&target, &mut directions, &dataset, &dataset, &mut rng)?;
//!     summary.save("report.json")?;
//!     Ok(())
//! }
//! ```

pub mod attack;
pub mod direction;
pub mod estimator;
pub mod grouping;
pub mod runner;
pub mod target;
pub mod window;

/// A convenient type alias for `anyhow::Result`.
pub type DarkBoxResult<T> = anyhow::Result<T>;
