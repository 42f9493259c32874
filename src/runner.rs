//! Batch orchestration: iterates a dataset, selects target labels, drives the
//! per-image attacks, and aggregates the run statistics into a persisted
//! report.

use crate::attack::{AttackConfig, Attacker};
use crate::direction::DirectionGenerator;
use crate::target::{softmax, top1, Target};
use crate::DarkBoxResult;
use anyhow::bail;
use colored::*;
use ndarray::Array4;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use tracing::info;

/// Fraction of direction entries kept by the generator's random mask.
const RANDOM_MASK: f32 = 0.9;
/// Noise scale handed to the generator for untargeted runs.
const UNTARGETED_SCALE: f32 = 5.0;

/// How the target class of a targeted attack is chosen per image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetSelection {
    /// A uniformly random class different from the true one.
    Random,
    /// The class the model considers least likely for this image.
    LeastLikely,
    /// `(true_label + 1) mod classes`.
    Increment,
}

pub struct Runner {
    attacker: Attacker,
    targeted: bool,
    target_selection: TargetSelection,
}

impl Runner {
    /// Configuration problems (bad sampling parameters, inverted
    /// learning-rate bounds) surface here, before any attack work begins.
    pub fn new(
        config: AttackConfig,
        targeted: bool,
        target_selection: TargetSelection,
    ) -> DarkBoxResult<Self> {
        Ok(Self {
            attacker: Attacker::new(config)?,
            targeted,
            target_selection,
        })
    }

    fn pick_target_label<R: Rng>(
        &self,
        target: &dyn Target,
        image: &Array4<f32>,
        true_label: usize,
        rng: &mut R,
    ) -> DarkBoxResult<usize> {
        let classes = target.num_classes();
        if classes < 2 {
            bail!("targeted attacks need at least two classes");
        }
        Ok(match self.target_selection {
            TargetSelection::Random => loop {
                let candidate = rng.random_range(0..classes);
                if candidate != true_label {
                    break candidate;
                }
            },
            TargetSelection::LeastLikely => {
                let logits = target.predict(image)?;
                let mut least = (0, f32::INFINITY);
                for (idx, &v) in logits.row(0).iter().enumerate() {
                    if v < least.1 {
                        least = (idx, v);
                    }
                }
                least.0
            }
            TargetSelection::Increment => (true_label + 1) % classes,
        })
    }

    /// Picks a random dataset image of `label` that the model actually
    /// classifies as `label`, to seed the targeted attack.
    fn reference_of_class<R: Rng>(
        &self,
        target: &dyn Target,
        dataset: &[(Array4<f32>, usize)],
        label: usize,
        rng: &mut R,
    ) -> DarkBoxResult<Array4<f32>> {
        let mut candidates: Vec<&Array4<f32>> = dataset
            .iter()
            .filter(|(_, l)| *l == label)
            .map(|(image, _)| image)
            .collect();
        if candidates.is_empty() {
            bail!("dataset holds no image of class {}", label);
        }
        candidates.shuffle(rng);
        for image in candidates {
            let probs = softmax(&target.predict(image)?);
            if top1(&probs)[0].0 == label {
                return Ok(image.clone());
            }
        }
        bail!("no correctly classified image of class {} available", label)
    }

    /// Attacks every image in the dataset and returns the aggregate record.
    ///
    /// `references` is the pool searched for target-class seed images of
    /// targeted attacks; passing the dataset itself is the common case.
    pub fn run<R: Rng>(
        &self,
        target: &dyn Target,
        directions: &mut dyn DirectionGenerator,
        dataset: &[(Array4<f32>, usize)],
        references: &[(Array4<f32>, usize)],
        rng: &mut R,
    ) -> DarkBoxResult<RunSummary> {
        if dataset.is_empty() {
            bail!("dataset is empty");
        }
        let total = dataset.len();
        println!(
            "Attacking {} images ({})",
            total,
            if self.targeted {
                "targeted".cyan()
            } else {
                "untargeted".cyan()
            }
        );

        let mut correct_all = vec![0u32; total];
        let mut not_done_all = vec![0u32; total];
        let mut query_all = vec![0u64; total];
        let mut success_all = vec![false; total];
        let mut not_done_prob_all = vec![0.0f32; total];

        for (index, (image, true_label)) in dataset.iter().enumerate() {
            if *true_label >= target.num_classes() {
                bail!(
                    "label {} of image {} out of range for {} classes",
                    true_label,
                    index,
                    target.num_classes()
                );
            }
            let probs = softmax(&target.predict(image)?);
            let correct = top1(&probs)[0].0 == *true_label;

            let target_label = if self.targeted {
                Some(self.pick_target_label(target, image, *true_label, rng)?)
            } else {
                None
            };
            let outcome = match target_label {
                Some(label) => {
                    let reference = self.reference_of_class(target, references, label, rng)?;
                    directions.set_targeted_params(reference.clone(), RANDOM_MASK);
                    self.attacker
                        .attack_targeted(target, directions, image, &reference, label, rng)?
                }
                None => {
                    directions.set_untargeted_params(image.clone(), RANDOM_MASK, UNTARGETED_SCALE);
                    self.attacker
                        .attack_untargeted(target, directions, image, *true_label, rng)?
                }
            };

            // the persisted verdict comes from re-querying the final image,
            // not from the driver's own flag
            let adv_probs = softmax(&target.predict(&outcome.adversarial)?);
            let adv_pred = top1(&adv_probs)[0].0;
            let not_done = match target_label {
                Some(label) => correct && adv_pred != label,
                None => correct && adv_pred == *true_label,
            };
            let success = correct && !not_done;

            correct_all[index] = correct as u32;
            not_done_all[index] = not_done as u32;
            query_all[index] = outcome.queries;
            success_all[index] = success;
            not_done_prob_all[index] = if not_done {
                adv_probs[(0, *true_label)]
            } else {
                0.0
            };

            info!(
                image = index,
                total,
                correct,
                not_done,
                queries = outcome.queries,
                "image attacked"
            );
            if success {
                println!(
                    "\n[{}] image {} after {} queries",
                    "ADVERSARIAL".red().bold(),
                    index,
                    outcome.queries
                );
            } else {
                print!(".");
                io::stdout().flush().ok();
            }
        }
        println!("\n{}", "Attack run complete.".bold().white());

        let summary = RunSummary::from_records(
            correct_all,
            not_done_all,
            query_all,
            &success_all,
            &not_done_prob_all,
        );
        info!(
            avg_correct = summary.avg_correct,
            avg_not_done = summary.avg_not_done,
            mean_query = summary.mean_query,
            median_query = summary.median_query,
            max_query = summary.max_query,
            "run finished"
        );
        Ok(summary)
    }
}

/// The per-run record persisted as JSON at the end of a batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub avg_correct: f32,
    /// Mean not-done over the initially correctly classified images.
    pub avg_not_done: f32,
    /// Query statistics over successful attacks only.
    pub mean_query: f32,
    pub median_query: f32,
    pub max_query: u64,
    /// Mean residual true-class probability over the not-done images.
    pub avg_not_done_prob: f32,
    pub correct_all: Vec<u32>,
    pub not_done_all: Vec<u32>,
    pub query_all: Vec<u64>,
}

impl RunSummary {
    fn from_records(
        correct_all: Vec<u32>,
        not_done_all: Vec<u32>,
        query_all: Vec<u64>,
        success_all: &[bool],
        not_done_prob_all: &[f32],
    ) -> Self {
        let total = correct_all.len() as f32;
        let avg_correct = correct_all.iter().sum::<u32>() as f32 / total;

        let correct_count = correct_all.iter().filter(|&&c| c == 1).count();
        let not_done_among_correct: u32 = correct_all
            .iter()
            .zip(&not_done_all)
            .filter(|(&c, _)| c == 1)
            .map(|(_, &nd)| nd)
            .sum();
        let avg_not_done = if correct_count > 0 {
            not_done_among_correct as f32 / correct_count as f32
        } else {
            0.0
        };

        let mut success_queries: Vec<u64> = query_all
            .iter()
            .zip(success_all)
            .filter(|(_, &s)| s)
            .map(|(&q, _)| q)
            .collect();
        success_queries.sort_unstable();
        let (mean_query, median_query, max_query) = if success_queries.is_empty() {
            (0.0, 0.0, 0)
        } else {
            let mean =
                success_queries.iter().sum::<u64>() as f32 / success_queries.len() as f32;
            let median = success_queries[(success_queries.len() - 1) / 2] as f32;
            let max = *success_queries.last().unwrap_or(&0);
            (mean, median, max)
        };

        let not_done_count = not_done_all.iter().filter(|&&nd| nd == 1).count();
        let avg_not_done_prob = if not_done_count > 0 {
            not_done_all
                .iter()
                .zip(not_done_prob_all)
                .filter(|(&nd, _)| nd == 1)
                .map(|(_, &p)| p)
                .sum::<f32>()
                / not_done_count as f32
        } else {
            0.0
        };

        Self {
            avg_correct,
            avg_not_done,
            mean_query,
            median_query,
            max_query,
            avg_not_done_prob,
            correct_all,
            not_done_all,
            query_all,
        }
    }

    /// Writes the record as pretty JSON, once, at the end of a run.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> DarkBoxResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}
