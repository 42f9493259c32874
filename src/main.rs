use darkbox::attack::AttackConfig;
use darkbox::direction::ContrastDirectionGenerator;
use darkbox::estimator::Aggregation;
use darkbox::runner::{Runner, TargetSelection};
use darkbox::target::{softmax, top1, LinearTarget, Target};

use anyhow::bail;
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use ndarray::Array4;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "DarkBox")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a black-box attack batch against the built-in demo classifier
    Attack {
        /// Final linf perturbation radius
        #[arg(long, default_value = "0.05")]
        epsilon: f32,

        /// Initial trust-region radius (targeted attacks)
        #[arg(long, default_value = "1.0")]
        starting_eps: f32,

        /// Initial trust-region shrink step
        #[arg(long, default_value = "0.5")]
        delta_eps: f32,

        #[arg(long, default_value = "0.01")]
        max_lr: f32,

        #[arg(long, default_value = "0.001")]
        min_lr: f32,

        /// Gaussian scale of the finite-difference probes
        #[arg(long, default_value = "1e-6")]
        sigma: f32,

        /// Model queries per gradient estimate
        #[arg(long, default_value = "48")]
        samples: usize,

        /// Mini-batch size for the estimator (even, divides --samples)
        #[arg(long, default_value = "12")]
        sub_batch: usize,

        /// Spatial split factor of the perturbation grouping
        #[arg(long, default_value = "8")]
        image_split: usize,

        /// Hard query budget per image
        #[arg(long, default_value = "10000")]
        max_queries: u64,

        /// Targeted instead of untargeted attack
        #[arg(long)]
        targeted: bool,

        /// How the target class is picked per image
        #[arg(long, value_enum, default_value_t = TargetType::Increment)]
        target_type: TargetType,

        /// Aggregate raw losses instead of rank-transformed ones
        #[arg(long)]
        no_rank_transform: bool,

        /// Number of synthetic images to attack
        #[arg(long, default_value = "10")]
        images: usize,

        #[arg(long, default_value = "10")]
        classes: usize,

        #[arg(long, default_value = "32")]
        resolution: usize,

        #[arg(long, default_value = "3")]
        channels: usize,

        #[arg(long, default_value = "42")]
        seed: u64,

        #[arg(short, long, default_value = "report.json")]
        output: String,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum TargetType {
    Random,
    LeastLikely,
    Increment,
}

impl From<TargetType> for TargetSelection {
    fn from(value: TargetType) -> Self {
        match value {
            TargetType::Random => TargetSelection::Random,
            TargetType::LeastLikely => TargetSelection::LeastLikely,
            TargetType::Increment => TargetSelection::Increment,
        }
    }
}

/// Attempts spent searching for an image of a class the random pool missed.
const CLASS_SEARCH_ATTEMPTS: usize = 10_000;

/// Random images labeled with the model's own prediction, so every entry is
/// correctly classified and usable both as attack input and as a targeted
/// reference seed. The pool is topped up until every class appears at least
/// once, since a class with no reference image would abort targeted runs.
fn synthetic_pool<R: Rng>(
    target: &dyn Target,
    channels: usize,
    resolution: usize,
    count: usize,
    rng: &mut R,
) -> anyhow::Result<Vec<(Array4<f32>, usize)>> {
    let mut draw = |rng: &mut R| -> anyhow::Result<(Array4<f32>, usize)> {
        let image =
            Array4::from_shape_fn((1, channels, resolution, resolution), |_| rng.random());
        let probs = softmax(&target.predict(&image)?);
        let label = top1(&probs)[0].0;
        Ok((image, label))
    };

    let mut pool = Vec::with_capacity(count);
    let mut seen = vec![false; target.num_classes()];
    for _ in 0..count {
        let (image, label) = draw(rng)?;
        seen[label] = true;
        pool.push((image, label));
    }

    for class in seen
        .iter()
        .enumerate()
        .filter(|(_, &s)| !s)
        .map(|(c, _)| c)
        .collect::<Vec<_>>()
    {
        let mut found = false;
        for _ in 0..CLASS_SEARCH_ATTEMPTS {
            let (image, label) = draw(rng)?;
            if label == class {
                pool.push((image, label));
                found = true;
                break;
            }
        }
        if !found {
            bail!(
                "demo model never predicts class {}, cannot seed targeted attacks",
                class
            );
        }
    }
    Ok(pool)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Attack {
            epsilon,
            starting_eps,
            delta_eps,
            max_lr,
            min_lr,
            sigma,
            samples,
            sub_batch,
            image_split,
            max_queries,
            targeted,
            target_type,
            no_rank_transform,
            images,
            classes,
            resolution,
            channels,
            seed,
            output,
        } => {
            println!("{}", "Initializing DarkBox...".bold().cyan());

            let config = AttackConfig {
                epsilon,
                starting_eps,
                delta_eps,
                max_lr,
                min_lr,
                sigma,
                sample_count: samples,
                sub_batch,
                image_split,
                max_queries,
                aggregation: if no_rank_transform {
                    Aggregation::Raw
                } else {
                    Aggregation::RankTransform
                },
            };
            // configuration errors surface here, before any model work
            let runner = Runner::new(config, targeted, target_type.into())?;

            let mut rng = StdRng::seed_from_u64(seed);
            let target = LinearTarget::random(classes, (channels, resolution, resolution), &mut rng)?;
            let pool = synthetic_pool(&target, channels, resolution, images.max(classes * 20), &mut rng)?;
            let dataset: Vec<_> = pool.iter().take(images).cloned().collect();

            let mut directions = ContrastDirectionGenerator::new(seed.wrapping_add(1));
            let summary = runner.run(&target, &mut directions, &dataset, &pool, &mut rng)?;

            println!("Images attacked: {}", summary.correct_all.len());
            println!("Avg correct:  {:.4}", summary.avg_correct);
            println!(
                "Avg not-done: {}",
                format!("{:.4}", summary.avg_not_done).red().bold()
            );
            if summary.max_query > 0 {
                println!("Mean query:   {:.1}", summary.mean_query);
                println!("Median query: {:.1}", summary.median_query);
                println!("Max query:    {}", summary.max_query);
            }

            summary.save(&output)?;
            println!("Report saved to {}", output);
        }
    }

    Ok(())
}
