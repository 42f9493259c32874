//! Tentative perturbation directions.
//!
//! The optimization loop never invents its own search direction: an external
//! generator proposes one per iteration and the estimator only rectifies it
//! per group. The production feature-extractor generators are external
//! collaborators; [`ContrastDirectionGenerator`] is the built-in stand-in
//! with the same surface.

use crate::DarkBoxResult;
use anyhow::bail;
use ndarray::Array4;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

pub trait DirectionGenerator {
    /// Proposes a direction tensor of the same shape as `images`.
    fn propose(&mut self, images: &Array4<f32>) -> DarkBoxResult<Array4<f32>>;

    /// Configures targeted mode: directions point toward `reference`, with a
    /// random mask keeping `mask_ratio` of the entries.
    fn set_targeted_params(&mut self, reference: Array4<f32>, mask_ratio: f32);

    /// Configures untargeted mode: directions are scaled noise around the
    /// attacked images, masked the same way.
    fn set_untargeted_params(&mut self, originals: Array4<f32>, mask_ratio: f32, scale: f32);
}

enum Mode {
    Targeted { reference: Array4<f32>, mask_ratio: f32 },
    Untargeted { mask_ratio: f32, scale: f32 },
}

/// Default direction generator.
///
/// Targeted attacks walk toward the reference image of the target class;
/// untargeted attacks explore with masked Gaussian noise. Stateful: one of
/// the `set_*_params` calls must precede `propose`.
pub struct ContrastDirectionGenerator {
    mode: Option<Mode>,
    rng: StdRng,
}

impl ContrastDirectionGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            mode: None,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn mask_inplace(rng: &mut StdRng, direction: &mut Array4<f32>, mask_ratio: f32) {
        for v in direction.iter_mut() {
            if rng.random::<f32>() >= mask_ratio {
                *v = 0.0;
            }
        }
    }
}

impl DirectionGenerator for ContrastDirectionGenerator {
    fn propose(&mut self, images: &Array4<f32>) -> DarkBoxResult<Array4<f32>> {
        let Self { mode, rng } = self;
        match &*mode {
            Some(Mode::Targeted { reference, mask_ratio }) => {
                if reference.shape() != images.shape() {
                    bail!(
                        "reference shape {:?} does not match image shape {:?}",
                        reference.shape(),
                        images.shape()
                    );
                }
                let mut direction = reference - images;
                Self::mask_inplace(rng, &mut direction, *mask_ratio);
                Ok(direction)
            }
            Some(Mode::Untargeted { mask_ratio, scale }) => {
                let normal = Normal::new(0.0f32, 1.0)?;
                let mut direction =
                    Array4::from_shape_fn(images.raw_dim(), |_| normal.sample(&mut *rng) * scale);
                Self::mask_inplace(rng, &mut direction, *mask_ratio);
                Ok(direction)
            }
            None => bail!("direction generator used before set_targeted_params/set_untargeted_params"),
        }
    }

    fn set_targeted_params(&mut self, reference: Array4<f32>, mask_ratio: f32) {
        self.mode = Some(Mode::Targeted { reference, mask_ratio });
    }

    fn set_untargeted_params(&mut self, _originals: Array4<f32>, mask_ratio: f32, scale: f32) {
        self.mode = Some(Mode::Untargeted { mask_ratio, scale });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_propose_requires_configuration() {
        let mut generator = ContrastDirectionGenerator::new(1);
        let images = Array4::from_elem((1, 1, 4, 4), 0.5);
        assert!(generator.propose(&images).is_err());
    }

    #[test]
    fn test_targeted_direction_points_at_reference() {
        let mut generator = ContrastDirectionGenerator::new(1);
        let images = Array4::from_elem((1, 1, 4, 4), 0.25);
        let reference = Array4::from_elem((1, 1, 4, 4), 0.75);
        generator.set_targeted_params(reference, 1.0);

        // mask_ratio 1.0 keeps everything, so this is the exact difference
        let direction = generator.propose(&images).unwrap();
        for &v in direction.iter() {
            assert!((v - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn test_mask_ratio_zero_blanks_everything() {
        let mut generator = ContrastDirectionGenerator::new(1);
        let images = Array4::from_elem((1, 1, 4, 4), 0.25);
        let reference = Array4::from_elem((1, 1, 4, 4), 0.75);
        generator.set_targeted_params(reference, 0.0);

        let direction = generator.propose(&images).unwrap();
        assert!(direction.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_targeted_shape_mismatch_is_fatal() {
        let mut generator = ContrastDirectionGenerator::new(1);
        let reference = Array4::from_elem((1, 1, 8, 8), 0.75);
        generator.set_targeted_params(reference, 1.0);

        let images = Array4::from_elem((1, 1, 4, 4), 0.25);
        assert!(generator.propose(&images).is_err());
    }

    #[test]
    fn test_untargeted_direction_matches_image_shape() {
        let mut generator = ContrastDirectionGenerator::new(1);
        let images = Array4::from_elem((1, 3, 4, 4), 0.25);
        generator.set_untargeted_params(images.clone(), 0.9, 5.0);

        let direction = generator.propose(&images).unwrap();
        assert_eq!(direction.shape(), images.shape());
        assert!(direction.iter().any(|&v| v != 0.0));
    }
}
