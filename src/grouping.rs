//! Spatial grouping of perturbation tensors.
//!
//! The estimator does not work on raw pixels: the perturbation plane is split
//! into `split x split` equal blocks and every block ("group") receives one
//! scalar adjustment. All channels of a pixel belong to the pixel's block.

use crate::DarkBoxResult;
use anyhow::bail;
use ndarray::{Array1, Array2, Array4};

/// Increments `split` until it evenly divides both spatial dimensions.
///
/// Callers apply this before binding a grouping so that uneven resolutions
/// never reach [`EqualSplitGrouping::initialize`].
pub fn round_up_split(height: usize, width: usize, split: usize) -> usize {
    let mut split = split.max(1);
    while height % split != 0 || width % split != 0 {
        split += 1;
    }
    split
}

/// Equal spatial split of a `1 x C x H x W` perturbation tensor.
///
/// A grouping is constructed with a split factor, then bound to a concrete
/// shape with [`initialize`](Self::initialize). The binding is immutable;
/// calling `initialize` again simply rebinds for the next attack iteration.
#[derive(Debug, Clone)]
pub struct EqualSplitGrouping {
    split: usize,
    bound: Option<Bound>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Bound {
    channels: usize,
    height: usize,
    width: usize,
    block_h: usize,
    block_w: usize,
}

impl EqualSplitGrouping {
    pub fn new(split: usize) -> Self {
        Self {
            split: split.max(1),
            bound: None,
        }
    }

    /// Binds the grouping to a concrete tensor shape.
    ///
    /// The shape must be rank 4 with a batch of one, and both spatial
    /// dimensions must be divisible by the split factor. Anything else is a
    /// caller bug and aborts the attack on this image.
    pub fn initialize(&mut self, shape: &[usize]) -> DarkBoxResult<()> {
        let [batch, channels, height, width] = match shape {
            [b, c, h, w] => [*b, *c, *h, *w],
            _ => bail!("grouping expects a rank-4 shape, got {:?}", shape),
        };
        if batch != 1 {
            bail!("grouping expects a single-image batch, got batch={}", batch);
        }
        if height % self.split != 0 || width % self.split != 0 {
            bail!(
                "split factor {} does not divide spatial dims {}x{}",
                self.split,
                height,
                width
            );
        }
        self.bound = Some(Bound {
            channels,
            height,
            width,
            block_h: height / self.split,
            block_w: width / self.split,
        });
        Ok(())
    }

    /// Number of groups. This is the dimensionality of the rectification
    /// vector.
    pub fn len(&self) -> usize {
        self.split * self.split
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    fn bound(&self) -> DarkBoxResult<Bound> {
        match self.bound {
            Some(b) => Ok(b),
            None => bail!("grouping used before initialize"),
        }
    }

    fn check_direction(&self, direction: &Array4<f32>) -> DarkBoxResult<Bound> {
        let b = self.bound()?;
        let expected = [1, b.channels, b.height, b.width];
        if direction.shape() != expected {
            bail!(
                "direction shape {:?} does not match grouping shape {:?}",
                direction.shape(),
                expected
            );
        }
        Ok(b)
    }

    fn group_of(&self, b: Bound, h: usize, w: usize) -> usize {
        (h / b.block_h) * self.split + w / b.block_w
    }

    /// Maps per-group scalars back onto the full tensor shape.
    ///
    /// `per_group` is `(n_samples, groups)`; the output is `(n_samples, C, H,
    /// W)` where each element is the direction element scaled by its group's
    /// scalar. Pure: identical inputs yield bit-identical output.
    pub fn broadcast(
        &self,
        direction: &Array4<f32>,
        per_group: &Array2<f32>,
    ) -> DarkBoxResult<Array4<f32>> {
        let b = self.check_direction(direction)?;
        if per_group.ncols() != self.len() {
            bail!(
                "rectification vector has {} entries, grouping has {} groups",
                per_group.ncols(),
                self.len()
            );
        }
        let samples = per_group.nrows();
        let mut out = Array4::<f32>::zeros((samples, b.channels, b.height, b.width));
        for s in 0..samples {
            for c in 0..b.channels {
                for h in 0..b.height {
                    for w in 0..b.width {
                        let g = self.group_of(b, h, w);
                        out[(s, c, h, w)] = direction[(0, c, h, w)] * per_group[(s, g)];
                    }
                }
            }
        }
        Ok(out)
    }

    /// Single-sample variant of [`broadcast`](Self::broadcast); the output has
    /// the direction's own shape.
    pub fn broadcast_one(
        &self,
        direction: &Array4<f32>,
        per_group: &Array1<f32>,
    ) -> DarkBoxResult<Array4<f32>> {
        let row = per_group
            .clone()
            .into_shape_with_order((1, per_group.len()))?;
        let out = self.broadcast(direction, &row)?;
        let shape = direction.raw_dim();
        Ok(out.into_shape_with_order(shape)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array2, Array4};

    fn direction_4x4() -> Array4<f32> {
        Array4::from_shape_fn((1, 1, 4, 4), |(_, _, h, w)| (h * 4 + w) as f32 + 1.0)
    }

    #[test]
    fn test_round_up_split() {
        assert_eq!(round_up_split(32, 32, 8), 8);
        assert_eq!(round_up_split(30, 30, 8), 10);
        assert_eq!(round_up_split(7, 7, 2), 7);
        // zero split is coerced to at least one
        assert_eq!(round_up_split(4, 4, 0), 1);
    }

    #[test]
    fn test_ones_broadcast_is_identity() {
        let mut grouping = EqualSplitGrouping::new(2);
        let direction = direction_4x4();
        grouping.initialize(direction.shape()).unwrap();

        let ones = Array1::from_elem(grouping.len(), 1.0);
        let out = grouping.broadcast_one(&direction, &ones).unwrap();
        assert_eq!(out, direction);
    }

    #[test]
    fn test_broadcast_is_pure() {
        let mut grouping = EqualSplitGrouping::new(2);
        let direction = direction_4x4();
        grouping.initialize(direction.shape()).unwrap();

        let values = Array2::from_shape_vec((2, 4), vec![0.5, -1.0, 2.0, 0.0, 1.0, 1.0, -3.0, 0.25])
            .unwrap();
        let first = grouping.broadcast(&direction, &values).unwrap();
        let second = grouping.broadcast(&direction, &values).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_group_assignment_scales_blocks() {
        let mut grouping = EqualSplitGrouping::new(2);
        let direction = Array4::from_elem((1, 1, 4, 4), 1.0);
        grouping.initialize(direction.shape()).unwrap();
        assert_eq!(grouping.len(), 4);

        // one scalar per quadrant, row-major
        let values = Array1::from_vec(vec![1.0, 2.0, 3.0, 4.0]);
        let out = grouping.broadcast_one(&direction, &values).unwrap();
        assert_eq!(out[(0, 0, 0, 0)], 1.0); // top-left block
        assert_eq!(out[(0, 0, 0, 3)], 2.0); // top-right block
        assert_eq!(out[(0, 0, 3, 0)], 3.0); // bottom-left block
        assert_eq!(out[(0, 0, 3, 3)], 4.0); // bottom-right block
    }

    #[test]
    fn test_shape_mismatch_is_fatal() {
        let mut grouping = EqualSplitGrouping::new(2);
        grouping.initialize(&[1, 1, 4, 4]).unwrap();

        let other = Array4::<f32>::zeros((1, 1, 8, 8));
        let ones = Array1::from_elem(grouping.len(), 1.0);
        assert!(grouping.broadcast_one(&other, &ones).is_err());
    }

    #[test]
    fn test_wrong_vector_length_is_fatal() {
        let mut grouping = EqualSplitGrouping::new(2);
        let direction = direction_4x4();
        grouping.initialize(direction.shape()).unwrap();

        let short = Array1::from_elem(grouping.len() - 1, 1.0);
        assert!(grouping.broadcast_one(&direction, &short).is_err());
    }

    #[test]
    fn test_indivisible_split_rejected() {
        let mut grouping = EqualSplitGrouping::new(3);
        assert!(grouping.initialize(&[1, 1, 4, 4]).is_err());
    }

    #[test]
    fn test_uninitialized_use_rejected() {
        let grouping = EqualSplitGrouping::new(2);
        let direction = direction_4x4();
        let ones = Array1::from_elem(grouping.len(), 1.0);
        assert!(grouping.broadcast_one(&direction, &ones).is_err());
    }
}
