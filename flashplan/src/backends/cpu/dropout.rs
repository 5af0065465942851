use crate::config::Dropout;

/// Counter-based dropout mask. Every `(batch, head, row, col)` draws one
/// byte from a hash of the seed, so forward and backward agree without
/// storing the mask.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DropoutMask {
    seed: u64,
    threshold: u8,
    rescale: f32,
}

impl DropoutMask {
    pub fn new(dropout: &Dropout) -> Self {
        Self {
            seed: dropout.seed,
            threshold: dropout.keep_threshold_u8(),
            rescale: dropout.rescale(),
        }
    }

    pub fn rescale(&self) -> f32 {
        self.rescale
    }

    pub fn keep(
        &self,
        batch: usize,
        head: usize,
        row: usize,
        col: usize,
    ) -> bool {
        self.sample(batch, head, row, col) <= self.threshold
    }

    fn sample(
        &self,
        batch: usize,
        head: usize,
        row: usize,
        col: usize,
    ) -> u8 {
        let mut state = self.seed;
        for value in [batch, head, row, col] {
            state = mix(state ^ value as u64);
        }
        (state >> 56) as u8
    }
}

/// SplitMix64 finalizer.
fn mix(value: u64) -> u64 {
    let mut z = value.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keep_rate_follows_threshold() {
        let mask = DropoutMask::new(&Dropout {
            probability: 0.25,
            seed: 42,
        });
        let kept = (0..64)
            .flat_map(|row| (0..256).map(move |col| (row, col)))
            .filter(|&(row, col)| mask.keep(1, 3, row, col))
            .count();
        let rate = kept as f32 / (64 * 256) as f32;
        assert!((rate - 0.75).abs() < 0.02, "rate {rate}");
    }

    #[test]
    fn test_mask_is_reproducible() {
        let dropout = Dropout {
            probability: 0.5,
            seed: 7,
        };
        let a = DropoutMask::new(&dropout);
        let b = DropoutMask::new(&dropout);
        for col in 0..100 {
            assert_eq!(a.keep(0, 1, 2, col), b.keep(0, 1, 2, col));
        }
        let other = DropoutMask::new(&Dropout {
            probability: 0.5,
            seed: 8,
        });
        assert!((0..100).any(|col| a.keep(0, 1, 2, col) != other.keep(0, 1, 2, col)));
    }
}
