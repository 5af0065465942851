/// Per-tensor descale factors for quantized inputs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Descale {
    pub q: f32,
    pub k: f32,
    pub v: f32,
}

impl Default for Descale {
    fn default() -> Self {
        Self {
            q: 1.0,
            k: 1.0,
            v: 1.0,
        }
    }
}

/// Attention dropout. `probability` is the drop probability; the keep
/// probability is quantized to 8 bits for the mask comparison.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dropout {
    pub probability: f32,
    pub seed: u64,
}

impl Dropout {
    pub fn keep_probability(&self) -> f32 {
        1.0 - self.probability
    }

    pub fn keep_threshold_u8(&self) -> u8 {
        (self.keep_probability() * 255.0).floor() as u8
    }

    pub fn rescale(&self) -> f32 {
        1.0 / self.keep_probability()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForwardParams {
    pub softmax_scale: f32,
    pub is_causal: bool,
    pub window_size_left: i64,
    pub window_size_right: i64,
    pub sink_token_length: usize,
    pub softcap: f32,
    pub num_splits: usize,
    pub pack_gqa: Option<bool>,
    pub descale: Option<Descale>,
    pub dropout: Option<Dropout>,
}

impl ForwardParams {
    pub fn new(head_dim: usize) -> Self {
        Self {
            softmax_scale: 1.0 / (head_dim as f32).sqrt(),
            is_causal: false,
            window_size_left: -1,
            window_size_right: -1,
            sink_token_length: 0,
            softcap: 0.0,
            num_splits: 1,
            pack_gqa: None,
            descale: None,
            dropout: None,
        }
    }

    pub fn causal(mut self) -> Self {
        self.is_causal = true;
        self
    }

    pub fn window(
        mut self,
        left: i64,
        right: i64,
    ) -> Self {
        self.window_size_left = left;
        self.window_size_right = right;
        self
    }

    pub fn splits(
        mut self,
        num_splits: usize,
    ) -> Self {
        self.num_splits = num_splits;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackwardParams {
    pub softmax_scale: f32,
    pub is_causal: bool,
    pub window_size_left: i64,
    pub window_size_right: i64,
    pub sink_token_length: usize,
    pub softcap: f32,
    pub dropout: Option<Dropout>,
    pub deterministic: bool,
}

impl BackwardParams {
    pub fn new(head_dim: usize) -> Self {
        Self {
            softmax_scale: 1.0 / (head_dim as f32).sqrt(),
            is_causal: false,
            window_size_left: -1,
            window_size_right: -1,
            sink_token_length: 0,
            softcap: 0.0,
            dropout: None,
            deterministic: false,
        }
    }

    pub fn causal(mut self) -> Self {
        self.is_causal = true;
        self
    }

    pub fn deterministic(mut self) -> Self {
        self.deterministic = true;
        self
    }
}

impl From<&ForwardParams> for BackwardParams {
    fn from(params: &ForwardParams) -> Self {
        Self {
            softmax_scale: params.softmax_scale,
            is_causal: params.is_causal,
            window_size_left: params.window_size_left,
            window_size_right: params.window_size_right,
            sink_token_length: params.sink_token_length,
            softcap: params.softcap,
            dropout: params.dropout,
            deterministic: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dropout_quantization() {
        let dropout = Dropout {
            probability: 0.1,
            seed: 0,
        };
        assert_eq!(dropout.keep_threshold_u8(), 229);
        assert!(is_close!(dropout.rescale(), 1.0 / 0.9));
    }
}
