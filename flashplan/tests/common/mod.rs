#![allow(dead_code)]

use flashplan::{
    ArrayElement, AttentionEngine, CpuMainloop, Dropout, EnginePolicy, ForwardParams,
    backends::cpu::DropoutMask,
};
use half::f16;
use ndarray::{Array3, Array4, ArrayD, Ix4, IxDyn};
use rand::{Rng, SeedableRng, rngs::StdRng};

pub fn engine(num_workers: usize) -> AttentionEngine<CpuMainloop> {
    let policy = EnginePolicy {
        num_workers: Some(num_workers),
        ..Default::default()
    };
    AttentionEngine::new(CpuMainloop::new(), policy).unwrap()
}

pub fn random_tensor(
    shape: &[usize],
    seed: u64,
) -> ArrayD<f16> {
    let mut rng = StdRng::seed_from_u64(seed);
    ArrayD::from_shape_fn(IxDyn(shape), |_| {
        f16::from_f32(rng.random_range(-1.0..1.0))
    })
}

pub fn widen<T: ArrayElement>(array: &ArrayD<T>) -> Array4<f32> {
    array.mapv(T::to_f32_value).into_dimensionality::<Ix4>().unwrap()
}

pub fn max_abs_diff<T: ArrayElement>(
    actual: &ArrayD<T>,
    expected: &ArrayD<f32>,
) -> f32 {
    assert_eq!(actual.shape(), expected.shape());
    actual
        .iter()
        .zip(expected.iter())
        .map(|(a, b)| (a.to_f32_value() - b).abs())
        .fold(0.0, f32::max)
}

pub struct ReferenceForward {
    /// `(batch, seq_q, heads, d)`
    pub out: Array4<f32>,
    /// `(batch, heads, seq_q)`
    pub lse: Array3<f32>,
}

pub struct ReferenceBackward {
    pub dq: Array4<f32>,
    pub dk: Array4<f32>,
    pub dv: Array4<f32>,
}

/// Softmax of one query row.
struct RowProbabilities {
    p: Vec<f32>,
    lse: f32,
    /// Derivative of the capped score with respect to the raw score.
    cap_grad: Vec<f32>,
}

/// Plain softmax attention over `(batch, seq, heads, d)` tensors, with the
/// options of a launch spelled out one by one.
#[derive(Debug, Clone, Copy)]
pub struct Reference {
    pub scale: f32,
    pub causal: bool,
    /// Local `(left, right)` window around the bottom-right diagonal;
    /// a negative bound is unbounded.
    pub window: Option<(i64, i64)>,
    /// Leading keys every query sees under a local window.
    pub sinks: usize,
    pub softcap: f32,
    pub dropout: Option<Dropout>,
    /// Multipliers of q, k and v.
    pub descale: [f32; 3],
}

impl Reference {
    pub fn new(scale: f32) -> Self {
        Self {
            scale,
            causal: false,
            window: None,
            sinks: 0,
            softcap: 0.0,
            dropout: None,
            descale: [1.0; 3],
        }
    }

    fn visible(
        &self,
        i: usize,
        j: usize,
        seq_q: usize,
        seq_k: usize,
    ) -> bool {
        let diagonal = i as i64 + seq_k as i64 - seq_q as i64;
        let j = j as i64;
        if self.causal {
            return j <= diagonal;
        }
        match self.window {
            Some((left, right)) => {
                j < self.sinks as i64
                    || ((left < 0 || j >= diagonal - left)
                        && (right < 0 || j <= diagonal + right))
            },
            None => true,
        }
    }

    /// Kept-and-rescaled factor of key `j` under dropout.
    fn keep_factor(
        &self,
        b: usize,
        h: usize,
        i: usize,
        j: usize,
    ) -> f32 {
        match &self.dropout {
            Some(dropout) => {
                let mask = DropoutMask::new(dropout);
                if mask.keep(b, h, i, j) {
                    mask.rescale()
                } else {
                    0.0
                }
            },
            None => 1.0,
        }
    }

    fn row(
        &self,
        q: &Array4<f32>,
        k: &Array4<f32>,
        b: usize,
        h: usize,
        i: usize,
    ) -> RowProbabilities {
        let (_, seq_q, num_heads, dim) = q.dim();
        let (_, seq_k, num_heads_k, _) = k.dim();
        let hk = h / (num_heads / num_heads_k);
        let scale = self.scale * self.descale[0] * self.descale[1];
        let mut cap_grad = vec![1.0; seq_k];
        let scores: Vec<f32> = (0..seq_k)
            .map(|j| {
                if !self.visible(i, j, seq_q, seq_k) {
                    return f32::NEG_INFINITY;
                }
                let raw = (0..dim).map(|d| q[[b, i, h, d]] * k[[b, j, hk, d]]).sum::<f32>()
                    * scale;
                if self.softcap > 0.0 {
                    let t = (raw / self.softcap).tanh();
                    cap_grad[j] = 1.0 - t * t;
                    self.softcap * t
                } else {
                    raw
                }
            })
            .collect();
        let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        if max == f32::NEG_INFINITY {
            return RowProbabilities {
                p: vec![0.0; seq_k],
                lse: f32::INFINITY,
                cap_grad,
            };
        }
        let sum: f32 = scores.iter().map(|s| (s - max).exp()).sum();
        RowProbabilities {
            p: scores.iter().map(|s| (s - max).exp() / sum).collect(),
            lse: max + sum.ln(),
            cap_grad,
        }
    }

    pub fn forward(
        &self,
        q: &Array4<f32>,
        k: &Array4<f32>,
        v: &Array4<f32>,
    ) -> ReferenceForward {
        let (batch, seq_q, num_heads, dim) = q.dim();
        let (_, seq_k, num_heads_k, _) = k.dim();
        let group = num_heads / num_heads_k;
        let mut out = Array4::zeros((batch, seq_q, num_heads, dim));
        let mut lse = Array3::zeros((batch, num_heads, seq_q));
        for b in 0..batch {
            for h in 0..num_heads {
                for i in 0..seq_q {
                    let row = self.row(q, k, b, h, i);
                    lse[[b, h, i]] = row.lse;
                    for j in 0..seq_k {
                        let weight = row.p[j] * self.keep_factor(b, h, i, j) * self.descale[2];
                        if weight == 0.0 {
                            continue;
                        }
                        for d in 0..dim {
                            out[[b, i, h, d]] += weight * v[[b, j, h / group, d]];
                        }
                    }
                }
            }
        }
        ReferenceForward {
            out,
            lse,
        }
    }

    pub fn backward(
        &self,
        dout: &Array4<f32>,
        q: &Array4<f32>,
        k: &Array4<f32>,
        v: &Array4<f32>,
    ) -> ReferenceBackward {
        let (batch, seq_q, num_heads, dim) = q.dim();
        let (_, seq_k, num_heads_k, _) = k.dim();
        let group = num_heads / num_heads_k;
        let mut dq = Array4::zeros(q.dim());
        let mut dk = Array4::zeros(k.dim());
        let mut dv = Array4::zeros(v.dim());
        for b in 0..batch {
            for h in 0..num_heads {
                let hk = h / group;
                for i in 0..seq_q {
                    let row = self.row(q, k, b, h, i);
                    let keep: Vec<f32> =
                        (0..seq_k).map(|j| self.keep_factor(b, h, i, j)).collect();
                    let dp: Vec<f32> = (0..seq_k)
                        .map(|j| {
                            keep[j]
                                * (0..dim)
                                    .map(|d| dout[[b, i, h, d]] * v[[b, j, hk, d]])
                                    .sum::<f32>()
                        })
                        .collect();
                    let delta: f32 = row.p.iter().zip(&dp).map(|(p, dp)| p * dp).sum();
                    for j in 0..seq_k {
                        let ds = row.p[j] * (dp[j] - delta) * row.cap_grad[j] * self.scale;
                        for d in 0..dim {
                            dv[[b, j, hk, d]] += row.p[j] * keep[j] * dout[[b, i, h, d]];
                            dq[[b, i, h, d]] += ds * k[[b, j, hk, d]];
                            dk[[b, j, hk, d]] += ds * q[[b, i, h, d]];
                        }
                    }
                }
            }
        }
        ReferenceBackward {
            dq,
            dk,
            dv,
        }
    }
}

impl From<&ForwardParams> for Reference {
    fn from(params: &ForwardParams) -> Self {
        let local = params.window_size_left >= 0 || params.window_size_right >= 0;
        Self {
            scale: params.softmax_scale,
            causal: params.is_causal,
            window: (local && !params.is_causal)
                .then_some((params.window_size_left, params.window_size_right)),
            sinks: params.sink_token_length,
            softcap: params.softcap,
            dropout: params.dropout.filter(|dropout| dropout.probability > 0.0),
            descale: params
                .descale
                .map_or([1.0; 3], |descale| [descale.q, descale.k, descale.v]),
        }
    }
}

fn with_mask(
    scale: f32,
    causal: bool,
) -> Reference {
    Reference {
        causal,
        ..Reference::new(scale)
    }
}

pub fn reference_forward(
    q: &Array4<f32>,
    k: &Array4<f32>,
    v: &Array4<f32>,
    scale: f32,
    causal: bool,
) -> ReferenceForward {
    with_mask(scale, causal).forward(q, k, v)
}

pub fn reference_backward(
    dout: &Array4<f32>,
    q: &Array4<f32>,
    k: &Array4<f32>,
    v: &Array4<f32>,
    scale: f32,
    causal: bool,
) -> ReferenceBackward {
    with_mask(scale, causal).backward(dout, q, k, v)
}
