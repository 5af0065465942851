use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum MaskKind {
    None,
    Causal,
    Local,
}

impl MaskKind {
    pub fn classify(
        left: i64,
        right: i64,
    ) -> Self {
        if left < 0 && right == 0 {
            MaskKind::Causal
        } else if left >= 0 || right >= 0 {
            MaskKind::Local
        } else {
            MaskKind::None
        }
    }

    pub fn is_causal(&self) -> bool {
        matches!(self, MaskKind::Causal)
    }

    pub fn is_local(&self) -> bool {
        matches!(self, MaskKind::Local)
    }

    pub fn is_masked(&self) -> bool {
        !matches!(self, MaskKind::None)
    }
}

/// Canonical `(left, right)` window for a causal flag and raw window sizes.
///
/// The causal override and the "bound can never exclude anything" check run
/// first; a half-specified local window is only completed afterwards.
pub fn resolve_window(
    is_causal: bool,
    left: i64,
    right: i64,
    seqlen_q: usize,
    seqlen_k: usize,
) -> (i64, i64) {
    if is_causal {
        return (-1, 0);
    }
    let mut left = left;
    let mut right = right;
    if left >= seqlen_k as i64 - 1 {
        left = -1;
    }
    if right >= seqlen_q as i64 - 1 {
        right = -1;
    }
    if MaskKind::classify(left, right).is_local() {
        if left < 0 && right >= 0 {
            left = seqlen_k as i64 - 1;
        }
        if left >= 0 && right < 0 {
            right = seqlen_q as i64 - 1;
        }
    }
    (left, right)
}

/// Visibility rule of one launch, bottom-right aligned: the last query row
/// lines up with the last key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionMask {
    pub kind: MaskKind,
    pub window_left: i64,
    pub window_right: i64,
    pub sink_token_length: usize,
}

impl AttentionMask {
    pub fn new(
        is_causal: bool,
        window_left: i64,
        window_right: i64,
        sink_token_length: usize,
        seqlen_q: usize,
        seqlen_k: usize,
    ) -> Result<Self, ConfigurationError> {
        let (left, right) = resolve_window(
            is_causal,
            window_left,
            window_right,
            seqlen_q,
            seqlen_k,
        );
        let kind = MaskKind::classify(left, right);
        if kind.is_local() && !cfg!(feature = "local") {
            return Err(ConfigurationError::FeatureDisabled("local"));
        }
        Ok(Self {
            kind,
            window_left: left,
            window_right: right,
            sink_token_length: if kind.is_local() {
                sink_token_length
            } else {
                0
            },
        })
    }

    pub fn is_visible(
        &self,
        row: usize,
        col: usize,
        seqlen_q: usize,
        seqlen_k: usize,
    ) -> bool {
        if col >= seqlen_k {
            return false;
        }
        let diagonal = row as i64 + seqlen_k as i64 - seqlen_q as i64;
        let col = col as i64;
        match self.kind {
            MaskKind::None => true,
            MaskKind::Causal => col <= diagonal,
            MaskKind::Local => {
                (col as usize) < self.sink_token_length
                    || (col >= diagonal - self.window_left
                        && col <= diagonal + self.window_right)
            },
        }
    }
}
