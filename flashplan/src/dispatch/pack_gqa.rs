/// Whether packing query heads of one group into a tile improves tile
/// utilization by more than `margin`.
pub fn should_pack_gqa(
    seqlen_q: usize,
    qheads_per_kvhead: usize,
    block_m: usize,
    margin: f32,
) -> bool {
    if qheads_per_kvhead <= 1 || seqlen_q == 0 {
        return false;
    }
    let efficiency = |rows: usize| {
        rows as f32 / (rows.div_ceil(block_m) * block_m) as f32
    };
    let nopack_efficiency = efficiency(seqlen_q);
    let pack_efficiency = efficiency(seqlen_q * qheads_per_kvhead);
    nopack_efficiency < margin * pack_efficiency
}

/// Final packing decision. The override always wins; without one, grouped
/// heads are packed for variable-length or causal problems and otherwise
/// when the utilization heuristic says so.
#[allow(clippy::too_many_arguments)]
pub fn resolve_pack_gqa(
    pack_override: Option<bool>,
    num_heads: usize,
    num_heads_k: usize,
    varlen: bool,
    is_causal: bool,
    seqlen_q: usize,
    block_m: usize,
    margin: f32,
) -> bool {
    if let Some(pack) = pack_override {
        return pack;
    }
    num_heads != num_heads_k
        && (varlen
            || is_causal
            || should_pack_gqa(
                seqlen_q,
                num_heads / num_heads_k,
                block_m,
                margin,
            ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_head_group_never_packs() {
        for seqlen_q in [1, 7, 100, 128, 1000] {
            for block_m in [64, 128, 192] {
                assert!(!should_pack_gqa(seqlen_q, 1, block_m, 0.95));
            }
        }
        assert!(!resolve_pack_gqa(None, 8, 8, true, true, 1, 128, 0.95));
    }

    #[test]
    fn test_heuristic() {
        // One decode row per head: 1/128 vs 8/128 utilization.
        assert!(should_pack_gqa(1, 8, 128, 0.95));
        // Full tiles either way.
        assert!(!should_pack_gqa(128, 8, 128, 0.95));
    }

    #[test]
    fn test_override_wins() {
        assert!(!resolve_pack_gqa(Some(false), 8, 2, true, true, 1, 128, 0.95));
        assert!(resolve_pack_gqa(Some(true), 8, 8, false, false, 128, 128, 0.95));
        assert!(resolve_pack_gqa(None, 8, 2, false, true, 128, 128, 0.95));
    }
}
