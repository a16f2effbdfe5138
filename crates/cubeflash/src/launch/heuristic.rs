use crate::definition::MAX_SPLITS;

/// Device topology the split heuristic works against.
///
/// CubeCL does not expose a portable SM count, so the caller provides one;
/// the default matches a mid-size data-center part and only changes how
/// aggressively the key sequence is split, never correctness.
#[derive(Debug, Clone, Copy)]
pub struct DeviceSettings {
    pub sm_count: usize,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self { sm_count: 108 }
    }
}

/// Picks the number of K/V splits that best fills the device.
///
/// Splitting is only worthwhile when `batch · heads · query_tiles` alone
/// under-occupies the SMs. Candidate counts that don't change the
/// tiles-per-split are skipped, and among the rest the smallest count within
/// 85% of the best wave efficiency wins, so we don't pay the combine cost
/// for a marginal gain.
pub fn num_splits_heuristic(
    batch_nheads_mblocks: usize,
    num_sms: usize,
    num_n_blocks: usize,
    max_splits: usize,
) -> usize {
    if batch_nheads_mblocks as f32 >= 0.8 * num_sms as f32 {
        return 1;
    }
    let max_splits = max_splits.min(num_sms).min(num_n_blocks).max(1);

    let is_eligible = |num_splits: usize| {
        num_splits == 1
            || num_n_blocks.div_ceil(num_splits) != num_n_blocks.div_ceil(num_splits - 1)
    };
    let efficiency = |num_splits: usize| {
        let n_waves = (batch_nheads_mblocks * num_splits) as f32 / num_sms as f32;
        n_waves / n_waves.ceil()
    };

    let mut max_efficiency = 0.0f32;
    for num_splits in 1..=max_splits {
        if is_eligible(num_splits) {
            max_efficiency = max_efficiency.max(efficiency(num_splits));
        }
    }
    for num_splits in 1..=max_splits {
        if is_eligible(num_splits) && efficiency(num_splits) >= 0.85 * max_efficiency {
            log::debug!(
                "split heuristic: {num_splits} splits over {num_n_blocks} key tiles \
                 ({batch_nheads_mblocks} blocks on {num_sms} SMs)"
            );
            return num_splits;
        }
    }
    1
}

/// Splits for one problem, honoring a forced count when given.
pub(crate) fn resolve_num_splits(
    forced: usize,
    batch_nheads_mblocks: usize,
    num_n_blocks: usize,
    device: &DeviceSettings,
) -> usize {
    if forced > 0 {
        return forced.min(MAX_SPLITS).min(num_n_blocks.max(1));
    }
    num_splits_heuristic(
        batch_nheads_mblocks,
        device.sm_count,
        num_n_blocks,
        MAX_SPLITS,
    )
}
