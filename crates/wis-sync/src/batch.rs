use wis_core::{BATCH_SIZE_STEP, MAX_BATCH_SIZE, MIN_BATCH_SIZE};

/// Next run's batch size: one step up after a run that fit its budget, one step down
/// after a run that expired.
pub fn adjust(current: u32, did_expire: bool) -> u32 {
    let current = current.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE);
    if did_expire {
        current.saturating_sub(BATCH_SIZE_STEP).max(MIN_BATCH_SIZE)
    } else {
        current.saturating_add(BATCH_SIZE_STEP).min(MAX_BATCH_SIZE)
    }
}
