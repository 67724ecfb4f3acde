//! Change-id arithmetic. A change id is a hyphen-joined tuple of decimal
//! shards (one per upstream shard), each monotonically increasing.

use crate::error::PipelineError;

/// Sum of per-shard differences between the river head and our cursor; a
/// proxy for how far behind the head the consumer is running.
pub fn drift_between(head: &str, current: &str) -> Result<i64, PipelineError> {
    let mismatch = || PipelineError::CursorShapeMismatch {
        head: head.to_string(),
        current: current.to_string(),
    };

    let head_shards = shards(head).ok_or_else(mismatch)?;
    let current_shards = shards(current).ok_or_else(mismatch)?;
    if head_shards.len() != current_shards.len() {
        return Err(mismatch());
    }

    Ok(head_shards
        .iter()
        .zip(&current_shards)
        .map(|(h, c)| h - c)
        .sum())
}

fn shards(cursor: &str) -> Option<Vec<i64>> {
    cursor.split('-').map(|s| s.parse().ok()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drift_sums_shard_differences() {
        assert_eq!(drift_between("10-20-30", "7-18-25").unwrap(), 10);
    }

    #[test]
    fn test_drift_can_be_negative() {
        assert_eq!(drift_between("5-5", "6-7").unwrap(), -3);
    }

    #[test]
    fn test_shard_count_mismatch() {
        let err = drift_between("10-20", "1-2-3").unwrap_err();
        assert!(matches!(err, PipelineError::CursorShapeMismatch { .. }));
    }

    #[test]
    fn test_non_numeric_shard_is_a_shape_mismatch() {
        let err = drift_between("10-abc", "1-2").unwrap_err();
        assert!(matches!(err, PipelineError::CursorShapeMismatch { .. }));
    }
}
