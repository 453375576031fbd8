//! Debug assertion macros for the pipeline's structural invariants.
//!
//! Active only in debug builds (`debug_assert!`), so there is zero overhead
//! in release builds. Used by the input ring, the shared queue and the
//! output buffer.

/// Assert that a ring cursor only moves forward.
macro_rules! debug_assert_cursor_monotonic {
    ($name:literal, $old:expr, $new:expr) => {
        debug_assert!(
            $new >= $old,
            "{} cursor moved backwards: {} -> {}",
            $name,
            $old,
            $new
        )
    };
}

/// Assert that ring occupancy never exceeds capacity.
macro_rules! debug_assert_bounded_occupancy {
    ($used:expr, $capacity:expr) => {
        debug_assert!(
            $used <= $capacity,
            "ring occupancy {} exceeds capacity {}",
            $used,
            $capacity
        )
    };
}

/// Assert that an offset or size is machine-word aligned. Frames must keep
/// the dispatch word of the *next* frame aligned.
macro_rules! debug_assert_word_aligned {
    ($what:literal, $value:expr) => {
        debug_assert!(
            $value % crate::util::WORD == 0,
            "{} is not word aligned: {}",
            $what,
            $value
        )
    };
}

/// Assert the output buffer's region ordering: frame_end <= commit_end <=
/// capacity.
macro_rules! debug_assert_output_regions {
    ($frame_end:expr, $commit_end:expr, $capacity:expr) => {
        debug_assert!(
            $frame_end <= $commit_end && $commit_end <= $capacity,
            "output regions out of order: frame_end {} commit_end {} capacity {}",
            $frame_end,
            $commit_end,
            $capacity
        )
    };
}

pub(crate) use debug_assert_bounded_occupancy;
pub(crate) use debug_assert_cursor_monotonic;
pub(crate) use debug_assert_output_regions;
pub(crate) use debug_assert_word_aligned;
