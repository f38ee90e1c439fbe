//! Constant-rate pacing for mmap read/write threads
//!
//! A paced thread computes an absolute deadline per frame,
//! `start + index * period - offset`, and sleeps until that instant. The
//! offset is re-measured every [`OFFSET_RESYNC_FRAMES`] frames. Sleeping to an
//! absolute deadline keeps loop overhead from accumulating into drift.

use crate::constants::{NS_PER_MS, NS_PER_SECOND, OFFSET_RESYNC_FRAMES};
use crate::error::{Error, Result};

pub use crate::audio::param::calculate_sample_num;

/// Current monotonic time in nanoseconds
pub fn now_ns() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC with a valid pointer cannot fail
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as i64 * NS_PER_SECOND + ts.tv_nsec as i64
}

/// Frame 0 latches `start_time_ns` to now. Every resync frame returns the
/// measured drift `(now - start) - index * period`; all other frames return 0.
pub fn update_time_offset(frame_index: i64, frame_period_ns: i64, start_time_ns: &mut i64) -> i64 {
    if frame_index == 0 {
        *start_time_ns = now_ns();
        0
    } else if frame_index % OFFSET_RESYNC_FRAMES == 0 {
        now_ns() - *start_time_ns - frame_index * frame_period_ns
    } else {
        0
    }
}

/// Sleep until the absolute monotonic instant `deadline_ns`.
///
/// A non-positive deadline is rejected without sleeping. A deadline already
/// in the past returns immediately.
pub fn absolute_sleep(deadline_ns: i64) -> Result<()> {
    if deadline_ns <= 0 {
        return Err(Error::BadValue(format!(
            "absolute sleep deadline {} is not positive",
            deadline_ns
        )));
    }
    sleep_until(deadline_ns)
}

#[cfg(target_os = "linux")]
fn sleep_until(deadline_ns: i64) -> Result<()> {
    let ts = libc::timespec {
        tv_sec: (deadline_ns / NS_PER_SECOND) as libc::time_t,
        tv_nsec: (deadline_ns % NS_PER_SECOND) as libc::c_long,
    };
    loop {
        let ret = unsafe {
            libc::clock_nanosleep(
                libc::CLOCK_MONOTONIC,
                libc::TIMER_ABSTIME,
                &ts,
                std::ptr::null_mut(),
            )
        };
        match ret {
            0 => return Ok(()),
            libc::EINTR => continue,
            err => return Err(Error::Io(std::io::Error::from_raw_os_error(err))),
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn sleep_until(deadline_ns: i64) -> Result<()> {
    let remaining = deadline_ns - now_ns();
    if remaining > 0 {
        std::thread::sleep(std::time::Duration::from_nanos(remaining as u64));
    }
    Ok(())
}

/// Frame period of a hardware period given in milliseconds
pub fn period_ms_to_ns(period_ms: u32) -> i64 {
    period_ms as i64 * NS_PER_MS
}

/// Per-thread pacing state
#[derive(Debug)]
pub struct TimestampPacer {
    frame_index: i64,
    frame_period_ns: i64,
    start_time_ns: i64,
    last_offset_ns: i64,
}

impl TimestampPacer {
    pub fn new(frame_period_ns: i64) -> Self {
        Self {
            frame_index: 0,
            frame_period_ns,
            start_time_ns: 0,
            last_offset_ns: 0,
        }
    }

    /// Called at the top of each frame. Returns the offset for this frame.
    pub fn begin_frame(&mut self) -> i64 {
        let offset = update_time_offset(self.frame_index, self.frame_period_ns, &mut self.start_time_ns);
        if offset != 0 {
            self.last_offset_ns = offset;
        }
        offset
    }

    /// Called at the bottom of each frame with the offset from
    /// [`begin_frame`](Self::begin_frame): advances the index and sleeps to
    /// the next frame's absolute deadline.
    pub fn end_frame(&mut self, offset: i64) -> Result<()> {
        self.frame_index += 1;
        absolute_sleep(self.start_time_ns + self.frame_index * self.frame_period_ns - offset)
    }

    pub fn frame_index(&self) -> i64 {
        self.frame_index
    }

    pub fn frame_period_ns(&self) -> i64 {
        self.frame_period_ns
    }

    /// Most recent non-zero drift measurement
    pub fn last_offset_ns(&self) -> i64 {
        self.last_offset_ns
    }

    pub fn reset(&mut self) {
        self.frame_index = 0;
        self.start_time_ns = 0;
        self.last_offset_ns = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_frame_zero_latches_start() {
        let mut start = 0;
        let before = now_ns();
        assert_eq!(update_time_offset(0, 5_000_000, &mut start), 0);
        assert!(start >= before);
    }

    #[test]
    fn test_offset_only_on_resync_frames() {
        let period = 1_000_000;
        let mut start = now_ns();
        assert_eq!(update_time_offset(3, period, &mut start), 0);
        assert_eq!(update_time_offset(OFFSET_RESYNC_FRAMES + 1, period, &mut start), 0);

        // start was 50 ms ago and we claim 10 frames of 1 ms elapsed
        let mut start = now_ns() - 50 * NS_PER_MS;
        let offset = update_time_offset(OFFSET_RESYNC_FRAMES, period, &mut start);
        assert!(offset >= 40 * NS_PER_MS);
    }

    #[test]
    fn test_absolute_sleep() {
        assert!(absolute_sleep(0).is_err());
        assert!(absolute_sleep(-5).is_err());

        let deadline = now_ns() + 2 * NS_PER_MS;
        absolute_sleep(deadline).unwrap();
        assert!(now_ns() >= deadline);

        // a deadline in the past returns at once
        absolute_sleep(1).unwrap();
    }

    #[test]
    fn test_pacer_keeps_rate() {
        let mut pacer = TimestampPacer::new(2 * NS_PER_MS);
        let begin = now_ns();
        for _ in 0..10 {
            let offset = pacer.begin_frame();
            thread::sleep(Duration::from_micros(200));
            pacer.end_frame(offset).unwrap();
        }
        let elapsed = now_ns() - begin;
        assert_eq!(pacer.frame_index(), 10);
        assert!(elapsed >= 18 * NS_PER_MS);
    }
}
