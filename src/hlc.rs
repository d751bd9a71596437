//! Hybrid logical clock.
//!
//! A timestamp is a `u64` whose top 48 bits are physical time in
//! nanoseconds (low 16 bits masked off) and whose bottom 16 bits are a
//! logical tie-breaking counter. One `Hlc` instance is shared by every
//! context of an engine; all operations are lock-free.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::utils::{CartwrightError, ErrorKind};

/// Number of bits of the logical counter.
pub const HLC_LOGICAL_BITS: u32 = 16;

/// Mask of the logical counter part.
pub const HLC_LOGICAL_MASK: u64 = (1 << HLC_LOGICAL_BITS) - 1;

/// Mask of the physical time part.
pub const HLC_PHYSICAL_MASK: u64 = !HLC_LOGICAL_MASK;

const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Source of physical time in nanoseconds.
pub trait PhysicalClock: Send + Sync {
    fn now_ns(&self) -> u64;
}

/// Wall-clock physical time source.
#[derive(Debug, Default)]
pub struct SystemClock;

impl PhysicalClock for SystemClock {
    fn now_ns(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos() as u64)
    }
}

/// Manually driven physical time source, for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(start_ns: u64) -> Self {
        ManualClock(AtomicU64::new(start_ns))
    }

    pub fn set(&self, ns: u64) {
        self.0.store(ns, Ordering::SeqCst);
    }

    pub fn advance(&self, ns: u64) {
        self.0.fetch_add(ns, Ordering::SeqCst);
    }
}

impl PhysicalClock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

impl<C: PhysicalClock + ?Sized> PhysicalClock for Arc<C> {
    fn now_ns(&self) -> u64 {
        (**self).now_ns()
    }
}

/// Hybrid logical clock service.
pub struct Hlc {
    /// Last timestamp handed out or merged.
    last: AtomicU64,

    /// Physical time source.
    clock: Box<dyn PhysicalClock>,

    /// Maximum tolerated clock offset between processes, rounded up to
    /// physical granularity.
    epsilon: u64,
}

impl Hlc {
    /// Creates a clock over the system wall clock.
    pub fn new(epsilon_ns: u64) -> Self {
        Self::with_clock(Box::new(SystemClock), epsilon_ns)
    }

    /// Creates a clock over a given physical time source.
    pub fn with_clock(clock: Box<dyn PhysicalClock>, epsilon_ns: u64) -> Self {
        Hlc {
            last: AtomicU64::new(0),
            clock,
            epsilon: Self::round_epsilon(epsilon_ns),
        }
    }

    fn round_epsilon(epsilon_ns: u64) -> u64 {
        epsilon_ns.saturating_add(HLC_LOGICAL_MASK) & HLC_PHYSICAL_MASK
    }

    #[inline]
    fn physical(&self) -> u64 {
        self.clock.now_ns() & HLC_PHYSICAL_MASK
    }

    /// Returns a new timestamp strictly greater than every timestamp
    /// previously returned by `now()` or `merge()`.
    pub fn now(&self) -> u64 {
        let mut old = self.last.load(Ordering::Acquire);
        loop {
            let pt = self.physical();
            let new = if (old & HLC_PHYSICAL_MASK) < pt {
                pt
            } else {
                old.saturating_add(1)
            };
            match self.last.compare_exchange_weak(
                old,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return new,
                Err(cur) => old = cur,
            }
        }
    }

    /// Merges a timestamp carried by an incoming message, returning a new
    /// local timestamp strictly greater than both `msg` and every
    /// previously returned timestamp. The clock sticks at `u64::MAX` once
    /// it gets there.
    pub fn merge(&self, msg: u64) -> u64 {
        let mut old = self.last.load(Ordering::Acquire);
        loop {
            let pt = self.physical();
            let old_pt = old & HLC_PHYSICAL_MASK;
            let msg_pt = msg & HLC_PHYSICAL_MASK;
            let new = if old_pt < pt && msg_pt < pt {
                pt
            } else if old_pt > msg_pt {
                old.saturating_add(1)
            } else if msg_pt > old_pt {
                msg.saturating_add(1)
            } else {
                old.max(msg).saturating_add(1)
            };
            match self.last.compare_exchange_weak(
                old,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return new,
                Err(cur) => old = cur,
            }
        }
    }

    /// Like `merge()`, but rejects a message timestamp whose physical part
    /// is more than epsilon ahead of local physical time. The clock is left
    /// untouched on rejection.
    pub fn merge_bounded(&self, msg: u64) -> Result<u64, CartwrightError> {
        let pt = self.physical();
        if (msg & HLC_PHYSICAL_MASK) > pt.saturating_add(self.epsilon) {
            return Err(CartwrightError::new(
                ErrorKind::HlcSkew,
                format!(
                    "remote hlc {:#x} leads local physical time {:#x} by \
                     more than {} ns",
                    msg, pt, self.epsilon
                ),
            ));
        }
        Ok(self.merge(msg))
    }

    /// Returns the last timestamp without advancing the clock.
    #[inline]
    pub fn last(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }

    /// Returns the configured maximum clock offset in nanoseconds.
    #[inline]
    pub fn epsilon(&self) -> u64 {
        self.epsilon
    }

    /// Upper bound of the true time of an event stamped `hlc` on any
    /// process whose clock is within epsilon of ours.
    pub fn epsilon_bound(&self, hlc: u64) -> u64 {
        (hlc | HLC_LOGICAL_MASK).saturating_add(self.epsilon)
    }

    /// Lossy projection of a timestamp onto whole seconds since the epoch.
    /// For diagnostics only; never order by it.
    #[inline]
    pub fn to_seconds(hlc: u64) -> u64 {
        (hlc & HLC_PHYSICAL_MASK) / NSEC_PER_SEC
    }

    /// Physical nanoseconds part of a timestamp.
    #[inline]
    pub fn to_nanos(hlc: u64) -> u64 {
        hlc & HLC_PHYSICAL_MASK
    }

    /// Builds a timestamp from physical nanoseconds (lowest bits dropped).
    #[inline]
    pub fn from_nanos(ns: u64) -> u64 {
        ns & HLC_PHYSICAL_MASK
    }
}

impl Default for Hlc {
    fn default() -> Self {
        Self::new(NSEC_PER_SEC)
    }
}

impl fmt::Debug for Hlc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Hlc{{last: {:#x}, eps: {}}}", self.last(), self.epsilon)
    }
}

#[cfg(test)]
mod hlc_tests {
    use super::*;
    use std::thread;

    fn manual_hlc(start_ns: u64) -> (Arc<ManualClock>, Hlc) {
        let clock = Arc::new(ManualClock::new(start_ns));
        let hlc = Hlc::with_clock(Box::new(clock.clone()), NSEC_PER_SEC);
        (clock, hlc)
    }

    #[test]
    fn now_bumps_logical_when_time_stalls() {
        let (clock, hlc) = manual_hlc(5 << HLC_LOGICAL_BITS);
        let t1 = hlc.now();
        let t2 = hlc.now();
        let t3 = hlc.now();
        assert_eq!(t1, 5 << HLC_LOGICAL_BITS);
        assert_eq!(t2, t1 + 1);
        assert_eq!(t3, t1 + 2);
        clock.advance(1 << HLC_LOGICAL_BITS);
        assert_eq!(hlc.now(), 6 << HLC_LOGICAL_BITS);
    }

    #[test]
    fn now_ignores_backward_time() {
        let (clock, hlc) = manual_hlc(100 << HLC_LOGICAL_BITS);
        let t1 = hlc.now();
        clock.set(10 << HLC_LOGICAL_BITS);
        let t2 = hlc.now();
        assert!(t2 > t1);
        assert_eq!(Hlc::to_nanos(t2), Hlc::to_nanos(t1));
    }

    #[test]
    fn monotonic_mixed_ops() {
        let hlc = Hlc::default();
        let mut last = 0;
        for i in 0..10000u64 {
            let t = if i % 3 == 0 {
                hlc.merge(rand::random::<u64>() >> 20)
            } else {
                hlc.now()
            };
            assert!(t > last);
            last = t;
        }
    }

    #[test]
    fn monotonic_multi_threaded() {
        let hlc = Arc::new(Hlc::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let hlc = hlc.clone();
                thread::spawn(move || {
                    let mut seen = Vec::with_capacity(5000);
                    for _ in 0..5000 {
                        seen.push(hlc.now());
                    }
                    seen
                })
            })
            .collect();
        let mut all = Vec::new();
        for h in handles {
            let seen = h.join().unwrap();
            assert!(seen.windows(2).all(|w| w[0] < w[1]));
            all.extend(seen);
        }
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total);
    }

    #[test]
    fn causality_across_processes() {
        let (_ca, a) = manual_hlc(1000 << HLC_LOGICAL_BITS);
        // b's physical clock lags well behind a's
        let (cb, b) = manual_hlc(10 << HLC_LOGICAL_BITS);
        let t1 = a.now();
        let t2 = b.merge(t1);
        assert!(t2 > t1);
        assert!(b.now() > t2);
        // once b's physical time catches up it is used directly
        cb.set(2000 << HLC_LOGICAL_BITS);
        assert_eq!(b.now(), 2000 << HLC_LOGICAL_BITS);
    }

    #[test]
    fn merge_equal_physical_parts() {
        let (_c, hlc) = manual_hlc(7 << HLC_LOGICAL_BITS);
        let local = hlc.now();
        let msg = local + 9;
        assert_eq!(hlc.merge(msg), msg + 1);
        assert_eq!(hlc.merge(local), msg + 2);
    }

    #[test]
    fn merge_bounded_rejects_skew() {
        let (_c, hlc) = manual_hlc(NSEC_PER_SEC);
        let before = hlc.now();
        let far = Hlc::from_nanos(NSEC_PER_SEC * 5);
        let e = hlc.merge_bounded(far).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::HlcSkew);
        assert_eq!(hlc.last(), before);
        let near = Hlc::from_nanos(NSEC_PER_SEC + NSEC_PER_SEC / 2);
        assert!(hlc.merge_bounded(near).unwrap() > near);
    }

    #[test]
    fn merge_saturates_at_max() {
        let (_c, hlc) = manual_hlc(NSEC_PER_SEC);
        assert_eq!(hlc.merge(u64::MAX - 1), u64::MAX);
        assert_eq!(hlc.merge(u64::MAX), u64::MAX);
        assert_eq!(hlc.now(), u64::MAX);
        assert_eq!(hlc.last(), u64::MAX);
    }

    #[test]
    fn seconds_and_bounds() {
        let t = Hlc::from_nanos(3 * NSEC_PER_SEC + 12345678) | 0x2a;
        assert_eq!(Hlc::to_seconds(t), 3);
        let hlc = Hlc::new(0);
        assert_eq!(hlc.epsilon_bound(t), t | HLC_LOGICAL_MASK);
        let hlc = Hlc::new(1);
        assert_eq!(hlc.epsilon(), 1 << HLC_LOGICAL_BITS);
    }
}
