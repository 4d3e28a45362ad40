/*! Time structures.

The `time` module contains the coarse clock of the tcp layer.

 - [Ticks] counts invocations of the slow timer and wraps around.
 - [Duration] is used to configure timeouts.

[Ticks]: struct.Ticks.html
[Duration]: https://doc.rust-lang.org/core/time/struct.Duration.html
*/
use core::fmt;
pub use core::time::Duration;

/// A point on the slow timer clock.
///
/// The counter is advanced by one on every slow timer run and wraps silently. Comparisons are
/// therefore only meaningful as differences, see [`elapsed_since`].
///
/// [`elapsed_since`]: #method.elapsed_since
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Ticks(pub u32);

impl Ticks {
    /// The tick after this one.
    pub fn next(self) -> Ticks {
        Ticks(self.0.wrapping_add(1))
    }

    /// Number of ticks passed since an earlier stamp.
    ///
    /// Computed with unsigned wrapping arithmetic, so a stamp taken shortly before the counter
    /// wrapped still reports a small value.
    pub fn elapsed_since(self, earlier: Ticks) -> u32 {
        self.0.wrapping_sub(earlier.0)
    }
}

/// Convert a duration to a number of timer intervals, rounding down.
///
/// An interval of zero is treated as one millisecond.
pub fn intervals(duration: Duration, interval: Duration) -> u32 {
    let interval = interval.as_millis().max(1);
    let count = duration.as_millis() / interval;
    if count > u128::from(u32::max_value()) {
        u32::max_value()
    } else {
        count as u32
    }
}

impl fmt::Display for Ticks {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "tick {}", self.0)
    }
}
