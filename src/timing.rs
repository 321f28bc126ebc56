use rand::{thread_rng, Rng};
use tokio::time::{self, Duration};

/// Create a Tokio [`Interval`][time::Interval] with the given period
/// (±10% random jitter), so that a fleet of probers and drain loops started
/// together does not tick in lockstep.
///
/// If the `Interval` is polled less frequently than the period (i.e., a pass
/// ends up taking longer than its period), further ticks are
/// [delayed][time::MissedTickBehavior::Delay] until another interval elapses.
pub(crate) fn interval(period: Duration) -> time::Interval {
    let j = thread_rng().gen_range(0.9..1.1);
    let period = period.mul_f64(j);

    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    interval
}
