//! Segment cadence inference.
//!
//! Segment ids are timestamps in timescale units, so the gap between two
//! adjacent segments ("interval") is roughly constant but drifts by a unit
//! or two and doubles where a segment was dropped.

/// Most frequent value in `deltas`; ties go to whichever value was seen
/// first.
pub fn estimate(deltas: &[i64]) -> Option<i64> {
    let mut counts: Vec<(i64, usize)> = Vec::new();
    for &d in deltas {
        match counts.iter_mut().find(|(v, _)| *v == d) {
            Some((_, n)) => *n += 1,
            None => counts.push((d, 1)),
        }
    }

    counts
        .iter()
        .fold(None, |best: Option<(i64, usize)>, &(v, n)| match best {
            Some((_, bn)) if bn >= n => best,
            _ => Some((v, n)),
        })
        .map(|(v, _)| v)
}

/// Observed interval counts, used to order next-id guesses.
#[derive(Debug, Clone)]
pub struct IntervalHistogram {
    nominal: i64,
    cutoff: f64,
    /// Discovery order, never reordered.
    entries: Vec<(i64, u32)>,
}

impl IntervalHistogram {
    /// Seeded with `nominal` and its two neighbours, positive ones only.
    /// Deltas of `cutoff` times the nominal interval or more are treated as
    /// gaps and not recorded.
    pub fn new(nominal: i64, cutoff: f64) -> Self {
        Self {
            nominal,
            cutoff,
            entries: [nominal, nominal - 1, nominal + 1]
                .into_iter()
                .filter(|v| *v > 0)
                .map(|v| (v, 0))
                .collect(),
        }
    }

    pub fn nominal(&self) -> i64 {
        self.nominal
    }

    /// Record an observed delta. Returns false if it was too large to count.
    pub fn record(&mut self, delta: i64) -> bool {
        let delta = delta.abs();
        if delta == 0 || delta as f64 >= self.nominal as f64 * self.cutoff {
            return false;
        }

        match self.entries.iter_mut().find(|(v, _)| *v == delta) {
            Some((_, n)) => *n += 1,
            None => self.entries.push((delta, 1)),
        }
        true
    }

    pub fn count(&self, interval: i64) -> u32 {
        self.entries
            .iter()
            .find(|(v, _)| *v == interval)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }

    /// Intervals by descending count, ties in discovery order.
    pub fn ordered(&self) -> Vec<i64> {
        let mut sorted = self.entries.clone();
        sorted.sort_by(|a, b| b.1.cmp(&a.1));
        sorted.into_iter().map(|(v, _)| v).collect()
    }

    /// Ids to try after `from`, walking in the direction of `sign`.
    pub fn guesses(&self, from: i64, sign: i64) -> Vec<i64> {
        self.ordered().into_iter().map(|k| from + k * sign).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_mode() {
        assert_eq!(estimate(&[2000, 2000, 2001, 2000, 1999, 2000]), Some(2000));
        assert_eq!(estimate(&[1999, 2001, 2001, 1999]), Some(1999));
        assert_eq!(estimate(&[7]), Some(7));
        assert_eq!(estimate(&[]), None);
    }

    #[test]
    fn ordered_by_count_then_discovery() {
        let mut h = IntervalHistogram::new(2000, 1.6);
        for _ in 0..3 {
            h.record(2001);
        }
        for _ in 0..3 {
            h.record(1999);
        }
        for _ in 0..5 {
            h.record(2000);
        }

        assert_eq!(h.count(2000), 5);
        assert_eq!(h.ordered(), vec![2000, 1999, 2001]);
    }

    #[test]
    fn new_intervals_append() {
        let mut h = IntervalHistogram::new(2000, 1.6);
        assert_eq!(h.ordered(), vec![2000, 1999, 2001]);

        assert!(h.record(-2033));
        assert_eq!(h.ordered(), vec![2033, 2000, 1999, 2001]);

        assert!(h.record(2000));
        assert!(h.record(2000));
        assert_eq!(h.ordered(), vec![2000, 2033, 1999, 2001]);
    }

    #[test]
    fn large_jumps_ignored() {
        let mut h = IntervalHistogram::new(2000, 1.6);
        assert!(!h.record(3200));
        assert!(!h.record(4000));
        assert!(h.record(3199));
        assert!(!h.record(0));
        assert_eq!(h.count(4000), 0);
    }

    #[test]
    fn guesses_follow_direction() {
        let h = IntervalHistogram::new(2000, 1.6);
        assert_eq!(h.guesses(100000, -1), vec![98000, 98001, 97999]);
        assert_eq!(h.guesses(100000, 1), vec![102000, 101999, 102001]);
    }

    #[test]
    fn seeds_stay_positive() {
        assert_eq!(IntervalHistogram::new(1, 1.6).ordered(), vec![1, 2]);
        assert_eq!(IntervalHistogram::new(1, 1.6).guesses(100, -1), vec![99, 98]);
        assert!(IntervalHistogram::new(0, 1.6).ordered().iter().all(|v| *v > 0));
    }
}
