//! Percentile histogram used for pause and cancellation latencies.

const MAG_MIN: i32 = -12;
const MAG_MAX: i32 = 20;
const MAGNITUDES: usize = (MAG_MAX - MAG_MIN + 1) as usize;
const SUB_BUCKETS: usize = 512;

/// A histogram over decimal magnitudes with linear sub-buckets.
///
/// Values in `[10^m, 10^(m+1))` land in one of [`SUB_BUCKETS`] buckets of
/// magnitude `m`; values at or below zero (and below `10^MAG_MIN`) are kept
/// in a separate zero bucket. Percentiles report the lower bound of the
/// bucket they fall into, so results are exact for powers of ten.
#[derive(Debug, Clone)]
pub struct HdrSeq {
    zero: u64,
    buckets: Vec<Option<Box<[u64]>>>,
    num: u64,
    sum: f64,
    sum_of_squares: f64,
    maximum: f64,
}

impl Default for HdrSeq {
    fn default() -> Self {
        Self::new()
    }
}

impl HdrSeq {
    pub fn new() -> Self {
        Self {
            zero: 0,
            buckets: vec![None; MAGNITUDES],
            num: 0,
            sum: 0.0,
            sum_of_squares: 0.0,
            maximum: 0.0,
        }
    }

    fn magnitude(value: f64) -> i32 {
        let mut mag = value.log10().floor() as i32;
        if 10f64.powi(mag) > value {
            mag -= 1;
        } else if 10f64.powi(mag + 1) <= value {
            mag += 1;
        }
        mag
    }

    pub fn add(&mut self, value: f64) {
        if self.num == 0 || value > self.maximum {
            self.maximum = value;
        }
        self.num += 1;
        self.sum += value;
        self.sum_of_squares += value * value;

        if value.is_nan() || value < 10f64.powi(MAG_MIN) {
            self.zero += 1;
            return;
        }
        let mag = Self::magnitude(value).min(MAG_MAX);
        let scaled = value / 10f64.powi(mag);
        let sub = (((scaled - 1.0) / 9.0) * SUB_BUCKETS as f64) as usize;
        let sub = sub.min(SUB_BUCKETS - 1);
        let slot = (mag - MAG_MIN) as usize;
        let bucket = self.buckets[slot]
            .get_or_insert_with(|| vec![0; SUB_BUCKETS].into_boxed_slice());
        bucket[sub] += 1;
    }

    fn bucket_value(slot: usize, sub: usize) -> f64 {
        let mag = slot as i32 + MAG_MIN;
        10f64.powi(mag) * (1.0 + sub as f64 * 9.0 / SUB_BUCKETS as f64)
    }

    /// Value at percentile `p` in `[0, 100]`. Percentile 0 is the minimum.
    pub fn percentile(&self, p: f64) -> f64 {
        if self.num == 0 {
            return 0.0;
        }
        let target = ((p * self.num as f64 / 100.0).ceil() as u64).max(1);
        let mut seen = self.zero;
        if seen >= target {
            return 0.0;
        }
        for (slot, bucket) in self.buckets.iter().enumerate() {
            let Some(bucket) = bucket else { continue };
            for (sub, &count) in bucket.iter().enumerate() {
                seen += count;
                if seen >= target {
                    return Self::bucket_value(slot, sub);
                }
            }
        }
        self.maximum
    }

    #[inline]
    pub fn num(&self) -> u64 {
        self.num
    }

    #[inline]
    pub fn maximum(&self) -> f64 {
        self.maximum
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn avg(&self) -> f64 {
        if self.num == 0 {
            0.0
        } else {
            self.sum / self.num as f64
        }
    }

    pub fn variance(&self) -> f64 {
        if self.num <= 1 {
            return 0.0;
        }
        let avg = self.avg();
        let v = self.sum_of_squares / self.num as f64 - avg * avg;
        v.max(0.0)
    }

    pub fn sd(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Moves every sample of `other` into `self`, leaving `other` empty.
    pub fn merge(&mut self, other: &mut HdrSeq) {
        if other.num == 0 {
            return;
        }
        if self.num == 0 || other.maximum > self.maximum {
            self.maximum = other.maximum;
        }
        self.num += other.num;
        self.sum += other.sum;
        self.sum_of_squares += other.sum_of_squares;
        self.zero += other.zero;
        for (mine, theirs) in self.buckets.iter_mut().zip(other.buckets.iter()) {
            let Some(theirs) = theirs else { continue };
            let mine = mine
                .get_or_insert_with(|| vec![0; SUB_BUCKETS].into_boxed_slice());
            for (m, t) in mine.iter_mut().zip(theirs.iter()) {
                *m += t;
            }
        }
        other.clear();
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }
}

impl std::fmt::Display for HdrSeq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "num = {}, min = {:.6}, 25% = {:.6}, 50% = {:.6}, 75% = {:.6}, max = {:.6}, avg = {:.6}",
            self.num,
            self.percentile(0.0),
            self.percentile(25.0),
            self.percentile(50.0),
            self.percentile(75.0),
            self.maximum,
            self.avg(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ERR: f64 = 0.5;

    fn basic() -> HdrSeq {
        let mut seq = HdrSeq::new();
        seq.add(0.0);
        seq.add(1.0);
        seq.add(10.0);
        for _ in 0..7 {
            seq.add(100.0);
        }
        seq
    }

    fn near(a: f64, b: f64) -> bool {
        (a - b).abs() <= ERR
    }

    #[test]
    fn test_maximum_and_minimum() {
        let seq = basic();
        assert_eq!(seq.maximum(), 100.0);
        assert_eq!(seq.percentile(0.0), 0.0);
    }

    #[test]
    fn test_percentiles() {
        let seq = basic();
        assert!(near(seq.percentile(10.0), 0.0));
        assert!(near(seq.percentile(20.0), 1.0));
        assert!(near(seq.percentile(30.0), 10.0));
        for p in [40.0, 50.0, 75.0, 90.0, 100.0] {
            assert!(near(seq.percentile(p), 100.0), "p{p} = {}", seq.percentile(p));
        }
    }

    #[test]
    fn test_merge_moves_samples() {
        let mut seq1 = HdrSeq::new();
        let mut seq2 = HdrSeq::new();
        let mut seq3 = HdrSeq::new();
        for _ in 0..80 {
            seq1.add(1.0);
            seq3.add(1.0);
        }
        for _ in 0..20 {
            seq2.add(100.0);
            seq3.add(100.0);
        }
        assert_eq!(seq1.num(), 80);
        assert_eq!(seq2.num(), 20);

        seq2.merge(&mut seq1);

        assert_eq!(seq1.num(), 0);
        assert_eq!(seq2.num(), 100);
        assert_eq!(seq2.maximum(), seq3.maximum());
        for p in (0..=100).step_by(10) {
            let p = p as f64;
            assert!(near(seq2.percentile(p), seq3.percentile(p)));
        }
        assert!(near(seq2.avg(), seq3.avg()));
        assert!(near(seq2.sd(), seq3.sd()));
    }

    #[test]
    fn test_small_latencies() {
        let mut seq = HdrSeq::new();
        seq.add(0.002);
        seq.add(0.004);
        let p50 = seq.percentile(50.0);
        assert!(p50 > 0.0019 && p50 <= 0.002, "{p50}");
        let p100 = seq.percentile(100.0);
        assert!(p100 > 0.0039 && p100 <= 0.004, "{p100}");
    }
}
