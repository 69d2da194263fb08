use loadbench_core::{Distribution, EXACT_SAMPLE_LIMIT, TDIGEST_COMPRESSION};
use pdatastructs::tdigest::{TDigest, K1};

const TDIGEST_BACKLOG_SIZE: usize = 100;

/// A stream of observations summarized as a [`Distribution`].
///
/// Values are retained exactly up to [`EXACT_SAMPLE_LIMIT`]; past that they move into a
/// t-digest and quantiles become estimates.
#[derive(Debug, Clone)]
pub(crate) struct Series {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    exact: Vec<f64>,
    digest: Option<TDigest<K1>>,
}

impl Series {
    pub fn new() -> Self {
        Self {
            count: 0,
            sum: 0.,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            exact: vec![],
            digest: None,
        }
    }

    pub fn push(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }

        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);

        match &mut self.digest {
            Some(digest) => digest.insert(value),
            None => {
                self.exact.push(value);
                if self.exact.len() > EXACT_SAMPLE_LIMIT {
                    let mut digest = default_tdigest();
                    for v in self.exact.drain(..) {
                        digest.insert(v);
                    }
                    self.digest = Some(digest);
                }
            }
        }
    }

    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn distribution(&self) -> Option<Distribution> {
        if self.count == 0 {
            return None;
        }

        let (p50, p90, p95, p99) = match &self.digest {
            Some(digest) => {
                let q = |q: f64| {
                    let v = digest.quantile(q);
                    if v.is_nan() {
                        self.sum / self.count as f64
                    } else {
                        v.clamp(self.min, self.max)
                    }
                };
                (q(0.5), q(0.9), q(0.95), q(0.99))
            }
            None => {
                let mut sorted = self.exact.clone();
                sorted.sort_by(f64::total_cmp);
                let q = |q: f64| nearest_rank(&sorted, q);
                (q(0.5), q(0.9), q(0.95), q(0.99))
            }
        };

        Some(Distribution {
            count: self.count,
            avg: self.sum / self.count as f64,
            min: self.min,
            max: self.max,
            p50,
            p90,
            p95,
            p99,
            exact: self.digest.is_none(),
        })
    }
}

/// Nearest-rank quantile of a sorted, non-empty slice.
fn nearest_rank(sorted: &[f64], q: f64) -> f64 {
    let rank = (q * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn default_tdigest() -> TDigest<K1> {
    TDigest::new(K1::new(TDIGEST_COMPRESSION), TDIGEST_BACKLOG_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use loadbench_core::TDIGEST_RANK_ERROR;
    use rand::rngs::SmallRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    #[test]
    fn test_empty() {
        assert_eq!(Series::new().distribution(), None);
    }

    #[test]
    fn test_exact_nearest_rank() {
        let mut series = Series::new();
        for v in (1..=100).rev() {
            series.push(v as f64);
        }
        series.push(f64::NAN);

        let d = series.distribution().unwrap();
        assert!(d.exact);
        assert_eq!(d.count, 100);
        assert_eq!(d.min, 1.);
        assert_eq!(d.max, 100.);
        assert_eq!(d.avg, 50.5);
        assert_eq!(d.p50, 50.);
        assert_eq!(d.p90, 90.);
        assert_eq!(d.p95, 95.);
        assert_eq!(d.p99, 99.);
    }

    #[test]
    fn test_single_value() {
        let mut series = Series::new();
        series.push(0.25);
        let d = series.distribution().unwrap();
        assert_eq!((d.p50, d.p99), (0.25, 0.25));
    }

    #[test]
    fn test_switches_to_sketch() {
        let mut series = Series::new();
        for v in 0..EXACT_SAMPLE_LIMIT {
            series.push(v as f64);
        }
        assert!(series.distribution().unwrap().exact);

        series.push(0.);
        assert!(!series.distribution().unwrap().exact);
        assert_eq!(series.len(), EXACT_SAMPLE_LIMIT as u64 + 1);
    }

    #[test]
    fn test_sketch_rank_error() {
        let n = 20_000;
        let mut values: Vec<f64> = (0..n).map(|i| i as f64 / n as f64).collect();
        values.shuffle(&mut SmallRng::seed_from_u64(3));

        let mut series = Series::new();
        for v in values {
            series.push(v);
        }

        // Values are uniform on [0, 1), so the value error equals the rank error.
        let d = series.distribution().unwrap();
        assert!(!d.exact);
        for (estimate, q) in [(d.p50, 0.5), (d.p90, 0.9), (d.p95, 0.95), (d.p99, 0.99)] {
            assert!(
                (estimate - q).abs() <= TDIGEST_RANK_ERROR,
                "q{q}: estimate {estimate}"
            );
        }
    }
}
