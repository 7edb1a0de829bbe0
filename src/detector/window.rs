//! Fixed-size rolling window over daily transaction counts

use std::collections::VecDeque;

/// Ring buffer with exact running sum and sum of squares
///
/// Counts are integers, so both sums are kept in `u128` and the variance
/// numerator `n·Σx² − (Σx)²` is computed without rounding before the final
/// division. Each push is O(1) while the sums fit.
///
/// Σx² of a few values near `u64::MAX` does not fit in `u128`. `sum_sq` is
/// then `None` and is rebuilt on each push until it fits again; mean and
/// std fall back to a two-pass `f64` computation meanwhile.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    capacity: usize,
    values: VecDeque<u64>,
    sum: u128,
    sum_sq: Option<u128>,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            values: VecDeque::with_capacity(capacity),
            sum: 0,
            sum_sq: Some(0),
        }
    }

    /// Add a value, evicting the oldest once the window is full
    pub fn push(&mut self, value: u64) {
        if self.values.len() == self.capacity {
            if let Some(old) = self.values.pop_front() {
                let old = old as u128;
                self.sum -= old;
                self.sum_sq = self.sum_sq.map(|sq| sq - old * old);
            }
        }

        let v = value as u128;
        self.values.push_back(value);
        self.sum += v;
        self.sum_sq = match self.sum_sq {
            Some(sq) => sq.checked_add(v * v),
            None => self.rescan_sum_sq(),
        };
    }

    fn rescan_sum_sq(&self) -> Option<u128> {
        self.values.iter().try_fold(0u128, |acc, &x| {
            let x = x as u128;
            acc.checked_add(x * x)
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.values.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn mean(&self) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        Some(self.sum as f64 / self.values.len() as f64)
    }

    /// Sample standard deviation (N-1 divisor); 0 for fewer than two values
    pub fn sample_std(&self) -> f64 {
        let n = self.values.len() as u128;
        if n < 2 {
            return 0.0;
        }

        // n·Σx² ≥ (Σx)², so the subtraction cannot underflow
        let numerator = self
            .sum_sq
            .and_then(|sq| n.checked_mul(sq))
            .zip(self.sum.checked_mul(self.sum))
            .map(|(a, b)| a - b);

        match numerator {
            Some(numerator) => (numerator as f64 / (n * (n - 1)) as f64).sqrt(),
            None => self.two_pass_std(),
        }
    }

    fn two_pass_std(&self) -> f64 {
        let n = self.values.len() as f64;
        let mean = self.values.iter().map(|&x| x as f64).sum::<f64>() / n;
        let squares: f64 = self.values.iter().map(|&x| (x as f64 - mean).powi(2)).sum();
        (squares / (n - 1.0)).sqrt()
    }
}
