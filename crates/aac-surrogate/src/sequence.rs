//! Halton low-discrepancy sequence over the unit hypercube.

#[derive(Debug, Clone)]
pub struct HaltonSequence {
    primes: Vec<u64>,
    index: u64,
}

impl HaltonSequence {
    /// Sequence of `dims`-dimensional points, starting at index 1.
    pub fn new(dims: usize) -> Self {
        Self {
            primes: first_primes(dims),
            index: 1,
        }
    }

    pub fn dims(&self) -> usize {
        self.primes.len()
    }

    /// Index of the next point to be produced.
    pub fn position(&self) -> u64 {
        self.index
    }

    pub fn next_point(&mut self) -> Vec<f64> {
        let i = self.index;
        self.index += 1;
        self.primes.iter().map(|&b| radical_inverse(i, b)).collect()
    }
}

impl Iterator for HaltonSequence {
    type Item = Vec<f64>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_point())
    }
}

fn radical_inverse(mut i: u64, base: u64) -> f64 {
    let mut f = 1.0;
    let mut r = 0.0;
    let b = base as f64;
    while i > 0 {
        f /= b;
        r += f * (i % base) as f64;
        i /= base;
    }
    r
}

fn first_primes(n: usize) -> Vec<u64> {
    let mut primes = Vec::with_capacity(n);
    let mut candidate = 2u64;
    while primes.len() < n {
        if primes
            .iter()
            .take_while(|&&p| p * p <= candidate)
            .all(|&p| candidate % p != 0)
        {
            primes.push(candidate);
        }
        candidate += 1;
    }
    primes
}
