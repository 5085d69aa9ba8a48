//! Principal component projection of instance features.

use serde::{Deserialize, Serialize};

use crate::{SurrogateError, SurrogateResult};

const POWER_ITERATIONS: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pca {
    means: Vec<f64>,
    scales: Vec<f64>,
    /// Unit-length principal axes, strongest first.
    components: Vec<Vec<f64>>,
}

impl Pca {
    /// Fit a projection onto at most `k` components. When the data has no
    /// more than `k` columns the standardized features are kept as they are.
    /// Every row must have the same length.
    pub fn fit(data: &[Vec<f64>], k: usize) -> SurrogateResult<Self> {
        let dims = data.first().map(|r| r.len()).unwrap_or(0);
        if let Some(row) = data.iter().find(|r| r.len() != dims) {
            return Err(SurrogateError::DimensionMismatch {
                expected: dims,
                actual: row.len(),
            });
        }
        let n = data.len().max(1) as f64;

        let means: Vec<f64> = (0..dims)
            .map(|j| data.iter().map(|r| r[j]).sum::<f64>() / n)
            .collect();
        let scales: Vec<f64> = (0..dims)
            .map(|j| {
                let var = data.iter().map(|r| (r[j] - means[j]).powi(2)).sum::<f64>() / n;
                if var > 1e-12 {
                    var.sqrt()
                } else {
                    1.0
                }
            })
            .collect();

        if dims <= k {
            let components = (0..dims)
                .map(|i| (0..dims).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
                .collect();
            return Ok(Self {
                means,
                scales,
                components,
            });
        }

        let standardized: Vec<Vec<f64>> = data
            .iter()
            .map(|r| (0..dims).map(|j| (r[j] - means[j]) / scales[j]).collect())
            .collect();
        let mut cov = vec![vec![0.0; dims]; dims];
        for row in &standardized {
            for a in 0..dims {
                for b in 0..dims {
                    cov[a][b] += row[a] * row[b] / n;
                }
            }
        }

        let mut components = Vec::with_capacity(k);
        for _ in 0..k {
            let (value, vector) = dominant_eigenpair(&cov);
            if value <= 1e-12 {
                break;
            }
            for a in 0..dims {
                for b in 0..dims {
                    cov[a][b] -= value * vector[a] * vector[b];
                }
            }
            components.push(vector);
        }

        Ok(Self {
            means,
            scales,
            components,
        })
    }

    pub fn n_components(&self) -> usize {
        self.components.len()
    }

    pub fn transform(&self, row: &[f64]) -> Vec<f64> {
        let standardized: Vec<f64> = row
            .iter()
            .zip(self.means.iter().zip(&self.scales))
            .map(|(x, (m, s))| (x - m) / s)
            .collect();
        self.components
            .iter()
            .map(|c| c.iter().zip(&standardized).map(|(a, b)| a * b).sum())
            .collect()
    }
}

fn dominant_eigenpair(matrix: &[Vec<f64>]) -> (f64, Vec<f64>) {
    let dims = matrix.len();
    let mut v: Vec<f64> = (0..dims).map(|i| 1.0 + i as f64 / dims as f64).collect();
    normalize(&mut v);
    let mut value = 0.0;
    for _ in 0..POWER_ITERATIONS {
        let mut next: Vec<f64> = matrix
            .iter()
            .map(|row| row.iter().zip(&v).map(|(a, b)| a * b).sum())
            .collect();
        value = normalize(&mut next);
        if value <= 1e-12 {
            break;
        }
        v = next;
    }
    (value, v)
}

fn normalize(v: &mut [f64]) -> f64 {
    let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    norm
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_component_follows_correlated_axis() {
        // Two perfectly correlated columns and one noise column.
        let data: Vec<Vec<f64>> = (0..50)
            .map(|i| {
                let x = i as f64;
                let noise = if i % 2 == 0 { 1.0 } else { -1.0 };
                vec![x, 2.0 * x + 1.0, noise]
            })
            .collect();
        let pca = Pca::fit(&data, 1).unwrap();
        assert_eq!(pca.n_components(), 1);
        let c = &pca.components[0];
        assert!((c[0].abs() - c[1].abs()).abs() < 1e-3);
        assert!(c[2].abs() < 0.1);
    }

    #[test]
    fn test_few_columns_are_only_standardized() {
        let data = vec![vec![1.0, 10.0], vec![3.0, 30.0]];
        let pca = Pca::fit(&data, 7).unwrap();
        assert_eq!(pca.n_components(), 2);
        assert_eq!(pca.transform(&[2.0, 20.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_empty_data_projects_to_nothing() {
        let pca = Pca::fit(&[], 3).unwrap();
        assert!(pca.transform(&[]).is_empty());
    }

    #[test]
    fn test_ragged_rows_are_rejected() {
        let data = vec![vec![1.0, 2.0, 3.0], vec![1.0]];
        assert!(matches!(
            Pca::fit(&data, 2),
            Err(SurrogateError::DimensionMismatch {
                expected: 3,
                actual: 1
            })
        ));
    }
}
