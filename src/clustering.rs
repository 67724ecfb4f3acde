//! 1-D agglomerative clustering over listing prices.
//!
//! Prices are clustered bottom-up with a dense distance matrix and a
//! Lance-Williams linkage update; every merge step is recorded as a
//! dendrogram stratum, and the stratum with the best mean silhouette
//! coefficient is the one handed back to the aggregator.

/// The cluster partition after one merge step, together with the distance at
/// which the merge happened.
#[derive(Debug, Clone)]
pub struct DendrogramStratum {
    pub clusters: Vec<Vec<usize>>,
    pub height: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    Single,
    Complete,
    Average,
    Ward,
}

impl Linkage {
    /// Lance-Williams distance from cluster `k` to the merge of `i` and `j`:
    /// `a1*d(k,i) + a2*d(k,j) + b*d(i,j) + g*|d(k,i) - d(k,j)|`.
    fn update(self, dist: &DistanceMatrix, i: usize, j: usize, k: usize, ni: f64, nj: f64, nk: f64) -> f64 {
        let (a1, a2, b, g) = match self {
            Linkage::Single => (0.5, 0.5, 0.0, -0.5),
            Linkage::Complete => (0.5, 0.5, 0.0, 0.5),
            Linkage::Average => (ni / (ni + nj), nj / (ni + nj), 0.0, 0.0),
            Linkage::Ward => {
                let denom = ni + nj + nk;
                ((ni + nk) / denom, (nj + nk) / denom, -nk / denom, 0.0)
            }
        };

        let dki = dist.get2d(k, i);
        let dkj = dist.get2d(k, j);
        a1 * dki + a2 * dkj + b * dist.get2d(j, i) + g * (dki - dkj).abs()
    }
}

/// Dense row-major distance matrix. Merged rows/columns are dropped and a
/// fresh slot for the merged cluster is prepended each iteration.
#[derive(Debug, Clone)]
struct DistanceMatrix {
    data: Vec<f64>,
    rows: usize,
    cols: usize,
}

impl DistanceMatrix {
    fn new(rows: usize, cols: usize) -> Self {
        Self {
            data: vec![0.0; rows * cols],
            rows,
            cols,
        }
    }

    fn len(&self) -> usize {
        self.rows * self.cols
    }

    fn get(&self, i: usize) -> f64 {
        self.data[i]
    }

    fn set(&mut self, i: usize, v: f64) {
        self.data[i] = v;
    }

    fn get2d(&self, x: usize, y: usize) -> f64 {
        self.data[y * self.cols + x]
    }

    fn set2d(&mut self, x: usize, y: usize, v: f64) {
        self.data[y * self.cols + x] = v;
    }

    fn without_rows(&self, skip: &[usize]) -> Self {
        let mut next = Self::new(self.rows - skip.len(), self.cols);
        let mut n = 0;
        for i in 0..self.len() {
            if !skip.contains(&(i / self.cols)) {
                next.set(n, self.get(i));
                n += 1;
            }
        }
        next
    }

    fn without_cols(&self, skip: &[usize]) -> Self {
        let mut next = Self::new(self.rows, self.cols - skip.len());
        let mut n = 0;
        for i in 0..self.len() {
            if !skip.contains(&(i % self.cols)) {
                next.set(n, self.get(i));
                n += 1;
            }
        }
        next
    }

    /// Grow by one row and one column at the front, shifting existing
    /// entries to offset (1, 1).
    fn grown(&self) -> Self {
        let mut next = Self::new(self.rows + 1, self.cols + 1);
        for i in 0..self.len() {
            next.set2d(i % self.cols + 1, i / self.cols + 1, self.get(i));
        }
        next
    }
}

/// First position of the strictly smallest entry, scanning row-major.
/// Returns `((col, row), distance)`.
fn closest_pair(dist: &DistanceMatrix) -> ((usize, usize), f64) {
    let mut best = f64::INFINITY;
    let mut pair = (0, 0);
    for i in 0..dist.len() {
        let d = dist.get(i);
        if d < best {
            best = d;
            pair = (i % dist.cols, i / dist.cols);
        }
    }
    (pair, best)
}

/// Agglomerative clustering over a sorted price vector (`n >= 1`). Returns
/// one stratum per state: the initial singleton partition plus one per
/// merge, `n` in total.
pub fn hcluster(data: &[f64], linkage: Linkage) -> Vec<DendrogramStratum> {
    let n = data.len();

    let mut dist = DistanceMatrix::new(n, n);
    for i in 0..n * n {
        let (x, y) = (i % n, i / n);
        let d = if x == y {
            f64::INFINITY
        } else {
            (data[x] - data[y]).abs()
        };
        dist.set(i, d);
    }

    let mut clusters: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();
    let mut dendrogram = Vec::with_capacity(n);
    dendrogram.push(DendrogramStratum {
        clusters: clusters.clone(),
        height: 0.0,
    });

    for _ in 0..n.saturating_sub(1) {
        let ((ci, cj), height) = closest_pair(&dist);
        let ni = clusters[ci].len() as f64;
        let nj = clusters[cj].len() as f64;

        let mut merged = Vec::with_capacity(clusters[ci].len() + clusters[cj].len());
        merged.extend_from_slice(&clusters[ci]);
        merged.extend_from_slice(&clusters[cj]);

        let mut next_clusters = Vec::with_capacity(clusters.len() - 1);
        next_clusters.push(merged);
        for (idx, cluster) in clusters.iter().enumerate() {
            if idx != ci && idx != cj {
                next_clusters.push(cluster.clone());
            }
        }

        let removed = [ci, cj];
        let mut next = dist.without_rows(&removed).without_cols(&removed).grown();
        let mut slot = 0;
        for k in 0..dist.cols {
            if k == ci || k == cj {
                continue;
            }
            slot += 1;
            let nk = clusters[k].len() as f64;
            let d = linkage.update(&dist, ci, cj, k, ni, nj, nk);
            next.set2d(slot, 0, d);
            next.set2d(0, slot, d);
        }
        // the merged cluster's self-distance must never win the min scan
        next.set(0, f64::INFINITY);

        dendrogram.push(DendrogramStratum {
            clusters: next_clusters.clone(),
            height,
        });
        clusters = next_clusters;
        dist = next;
    }

    dendrogram
}

/// Map a stratum's index clusters back onto the source values.
pub fn map_to_values(data: &[f64], stratum: &DendrogramStratum) -> Vec<Vec<f64>> {
    stratum
        .clusters
        .iter()
        .map(|cluster| cluster.iter().map(|&i| data[i]).collect())
        .collect()
}

/// Mean silhouette coefficient of a partition. Singleton clusters score 0.
/// Inter-cluster mean distances are normalized by the size of the point's
/// own cluster, not the neighbor's.
pub fn mean_silhouette(clusters: &[Vec<f64>]) -> f64 {
    let mut coefficients = Vec::new();

    for (i, cluster) in clusters.iter().enumerate() {
        for (j, &point) in cluster.iter().enumerate() {
            if cluster.len() == 1 {
                coefficients.push(0.0);
                continue;
            }

            let mut intra = 0.0;
            for (nj, &neighbor) in cluster.iter().enumerate() {
                if nj != j {
                    intra += (neighbor - point).abs();
                }
            }
            intra /= cluster.len() as f64 - 1.0;

            let mut nearest = f64::INFINITY;
            for (ni, other) in clusters.iter().enumerate() {
                if ni == i {
                    continue;
                }
                let mut d = 0.0;
                for &neighbor in other {
                    d += (neighbor - point).abs();
                }
                d /= cluster.len() as f64;
                if d < nearest {
                    nearest = d;
                }
            }

            coefficients.push((nearest - intra) / nearest.max(intra));
        }
    }

    coefficients.iter().sum::<f64>() / coefficients.len() as f64
}

/// Pick the stratum with the best mean silhouette and return its clusters
/// as values.
pub fn select_clusters(data: &[f64], dendrogram: &[DendrogramStratum]) -> Vec<Vec<f64>> {
    let mut best_score = f64::NEG_INFINITY;
    let mut best = Vec::new();

    for stratum in dendrogram {
        let mapped = map_to_values(data, stratum);
        let score = mean_silhouette(&mapped);
        if score > best_score {
            best_score = score;
            best = mapped;
        }
    }

    best
}

/// Cluster a sorted price vector and return the best-scoring partition.
pub fn cluster_prices(data: &[f64], linkage: Linkage) -> Vec<Vec<f64>> {
    let dendrogram = hcluster(data, linkage);
    select_clusters(data, &dendrogram)
}
