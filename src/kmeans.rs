use indicatif::ProgressBar;
use log::{debug, info};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rand::prelude::*;
use rand::rngs::StdRng;
use rayon::prelude::*;

use crate::config::VocabularyOptions;
use crate::error::{Error, Result};
use crate::utils::pb_style;

#[derive(Debug, Clone, PartialEq)]
pub struct KMeansConfig {
    pub k: usize,
    pub max_iter: usize,
    pub epsilon: f32,
    pub attempts: usize,
    pub seed: u64,
}

impl From<&VocabularyOptions> for KMeansConfig {
    fn from(opts: &VocabularyOptions) -> Self {
        Self {
            k: opts.vocab_size,
            max_iter: opts.max_iter,
            epsilon: opts.epsilon,
            attempts: opts.attempts.max(1),
            seed: opts.seed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct KMeansState {
    /// 聚类中心，每行一个
    pub centroids: Array2<f32>,
    /// 所有点到所属中心的距离平方和
    pub compactness: f64,
    /// 每个聚类中心包含的向量数量
    pub centroid_frequency: Vec<usize>,
}

#[inline]
pub fn l2_sq(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// 返回距离 `point` 最近的中心序号及距离平方，距离相同时取序号小的
pub fn nearest_centroid(point: ArrayView1<f32>, centroids: ArrayView2<f32>) -> (usize, f32) {
    let mut best = (0, f32::MAX);
    for (j, centroid) in centroids.outer_iter().enumerate() {
        let d = l2_sq(point, centroid);
        if d < best.1 {
            best = (j, d);
        }
    }
    best
}

fn imbalance_factor(hist: &[usize]) -> f32 {
    let (mut tot, mut uf) = (0.0, 0.0);
    for h in hist {
        let h = *h as f32;
        tot += h;
        uf += h.powf(2.0);
    }
    uf * hist.len() as f32 / tot.powf(2.0)
}

/// K-means 聚类，k-means++ 初始化，重复 `attempts` 次后保留距离和最小的结果
///
/// 种子固定时结果是确定的。
pub fn kmeans(data: ArrayView2<f32>, config: &KMeansConfig) -> Result<KMeansState> {
    let n = data.nrows();
    if n == 0 {
        return Err(Error::InvalidInput("no descriptors to cluster".into()));
    }
    if config.k == 0 || config.k > n {
        return Err(Error::InvalidInput(format!(
            "cannot build {} clusters from {} descriptors",
            config.k, n
        )));
    }

    let mut best: Option<KMeansState> = None;
    for attempt in 0..config.attempts.max(1) {
        let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(attempt as u64));
        let state = kmeans_once(data, config, &mut rng);
        info!(
            "第 {} 次聚类完成，距离和：{:.4}，不平衡度：{:.2}",
            attempt + 1,
            state.compactness,
            imbalance_factor(&state.centroid_frequency)
        );
        if best.as_ref().is_none_or(|b| state.compactness < b.compactness) {
            best = Some(state);
        }
    }
    best.ok_or_else(|| Error::InvalidInput("no clustering attempt was made".into()))
}

fn kmeans_once(data: ArrayView2<f32>, config: &KMeansConfig, rng: &mut StdRng) -> KMeansState {
    let mut centroids = init_plusplus(data, config.k, rng);

    let pb = ProgressBar::new(config.max_iter as u64).with_style(pb_style());
    for iter in 0..config.max_iter {
        let (assignments, _) = update_assignments(data, centroids.view());
        let new_centroids = update_centroids(data, &assignments, centroids.view());

        let shift = centroids
            .outer_iter()
            .zip(new_centroids.outer_iter())
            .map(|(a, b)| l2_sq(a, b))
            .fold(0.0f32, f32::max)
            .sqrt();
        centroids = new_centroids;
        pb.inc(1);
        pb.set_message(format!("最大位移：{shift:.6}"));

        if shift < config.epsilon {
            debug!("第 {} 轮收敛", iter + 1);
            break;
        }
    }
    pb.finish_and_clear();

    let (assignments, compactness) = update_assignments(data, centroids.view());
    let mut centroid_frequency = vec![0; config.k];
    for a in assignments {
        centroid_frequency[a] += 1;
    }
    KMeansState { centroids, compactness, centroid_frequency }
}

/// k-means++：按到已选中心的距离平方加权抽样
fn init_plusplus(data: ArrayView2<f32>, k: usize, rng: &mut StdRng) -> Array2<f32> {
    let n = data.nrows();
    let mut chosen = Vec::with_capacity(k);
    chosen.push(rng.random_range(0..n));

    let mut dist = data
        .outer_iter()
        .into_par_iter()
        .map(|p| l2_sq(p, data.row(chosen[0])))
        .collect::<Vec<_>>();

    while chosen.len() < k {
        let total = dist.iter().map(|d| *d as f64).sum::<f64>();
        let next = if total > 0.0 {
            let mut r = rng.random::<f64>() * total;
            let mut next = dist.iter().rposition(|d| *d > 0.0).unwrap_or(n - 1);
            for (i, d) in dist.iter().enumerate() {
                r -= *d as f64;
                if r <= 0.0 && *d > 0.0 {
                    next = i;
                    break;
                }
            }
            next
        } else {
            // 剩下的点和已选中心完全重合
            rng.random_range(0..n)
        };
        chosen.push(next);

        let center = data.row(next);
        dist.par_iter_mut().zip(data.outer_iter().into_par_iter()).for_each(|(d, p)| {
            *d = d.min(l2_sq(p, center));
        });
    }

    data.select(Axis(0), &chosen)
}

/// 将每个点分配给最近的聚类中心，并返回聚类中心的序号和距离平方和
fn update_assignments(data: ArrayView2<f32>, centroids: ArrayView2<f32>) -> (Vec<usize>, f64) {
    let (assignments, distances): (Vec<_>, Vec<_>) = data
        .outer_iter()
        .into_par_iter()
        .map(|point| nearest_centroid(point, centroids))
        .unzip();
    let distance = distances.iter().map(|d| *d as f64).sum();
    (assignments, distance)
}

/// 重新计算聚类中心，空的聚类保留原中心
fn update_centroids(
    data: ArrayView2<f32>,
    assignments: &[usize],
    old: ArrayView2<f32>,
) -> Array2<f32> {
    let mut sums = Array2::<f64>::zeros(old.dim());
    let mut counts = vec![0usize; old.nrows()];
    for (point, &a) in data.outer_iter().zip(assignments) {
        sums.row_mut(a).zip_mut_with(&point, |s, v| *s += *v as f64);
        counts[a] += 1;
    }

    let mut centroids = old.to_owned();
    for (j, count) in counts.into_iter().enumerate() {
        if count > 0 {
            centroids
                .row_mut(j)
                .zip_mut_with(&sums.row(j), |c, s| *c = (*s / count as f64) as f32);
        }
    }
    centroids
}
