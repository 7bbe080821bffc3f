//! 随机 kd 森林，用于浮点描述符的近似最近邻搜索
//!
//! 每棵树在方差最大的几个维度中随机选择切分维度，查询时所有树共享一个优先队列，
//! 按到切分面的距离依次回溯，检查的点数达到 `checks` 后停止。

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use log::info;
use ndarray::{Array2, ArrayView1, ArrayView2};
use rand::prelude::*;
use rand::rngs::StdRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::IndexOptions;
use crate::error::{Error, Result};
use crate::kmeans::l2_sq;

/// 候选切分维度数量
const RAND_DIM: usize = 5;
/// 计算均值和方差时最多采样的点数
const SAMPLE_MEAN: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    /// 在数据中的行号
    pub index: usize,
    /// 欧氏距离的平方
    pub distance: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    Leaf(usize),
    Split { dim: usize, value: f32, left: usize, right: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KdTree {
    nodes: Vec<Node>,
}

impl KdTree {
    fn build(data: ArrayView2<f32>, rng: &mut StdRng) -> Self {
        let mut indices = (0..data.nrows()).collect::<Vec<_>>();
        indices.shuffle(rng);
        let mut tree = Self { nodes: vec![] };
        if !indices.is_empty() {
            tree.divide(data, &mut indices, rng);
        }
        tree
    }

    /// 递归建树，返回节点在 `nodes` 中的位置
    fn divide(&mut self, data: ArrayView2<f32>, indices: &mut [usize], rng: &mut StdRng) -> usize {
        let id = self.nodes.len();
        if indices.len() == 1 {
            self.nodes.push(Node::Leaf(indices[0]));
            return id;
        }
        self.nodes.push(Node::Leaf(usize::MAX));

        let (dim, value) = mean_split(data, indices, rng);
        let mut mid = partition(indices, |&i| data[[i, dim]] < value);
        // 该维度上的值全部相同，直接对半分
        if mid == 0 || mid == indices.len() {
            mid = indices.len() / 2;
        }

        let (l, r) = indices.split_at_mut(mid);
        let left = self.divide(data, l, rng);
        let right = self.divide(data, r, rng);
        self.nodes[id] = Node::Split { dim, value, left, right };
        id
    }
}

/// 在采样点方差最大的几个维度中随机选一个，以均值作为切分点
fn mean_split(data: ArrayView2<f32>, indices: &[usize], rng: &mut StdRng) -> (usize, f32) {
    let dims = data.ncols();
    let sample = &indices[..indices.len().min(SAMPLE_MEAN)];
    let n = sample.len() as f32;

    let mut mean = vec![0.0f32; dims];
    for &i in sample {
        for (m, v) in mean.iter_mut().zip(data.row(i)) {
            *m += v;
        }
    }
    mean.iter_mut().for_each(|m| *m /= n);

    let mut var = vec![0.0f32; dims];
    for &i in sample {
        for ((s, v), m) in var.iter_mut().zip(data.row(i)).zip(&mean) {
            *s += (v - m) * (v - m);
        }
    }

    let mut order = (0..dims).collect::<Vec<_>>();
    order.sort_by(|&a, &b| var[b].partial_cmp(&var[a]).unwrap_or(Ordering::Equal));
    let dim = order[rng.random_range(0..RAND_DIM.min(dims))];
    (dim, mean[dim])
}

/// 把满足条件的元素移到前面，返回满足条件的数量
fn partition<F: Fn(&usize) -> bool>(indices: &mut [usize], pred: F) -> usize {
    let mut mid = 0;
    for i in 0..indices.len() {
        if pred(&indices[i]) {
            indices.swap(i, mid);
            mid += 1;
        }
    }
    mid
}

/// 待回溯的分支
struct Branch {
    mindist: f32,
    tree: usize,
    node: usize,
}

impl Ord for Branch {
    fn cmp(&self, other: &Self) -> Ordering {
        // 最小堆
        other.mindist.total_cmp(&self.mindist)
    }
}

impl PartialOrd for Branch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Branch {
    fn eq(&self, other: &Self) -> bool {
        self.mindist == other.mindist
    }
}

impl Eq for Branch {}

/// 保存最近的 k 个结果，按距离升序
struct ResultSet {
    k: usize,
    items: Vec<Neighbor>,
}

impl ResultSet {
    fn full(&self) -> bool {
        self.items.len() >= self.k
    }

    fn worst(&self) -> f32 {
        if self.full() { self.items[self.items.len() - 1].distance } else { f32::INFINITY }
    }

    fn add(&mut self, n: Neighbor) {
        if self.full() && n.distance >= self.worst() {
            return;
        }
        let pos = self
            .items
            .partition_point(|x| (x.distance, x.index) < (n.distance, n.index));
        self.items.insert(pos, n);
        self.items.truncate(self.k);
    }
}

/// 查询过程中的状态
struct Search<'a, 'q> {
    forest: &'a KdForest,
    query: ArrayView1<'q, f32>,
    result: ResultSet,
    heap: BinaryHeap<Branch>,
    visited: HashSet<usize>,
    checks: usize,
}

impl Search<'_, '_> {
    fn exhausted(&self) -> bool {
        self.checks >= self.forest.checks && self.result.full()
    }

    fn search_level(&mut self, tree: usize, mut node: usize, mindist: f32) {
        if self.result.full() && mindist > self.result.worst() {
            return;
        }
        let forest = self.forest;
        let nodes = &forest.trees[tree].nodes;
        loop {
            match nodes[node] {
                Node::Leaf(index) => {
                    if self.exhausted() || !self.visited.insert(index) {
                        return;
                    }
                    self.checks += 1;
                    let distance = l2_sq(self.query, forest.data.row(index));
                    self.result.add(Neighbor { index, distance });
                    return;
                }
                Node::Split { dim, value, left, right } => {
                    let diff = self.query[dim] - value;
                    let (best, other) = if diff < 0.0 { (left, right) } else { (right, left) };
                    let new_dist = mindist + diff * diff;
                    if !self.result.full() || new_dist < self.result.worst() {
                        self.heap.push(Branch { mindist: new_dist, tree, node: other });
                    }
                    node = best;
                }
            }
        }
    }
}

/// 随机 kd 森林，只能一次性构建，不支持增量添加
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdForest {
    data: Array2<f32>,
    trees: Vec<KdTree>,
    checks: usize,
}

impl KdForest {
    pub fn build(data: Array2<f32>, opts: &IndexOptions) -> Self {
        info!("构建 kd 森林：{} 个点，{} 棵树", data.nrows(), opts.trees);
        let view = data.view();
        let trees = (0..opts.trees.max(1))
            .into_par_iter()
            .map(|t| {
                let mut rng = StdRng::seed_from_u64(opts.seed.wrapping_add(t as u64));
                KdTree::build(view, &mut rng)
            })
            .collect();
        Self { data, trees, checks: opts.checks.max(1) }
    }

    pub fn len(&self) -> usize {
        self.data.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.data.nrows() == 0
    }

    pub fn dim(&self) -> usize {
        self.data.ncols()
    }

    pub fn data(&self) -> ArrayView2<f32> {
        self.data.view()
    }

    pub fn checks(&self) -> usize {
        self.checks
    }

    /// 修改检查的点数，不需要重建
    pub fn set_checks(&mut self, checks: usize) {
        self.checks = checks.max(1);
    }

    /// 查找 `query` 的 k 个近似最近邻，结果按距离升序
    pub fn knn(&self, query: ArrayView1<f32>, k: usize) -> Vec<Neighbor> {
        if k == 0 || self.is_empty() {
            return vec![];
        }
        let mut search = Search {
            forest: self,
            query,
            result: ResultSet { k, items: Vec::with_capacity(k + 1) },
            heap: BinaryHeap::new(),
            visited: HashSet::new(),
            checks: 0,
        };
        for tree in 0..self.trees.len() {
            search.search_level(tree, 0, 0.0);
        }
        while let Some(branch) = search.heap.pop() {
            if search.exhausted() {
                break;
            }
            search.search_level(branch.tree, branch.node, branch.mindist);
        }
        search.result.items
    }

    /// 批量查询，每行一个查询向量
    pub fn knn_batch(&self, queries: ArrayView2<f32>, k: usize) -> Result<Vec<Vec<Neighbor>>> {
        if queries.nrows() > 0 && !self.is_empty() {
            Error::check_dim(self.dim(), queries.ncols())?;
        }
        Ok(queries.outer_iter().into_par_iter().map(|q| self.knn(q, k)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    fn random_data(n: usize, d: usize, seed: u64) -> Array2<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((n, d), |_| rng.random::<f32>())
    }

    fn brute_force(data: ArrayView2<f32>, q: ArrayView1<f32>) -> usize {
        (0..data.nrows())
            .min_by(|&a, &b| l2_sq(q, data.row(a)).total_cmp(&l2_sq(q, data.row(b))))
            .unwrap()
    }

    #[test]
    fn test_exact_duplicates() {
        let data = random_data(500, 16, 1);
        let forest = KdForest::build(data.clone(), &IndexOptions::default());
        let result = forest.knn_batch(data.view(), 2).unwrap();
        for (i, neighbors) in result.iter().enumerate() {
            assert_eq!(neighbors.len(), 2);
            assert_eq!(neighbors[0].index, i);
            assert_eq!(neighbors[0].distance, 0.0);
            assert!(neighbors[0].distance <= neighbors[1].distance);
        }
    }

    #[test]
    fn test_recall() {
        let data = random_data(1000, 8, 2);
        let queries = random_data(100, 8, 3);
        let opts = IndexOptions { checks: 256, ..Default::default() };
        let forest = KdForest::build(data.clone(), &opts);
        let hits = queries
            .outer_iter()
            .filter(|q| forest.knn(q.view(), 1)[0].index == brute_force(data.view(), q.view()))
            .count();
        assert!(hits >= 80, "recall too low: {hits}/100");
    }

    #[test]
    fn test_exhaustive_when_checks_cover_all() {
        let data = random_data(64, 4, 4);
        let opts = IndexOptions { checks: 64, trees: 1, ..Default::default() };
        let forest = KdForest::build(data.clone(), &opts);
        let q = Array1::from(vec![0.5f32; 4]);
        let got = forest.knn(q.view(), 64);
        assert_eq!(got.len(), 64);
        assert_eq!(got[0].index, brute_force(data.view(), q.view()));
    }

    #[test]
    fn test_identical_points() {
        let data = Array2::from_elem((10, 3), 1.0f32);
        let forest = KdForest::build(data, &IndexOptions::default());
        let got = forest.knn(Array1::from(vec![1.0f32; 3]).view(), 3);
        assert_eq!(got.len(), 3);
        assert!(got.iter().all(|n| n.distance == 0.0));
    }

    #[test]
    fn test_empty_and_mismatch() {
        let forest = KdForest::build(Array2::zeros((0, 4)), &IndexOptions::default());
        assert!(forest.knn_batch(Array2::zeros((2, 4)).view(), 2).unwrap().iter().all(Vec::is_empty));

        let forest = KdForest::build(random_data(10, 4, 5), &IndexOptions::default());
        assert!(matches!(
            forest.knn_batch(Array2::zeros((1, 3)).view(), 2),
            Err(Error::DimensionMismatch { expected: 4, actual: 3 })
        ));
    }

    #[test]
    fn test_deterministic_build() {
        let data = random_data(200, 8, 6);
        let a = KdForest::build(data.clone(), &IndexOptions::default());
        let b = KdForest::build(data.clone(), &IndexOptions::default());
        let q = data.row(17);
        assert_eq!(a.knn(q, 2), b.knn(q, 2));
    }
}
