//! RBF 核 SVM 多分类器
//!
//! 多分类采用一对一策略：每两个类别训练一个二分类器，预测时投票。
//! 二分类器用 SMO 求解对偶问题，工作集选择最大违反对。

use std::collections::BTreeMap;

use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::ClassifierOptions;
use crate::error::{Error, Result};
use crate::histogram::TrainingSet;
use crate::store::{ArtifactCache, MODEL_KEY, TRAINING_KEY};
use crate::vocabulary::Vocabulary;

const TAU: f64 = 1e-12;

fn rbf(gamma: f64, a: &[f64], b: &[f64]) -> f64 {
    let d: f64 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
    (-gamma * d).exp()
}

/// 一个二分类器，正类为 `positive`，负类为 `negative`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct BinarySvm {
    positive: usize,
    negative: usize,
    support: Vec<Vec<f64>>,
    /// alpha_i * y_i
    coef: Vec<f64>,
    rho: f64,
}

impl BinarySvm {
    fn decision(&self, gamma: f64, x: &[f64]) -> f64 {
        let sum: f64 = self.support.iter().zip(&self.coef).map(|(sv, c)| c * rbf(gamma, sv, x)).sum();
        sum - self.rho
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SvmModel {
    labels: Vec<String>,
    dim: usize,
    gamma: f64,
    machines: Vec<BinarySvm>,
}

impl SvmModel {
    /// 训练模型，类别按字典序排列
    pub fn train(samples: &[(Vec<f32>, String)], opts: &ClassifierOptions) -> Result<Self> {
        let Some((first, _)) = samples.first() else {
            return Err(Error::InvalidInput("no labeled histograms to train on".into()));
        };
        let dim = first.len();
        for (x, _) in samples {
            Error::check_dim(dim, x.len())?;
        }

        let mut by_label: BTreeMap<&str, Vec<Vec<f64>>> = BTreeMap::new();
        for (x, label) in samples {
            by_label
                .entry(label.as_str())
                .or_default()
                .push(x.iter().map(|v| *v as f64).collect());
        }
        let labels = by_label.keys().map(|s| s.to_string()).collect::<Vec<_>>();
        let groups = by_label.into_values().collect::<Vec<_>>();
        info!("训练 SVM：{} 个样本，{} 个类别", samples.len(), labels.len());

        let pairs = (0..groups.len())
            .flat_map(|a| (a + 1..groups.len()).map(move |b| (a, b)))
            .collect::<Vec<_>>();
        let machines = pairs
            .into_par_iter()
            .map(|(a, b)| train_binary(&groups[a], &groups[b], a, b, opts))
            .collect::<Vec<_>>();

        Ok(Self { labels, dim, gamma: opts.gamma, machines })
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// 预测类别，票数相同时取序号较小的类别
    pub fn predict(&self, x: &[f32]) -> Result<&str> {
        Error::check_dim(self.dim, x.len())?;
        let x = x.iter().map(|v| *v as f64).collect::<Vec<_>>();

        let mut votes = vec![0usize; self.labels.len()];
        for m in &self.machines {
            if m.decision(self.gamma, &x) > 0.0 {
                votes[m.positive] += 1;
            } else {
                votes[m.negative] += 1;
            }
        }

        let mut best = 0;
        for (i, v) in votes.iter().enumerate() {
            if *v > votes[best] {
                best = i;
            }
        }
        Ok(&self.labels[best])
    }
}

fn train_binary(
    pos: &[Vec<f64>],
    neg: &[Vec<f64>],
    positive: usize,
    negative: usize,
    opts: &ClassifierOptions,
) -> BinarySvm {
    let x = pos.iter().chain(neg).collect::<Vec<_>>();
    let y = (0..x.len()).map(|i| if i < pos.len() { 1.0 } else { -1.0 }).collect::<Vec<f64>>();
    let n = x.len();

    let kernel = (0..n)
        .into_par_iter()
        .map(|i| (0..n).map(|j| rbf(opts.gamma, x[i], x[j])).collect::<Vec<_>>())
        .collect::<Vec<_>>();
    let q = |i: usize, j: usize| y[i] * y[j] * kernel[i][j];

    let c = opts.c;
    let mut alpha = vec![0.0f64; n];
    let mut grad = vec![-1.0f64; n];

    let mut iter = 0;
    loop {
        // 最大违反对
        let (mut gmax, mut i) = (f64::NEG_INFINITY, usize::MAX);
        let (mut gmin, mut j) = (f64::INFINITY, usize::MAX);
        for t in 0..n {
            let v = -y[t] * grad[t];
            let up = if y[t] > 0.0 { alpha[t] < c } else { alpha[t] > 0.0 };
            let low = if y[t] > 0.0 { alpha[t] > 0.0 } else { alpha[t] < c };
            if up && v > gmax {
                (gmax, i) = (v, t);
            }
            if low && v < gmin {
                (gmin, j) = (v, t);
            }
        }
        if i == usize::MAX || j == usize::MAX || gmax - gmin < opts.tol {
            break;
        }
        if iter >= opts.max_iter {
            warn!("SMO 达到最大迭代次数 {}，提前结束", opts.max_iter);
            break;
        }
        iter += 1;

        let (old_ai, old_aj) = (alpha[i], alpha[j]);
        if y[i] != y[j] {
            let mut quad = kernel[i][i] + kernel[j][j] + 2.0 * q(i, j);
            if quad <= 0.0 {
                quad = TAU;
            }
            let delta = (-grad[i] - grad[j]) / quad;
            let diff = alpha[i] - alpha[j];
            alpha[i] += delta;
            alpha[j] += delta;
            if diff > 0.0 {
                if alpha[j] < 0.0 {
                    alpha[j] = 0.0;
                    alpha[i] = diff;
                }
            } else if alpha[i] < 0.0 {
                alpha[i] = 0.0;
                alpha[j] = -diff;
            }
            if diff > 0.0 {
                if alpha[i] > c {
                    alpha[i] = c;
                    alpha[j] = c - diff;
                }
            } else if alpha[j] > c {
                alpha[j] = c;
                alpha[i] = c + diff;
            }
        } else {
            let mut quad = kernel[i][i] + kernel[j][j] - 2.0 * q(i, j);
            if quad <= 0.0 {
                quad = TAU;
            }
            let delta = (grad[i] - grad[j]) / quad;
            let sum = alpha[i] + alpha[j];
            alpha[i] -= delta;
            alpha[j] += delta;
            if sum > c {
                if alpha[i] > c {
                    alpha[i] = c;
                    alpha[j] = sum - c;
                }
            } else if alpha[j] < 0.0 {
                alpha[j] = 0.0;
                alpha[i] = sum;
            }
            if sum > c {
                if alpha[j] > c {
                    alpha[j] = c;
                    alpha[i] = sum - c;
                }
            } else if alpha[i] < 0.0 {
                alpha[i] = 0.0;
                alpha[j] = sum;
            }
        }

        let (dai, daj) = (alpha[i] - old_ai, alpha[j] - old_aj);
        for t in 0..n {
            grad[t] += q(t, i) * dai + q(t, j) * daj;
        }
    }
    debug!("类别 {} / {}：SMO 迭代 {} 次", positive, negative, iter);

    let rho = calculate_rho(&alpha, &y, &grad, c);
    let (support, coef) = (0..n)
        .filter(|&t| alpha[t] > 0.0)
        .map(|t| (x[t].clone(), alpha[t] * y[t]))
        .unzip();
    BinarySvm { positive, negative, support, coef, rho }
}

fn calculate_rho(alpha: &[f64], y: &[f64], grad: &[f64], c: f64) -> f64 {
    let (mut ub, mut lb) = (f64::INFINITY, f64::NEG_INFINITY);
    let (mut nr_free, mut sum_free) = (0usize, 0.0);
    for t in 0..alpha.len() {
        let yg = y[t] * grad[t];
        if alpha[t] >= c {
            if y[t] < 0.0 { ub = ub.min(yg) } else { lb = lb.max(yg) }
        } else if alpha[t] <= 0.0 {
            if y[t] > 0.0 { ub = ub.min(yg) } else { lb = lb.max(yg) }
        } else {
            nr_free += 1;
            sum_free += yg;
        }
    }
    if nr_free > 0 { sum_free / nr_free as f64 } else { (ub + lb) / 2.0 }
}

/// 持久化的模型，记录训练时使用的词汇表指纹
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedModel {
    pub fingerprint: String,
    pub model: SvmModel,
}

/// 分类器，未训练时预测会返回 [`Error::ModelNotTrained`]
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    model: Option<SvmModel>,
}

impl Classifier {
    pub fn untrained() -> Self {
        Self::default()
    }

    pub fn new(model: SvmModel) -> Self {
        Self { model: Some(model) }
    }

    /// 加载已训练的模型，不存在时用训练集训练并保存
    pub fn load_or_train(
        cache: &ArtifactCache,
        vocab: &Vocabulary,
        training_set: &TrainingSet,
        opts: &ClassifierOptions,
    ) -> Result<Self> {
        let trained = cache.get_or_build_validated(
            MODEL_KEY,
            |m: &TrainedModel| vocab.check_fingerprint(MODEL_KEY, &m.fingerprint),
            || {
                vocab.check_fingerprint(TRAINING_KEY, &training_set.fingerprint)?;
                let samples = training_set
                    .items
                    .iter()
                    .filter_map(|item| item.label.clone().map(|label| (item.bins.clone(), label)))
                    .collect::<Vec<_>>();
                let model = SvmModel::train(&samples, opts)?;
                Ok(TrainedModel { fingerprint: vocab.fingerprint().to_string(), model })
            },
        )?;
        Ok(Self::new(trained.model))
    }

    pub fn is_trained(&self) -> bool {
        self.model.is_some()
    }

    pub fn model(&self) -> Option<&SvmModel> {
        self.model.as_ref()
    }

    pub fn predict(&self, histogram: &[f32]) -> Result<&str> {
        self.model.as_ref().ok_or(Error::ModelNotTrained)?.predict(histogram)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> ClassifierOptions {
        ClassifierOptions { gamma: 1.0, ..Default::default() }
    }

    fn sample(v: [f32; 3], label: &str) -> (Vec<f32>, String) {
        (v.to_vec(), label.to_string())
    }

    fn three_classes() -> Vec<(Vec<f32>, String)> {
        vec![
            sample([1.0, 0.0, 0.0], "a"),
            sample([0.9, 0.1, 0.0], "a"),
            sample([0.8, 0.1, 0.1], "a"),
            sample([0.0, 1.0, 0.0], "b"),
            sample([0.1, 0.9, 0.0], "b"),
            sample([0.1, 0.8, 0.1], "b"),
            sample([0.0, 0.0, 1.0], "c"),
            sample([0.0, 0.1, 0.9], "c"),
            sample([0.1, 0.1, 0.8], "c"),
        ]
    }

    #[test]
    fn test_separates_classes() {
        let model = SvmModel::train(&three_classes(), &opts()).unwrap();
        assert_eq!(model.labels(), ["a", "b", "c"]);
        assert_eq!(model.predict(&[0.95, 0.05, 0.0]).unwrap(), "a");
        assert_eq!(model.predict(&[0.05, 0.9, 0.05]).unwrap(), "b");
        assert_eq!(model.predict(&[0.0, 0.05, 0.95]).unwrap(), "c");
        for (x, label) in three_classes() {
            assert_eq!(model.predict(&x).unwrap(), label);
        }
    }

    #[test]
    fn test_single_class() {
        let model = SvmModel::train(&[sample([1.0, 0.0, 0.0], "only")], &opts()).unwrap();
        assert_eq!(model.predict(&[0.0, 1.0, 0.0]).unwrap(), "only");
    }

    #[test]
    fn test_train_errors() {
        assert!(matches!(SvmModel::train(&[], &opts()), Err(Error::InvalidInput(_))));
        let bad = vec![sample([1.0, 0.0, 0.0], "a"), (vec![1.0], "b".to_string())];
        assert!(matches!(
            SvmModel::train(&bad, &opts()),
            Err(Error::DimensionMismatch { expected: 3, actual: 1 })
        ));
    }

    #[test]
    fn test_predict_dimension_mismatch() {
        let model = SvmModel::train(&three_classes(), &opts()).unwrap();
        assert!(matches!(model.predict(&[1.0]), Err(Error::DimensionMismatch { .. })));
    }

    #[test]
    fn test_untrained() {
        let classifier = Classifier::untrained();
        assert!(!classifier.is_trained());
        assert!(matches!(classifier.predict(&[1.0, 0.0, 0.0]), Err(Error::ModelNotTrained)));
    }

    #[test]
    fn test_rho_free_vectors() {
        let rho = calculate_rho(&[0.5, 0.5], &[1.0, -1.0], &[-0.2, -0.6], 1.0);
        assert!((rho - 0.2).abs() < 1e-12);
    }
}
