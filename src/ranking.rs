use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::index::RowRanges;
use crate::kdtree::Neighbor;

/// 一张图库图片获得的票数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    pub identity: String,
    pub votes: u32,
}

/// 比率测试：最近距离不大于次近距离的 `ratio` 倍才算有效匹配
///
/// 只有一个近邻时无法比较，直接接受；没有近邻时返回 `None`。
pub fn ratio_test(neighbors: &[Neighbor], ratio: f32) -> Option<&Neighbor> {
    match neighbors {
        [] => None,
        [best] => Some(best),
        [best, second, ..] => (best.distance <= ratio * second.distance).then_some(best),
    }
}

/// 根据每个查询描述符的近邻结果给图库图片投票，按票数降序返回所有图片
///
/// 票数相同的图片保持图库顺序。近邻行号不属于任何图片时返回
/// [`Error::IndexMappingCorrupt`](crate::Error::IndexMappingCorrupt)，不会返回部分结果。
pub fn rank(neighbors: &[Vec<Neighbor>], ranges: &RowRanges, ratio: f32) -> Result<Vec<Match>> {
    let mut votes = vec![0u32; ranges.len()];
    let mut accepted = 0;
    for n in neighbors {
        if let Some(best) = ratio_test(n, ratio) {
            votes[ranges.locate(best.index)?] += 1;
            accepted += 1;
        }
    }
    debug!("{} 个查询描述符中 {} 个通过比率测试", neighbors.len(), accepted);

    let mut matches = ranges
        .iter()
        .zip(votes)
        .map(|(r, votes)| Match { identity: r.identity.clone(), votes })
        .collect::<Vec<_>>();
    matches.sort_by(|a, b| b.votes.cmp(&a.votes));
    Ok(matches)
}

/// 只保留属于某个类别的图片，顺序不变
pub fn restrict_to_labels<F>(matches: Vec<Match>, label: &str, label_of: F) -> Vec<Match>
where
    F: Fn(&str) -> Option<String>,
{
    matches
        .into_iter()
        .filter(|m| label_of(&m.identity).as_deref() == Some(label))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn n(index: usize, distance: f32) -> Neighbor {
        Neighbor { index, distance }
    }

    fn ranges(sizes: &[(&str, usize)]) -> RowRanges {
        sizes.iter().map(|(id, rows)| (id.to_string(), *rows)).collect()
    }

    #[test]
    fn test_ratio_test() {
        assert!(ratio_test(&[], 0.6).is_none());
        assert_eq!(ratio_test(&[n(3, 1.0)], 0.6).unwrap().index, 3);
        assert_eq!(ratio_test(&[n(1, 0.5), n(2, 1.0)], 0.6).unwrap().index, 1);
        assert!(ratio_test(&[n(1, 0.7), n(2, 1.0)], 0.6).is_none());
        assert!(ratio_test(&[n(1, 0.6), n(2, 1.0)], 0.6).is_some());
        // 两个距离都为 0 时 0 <= 0 成立
        assert!(ratio_test(&[n(1, 0.0), n(2, 0.0)], 0.6).is_some());
    }

    #[test]
    fn test_rank_orders_by_votes() {
        let ranges = ranges(&[("a", 5), ("b", 0), ("c", 4)]);
        let neighbors = vec![
            vec![n(0, 0.1), n(6, 1.0)],
            vec![n(3, 0.1), n(7, 1.0)],
            vec![n(6, 0.1), n(0, 1.0)],
            vec![n(4, 0.1), n(5, 1.0)],
            vec![n(8, 0.9), n(0, 1.0)],
        ];
        let result = rank(&neighbors, &ranges, 0.6).unwrap();
        assert_eq!(
            result,
            vec![
                Match { identity: "a".into(), votes: 3 },
                Match { identity: "c".into(), votes: 1 },
                Match { identity: "b".into(), votes: 0 },
            ]
        );
    }

    #[test]
    fn test_rank_ties_keep_corpus_order() {
        let ranges = ranges(&[("a", 1), ("b", 1), ("c", 1)]);
        let neighbors = vec![vec![n(2, 0.0)], vec![n(1, 0.0)]];
        let result = rank(&neighbors, &ranges, 0.6).unwrap();
        let ids = result.iter().map(|m| m.identity.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, ["b", "c", "a"]);
    }

    #[test]
    fn test_rank_corrupt_mapping() {
        let ranges = ranges(&[("a", 5), ("b", 0), ("c", 4)]);
        let neighbors = vec![vec![n(0, 0.1), n(1, 1.0)], vec![n(12, 0.1), n(1, 1.0)]];
        assert!(matches!(
            rank(&neighbors, &ranges, 0.6),
            Err(Error::IndexMappingCorrupt { row: 12, .. })
        ));
    }

    #[test]
    fn test_rejected_corrupt_row_is_ignored() {
        // 没有通过比率测试的近邻不参与投票，也不会检查行号
        let ranges = ranges(&[("a", 2)]);
        let neighbors = vec![vec![n(12, 0.9), n(1, 1.0)]];
        assert_eq!(rank(&neighbors, &ranges, 0.6).unwrap()[0].votes, 0);
    }

    #[test]
    fn test_restrict_to_labels() {
        let matches = vec![
            Match { identity: "data/001.cat/a.jpg".into(), votes: 3 },
            Match { identity: "data/002.dog/b.jpg".into(), votes: 2 },
            Match { identity: "data/001.cat/c.jpg".into(), votes: 1 },
        ];
        let cats = restrict_to_labels(matches, "cat", |id| crate::corpus::class_label_of(id));
        assert_eq!(cats.len(), 2);
        assert_eq!(cats[1].identity, "data/001.cat/c.jpg");
    }
}
