use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use log::info;
use regex::Regex;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// 类别目录名，例如 `001.cat`
static RE_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+\.(.+)$").expect("failed to build regex"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorpusImage {
    pub path: PathBuf,
    pub label: Option<String>,
}

impl CorpusImage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let label = class_label_of(&path);
        Self { path, label }
    }

    /// 图片的唯一标识
    pub fn identity(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }
}

/// 递归扫描目录下的图片，按路径排序以保证每次扫描的顺序一致
///
/// `suffix` 为逗号分隔的后缀名，不区分大小写
pub fn list_images(root: impl AsRef<Path>, suffix: &str) -> Result<Vec<CorpusImage>> {
    let root = root.as_ref();
    if !root.is_dir() {
        return Err(Error::InvalidInput(format!("{} is not a directory", root.display())));
    }
    let re_suf = Regex::new(&format!("(?i)^({})$", suffix.replace(',', "|")))
        .map_err(|e| Error::InvalidInput(e.to_string()))?;

    let mut paths = WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            path.extension()
                .is_some_and(|ext| re_suf.is_match(&ext.to_string_lossy()))
        })
        .collect::<Vec<_>>();
    paths.sort();
    info!("扫描完成，共 {} 张图片", paths.len());

    Ok(paths.into_iter().map(CorpusImage::new).collect())
}

/// 从路径中形如 `<数字>.<类别>` 的目录名解析类别，取最靠近文件的一级
pub fn class_label_of(path: impl AsRef<Path>) -> Option<String> {
    let path = path.as_ref();
    path.parent()?
        .components()
        .rev()
        .filter_map(|c| c.as_os_str().to_str())
        .find_map(|segment| RE_LABEL.captures(segment).map(|caps| caps[1].to_string()))
}

/// 返回图库中出现的所有类别，已排序
pub fn class_labels(images: &[CorpusImage]) -> Vec<String> {
    images
        .iter()
        .filter_map(|image| image.label.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::fs;

    #[rstest]
    #[case("data/001.cat/a.jpg", Some("cat"))]
    #[case("data/12.golden retriever/b.png", Some("golden retriever"))]
    #[case("/abs/003.bird/sub/c.jpg", Some("bird"))]
    #[case("data/cat/a.jpg", None)]
    #[case("001.cat", None)]
    #[case("data/x.cat/a.jpg", None)]
    fn test_class_label_of(#[case] path: &str, #[case] expected: Option<&str>) {
        assert_eq!(class_label_of(path).as_deref(), expected);
    }

    #[test]
    fn test_list_images() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("002.dog")).unwrap();
        fs::create_dir_all(dir.path().join("001.cat")).unwrap();
        fs::write(dir.path().join("002.dog/b.JPG"), b"").unwrap();
        fs::write(dir.path().join("001.cat/a.png"), b"").unwrap();
        fs::write(dir.path().join("001.cat/notes.txt"), b"").unwrap();

        let images = list_images(dir.path(), "jpg,png").unwrap();
        assert_eq!(images.len(), 2);
        assert!(images[0].path.ends_with("001.cat/a.png"));
        assert_eq!(images[0].label.as_deref(), Some("cat"));
        assert_eq!(images[1].label.as_deref(), Some("dog"));
        assert_eq!(class_labels(&images), ["cat", "dog"]);
    }

    #[test]
    fn test_list_images_missing_root() {
        let result = list_images("/definitely/not/here", "jpg");
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
