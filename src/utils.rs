/// Path processing utility functions / 路径处理工具函数

use std::path::{Component, Path};

/// Clean and normalize path / 清理和规范化路径
/// 1. Replace backslashes with forward slashes / 将反斜杠替换为正斜杠
/// 2. Ensure path starts with / / 确保路径以 / 开头
/// 3. Clean . and .. in path / 清理路径中的 . 和 ..
pub fn fix_and_clean_path(path: &str) -> String {
    let path = path.replace('\\', "/");
    let path = if path.starts_with('/') {
        path
    } else {
        format!("/{}", path)
    };

    clean_path(&path)
}

/// Clean path, handle ., .. and duplicate / / 清理路径，处理 . 和 .. 和重复的 /
fn clean_path(path: &str) -> String {
    let parts = clean_segments(path);
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

fn clean_segments(path: &str) -> Vec<&str> {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                parts.pop();
            }
            _ => parts.push(part),
        }
    }
    parts
}

/// Check if sub_path is a subpath of path / 判断 sub_path 是否是 path 的子路径
pub fn is_sub_path(path: &str, sub_path: &str) -> bool {
    let path = fix_and_clean_path(path);
    let sub_path = fix_and_clean_path(sub_path);

    if path == sub_path {
        return true;
    }

    let path_with_sep = if path.ends_with('/') {
        path
    } else {
        format!("{}/", path)
    };

    sub_path.starts_with(&path_with_sep)
}

/// Join a relative file path onto a dataset base path / 拼接数据集目标路径
///
/// The result always uses `/`, never starts with `/` and never contains
/// empty, `.` or `..` segments.
pub fn join_dataset_path(base: &str, relative: &str) -> String {
    let joined = format!("{}/{}", base.replace('\\', "/"), relative.replace('\\', "/"));
    clean_segments(&joined).join("/")
}

/// Path of `file` relative to `root`, `/`-separated / 计算相对路径
pub fn relative_dataset_path(root: &Path, file: &Path) -> Option<String> {
    let relative = file.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Last segment of a `/` or `\` separated name / 获取文件名
pub fn file_name_of(path: &str) -> &str {
    path.rsplit(|c| c == '/' || c == '\\')
        .find(|s| !s.is_empty())
        .unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_fix_and_clean_path() {
        assert_eq!(fix_and_clean_path(""), "/");
        assert_eq!(fix_and_clean_path(".."), "/");
        assert_eq!(fix_and_clean_path("a/b/c"), "/a/b/c");
        assert_eq!(fix_and_clean_path("a\\b\\c"), "/a/b/c");
        assert_eq!(fix_and_clean_path("/a//b///c"), "/a/b/c");
        assert_eq!(fix_and_clean_path("/a/./b/../c"), "/a/c");
    }

    #[test]
    fn test_is_sub_path() {
        assert!(is_sub_path("/data/uploads", "/data/uploads"));
        assert!(is_sub_path("/data/uploads", "/data/uploads/a/b.txt"));
        assert!(!is_sub_path("/data/uploads", "/data/uploads2/a"));
        assert!(!is_sub_path("/data/uploads", "/data/uploads/../secret"));
    }

    #[test]
    fn test_join_dataset_path() {
        assert_eq!(join_dataset_path("", "a.txt"), "a.txt");
        assert_eq!(join_dataset_path("/", "sub/b.txt"), "sub/b.txt");
        assert_eq!(join_dataset_path("photos/2024/", "sub\\b.txt"), "photos/2024/sub/b.txt");
        assert_eq!(join_dataset_path("photos", "./x//y.bin"), "photos/x/y.bin");
    }

    #[test]
    fn test_relative_dataset_path() {
        let root = PathBuf::from("/tmp/root");
        assert_eq!(
            relative_dataset_path(&root, &root.join("sub").join("b.txt")).as_deref(),
            Some("sub/b.txt")
        );
        assert_eq!(relative_dataset_path(&root, &root), None);
        assert_eq!(relative_dataset_path(&root, Path::new("/elsewhere/a")), None);
    }

    #[test]
    fn test_file_name_of() {
        assert_eq!(file_name_of("a/b/c.txt"), "c.txt");
        assert_eq!(file_name_of("dir\\x.bin"), "x.bin");
        assert_eq!(file_name_of("plain"), "plain");
        assert_eq!(file_name_of("folder/"), "folder");
    }
}
