//! Path allow-list and submission validation / 路径白名单与提交参数校验

use std::path::{Path, PathBuf};

use crate::config::AllowedPathsConfig;
use crate::error::UploadError;
use crate::task::OriginClass;
use crate::utils::{fix_and_clean_path, is_sub_path};

/// 文件名最大长度（字符数）
pub const MAX_FILE_NAME_LENGTH: usize = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct PathValidation {
    pub resolved_path: PathBuf,
    pub allowed: bool,
}

pub trait PathValidator: Send + Sync {
    fn validate(&self, logical_path: &str) -> PathValidation;
}

#[derive(Debug, Clone)]
struct AllowedRootPath {
    alias: String,
    /// 规范化后的绝对路径（`/` 分隔）
    path: String,
}

/// 基于配置白名单的路径校验
#[derive(Debug, Clone)]
pub struct AllowListValidator {
    base_dir: String,
    roots: Vec<AllowedRootPath>,
}

impl AllowListValidator {
    pub fn new(base_dir: &Path, roots: &[(String, PathBuf)]) -> Self {
        Self {
            base_dir: absolute_clean(base_dir),
            roots: roots
                .iter()
                .map(|(alias, path)| AllowedRootPath {
                    alias: alias.clone(),
                    path: absolute_clean(path),
                })
                .collect(),
        }
    }

    pub fn from_config(config: &AllowedPathsConfig) -> Self {
        let roots: Vec<(String, PathBuf)> = config
            .roots
            .iter()
            .map(|r| (r.alias.clone(), PathBuf::from(&r.path)))
            .collect();
        Self::new(Path::new(&config.base_dir), &roots)
    }
}

impl PathValidator for AllowListValidator {
    fn validate(&self, logical_path: &str) -> PathValidation {
        let logical = logical_path.trim().replace('\\', "/");

        // 别名本身，或以别名开头的相对路径
        let (head, rest) = match logical.split_once('/') {
            Some((head, rest)) => (head, rest),
            None => (logical.as_str(), ""),
        };
        if let Some(root) = self.roots.iter().find(|r| !r.alias.is_empty() && r.alias == head) {
            let sub = fix_and_clean_path(rest);
            let resolved = if sub == "/" {
                root.path.clone()
            } else {
                format!("{}{}", root.path.trim_end_matches('/'), sub)
            };
            return PathValidation { resolved_path: PathBuf::from(resolved), allowed: true };
        }

        let joined = if logical.starts_with('/') {
            logical.clone()
        } else {
            format!("{}/{}", self.base_dir, logical)
        };
        let resolved = fix_and_clean_path(&joined);
        let allowed = self.roots.iter().any(|r| is_sub_path(&r.path, &resolved));
        if !allowed {
            tracing::warn!("Path outside allow-list rejected: {}", logical_path);
        }
        PathValidation { resolved_path: PathBuf::from(resolved), allowed }
    }
}

fn absolute_clean(path: &Path) -> String {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    };
    fix_and_clean_path(&absolute.to_string_lossy())
}

/// 提交参数校验：名称与目标数据集
pub fn validate_submission(name: &str, destination_dataset_id: &str) -> Result<(), UploadError> {
    if name.trim().is_empty() {
        return Err(UploadError::Validation("name is required".to_string()));
    }
    if name.chars().count() > MAX_FILE_NAME_LENGTH {
        return Err(UploadError::Validation(format!(
            "file name must not exceed {} characters",
            MAX_FILE_NAME_LENGTH
        )));
    }
    if destination_dataset_id.trim().is_empty() {
        return Err(UploadError::Validation("destination dataset id is required".to_string()));
    }
    Ok(())
}

/// 负载必须恰好一个，且与来源类型匹配
pub fn validate_payload(
    origin_class: OriginClass,
    remote_path: Option<&str>,
    url: Option<&str>,
) -> Result<(), UploadError> {
    let remote_path = remote_path.filter(|p| !p.trim().is_empty());
    let url = url.filter(|u| !u.trim().is_empty());

    match (origin_class, remote_path, url) {
        (OriginClass::RemoteOrigin, Some(_), None) => Ok(()),
        (OriginClass::UrlFetch, None, Some(url)) => {
            let parsed = url::Url::parse(url)
                .map_err(|e| UploadError::Validation(format!("invalid url {}: {}", url, e)))?;
            if matches!(parsed.scheme(), "http" | "https") {
                Ok(())
            } else {
                Err(UploadError::Validation(format!("unsupported url scheme: {}", parsed.scheme())))
            }
        }
        (OriginClass::LocalOrigin, _, _) => Err(UploadError::Validation(
            "local-origin uploads must be sent as multipart".to_string(),
        )),
        _ => Err(UploadError::Validation(
            "exactly one payload matching the origin class is required".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> AllowListValidator {
        AllowListValidator::new(
            Path::new("/srv/app"),
            &[("uploads".to_string(), PathBuf::from("/srv/app/uploads"))],
        )
    }

    #[test]
    fn test_alias_resolution() {
        let v = validator();
        assert_eq!(
            v.validate("uploads"),
            PathValidation { resolved_path: PathBuf::from("/srv/app/uploads"), allowed: true }
        );
        assert_eq!(v.validate("uploads/a/b.txt").resolved_path, PathBuf::from("/srv/app/uploads/a/b.txt"));
        // 别名下的 .. 不能越过根目录
        let escaped = v.validate("uploads/../../etc/passwd");
        assert_eq!(escaped.resolved_path, PathBuf::from("/srv/app/uploads/etc/passwd"));
        assert!(escaped.allowed);
    }

    #[test]
    fn test_relative_and_absolute_paths() {
        let v = validator();
        assert!(v.validate("uploads2/x").resolved_path.starts_with("/srv/app"));
        assert!(!v.validate("uploads2/x").allowed);
        assert!(!v.validate("other/file.txt").allowed);
        assert!(v.validate("/srv/app/uploads/ok.bin").allowed);
        assert!(!v.validate("/srv/app/uploads/../secret").allowed);
        assert!(!v.validate("/etc/passwd").allowed);
    }

    #[test]
    fn test_validate_submission() {
        assert!(validate_submission("a.txt", "42").is_ok());
        assert!(validate_submission("  ", "42").is_err());
        assert!(validate_submission("a.txt", "").is_err());
        let long = "x".repeat(MAX_FILE_NAME_LENGTH + 1);
        assert!(matches!(validate_submission(&long, "42"), Err(UploadError::Validation(_))));
        assert!(validate_submission(&"文".repeat(MAX_FILE_NAME_LENGTH), "42").is_ok());
    }

    #[test]
    fn test_validate_payload() {
        assert!(validate_payload(OriginClass::RemoteOrigin, Some("uploads/a"), None).is_ok());
        assert!(validate_payload(OriginClass::UrlFetch, None, Some("https://example.com/f.zip")).is_ok());
        assert!(validate_payload(OriginClass::UrlFetch, None, Some("ftp://example.com/f")).is_err());
        assert!(validate_payload(OriginClass::UrlFetch, Some("uploads/a"), Some("https://e.com")).is_err());
        assert!(validate_payload(OriginClass::RemoteOrigin, None, None).is_err());
        assert!(validate_payload(OriginClass::LocalOrigin, Some("x"), None).is_err());
    }
}
