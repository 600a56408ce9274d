//! 目录文件加载

use crate::error::StorageError;
use crate::models::{CatalogFile, CatalogSnapshot, snapshot_from_file};
use std::path::Path;

/// 解析目录 JSON 文本
pub fn parse_catalog(json: &str) -> Result<CatalogSnapshot, StorageError> {
    let file: CatalogFile = serde_json::from_str(json)?;
    snapshot_from_file(file)
}

/// 读取并解析目录文件
pub fn load_catalog_file(path: impl AsRef<Path>) -> Result<CatalogSnapshot, StorageError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|err| StorageError::new(format!("{}: {}", path.display(), err)))?;
    parse_catalog(&text)
}
