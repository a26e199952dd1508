// 上传数据源
//
// 文件大小在开始上传前确定，之后按字节范围读取分片数据。
// 文件读取放在 spawn_blocking 中执行，避免阻塞异步运行时。

use crate::error::TransferError;
use anyhow::{Context, Result};
use bytes::Bytes;
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};

/// 上传数据源
#[derive(Debug, Clone)]
pub enum UploadSource {
    /// 内存数据
    Memory(Bytes),
    /// 本地文件
    File { path: PathBuf, size: u64 },
}

impl UploadSource {
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self::Memory(data.into())
    }

    /// 打开本地文件（读取文件大小）
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("无法读取文件信息: {:?}", path))?;
        if !metadata.is_file() {
            anyhow::bail!("不是普通文件: {:?}", path);
        }
        Ok(Self::File {
            size: metadata.len(),
            path,
        })
    }

    /// 数据总大小
    pub fn len(&self) -> u64 {
        match self {
            Self::Memory(data) => data.len() as u64,
            Self::File { size, .. } => *size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 本地文件名（内存数据返回 None）
    pub fn file_name(&self) -> Option<String> {
        match self {
            Self::Memory(_) => None,
            Self::File { path, .. } => path
                .file_name()
                .map(|name| name.to_string_lossy().to_string()),
        }
    }

    /// 读取字节范围
    pub async fn read_range(&self, range: Range<u64>) -> Result<Bytes, TransferError> {
        if range.end > self.len() || range.start > range.end {
            return Err(TransferError::Source(format!(
                "读取范围 {:?} 超出数据大小 {}",
                range,
                self.len()
            )));
        }

        match self {
            Self::Memory(data) => Ok(data.slice(range.start as usize..range.end as usize)),
            Self::File { path, .. } => {
                let path = path.clone();
                let start = range.start;
                let size = (range.end - range.start) as usize;

                tokio::task::spawn_blocking(move || -> std::io::Result<Bytes> {
                    let mut file = std::fs::File::open(&path)?;
                    file.seek(SeekFrom::Start(start))?;

                    let mut buffer = vec![0u8; size];
                    file.read_exact(&mut buffer)?;

                    Ok(Bytes::from(buffer))
                })
                .await
                .map_err(|e| TransferError::Source(e.to_string()))?
                .map_err(|e| TransferError::Source(e.to_string()))
            }
        }
    }
}

/// 根据扩展名推断 Content-Type
pub fn guess_content_type(file_name: &str) -> &'static str {
    let ext = Path::new(file_name)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "mp4" => "video/mp4",
        "m4v" => "video/x-m4v",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_memory_range() {
        let source = UploadSource::from_bytes(b"0123456789".to_vec());
        assert_eq!(source.len(), 10);
        assert_eq!(source.read_range(2..5).await.unwrap(), Bytes::from_static(b"234"));
        assert!(source.read_range(8..12).await.is_err());
    }

    #[tokio::test]
    async fn test_file_range() {
        let mut file = NamedTempFile::new().unwrap();
        let content: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        file.write_all(&content).unwrap();
        file.flush().unwrap();

        let source = UploadSource::from_path(file.path()).await.unwrap();
        assert_eq!(source.len(), 10_000);

        let data = source.read_range(4096..8192).await.unwrap();
        assert_eq!(&data[..], &content[4096..8192]);

        let tail = source.read_range(8192..10_000).await.unwrap();
        assert_eq!(tail.len(), 1808);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(UploadSource::from_path(dir.path().join("nope.mp4")).await.is_err());
        // 目录不是普通文件
        assert!(UploadSource::from_path(dir.path()).await.is_err());
    }

    #[test]
    fn test_content_type() {
        assert_eq!(guess_content_type("clip.MP4"), "video/mp4");
        assert_eq!(guess_content_type("a.mov"), "video/quicktime");
        assert_eq!(guess_content_type("a.webm"), "video/webm");
        assert_eq!(guess_content_type("noext"), "application/octet-stream");
    }
}
