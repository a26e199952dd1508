// 上传会话
//
// 一次文件上传的不可变记录：分片大小和数量在第一个分片分发前确定，之后不再变化

use crate::api::{TransferMode, VideoMetadata};
use crate::error::ValidationError;
use crate::uploader::part::PartLayout;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 生成客户端会话 ID
pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// 上传会话
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    /// 会话 ID（服务端返回非空 ID 时以服务端为准）
    pub id: String,
    pub file_name: String,
    pub content_type: String,
    pub mode: TransferMode,
    pub file_size: u64,
    pub part_size: u64,
    pub total_parts: usize,
    pub metadata: VideoMetadata,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
}

impl UploadSession {
    /// 创建会话
    ///
    /// 分片数量由文件大小和分片大小计算
    pub fn new(
        id: String,
        file_name: String,
        content_type: String,
        mode: TransferMode,
        file_size: u64,
        part_size: u64,
        metadata: VideoMetadata,
    ) -> Result<Self, ValidationError> {
        let layout = PartLayout::new(file_size, part_size)?;

        Ok(Self {
            id,
            file_name,
            content_type,
            mode,
            file_size,
            part_size,
            total_parts: layout.total_parts(),
            metadata,
            created_at: chrono::Utc::now().timestamp(),
        })
    }

    /// 分片布局
    pub fn layout(&self) -> Result<PartLayout, ValidationError> {
        PartLayout::new(self.file_size, self.part_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_are_unique() {
        let a = new_session_id();
        let b = new_session_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }

    #[test]
    fn test_session_total_parts() {
        let session = UploadSession::new(
            new_session_id(),
            "a.mp4".to_string(),
            "video/mp4".to_string(),
            TransferMode::Proxy,
            10 * 1024 * 1024,
            4 * 1024 * 1024,
            VideoMetadata::new("A"),
        )
        .unwrap();
        assert_eq!(session.total_parts, 3);
        assert_eq!(session.layout().unwrap().range(2).end, 10 * 1024 * 1024);
    }

    #[test]
    fn test_empty_file_has_no_session() {
        let result = UploadSession::new(
            new_session_id(),
            "a.mp4".to_string(),
            "video/mp4".to_string(),
            TransferMode::Direct,
            0,
            1024,
            VideoMetadata::default(),
        );
        assert_eq!(result, Err(ValidationError::EmptyFile));
    }
}
