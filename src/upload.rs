//! アップロード境界
//!
//! 表示層から受け取った生バイト列と宣言された拡張子を検証します。

use crate::error::{Result, RetinaError};
use crate::model::UploadSettings;

/// 宣言された画像フォーマット
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclaredFormat {
    Jpeg,
    Png,
}

impl DeclaredFormat {
    /// 拡張子からフォーマットを判定（大文字小文字・先頭のドットは無視）
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(DeclaredFormat::Jpeg),
            "png" => Some(DeclaredFormat::Png),
            _ => None,
        }
    }

    pub fn image_format(self) -> image::ImageFormat {
        match self {
            DeclaredFormat::Jpeg => image::ImageFormat::Jpeg,
            DeclaredFormat::Png => image::ImageFormat::Png,
        }
    }
}

/// アップロードされた画像（RawImage）
#[derive(Debug, Clone)]
pub struct UploadedImage {
    bytes: Vec<u8>,
    format: DeclaredFormat,
}

impl UploadedImage {
    pub fn new(bytes: Vec<u8>, extension: &str, settings: &UploadSettings) -> Result<Self> {
        let normalized = extension.trim_start_matches('.').to_ascii_lowercase();
        if !settings.allowed_extensions.iter().any(|e| *e == normalized) {
            return Err(RetinaError::UnsupportedFormat(extension.to_string()));
        }
        let format = DeclaredFormat::from_extension(&normalized)
            .ok_or_else(|| RetinaError::UnsupportedFormat(extension.to_string()))?;

        let size = bytes.len() as u64;
        if size > settings.max_upload_bytes {
            return Err(RetinaError::UploadTooLarge {
                size,
                limit: settings.max_upload_bytes,
            });
        }
        if bytes.is_empty() {
            return Err(RetinaError::Decode("uploaded file is empty".to_string()));
        }

        Ok(Self { bytes, format })
    }

    /// ファイルパスの拡張子を宣言フォーマットとして読み込む
    pub fn from_path(path: &std::path::Path, settings: &UploadSettings) -> anyhow::Result<Self> {
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        let bytes = std::fs::read(path)?;
        Ok(Self::new(bytes, &extension, settings)?)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn format(&self) -> DeclaredFormat {
        self.format
    }
}
