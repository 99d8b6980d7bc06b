//! 分類パイプラインのエラー定義
//!
//! 各エラーは利用者側で回復可能なもの（再アップロードで解決する）と、
//! 運用者側の設定ミスやプログラム上の契約違反に分かれます。

use std::path::{Path, PathBuf};
use thiserror::Error;

/// エラーの重大度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// 利用者が正しい画像を再アップロードすれば解決する
    UserRecoverable,
    /// デプロイ設定の不備（モデル欠損、ラベル不一致など）
    OperatorFatal,
    /// 前処理と推論エンジンの間の契約違反（プログラムの不具合）
    ContractViolation,
}

#[derive(Debug, Error)]
pub enum RetinaError {
    #[error("failed to decode image: {0}")]
    Decode(String),

    #[error("unsupported file extension `{0}` (expected jpg, jpeg or png)")]
    UnsupportedFormat(String),

    #[error("upload of {size} bytes exceeds the limit of {limit} bytes")]
    UploadTooLarge { size: u64, limit: u64 },

    #[error("cannot normalize an image with {channels} channel(s) to RGB")]
    UnsupportedChannelLayout { channels: usize },

    #[error("failed to load model from {path:?}: {reason}")]
    ModelLoad { path: PathBuf, reason: String },

    #[error("input tensor shape {actual:?} does not match the model input {expected:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("model returned {actual} scores but the label table has {expected}")]
    EmptyOutput { expected: usize, actual: usize },

    #[error("model output is not a probability distribution (sum = {sum})")]
    OutputNotNormalized { sum: f32 },

    #[error("inference did not finish within {millis} ms")]
    Timeout { millis: u64 },

    #[error("inference runtime error: {0}")]
    Runtime(String),
}

pub type Result<T> = std::result::Result<T, RetinaError>;

impl RetinaError {
    pub fn model_load(path: &Path, reason: impl Into<String>) -> Self {
        RetinaError::ModelLoad {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            RetinaError::Decode(_)
            | RetinaError::UnsupportedFormat(_)
            | RetinaError::UploadTooLarge { .. }
            | RetinaError::UnsupportedChannelLayout { .. } => Severity::UserRecoverable,
            RetinaError::ShapeMismatch { .. } => Severity::ContractViolation,
            RetinaError::ModelLoad { .. }
            | RetinaError::EmptyOutput { .. }
            | RetinaError::OutputNotNormalized { .. }
            | RetinaError::Timeout { .. }
            | RetinaError::Runtime(_) => Severity::OperatorFatal,
        }
    }

    pub fn is_user_recoverable(&self) -> bool {
        self.severity() == Severity::UserRecoverable
    }

    /// 利用者に見せるメッセージ
    ///
    /// 内部エラーの詳細は表示せず、ログ側にのみ残します。
    pub fn user_message(&self) -> String {
        match self {
            RetinaError::UploadTooLarge { limit, .. } => format!(
                "The uploaded file is too large (limit {} MB). Please upload a smaller JPG/PNG.",
                limit / (1024 * 1024)
            ),
            RetinaError::UnsupportedChannelLayout { .. } => {
                "This image uses an unsupported color layout. Please upload a color or grayscale JPG/PNG."
                    .to_string()
            }
            e if e.is_user_recoverable() => "Please upload a valid JPG/PNG retinal image.".to_string(),
            _ => "An internal error occurred while analyzing the image. Please contact the operator."
                .to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_taxonomy() {
        assert_eq!(RetinaError::Decode("x".into()).severity(), Severity::UserRecoverable);
        assert_eq!(
            RetinaError::UnsupportedChannelLayout { channels: 5 }.severity(),
            Severity::UserRecoverable
        );
        assert_eq!(
            RetinaError::model_load(Path::new("m.tar.gz"), "missing").severity(),
            Severity::OperatorFatal
        );
        assert_eq!(
            RetinaError::ShapeMismatch { expected: vec![1], actual: vec![2] }.severity(),
            Severity::ContractViolation
        );
        assert_eq!(
            RetinaError::EmptyOutput { expected: 4, actual: 3 }.severity(),
            Severity::OperatorFatal
        );
    }

    #[test]
    fn test_user_message_hides_internal_details() {
        let decode = RetinaError::Decode("truncated".into());
        assert!(decode.user_message().contains("valid JPG/PNG"));

        let load = RetinaError::model_load(Path::new("/secret/model.tar.gz"), "not found");
        let message = load.user_message();
        assert!(!message.contains("/secret"));
        assert!(message.contains("internal error"));
    }
}
