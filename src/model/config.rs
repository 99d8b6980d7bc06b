//! アプリケーション設定管理モジュール
//!
//! モデルパス、推論タイムアウト、アップロード制限などをJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// モデルバンドル（.tar.gz）または .onnx ファイルのパス
    pub model_path: String,
    /// ONNX Runtime のスレッド数
    pub intra_threads: usize,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_path: "models/mobilenetv2_eye_disease.tar.gz".to_string(),
            intra_threads: 1,
        }
    }
}

/// 推論設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceSettings {
    /// 1回の推論の上限時間（ミリ秒）
    pub timeout_ms: u64,
    /// 出力が確率分布であることを検証するか
    pub require_normalized_output: bool,
    /// 出力スコア合計と1.0との許容誤差
    pub normalization_tolerance: f32,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            require_normalized_output: true,
            normalization_tolerance: 0.01,
        }
    }
}

impl InferenceSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// アップロード境界の設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    /// 受け付ける拡張子（小文字、ドットなし）
    pub allowed_extensions: Vec<String>,
    /// 最大アップロードサイズ（バイト）
    pub max_upload_bytes: u64,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            allowed_extensions: vec!["jpg".to_string(), "jpeg".to_string(), "png".to_string()],
            max_upload_bytes: 200 * 1024 * 1024,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub model: ModelSettings,
    pub inference: InferenceSettings,
    pub upload: UploadSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 指定パスから設定を読み込む、存在しない・壊れている場合はデフォルト設定を返す
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("設定ファイルが存在しません。デフォルト設定を使用します: {}", path.display());
            return Self::default();
        }

        match Self::load(path) {
            Ok(config) => {
                tracing::info!("設定ファイルを読み込みました: {}", path.display());
                config
            }
            Err(e) => {
                tracing::warn!(
                    "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn model_path(&self) -> PathBuf {
        PathBuf::from(&self.model.model_path)
    }
}
