//! モデルメタデータの定義と検証
//!
//! tar.gz形式のモデルバンドルに `metadata.json` として格納され、
//! 入出力テンソルの形状・型とラベル表のバージョンを宣言します。

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, RetinaError};
use crate::model::label_table::{label_table, LabelTable, LABEL_TABLE_V1, NUM_CLASSES};

/// モデル入力の空間解像度
pub const MODEL_INPUT_SIZE: usize = 224;

/// モデル入力のチャネル数
pub const MODEL_INPUT_CHANNELS: usize = 3;

/// 期待される入力形状 (batch, height, width, channels)
pub const EXPECTED_INPUT_SHAPE: [usize; 4] =
    [1, MODEL_INPUT_SIZE, MODEL_INPUT_SIZE, MODEL_INPUT_CHANNELS];

/// テンソルの数値型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorDType {
    Float32,
    Uint8,
    Int8,
}

impl std::fmt::Display for TensorDType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TensorDType::Float32 => write!(f, "float32"),
            TensorDType::Uint8 => write!(f, "uint8"),
            TensorDType::Int8 => write!(f, "int8"),
        }
    }
}

/// 入出力テンソルの記述子
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDescriptor {
    /// ランタイム上のテンソル名
    pub name: String,
    pub dtype: TensorDType,
    pub shape: Vec<usize>,
}

impl TensorDescriptor {
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }
}

fn default_true() -> bool {
    true
}

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.onnx: 量子化済みネットワーク
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub model_name: String,

    /// 出力スコアの並びに対応するラベル表のバージョン
    pub label_table_version: u32,

    /// 出力順のクラスラベル
    /// 例: ["Normal", "Diabetic Retinopathy", "Glaucoma", "AMD"]
    pub class_labels: Vec<String>,

    pub input: TensorDescriptor,
    pub output: TensorDescriptor,

    /// 出力層がsoftmax済み（確率分布）かどうか
    #[serde(default = "default_true")]
    pub output_is_probability: bool,

    /// 量子化方式（例: "int8", "float16"）
    #[serde(default)]
    pub quantization: Option<String>,

    /// エクスポート時刻（ISO8601形式）
    #[serde(default)]
    pub exported_at: String,
}

impl ModelMetadata {
    /// ラベル表V1・固定入出力形状のメタデータを作成
    pub fn v1(model_name: &str, input_name: &str, output_name: &str) -> Self {
        Self {
            model_name: model_name.to_string(),
            label_table_version: LABEL_TABLE_V1.version,
            class_labels: LABEL_TABLE_V1.labels(),
            input: TensorDescriptor {
                name: input_name.to_string(),
                dtype: TensorDType::Float32,
                shape: EXPECTED_INPUT_SHAPE.to_vec(),
            },
            output: TensorDescriptor {
                name: output_name.to_string(),
                dtype: TensorDType::Float32,
                shape: vec![1, NUM_CLASSES],
            },
            output_is_probability: true,
            quantization: None,
            exported_at: chrono::Local::now().to_rfc3339(),
        }
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> anyhow::Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }

    /// 固定の入出力契約とラベル表に合致するか検証し、対応するラベル表を返す
    pub fn validate(&self, path: &Path) -> Result<&'static LabelTable> {
        let fail = |reason: String| RetinaError::model_load(path, reason);

        if self.input.dtype != TensorDType::Float32 {
            return Err(fail(format!("input dtype is {}, expected float32", self.input.dtype)));
        }
        if self.input.shape != EXPECTED_INPUT_SHAPE {
            return Err(fail(format!(
                "input shape is {:?}, expected {:?}",
                self.input.shape, EXPECTED_INPUT_SHAPE
            )));
        }
        if self.output.dtype != TensorDType::Float32 {
            return Err(fail(format!("output dtype is {}, expected float32", self.output.dtype)));
        }
        if self.output.element_count() != NUM_CLASSES {
            return Err(fail(format!(
                "output shape {:?} does not hold {} class scores",
                self.output.shape, NUM_CLASSES
            )));
        }

        let table = label_table(self.label_table_version).ok_or_else(|| {
            fail(format!("unknown label table version {}", self.label_table_version))
        })?;
        if !table.matches(&self.class_labels) {
            return Err(fail(format!(
                "class labels {:?} do not match label table v{} {:?}",
                self.class_labels,
                table.version,
                table.labels()
            )));
        }

        Ok(table)
    }
}
