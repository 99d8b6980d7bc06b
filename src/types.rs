use ndarray::{Array3, Array4};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RetinaError};

/// 分類対象の疾患クラス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RetinalClass {
    Normal,
    DiabeticRetinopathy,
    Glaucoma,
    Amd,
}

impl RetinalClass {
    /// 表示用ラベル
    pub fn label(self) -> &'static str {
        match self {
            RetinalClass::Normal => "Normal",
            RetinalClass::DiabeticRetinopathy => "Diabetic Retinopathy",
            RetinalClass::Glaucoma => "Glaucoma",
            RetinalClass::Amd => "AMD",
        }
    }
}

impl std::fmt::Display for RetinalClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// デコード済みの画素配列 (height, width, channels)
///
/// デコード直後は元画像のチャネル数（1〜4）を保持し、
/// 前処理後は常に3チャネル。
#[derive(Debug, Clone, PartialEq)]
pub struct PixelGrid {
    data: Array3<u8>,
}

impl PixelGrid {
    pub fn from_array(data: Array3<u8>) -> Result<Self> {
        let (height, width, channels) = data.dim();
        if height == 0 || width == 0 || channels == 0 {
            return Err(RetinaError::Decode(format!(
                "image has empty dimensions {}x{}x{}",
                height, width, channels
            )));
        }
        Ok(Self { data })
    }

    /// 行優先 (HWC) の生バイト列から生成
    pub fn from_raw(height: usize, width: usize, channels: usize, raw: Vec<u8>) -> Result<Self> {
        let data = Array3::from_shape_vec((height, width, channels), raw).map_err(|e| {
            RetinaError::Decode(format!(
                "pixel buffer does not match {}x{}x{}: {}",
                height, width, channels, e
            ))
        })?;
        Self::from_array(data)
    }

    /// 全画素を同じ値で埋めたグリッド
    pub fn filled(height: usize, width: usize, channels: usize, value: u8) -> Result<Self> {
        Self::from_array(Array3::from_elem((height, width, channels), value))
    }

    pub fn height(&self) -> usize {
        self.data.dim().0
    }

    pub fn width(&self) -> usize {
        self.data.dim().1
    }

    pub fn channels(&self) -> usize {
        self.data.dim().2
    }

    pub fn as_array(&self) -> &Array3<u8> {
        &self.data
    }
}

/// モデル入力テンソル (1, 224, 224, 3)
///
/// 形状の検証は推論エンジン側で行うため、ここでは任意の4次元配列を受け付ける。
#[derive(Debug, Clone, PartialEq)]
pub struct BatchTensor {
    data: Array4<f32>,
}

impl BatchTensor {
    pub fn from_array(data: Array4<f32>) -> Self {
        Self { data }
    }

    pub fn shape(&self) -> Vec<usize> {
        self.data.shape().to_vec()
    }

    pub fn as_array(&self) -> &Array4<f32> {
        &self.data
    }
}

/// モデル出力（クラスごとのスコア）
#[derive(Debug, Clone, PartialEq)]
pub struct OutputVector {
    scores: Vec<f32>,
}

impl OutputVector {
    pub fn new(scores: Vec<f32>) -> Self {
        Self { scores }
    }

    pub fn scores(&self) -> &[f32] {
        &self.scores
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

/// 分類結果
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub class: RetinalClass,
    /// ラベル表におけるインデックス
    pub index: usize,
    /// 選択されたクラスの生スコア（再正規化しない）
    pub confidence: f32,
}

impl Prediction {
    pub fn label(&self) -> &'static str {
        self.class.label()
    }

    pub fn confidence_percent(&self) -> f32 {
        self.confidence * 100.0
    }
}

impl std::fmt::Display for Prediction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Predicted Disease: {} (Confidence: {:.2}%)",
            self.label(),
            self.confidence_percent()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_grid_dimensions() {
        let grid = PixelGrid::filled(384, 512, 3, 7).unwrap();
        assert_eq!(grid.height(), 384);
        assert_eq!(grid.width(), 512);
        assert_eq!(grid.channels(), 3);
    }

    #[test]
    fn test_pixel_grid_rejects_empty() {
        assert!(matches!(PixelGrid::filled(0, 10, 3, 0), Err(RetinaError::Decode(_))));
        assert!(matches!(
            PixelGrid::from_raw(2, 2, 3, vec![0; 5]),
            Err(RetinaError::Decode(_))
        ));
    }

    #[test]
    fn test_prediction_display() {
        let prediction = Prediction {
            class: RetinalClass::Glaucoma,
            index: 2,
            confidence: 0.8,
        };
        assert_eq!(
            prediction.to_string(),
            "Predicted Disease: Glaucoma (Confidence: 80.00%)"
        );
    }
}
