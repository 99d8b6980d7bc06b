//! 画像前処理
//!
//! 画素配列をモデル入力テンソル (1, 224, 224, 3) に変換します。
//!
//! 処理順:
//! 1. チャネル数をRGB (3) に正規化
//! 2. 224x224 にバイリニア補間でリサイズ（アスペクト比は保持しない）
//! 3. [0, 255] を [0.0, 1.0] にスケーリング
//! 4. 先頭にバッチ次元を追加し f32 テンソルにする

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;

use crate::error::{Result, RetinaError};
use crate::model::{MODEL_INPUT_CHANNELS, MODEL_INPUT_SIZE};
use crate::types::{BatchTensor, PixelGrid};

/// リサイズ時の補間方式
const RESIZE_FILTER: FilterType = FilterType::Triangle;

/// 前処理の結果
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedImage {
    pub tensor: BatchTensor,
    /// 再表示用のリサイズ済み画像（常に3チャネル）
    pub resized: PixelGrid,
}

/// 画素配列をRGB画像に変換
///
/// - 1ch: グレースケールを3チャネルに複製
/// - 2ch: アルファを破棄してグレースケールを複製
/// - 3ch: そのまま
/// - 4ch: アルファを破棄（合成はしない）
fn to_rgb_image(grid: &PixelGrid) -> Result<RgbImage> {
    let channels = grid.channels();

    let pick: fn(&[u8]) -> [u8; 3] = match channels {
        1 | 2 => |p| [p[0], p[0], p[0]],
        3 | 4 => |p| [p[0], p[1], p[2]],
        _ => return Err(RetinaError::UnsupportedChannelLayout { channels }),
    };

    let pixels = grid.as_array().as_standard_layout();
    let samples = pixels
        .as_slice()
        .ok_or_else(|| RetinaError::Decode("pixel buffer is not contiguous".to_string()))?;

    let mut raw = Vec::with_capacity(grid.height() * grid.width() * MODEL_INPUT_CHANNELS);
    for pixel in samples.chunks_exact(channels) {
        raw.extend_from_slice(&pick(pixel));
    }

    RgbImage::from_raw(grid.width() as u32, grid.height() as u32, raw).ok_or_else(|| {
        RetinaError::Decode(format!(
            "pixel buffer does not match {}x{}",
            grid.width(),
            grid.height()
        ))
    })
}

/// [0, 255] の画素値を [0.0, 1.0] にスケーリング
///
/// f64で除算してからf32に変換する（学習時の前処理と同じ丸め）。
fn rescale(value: u8) -> f32 {
    (f64::from(value) / 255.0) as f32
}

/// 画素配列をモデル入力テンソルに変換
///
/// 同じ入力に対して常に同じテンソルを返す（乱数は使わない）。
pub fn prepare(grid: &PixelGrid) -> Result<PreparedImage> {
    let rgb = to_rgb_image(grid)?;
    let size = MODEL_INPUT_SIZE as u32;
    let resized = if rgb.dimensions() == (size, size) {
        rgb
    } else {
        imageops::resize(&rgb, size, size, RESIZE_FILTER)
    };

    let tensor = Array4::from_shape_fn(
        (1, MODEL_INPUT_SIZE, MODEL_INPUT_SIZE, MODEL_INPUT_CHANNELS),
        |(_, y, x, c)| rescale(resized.get_pixel(x as u32, y as u32)[c]),
    );

    let resized = PixelGrid::from_raw(
        MODEL_INPUT_SIZE,
        MODEL_INPUT_SIZE,
        MODEL_INPUT_CHANNELS,
        resized.into_raw(),
    )?;

    tracing::debug!(
        source_height = grid.height(),
        source_width = grid.width(),
        source_channels = grid.channels(),
        "前処理完了"
    );

    Ok(PreparedImage {
        tensor: BatchTensor::from_array(tensor),
        resized,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EXPECTED_INPUT_SHAPE;
    use ndarray::Array3;

    fn gradient(height: usize, width: usize, channels: usize) -> PixelGrid {
        PixelGrid::from_array(Array3::from_shape_fn((height, width, channels), |(y, x, c)| {
            ((y * 7 + x * 3 + c * 11) % 256) as u8
        }))
        .unwrap()
    }

    fn assert_in_unit_range(prepared: &PreparedImage) {
        assert!(prepared
            .tensor
            .as_array()
            .iter()
            .all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn test_all_white_512x384_becomes_all_ones() {
        let grid = PixelGrid::filled(384, 512, 3, 255).unwrap();
        let prepared = prepare(&grid).unwrap();

        assert_eq!(prepared.tensor.shape(), EXPECTED_INPUT_SHAPE.to_vec());
        assert!(prepared.tensor.as_array().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_shape_invariant_for_various_resolutions() {
        for (h, w) in [(1, 1), (10, 3000), (224, 224), (1080, 1920), (333, 97)] {
            let prepared = prepare(&gradient(h, w, 3)).unwrap();
            assert_eq!(prepared.tensor.shape(), vec![1, 224, 224, 3]);
            assert_eq!(prepared.resized.channels(), 3);
            assert_eq!(prepared.resized.height(), 224);
            assert_in_unit_range(&prepared);
        }
    }

    #[test]
    fn test_prepare_is_deterministic() {
        let grid = gradient(300, 420, 3);
        let first = prepare(&grid).unwrap();
        let second = prepare(&grid).unwrap();
        assert_eq!(first, second);

        let first_bits: Vec<u32> = first.tensor.as_array().iter().map(|v| v.to_bits()).collect();
        let second_bits: Vec<u32> = second.tensor.as_array().iter().map(|v| v.to_bits()).collect();
        assert_eq!(first_bits, second_bits);
    }

    #[test]
    fn test_native_resolution_is_rescaled_exactly() {
        let grid = gradient(224, 224, 3);
        let prepared = prepare(&grid).unwrap();
        let source = grid.as_array();
        let tensor = prepared.tensor.as_array();

        for (y, x, c) in [(0, 0, 0), (10, 20, 1), (223, 223, 2)] {
            let expected = (f64::from(source[[y, x, c]]) / 255.0) as f32;
            assert_eq!(tensor[[0, y, x, c]], expected);
        }
    }

    #[test]
    fn test_grayscale_is_replicated_to_rgb() {
        let grid = gradient(50, 80, 1);
        let prepared = prepare(&grid).unwrap();
        let tensor = prepared.tensor.as_array();

        for y in (0..224).step_by(37) {
            for x in (0..224).step_by(41) {
                let r = tensor[[0, y, x, 0]];
                assert_eq!(r, tensor[[0, y, x, 1]]);
                assert_eq!(r, tensor[[0, y, x, 2]]);
            }
        }
        assert_eq!(prepare(&grid).unwrap(), prepared);
    }

    #[test]
    fn test_alpha_is_dropped() {
        let rgba = PixelGrid::from_array(Array3::from_shape_fn((4, 4, 4), |(_, _, c)| {
            [10u8, 20, 30, 0][c]
        }))
        .unwrap();
        let rgb = PixelGrid::from_array(Array3::from_shape_fn((4, 4, 3), |(_, _, c)| {
            [10u8, 20, 30][c]
        }))
        .unwrap();
        assert_eq!(prepare(&rgba).unwrap(), prepare(&rgb).unwrap());

        let gray_alpha = PixelGrid::filled(4, 4, 2, 90).unwrap();
        let gray = PixelGrid::filled(4, 4, 1, 90).unwrap();
        assert_eq!(prepare(&gray_alpha).unwrap(), prepare(&gray).unwrap());
    }

    #[test]
    fn test_unsupported_channel_count() {
        let grid = PixelGrid::filled(8, 8, 5, 0).unwrap();
        assert!(matches!(
            prepare(&grid),
            Err(RetinaError::UnsupportedChannelLayout { channels: 5 })
        ));
    }
}
