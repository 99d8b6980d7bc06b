//! 推論結果の解釈
//!
//! 出力スコアのうち最大のものを選び、そのスコアをそのまま信頼度として返します。
//!
//! 信頼度は再正規化しません。確率として扱えるのはモデルの出力層が
//! softmax済みの分布を返す場合に限られ、この前提はモデルアーティファクトの
//! `output_is_probability` で宣言されます。検証には [`check_distribution`] を使います。

use crate::error::{Result, RetinaError};
use crate::model::LabelTable;
use crate::types::{OutputVector, Prediction};

/// 出力ベクトルを分類結果に変換
///
/// 最大スコアが複数ある場合は最も小さいインデックス（ラベル順で先頭）を選ぶ。
pub fn interpret(output: &OutputVector, labels: &LabelTable) -> Result<Prediction> {
    if output.len() != labels.len() {
        return Err(RetinaError::EmptyOutput {
            expected: labels.len(),
            actual: output.len(),
        });
    }

    // NaNは比較で常に負けるため、位置によっては黙って読み飛ばされる
    if output.scores().iter().any(|s| s.is_nan()) {
        return Err(RetinaError::Runtime("model output contains NaN".to_string()));
    }

    let mut best = 0;
    for (index, &score) in output.scores().iter().enumerate().skip(1) {
        // 厳密に大きい場合のみ更新するので同点は先頭が残る
        if score > output.scores()[best] {
            best = index;
        }
    }

    let confidence = output.scores()[best];

    let class = labels.class_at(best).ok_or(RetinaError::EmptyOutput {
        expected: labels.len(),
        actual: output.len(),
    })?;

    Ok(Prediction {
        class,
        index: best,
        confidence,
    })
}

/// 出力が確率分布（各値が[0, 1]、合計が1）であるか検証
pub fn check_distribution(output: &OutputVector, tolerance: f32) -> Result<()> {
    let sum: f32 = output.scores().iter().sum();
    let in_range = output.scores().iter().all(|s| (0.0..=1.0).contains(s));
    if !in_range || !((sum - 1.0).abs() <= tolerance) {
        return Err(RetinaError::OutputNotNormalized { sum });
    }
    Ok(())
}
