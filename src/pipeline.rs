//! 分類パイプライン
//!
//! アップロード → デコード → 前処理 → 推論 → 解釈 を1リクエスト分まとめて実行します。
//! デコード・前処理で失敗した場合は推論エンジンを呼ばずに終了します。

use base64::Engine as _;
use std::time::Instant;

use crate::error::{Result, RetinaError, Severity};
use crate::ml::{decode, interpreter, prepare, InferenceEngine, PreparedImage};
use crate::model::{AppConfig, InferenceSettings, UploadSettings};
use crate::types::{OutputVector, PixelGrid, Prediction};
use crate::upload::UploadedImage;

/// 表示層に返す結果
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationResult {
    pub prediction: Prediction,
    /// 再表示用のリサイズ済み画像 (224x224x3)
    pub resized: PixelGrid,
}

impl ClassificationResult {
    /// リサイズ済み画像をPNGのdata URLとして返す
    pub fn resized_png_data_url(&self) -> anyhow::Result<String> {
        use image::ImageEncoder;

        let raw = self.resized.as_array().as_standard_layout();
        let raw = raw
            .as_slice()
            .ok_or_else(|| anyhow::anyhow!("resized image buffer is not contiguous"))?;

        let mut png_data = Vec::new();
        let encoder = image::codecs::png::PngEncoder::new(&mut png_data);
        encoder.write_image(
            raw,
            self.resized.width() as u32,
            self.resized.height() as u32,
            image::ExtendedColorType::Rgb8,
        )?;

        let base64_data = base64::engine::general_purpose::STANDARD.encode(&png_data);
        Ok(format!("data:image/png;base64,{}", base64_data))
    }
}

/// 分類パイプライン
#[derive(Debug, Clone)]
pub struct ClassificationPipeline {
    engine: InferenceEngine,
    inference: InferenceSettings,
    upload: UploadSettings,
}

impl ClassificationPipeline {
    pub fn new(engine: InferenceEngine, config: &AppConfig) -> Self {
        Self {
            engine,
            inference: config.inference.clone(),
            upload: config.upload.clone(),
        }
    }

    /// プロセス共有のモデルを使うパイプラインを作成
    #[cfg(feature = "ml")]
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let engine = InferenceEngine::shared(&config.model).inspect_err(log_failure)?;
        Ok(Self::new(engine, config))
    }

    pub fn engine(&self) -> &InferenceEngine {
        &self.engine
    }

    pub fn upload_settings(&self) -> &UploadSettings {
        &self.upload
    }

    /// 生バイト列と拡張子から分類
    pub fn classify_bytes(&self, bytes: Vec<u8>, extension: &str) -> Result<ClassificationResult> {
        let upload = UploadedImage::new(bytes, extension, &self.upload).inspect_err(log_failure)?;
        self.classify(&upload)
    }

    /// アップロード済み画像を分類
    pub fn classify(&self, upload: &UploadedImage) -> Result<ClassificationResult> {
        let started = Instant::now();
        let result = self.prepare(upload).and_then(|prepared| {
            let output = self.engine.run(&prepared.tensor)?;
            self.finish(output, prepared.resized)
        });
        self.report(result, started)
    }

    /// 推論に上限時間を設けて分類
    pub async fn classify_with_timeout(&self, upload: &UploadedImage) -> Result<ClassificationResult> {
        let started = Instant::now();
        let result = async {
            let PreparedImage { tensor, resized } = self.prepare(upload)?;
            let output = self
                .engine
                .run_with_timeout(tensor, self.inference.timeout())
                .await?;
            self.finish(output, resized)
        }
        .await;
        self.report(result, started)
    }

    fn prepare(&self, upload: &UploadedImage) -> Result<PreparedImage> {
        let grid = decode(upload)?;
        prepare(&grid)
    }

    fn finish(&self, output: OutputVector, resized: PixelGrid) -> Result<ClassificationResult> {
        let artifact = self.engine.artifact();
        // 長さの検証を分布の検証より先に行う
        if output.len() != artifact.labels().len() {
            return Err(RetinaError::EmptyOutput {
                expected: artifact.labels().len(),
                actual: output.len(),
            });
        }
        if self.inference.require_normalized_output && artifact.metadata().output_is_probability {
            interpreter::check_distribution(&output, self.inference.normalization_tolerance)?;
        }
        let prediction = artifact.interpret(&output)?;
        Ok(ClassificationResult { prediction, resized })
    }

    fn report(&self, result: Result<ClassificationResult>, started: Instant) -> Result<ClassificationResult> {
        match &result {
            Ok(r) => tracing::info!(
                label = r.prediction.label(),
                confidence = r.prediction.confidence,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "分類完了"
            ),
            Err(e) => log_failure(e),
        }
        result
    }
}

fn log_failure(e: &RetinaError) {
    match e.severity() {
        Severity::UserRecoverable => tracing::warn!(error = %e, "入力画像を処理できませんでした"),
        Severity::OperatorFatal => tracing::error!(error = %e, "運用者の対応が必要なエラー"),
        Severity::ContractViolation => tracing::error!(error = %e, "内部契約違反"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::inference::stub;
    use crate::types::RetinalClass;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        });
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn pipeline(artifact: crate::ml::ModelArtifact) -> ClassificationPipeline {
        ClassificationPipeline::new(InferenceEngine::new(artifact), &AppConfig::default())
    }

    /// 呼び出し回数を数えるランタイム
    struct Counting {
        calls: Arc<AtomicUsize>,
    }

    impl crate::ml::ForwardPass for Counting {
        fn forward(&mut self, _input: &ndarray::Array4<f32>) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![0.25; 4])
        }
    }

    #[test]
    fn test_end_to_end_glaucoma() {
        let pipeline = pipeline(stub::fixed(&[0.05, 0.10, 0.80, 0.05]));
        let result = pipeline.classify_bytes(png_bytes(512, 384), "png").unwrap();

        assert_eq!(result.prediction.class, RetinalClass::Glaucoma);
        assert_eq!(result.prediction.confidence, 0.80);
        assert_eq!(
            (result.resized.height(), result.resized.width(), result.resized.channels()),
            (224, 224, 3)
        );
    }

    #[test]
    fn test_end_to_end_is_deterministic() {
        let pipeline = pipeline(stub::artifact(Box::new(stub::ChannelMeans)));
        let bytes = png_bytes(300, 200);

        let first = pipeline.classify_bytes(bytes.clone(), "png").unwrap();
        let second = pipeline.classify_bytes(bytes, "png").unwrap();
        assert_eq!(first, second);
        assert_eq!(
            first.prediction.confidence.to_bits(),
            second.prediction.confidence.to_bits()
        );
    }

    #[test]
    fn test_truncated_upload_halts_before_inference() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pipeline = pipeline(stub::artifact(Box::new(Counting {
            calls: Arc::clone(&calls),
        })));

        let bytes = png_bytes(64, 64);
        let truncated = bytes[..bytes.len() / 2].to_vec();
        let err = pipeline.classify_bytes(truncated, "png").unwrap_err();

        assert!(matches!(err, RetinaError::Decode(_)));
        assert!(err.is_user_recoverable());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_rejects_disallowed_extension() {
        let pipeline = pipeline(stub::fixed(&[0.25; 4]));
        let err = pipeline.classify_bytes(png_bytes(8, 8), "bmp").unwrap_err();
        assert!(matches!(err, RetinaError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_label_count_mismatch_is_fatal() {
        let pipeline = pipeline(stub::fixed(&[0.5, 0.5, 0.0]));
        let err = pipeline.classify_bytes(png_bytes(8, 8), "png").unwrap_err();
        assert!(matches!(err, RetinaError::EmptyOutput { expected: 4, actual: 3 }));
        assert_eq!(err.severity(), Severity::OperatorFatal);
    }

    #[test]
    fn test_unnormalized_output_is_not_reported() {
        let pipeline = pipeline(stub::fixed(&[2.0, -1.0, 0.5, 0.1]));
        let err = pipeline.classify_bytes(png_bytes(8, 8), "png").unwrap_err();
        assert!(matches!(err, RetinaError::OutputNotNormalized { .. }));
    }

    #[test]
    fn test_normalization_check_can_be_disabled() {
        let mut config = AppConfig::default();
        config.inference.require_normalized_output = false;
        let pipeline = ClassificationPipeline::new(
            InferenceEngine::new(stub::fixed(&[2.0, -1.0, 0.5, 0.1])),
            &config,
        );
        let result = pipeline.classify_bytes(png_bytes(8, 8), "png").unwrap();
        assert_eq!(result.prediction.class, RetinalClass::Normal);
        assert_eq!(result.prediction.confidence, 2.0);
    }

    #[test]
    fn test_resized_png_data_url() {
        let pipeline = pipeline(stub::fixed(&[0.7, 0.1, 0.1, 0.1]));
        let result = pipeline.classify_bytes(png_bytes(40, 30), "png").unwrap();
        let url = result.resized_png_data_url().unwrap();
        assert!(url.starts_with("data:image/png;base64,"));
    }

    #[tokio::test]
    async fn test_classify_with_timeout() {
        let mut config = AppConfig::default();
        config.inference.timeout_ms = 20;

        let slow = stub::artifact(Box::new(stub::FixedScores {
            scores: vec![0.25; 4],
            delay: Duration::from_millis(300),
        }));
        let pipeline = ClassificationPipeline::new(InferenceEngine::new(slow), &config);
        let upload = UploadedImage::new(png_bytes(16, 16), "png", pipeline.upload_settings()).unwrap();

        let err = pipeline.classify_with_timeout(&upload).await.unwrap_err();
        assert!(matches!(err, RetinaError::Timeout { millis: 20 }));

        let fast = ClassificationPipeline::new(
            InferenceEngine::new(stub::fixed(&[0.1, 0.6, 0.2, 0.1])),
            &AppConfig::default(),
        );
        let result = fast.classify_with_timeout(&upload).await.unwrap();
        assert_eq!(result.prediction.class, RetinalClass::DiabeticRetinopathy);
    }
}
