//! モデル推論機能
//!
//! モデルアーティファクトを一度だけ読み込み、前処理済みテンソルに対して
//! 順伝播を1回実行します。

use ndarray::Array4;
#[cfg(feature = "ml")]
use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Result, RetinaError};
use crate::ml::interpreter;
use crate::model::{LabelTable, ModelMetadata, TensorDescriptor};
use crate::types::{BatchTensor, OutputVector, Prediction};

#[cfg(feature = "ml")]
use crate::model::{load_bundle, log_metadata_info, model_storage::is_bundle_path, ModelSettings};

/// 順伝播を実行するランタイム
///
/// 実装は同時呼び出しに対して安全である必要はない。
/// [`ModelArtifact`] が排他制御を行う。
pub trait ForwardPass: Send {
    /// 入力テンソルからスコア列を計算
    fn forward(&mut self, input: &Array4<f32>) -> Result<Vec<f32>>;
}

/// セッションが報告する入出力テンソルの型情報
#[cfg(feature = "ml")]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeTensor {
    pub name: String,
    pub float32: bool,
    /// 負の値は動的な次元
    pub dims: Vec<i64>,
}

#[cfg(feature = "ml")]
impl RuntimeTensor {
    fn from_outlet(path: &Path, role: &str, name: &str, dtype: &ort::value::ValueType) -> Result<Self> {
        use ort::tensor::TensorElementType;
        use ort::value::ValueType;

        match dtype {
            ValueType::Tensor { ty, shape, .. } => Ok(Self {
                name: name.to_string(),
                float32: *ty == TensorElementType::Float32,
                dims: shape.iter().copied().collect(),
            }),
            other => Err(RetinaError::model_load(
                path,
                format!("{} `{}` is not a tensor: {:?}", role, name, other),
            )),
        }
    }
}

/// ONNX Runtime による順伝播
#[cfg(feature = "ml")]
pub struct OrtRuntime {
    session: ort::session::Session,
    input: RuntimeTensor,
    output: RuntimeTensor,
}

#[cfg(feature = "ml")]
fn session_error(path: &Path, e: impl std::fmt::Display) -> RetinaError {
    RetinaError::model_load(path, format!("failed to create ONNX session: {}", e))
}

#[cfg(feature = "ml")]
impl OrtRuntime {
    /// メモリ上のモデルからセッションを作成
    ///
    /// 入力・出力がそれぞれ1つでない場合はエラー。
    pub fn from_memory(path: &Path, model_bytes: &[u8], intra_threads: usize) -> Result<Self> {
        use ort::logging::LogLevel;
        use ort::session::Session;

        let session = Session::builder()
            .map_err(|e| session_error(path, e))?
            .with_log_level(LogLevel::Error)
            .map_err(|e| session_error(path, e))?
            .with_intra_threads(intra_threads.max(1))
            .map_err(|e| session_error(path, e))?
            .commit_from_memory(model_bytes)
            .map_err(|e| session_error(path, e))?;

        let inputs: Vec<String> = session.inputs().iter().map(|i| i.name().to_string()).collect();
        let outputs: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if inputs.len() != 1 || outputs.len() != 1 {
            return Err(RetinaError::model_load(
                path,
                format!(
                    "expected exactly one input and one output tensor, found inputs {:?} and outputs {:?}",
                    inputs, outputs
                ),
            ));
        }

        let input = RuntimeTensor::from_outlet(path, "input", &inputs[0], session.inputs()[0].dtype())?;
        let output = RuntimeTensor::from_outlet(path, "output", &outputs[0], session.outputs()[0].dtype())?;
        tracing::debug!(input = ?input, output = ?output, "セッションの入出力");

        Ok(Self { session, input, output })
    }

    pub fn input(&self) -> &RuntimeTensor {
        &self.input
    }

    pub fn output(&self) -> &RuntimeTensor {
        &self.output
    }
}

#[cfg(feature = "ml")]
impl ForwardPass for OrtRuntime {
    fn forward(&mut self, input: &Array4<f32>) -> Result<Vec<f32>> {
        use ort::value::TensorRef;

        let dims: Vec<i64> = input.shape().iter().map(|&d| d as i64).collect();
        let data = input
            .as_slice()
            .ok_or_else(|| RetinaError::Runtime("input tensor is not contiguous in memory".to_string()))?;
        let tensor = TensorRef::from_array_view((dims, data))
            .map_err(|e| RetinaError::Runtime(format!("failed to create input tensor: {}", e)))?;

        let outputs = self
            .session
            .run(ort::inputs![self.input.name.as_str() => tensor])
            .map_err(|e| RetinaError::Runtime(format!("forward pass failed: {}", e)))?;

        let (_, scores) = outputs[self.output.name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(|e| RetinaError::Runtime(format!("failed to read output tensor: {}", e)))?;

        Ok(scores.to_vec())
    }
}

/// 読み込み済みモデル
///
/// メタデータ（入出力記述子とラベル表）とランタイムを保持する。
/// ランタイムはMutexで保護され、ロックは1回の順伝播の間だけ保持される。
pub struct ModelArtifact {
    source: PathBuf,
    metadata: ModelMetadata,
    labels: &'static LabelTable,
    runtime: Mutex<Box<dyn ForwardPass>>,
}

impl std::fmt::Debug for ModelArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelArtifact")
            .field("source", &self.source)
            .field("model_name", &self.metadata.model_name)
            .field("label_table_version", &self.labels.version)
            .finish()
    }
}

impl ModelArtifact {
    /// メタデータを検証してランタイムと組み合わせる
    pub fn from_runtime(source: &Path, metadata: ModelMetadata, runtime: Box<dyn ForwardPass>) -> Result<Self> {
        let labels = metadata.validate(source)?;
        Ok(Self::assemble(source, metadata, labels, runtime))
    }

    fn assemble(
        source: &Path,
        metadata: ModelMetadata,
        labels: &'static LabelTable,
        runtime: Box<dyn ForwardPass>,
    ) -> Self {
        Self {
            source: source.to_path_buf(),
            metadata,
            labels,
            runtime: Mutex::new(runtime),
        }
    }

    /// モデルを読み込む
    ///
    /// - `.tar.gz`: metadata.json と model.onnx を含むバンドル
    /// - それ以外: 単体のONNXファイル（ラベル表V1を仮定）
    #[cfg(feature = "ml")]
    pub fn load(path: &Path, settings: &ModelSettings) -> Result<Self> {
        let started = Instant::now();

        let artifact = if is_bundle_path(path) {
            let (metadata, model_bytes) = load_bundle(path)?;
            // ランタイムを作る前にメタデータを検証する
            let labels = metadata.validate(path)?;
            let runtime = OrtRuntime::from_memory(path, &model_bytes, settings.intra_threads)?;
            check_runtime_tensor(path, "input", &metadata.input, runtime.input())?;
            check_runtime_tensor(path, "output", &metadata.output, runtime.output())?;
            Self::assemble(path, metadata, labels, Box::new(runtime))
        } else {
            let model_bytes = std::fs::read(path)
                .map_err(|e| RetinaError::model_load(path, format!("failed to read model file: {}", e)))?;
            let runtime = OrtRuntime::from_memory(path, &model_bytes, settings.intra_threads)?;
            let model_name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("model");
            // 単体ファイルは固定の入出力形状をグラフ自体と突き合わせる
            let metadata = ModelMetadata::v1(model_name, &runtime.input().name, &runtime.output().name);
            check_runtime_tensor(path, "input", &metadata.input, runtime.input())?;
            check_runtime_tensor(path, "output", &metadata.output, runtime.output())?;
            Self::from_runtime(path, metadata, Box::new(runtime))?
        };

        log_metadata_info(&artifact.metadata);
        tracing::info!(
            path = %path.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "モデルを読み込みました"
        );
        Ok(artifact)
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn input(&self) -> &TensorDescriptor {
        &self.metadata.input
    }

    pub fn output(&self) -> &TensorDescriptor {
        &self.metadata.output
    }

    pub fn labels(&self) -> &'static LabelTable {
        self.labels
    }

    /// 順伝播を1回実行
    ///
    /// 入力形状が記述子と一致しない場合は前処理との契約違反として失敗する。
    pub fn run(&self, tensor: &BatchTensor) -> Result<OutputVector> {
        let actual = tensor.shape();
        if actual != self.metadata.input.shape {
            tracing::error!(
                expected = ?self.metadata.input.shape,
                actual = ?actual,
                "入力テンソルの形状がモデルと一致しません"
            );
            return Err(RetinaError::ShapeMismatch {
                expected: self.metadata.input.shape.clone(),
                actual,
            });
        }

        let started = Instant::now();
        let scores = {
            let mut runtime = self
                .runtime
                .lock()
                .map_err(|_| RetinaError::Runtime("model handle lock is poisoned".to_string()))?;
            runtime.forward(tensor.as_array())?
        };
        tracing::debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            scores = ?scores,
            "順伝播完了"
        );

        Ok(OutputVector::new(scores))
    }

    /// このモデルのラベル表で出力を解釈
    pub fn interpret(&self, output: &OutputVector) -> Result<Prediction> {
        interpreter::interpret(output, self.labels)
    }
}

/// 記述子とセッションの型情報を照合
///
/// 名前と要素型は完全一致。次元はランクが一致し、各次元が動的 (負の値) か
/// 記述子と同じ値であること。
#[cfg(feature = "ml")]
fn check_runtime_tensor(path: &Path, role: &str, descriptor: &TensorDescriptor, actual: &RuntimeTensor) -> Result<()> {
    if descriptor.name != actual.name {
        return Err(RetinaError::model_load(
            path,
            format!(
                "{} tensor is named `{}` in the model but `{}` in metadata",
                role, actual.name, descriptor.name
            ),
        ));
    }
    if !actual.float32 {
        return Err(RetinaError::model_load(
            path,
            format!("{} tensor `{}` is not float32 in the model", role, actual.name),
        ));
    }
    let compatible = actual.dims.len() == descriptor.shape.len()
        && actual
            .dims
            .iter()
            .zip(&descriptor.shape)
            .all(|(&dim, &expected)| dim < 0 || dim as usize == expected);
    if !compatible {
        return Err(RetinaError::model_load(
            path,
            format!(
                "{} shape {:?} in the model does not match {:?}",
                role, actual.dims, descriptor.shape
            ),
        ));
    }
    Ok(())
}

/// 推論エンジン
///
/// モデルアーティファクトへの共有ハンドル。クローンは同じモデルを指す。
#[derive(Debug, Clone)]
pub struct InferenceEngine {
    artifact: Arc<ModelArtifact>,
}

#[cfg(feature = "ml")]
static SHARED_ENGINE: OnceCell<InferenceEngine> = OnceCell::new();

impl InferenceEngine {
    pub fn new(artifact: ModelArtifact) -> Self {
        Self {
            artifact: Arc::new(artifact),
        }
    }

    /// 設定のモデルパスから読み込む
    #[cfg(feature = "ml")]
    pub fn load(settings: &ModelSettings) -> Result<Self> {
        let path = PathBuf::from(&settings.model_path);
        ModelArtifact::load(&path, settings).map(Self::new)
    }

    /// プロセス全体で共有するエンジンを取得
    ///
    /// 初回呼び出し時に読み込み、以降は同じエンジンを返す。
    /// 2回目以降の `settings` は無視される。
    #[cfg(feature = "ml")]
    pub fn shared(settings: &ModelSettings) -> Result<Self> {
        SHARED_ENGINE
            .get_or_try_init(|| Self::load(settings))
            .map(Clone::clone)
    }

    pub fn artifact(&self) -> &ModelArtifact {
        &self.artifact
    }

    pub fn run(&self, tensor: &BatchTensor) -> Result<OutputVector> {
        self.artifact.run(tensor)
    }

    /// 上限時間付きで順伝播を実行
    ///
    /// 順伝播はブロッキングスレッドで実行される。タイムアウトしても実行中の
    /// 順伝播は中断されず、ハンドルのロックは完了まで保持される。
    pub async fn run_with_timeout(&self, tensor: BatchTensor, timeout: Duration) -> Result<OutputVector> {
        let engine = self.clone();
        let task = tokio::task::spawn_blocking(move || engine.run(&tensor));

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(RetinaError::Runtime(format!("inference task failed: {}", e))),
            Err(_) => {
                let millis = timeout.as_millis() as u64;
                tracing::error!(timeout_ms = millis, "推論がタイムアウトしました");
                Err(RetinaError::Timeout { millis })
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod stub {
    use super::*;

    /// 固定スコアを返すランタイム
    pub struct FixedScores {
        pub scores: Vec<f32>,
        pub delay: Duration,
    }

    impl ForwardPass for FixedScores {
        fn forward(&mut self, _input: &Array4<f32>) -> Result<Vec<f32>> {
            std::thread::sleep(self.delay);
            Ok(self.scores.clone())
        }
    }

    /// 入力のチャネル平均からsoftmaxスコアを計算するランタイム
    pub struct ChannelMeans;

    impl ForwardPass for ChannelMeans {
        fn forward(&mut self, input: &Array4<f32>) -> Result<Vec<f32>> {
            let count = (input.len() / 3) as f32;
            let mut logits = vec![0.0f32; 4];
            for ((_, _, _, c), v) in input.indexed_iter() {
                logits[c] += v / count;
            }
            logits[3] = 0.5;
            let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let exp: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
            let sum: f32 = exp.iter().sum();
            Ok(exp.iter().map(|e| e / sum).collect())
        }
    }

    pub fn artifact(runtime: Box<dyn ForwardPass>) -> ModelArtifact {
        let metadata = ModelMetadata::v1("stub", "input", "output");
        ModelArtifact::from_runtime(Path::new("stub.tar.gz"), metadata, runtime).unwrap()
    }

    pub fn fixed(scores: &[f32]) -> ModelArtifact {
        artifact(Box::new(FixedScores {
            scores: scores.to_vec(),
            delay: Duration::ZERO,
        }))
    }
}
