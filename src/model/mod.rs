pub mod model_metadata;
pub mod model_storage;
pub mod label_table;
pub mod config;

pub use model_metadata::{ModelMetadata, TensorDType, TensorDescriptor, EXPECTED_INPUT_SHAPE, MODEL_INPUT_CHANNELS, MODEL_INPUT_SIZE};
pub use model_storage::{save_bundle, load_bundle, load_metadata, log_metadata_info};
pub use label_table::{label_table, LabelTable, LABEL_TABLE_V1, NUM_CLASSES};
pub use config::{AppConfig, InferenceSettings, ModelSettings, UploadSettings};
