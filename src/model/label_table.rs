//! クラスラベル表
//!
//! ラベルの並び順は学習時の出力層の並びと一致している必要があるため、
//! バージョン付きの定数として管理し、モデルアーティファクトに紐付けます。

use crate::types::RetinalClass;

/// クラス数
pub const NUM_CLASSES: usize = 4;

/// バージョン付きラベル表
#[derive(Debug, PartialEq, Eq)]
pub struct LabelTable {
    pub version: u32,
    pub classes: [RetinalClass; NUM_CLASSES],
}

/// mobilenetv2_eye_disease の学習時ラベル順
pub static LABEL_TABLE_V1: LabelTable = LabelTable {
    version: 1,
    classes: [
        RetinalClass::Normal,
        RetinalClass::DiabeticRetinopathy,
        RetinalClass::Glaucoma,
        RetinalClass::Amd,
    ],
};

static KNOWN_TABLES: &[&LabelTable] = &[&LABEL_TABLE_V1];

/// バージョンからラベル表を取得
pub fn label_table(version: u32) -> Option<&'static LabelTable> {
    KNOWN_TABLES.iter().copied().find(|t| t.version == version)
}

impl LabelTable {
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn class_at(&self, index: usize) -> Option<RetinalClass> {
        self.classes.get(index).copied()
    }

    pub fn labels(&self) -> Vec<String> {
        self.classes.iter().map(|c| c.label().to_string()).collect()
    }

    /// メタデータに記録されたラベル列と一致するか
    pub fn matches(&self, labels: &[String]) -> bool {
        labels.len() == self.classes.len()
            && self
                .classes
                .iter()
                .zip(labels)
                .all(|(class, label)| class.label() == label)
    }
}
