//! クラウド向けバンドル（推論サーバーが読み込む tar.gz）

use anyhow::Result;
use burn::tensor::backend::Backend;
use std::path::PathBuf;

use crate::export::{ExportContext, ModelExporter};
use crate::ml::inference::model_to_bytes;
use crate::model::{save_model_with_metadata, ClassInfo, CLASS_INFO_FILE};

pub const BUNDLE_FILE: &str = "model.tar.gz";

pub fn cloud_dir(export_root: &std::path::Path) -> PathBuf {
    export_root.join("cloud").join("model")
}

/// `cloud/model/model.tar.gz` を書き出す
pub struct CloudExporter;

impl<B: Backend> ModelExporter<B> for CloudExporter {
    fn format(&self) -> &'static str {
        "cloud"
    }

    fn export(&self, ctx: &ExportContext<'_, B>) -> Result<Vec<PathBuf>> {
        let bytes = model_to_bytes(ctx.model.clone())?;
        let path = save_model_with_metadata(&cloud_dir(ctx.export_root).join(BUNDLE_FILE), ctx.metadata, &bytes)?;
        tracing::info!("[cloud] {:.1} KB", bytes.len() as f64 / 1024.0);
        Ok(vec![path])
    }
}

/// `cloud/model/class_info.json` を書き出す
pub struct ClassInfoExporter;

impl<B: Backend> ModelExporter<B> for ClassInfoExporter {
    fn format(&self) -> &'static str {
        "class_info"
    }

    fn export(&self, ctx: &ExportContext<'_, B>) -> Result<Vec<PathBuf>> {
        let path = cloud_dir(ctx.export_root).join(CLASS_INFO_FILE);
        ClassInfo::from_metadata(ctx.metadata, &ctx.settings.version).save(&path)?;
        Ok(vec![path])
    }
}
