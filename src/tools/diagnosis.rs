//! Crop disease diagnosis tool.
//!
//! When the model calls `diagnose_crop_disease` without an image, the tool asks
//! the host for a photo and waits until the user takes one (or cancels).

use crate::tools::dispatcher::{ToolContext, ToolHandler};
use crate::tools::schema::{FunctionDeclaration, ParameterSchema};
use crate::tools::types::{CropDiseaseDiagnosis, ToolResult};
use anyhow::anyhow;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

pub const TOOL_NAME: &str = "diagnose_crop_disease";

/// Turns a crop photo into a diagnosis.
pub trait Diagnoser: Send + Sync {
    fn diagnose(&self, image: &str, language: &str) -> BoxFuture<'static, anyhow::Result<CropDiseaseDiagnosis>>;
}

/// Offline fallback that recognizes leaf spot from the image reference and
/// otherwise refers the farmer to an agricultural officer.
#[derive(Debug, Default)]
pub struct KeywordDiagnoser;

fn is_hindi(language: &str) -> bool {
    language == "hi" || language.starts_with("hi-")
}

impl KeywordDiagnoser {
    fn diagnose_now(image: &str, language: &str) -> CropDiseaseDiagnosis {
        let hindi = is_hindi(language);
        let pick = |hi: &str, en: &str| if hindi { hi.to_string() } else { en.to_string() };
        let language = if language.is_empty() { "en".to_string() } else { language.to_string() };

        if image.contains("leaf_spot") {
            return CropDiseaseDiagnosis {
                disease_name: pick("पत्ती धब्बा (Leaf Spot)", "Leaf Spot (Cercospora)"),
                cause: pick("फफूंद (Fungal)", "Fungal (Cercospora)"),
                treatment: vec![pick(
                    "1. प्रभावित पत्तियाँ हटा दें।\n2. नीम का छिड़काव करें।\n3. आवश्यकता हो तो सुरक्षित फफूंदनाशी का प्रयोग करें।",
                    "1. Remove affected leaves.\n2. Spray neem extract.\n3. Use safe fungicide if needed.",
                )],
                warnings: vec![pick("छिड़काव करते समय दस्ताने पहनें।", "Wear gloves when spraying.")],
                language,
            };
        }

        CropDiseaseDiagnosis {
            disease_name: pick("अज्ञात रोग", "Unknown Disease"),
            cause: pick("पहचान नहीं हो सकी।", "Could not identify."),
            treatment: vec![pick(
                "कृपया नजदीकी कृषि अधिकारी से संपर्क करें।",
                "Please consult your nearest agricultural officer.",
            )],
            warnings: Vec::new(),
            language,
        }
    }
}

impl Diagnoser for KeywordDiagnoser {
    fn diagnose(&self, image: &str, language: &str) -> BoxFuture<'static, anyhow::Result<CropDiseaseDiagnosis>> {
        let diagnosis = Self::diagnose_now(image, language);
        async move { Ok(diagnosis) }.boxed()
    }
}

pub struct CropDiagnosisTool {
    diagnoser: Arc<dyn Diagnoser>,
}

impl CropDiagnosisTool {
    pub fn new(diagnoser: Arc<dyn Diagnoser>) -> Self {
        Self { diagnoser }
    }
}

impl ToolHandler for CropDiagnosisTool {
    fn declaration(&self) -> FunctionDeclaration {
        FunctionDeclaration::new(
            TOOL_NAME,
            "Diagnose crop disease from a photo of the plant and give step-by-step treatment in the \
             farmer's language. Returns disease name, cause, remedies and safety warnings. Call it \
             without an image to ask the farmer to take a photo.",
            ParameterSchema::object().property(
                "image",
                ParameterSchema::string("Image URL or data of the diseased plant"),
            ),
        )
    }

    fn call(&self, args: Value, ctx: ToolContext) -> BoxFuture<'static, anyhow::Result<ToolResult>> {
        let diagnoser = self.diagnoser.clone();
        let supplied = args
            .get("image")
            .and_then(Value::as_str)
            .filter(|image| !image.trim().is_empty())
            .map(str::to_string);

        async move {
            let image = match supplied {
                Some(image) => image,
                None => {
                    let answer = ctx.pending.register(&ctx.call_id);
                    info!(call_id = %ctx.call_id, "Requesting crop photo");
                    ctx.events.on_image_requested(&ctx.call_id);
                    answer.await.map_err(|_| anyhow!("Image capture was cancelled"))?
                }
            };

            let diagnosis = diagnoser.diagnose(&image, &ctx.language_code).await?;
            Ok(ToolResult::CropDiagnosis(diagnosis))
        }
        .boxed()
    }
}
