use std::collections::BTreeMap;

use uuid::Uuid;

/// `Result` is the result type used by every fallible core operation.
pub type Result<T> = std::result::Result<T, ScanariumError>;

/// The failure classes the system can report. Each kind maps to one stable
/// wire code; clients match on the code, never on the message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    // Input / format
    UnknownQr,
    MalformedQr,
    NoQrCode,
    TooManyQrCodes,
    UnknownScene,
    UnknownActor,
    NoMaskPng,
    NoMaskJson,
    // Geometry
    NoApprox,
    ImageTooSmall,
    ImageGrewTooSmall,
    ImageTooManyIterations,
    // External conversion pipelines
    PipelineError,
    PipelineOsError,
    PipelineTimeout,
    PipelineReturnValue,
    // Configuration
    ConfigMissing,
    ConfigValue,
    SvgTransformScale,
    CamTypeUnknown,
    CapNotOpen,
    LoadUndistort,
    ScanUnknownWb,
    ScanUnknownPipeline,
    // Infrastructure
    Timeout,
    ReturnValue,
    DebugFail,
    SkippedException,
    Value,
    UnknownParam,
    NoDir,
    SaveMissingPath,
    StaticSourceMissing,
    UnreadableImageType,
    NoRawImage,
    RegenerateNoSourceForTarget,
}

impl ErrorKind {
    /// The stable error code for this kind.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::UnknownQr => "SE_UNKNOWN_QR_CODE",
            ErrorKind::MalformedQr => "SE_SCAN_MISFORMED_QR_CODE",
            ErrorKind::NoQrCode => "SE_SCAN_NO_QR_CODE",
            ErrorKind::TooManyQrCodes => "SE_SCAN_TOO_MANY_QR_CODES",
            ErrorKind::UnknownScene => "SE_UNKNOWN_SCENE",
            ErrorKind::UnknownActor => "SE_UNKNOWN_ACTOR",
            ErrorKind::NoMaskPng => "SE_SCAN_NO_MASK_PNG",
            ErrorKind::NoMaskJson => "SE_SCAN_NO_MASK_JSON",
            ErrorKind::NoApprox => "SE_SCAN_NO_APPROX",
            ErrorKind::ImageTooSmall => "SE_SCAN_IMAGE_TOO_SMALL",
            ErrorKind::ImageGrewTooSmall => "SE_SCAN_IMAGE_GREW_TOO_SMALL",
            ErrorKind::ImageTooManyIterations => "SE_SCAN_IMAGE_TOO_MANY_ITERATIONS",
            ErrorKind::PipelineError => "SE_PIPELINE_ERROR",
            ErrorKind::PipelineOsError => "SE_PIPELINE_OS_ERROR",
            ErrorKind::PipelineTimeout => "SE_PIPELINE_TIMEOUT",
            ErrorKind::PipelineReturnValue => "SE_PIPELINE_RETURN_VALUE",
            ErrorKind::ConfigMissing => "SE_CONFIG_MISSING",
            ErrorKind::ConfigValue => "SE_CONFIG_VALUE",
            ErrorKind::SvgTransformScale => "E_SVG_TRANSFORM_SCALE",
            ErrorKind::CamTypeUnknown => "SE_CAM_TYPE_UNKNOWN",
            ErrorKind::CapNotOpen => "SE_CAP_NOT_OPEN",
            ErrorKind::LoadUndistort => "SE_LOAD_UNDISTORT",
            ErrorKind::ScanUnknownWb => "SE_SCAN_UNKNOWN_WB",
            ErrorKind::ScanUnknownPipeline => "SE_SCAN_UNKNOWN_PIPELINE",
            ErrorKind::Timeout => "SE_TIMEOUT",
            ErrorKind::ReturnValue => "SE_RETURN_VALUE",
            ErrorKind::DebugFail => "SE_DEBUG_FAIL",
            ErrorKind::SkippedException => "SE_SKIPPED_EXCEPTION",
            ErrorKind::Value => "SE_VALUE",
            ErrorKind::UnknownParam => "SE_UNKNOWN_PARAM",
            ErrorKind::NoDir => "E_NO_DIR",
            ErrorKind::SaveMissingPath => "SE_SCAN_SAVE_PATH_MISSING",
            ErrorKind::StaticSourceMissing => "SE_SCAN_STATIC_SOURCE_MISSING",
            ErrorKind::UnreadableImageType => "SE_SCAN_STATIC_UNREADABLE_IMAGE_TYPE",
            ErrorKind::NoRawImage => "SE_SCAN_NO_RAW_IMAGE",
            ErrorKind::RegenerateNoSourceForTarget => "SE_REGENERATE_NO_SOURCE_FOR_TARGET",
        }
    }
}

/// A tagged error: a stable code, a message template with `{placeholder}`
/// substitution, a public parameter map that clients may see, a private
/// parameter map that never leaves the server, and a per-occurrence uuid
/// so a user report can be matched against the logs.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ScanariumError {
    pub kind: ErrorKind,
    pub template: &'static str,
    pub parameters: BTreeMap<String, String>,
    pub private_parameters: BTreeMap<String, String>,
    pub message: String,
    pub uuid: Uuid,
}

impl ScanariumError {
    pub fn new(kind: ErrorKind, template: &'static str) -> Self {
        Self::with_parameters(kind, template, &[])
    }

    pub fn with_parameters(
        kind: ErrorKind,
        template: &'static str,
        parameters: &[(&str, &str)],
    ) -> Self {
        let parameters: BTreeMap<String, String> = parameters
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let message = format_message(template, &parameters);
        ScanariumError {
            kind,
            template,
            parameters,
            private_parameters: BTreeMap::new(),
            message,
            uuid: Uuid::new_v4(),
        }
    }

    pub fn with_private(mut self, key: &str, value: &str) -> Self {
        self.private_parameters
            .insert(key.to_string(), value.to_string());
        self
    }

    /// The catch-all error shown to users when fine-grained errors are off.
    pub fn unknown_qr() -> Self {
        ScanariumError::new(ErrorKind::UnknownQr, "Unknown QR code")
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }
}

fn format_message(template: &str, parameters: &BTreeMap<String, String>) -> String {
    let mut message = template.to_string();
    for (key, value) in parameters {
        message = message.replace(&format!("{{{key}}}"), value);
    }
    message
}
