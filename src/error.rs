use std::path::PathBuf;

use tss_esapi::constants::response_code::Tss2ResponseCodeKind;

use crate::keys::DecodeError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The device command that was in flight when something went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Open,
    Startup,
    SetAuth,
    Capability,
    FlushTransient,
    StartAuthSession,
    CreatePrimary,
    ReadPublic,
    ContextSave,
    ContextLoad,
    Import,
    Load,
    EvictControl,
    Flush,
    Sign,
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Step::Open => "open",
            Step::Startup => "startup",
            Step::SetAuth => "set auth",
            Step::Capability => "get capability",
            Step::FlushTransient => "flush transient handles",
            Step::StartAuthSession => "start auth session",
            Step::CreatePrimary => "create primary",
            Step::ReadPublic => "read public",
            Step::ContextSave => "context save",
            Step::ContextLoad => "context load",
            Step::Import => "import",
            Step::Load => "load",
            Step::EvictControl => "evict control",
            Step::Flush => "flush context",
            Step::Sign => "sign",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to decode key material")]
    Decode(#[from] DecodeError),

    #[error("TPM command failed during {step}{}", fmt_handle(.handle))]
    Device {
        step: Step,
        handle: Option<u32>,
        #[source]
        source: tss_esapi::Error,
    },

    #[error("name digest mismatch: expected {expected}, device reported {actual}")]
    NameMismatch { expected: String, actual: String },

    #[error("import rejected: {reason}")]
    ImportRejected {
        reason: String,
        #[source]
        source: Option<tss_esapi::Error>,
    },

    #[error("context blob rejected during {step}")]
    Context {
        step: Step,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("transient object pool exhausted during {step}{}", fmt_slots(.slots))]
    ResourceExhaustion {
        step: Step,
        /// `(in_use, limit)` when the exhaustion was detected locally.
        slots: Option<(usize, usize)>,
    },

    #[error("i/o error on {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

fn fmt_handle(handle: &Option<u32>) -> String {
    handle
        .map(|h| format!(" (handle {h:#010x})"))
        .unwrap_or_default()
}

fn fmt_slots(slots: &Option<(usize, usize)>) -> String {
    slots
        .map(|(in_use, limit)| format!(" ({in_use} of {limit} slots in use)"))
        .unwrap_or_else(|| " (reported by device)".to_string())
}

/// Extracts the TPM response code kind, if the error came from the device.
pub(crate) fn response_kind(err: &tss_esapi::Error) -> Option<Tss2ResponseCodeKind> {
    match err {
        tss_esapi::Error::Tss2Error(rc) => rc.kind(),
        _ => None,
    }
}

pub(crate) fn is_memory_exhausted(err: &tss_esapi::Error) -> bool {
    matches!(
        response_kind(err),
        Some(
            Tss2ResponseCodeKind::ObjectMemory
                | Tss2ResponseCodeKind::SessionMemory
                | Tss2ResponseCodeKind::ObjectHandles
                | Tss2ResponseCodeKind::SessionHandles
        )
    )
}

impl Error {
    /// Wraps a device error, promoting memory exhaustion to its own variant.
    pub(crate) fn device(step: Step, handle: Option<u32>, source: tss_esapi::Error) -> Self {
        if is_memory_exhausted(&source) {
            log::warn!("device reports memory exhaustion during {step}: {source}");
            return Error::ResourceExhaustion { step, slots: None };
        }
        Error::Device {
            step,
            handle,
            source,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Name of the failing step, when the error is tied to one.
    pub fn step(&self) -> Option<Step> {
        match self {
            Error::Device { step, .. }
            | Error::Context { step, .. }
            | Error::ResourceExhaustion { step, .. } => Some(*step),
            Error::ImportRejected { .. } | Error::NameMismatch { .. } => Some(Step::Import),
            _ => None,
        }
    }

    /// Only pool exhaustion is recoverable, by running the startup flush.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::ResourceExhaustion { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_error_message_names_step_and_handle() {
        let err = Error::Device {
            step: Step::EvictControl,
            handle: Some(0x8101_0002),
            source: tss_esapi::Error::WrapperError(tss_esapi::WrapperErrorKind::InvalidParam),
        };
        assert_eq!(
            err.to_string(),
            "TPM command failed during evict control (handle 0x81010002)"
        );
        assert_eq!(err.step(), Some(Step::EvictControl));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn wrapper_errors_are_not_exhaustion() {
        let err = Error::device(
            Step::Load,
            None,
            tss_esapi::Error::WrapperError(tss_esapi::WrapperErrorKind::WrongParamSize),
        );
        assert!(matches!(err, Error::Device { handle: None, .. }));
        assert_eq!(err.to_string(), "TPM command failed during load");
    }

    #[test]
    fn device_reported_object_memory_is_exhaustion() {
        // TPM_RC_OBJECT_MEMORY
        let rc = tss_esapi::constants::response_code::Tss2ResponseCode::from(0x902);
        let err = Error::device(Step::Load, Some(0x8000_0001), tss_esapi::Error::Tss2Error(rc));
        assert!(matches!(
            err,
            Error::ResourceExhaustion {
                step: Step::Load,
                slots: None
            }
        ));
        assert!(err.is_recoverable());
        assert_eq!(
            err.to_string(),
            "transient object pool exhausted during load (reported by device)"
        );
    }

    #[test]
    fn exhaustion_is_recoverable() {
        let err = Error::ResourceExhaustion {
            step: Step::ContextLoad,
            slots: Some((3, 3)),
        };
        assert!(err.is_recoverable());
        assert_eq!(
            err.to_string(),
            "transient object pool exhausted during context load (3 of 3 slots in use)"
        );
    }
}
