use std::path::Path;

use log::debug;
use tss_esapi::utils::TpmsContext;

use crate::{Error, Result, Step};

/// Saved object state, opaque outside the device that produced it.
///
/// The bytes are only ever produced by a context save and only ever consumed
/// by a context load; nothing in this crate looks inside them.
#[derive(Clone, PartialEq, Eq)]
pub struct ContextBlob(Vec<u8>);

impl std::fmt::Debug for ContextBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContextBlob({} bytes)", self.0.len())
    }
}

impl ContextBlob {
    pub(crate) fn from_tpms(context: &TpmsContext) -> Result<Self> {
        serde_json::to_vec(context)
            .map(Self)
            .map_err(|e| Error::Context {
                step: Step::ContextSave,
                source: Box::new(e),
            })
    }

    pub(crate) fn to_tpms(&self) -> Result<TpmsContext> {
        serde_json::from_slice(&self.0).map_err(|e| Error::Context {
            step: Step::ContextLoad,
            source: Box::new(e),
        })
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| Error::io(path, e))?;
        debug!("read {} context bytes from {}", bytes.len(), path.display());
        Ok(Self(bytes))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, &self.0).map_err(|e| Error::io(path, e))?;
        debug!("wrote {} context bytes to {}", self.0.len(), path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn survives_a_trip_through_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("primary.ctx");

        let blob = ContextBlob::from_bytes(vec![0xde, 0xad, 0xbe, 0xef]);
        blob.write(&path).unwrap();

        assert_eq!(ContextBlob::read(&path).unwrap(), blob);
    }

    #[test]
    fn missing_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.ctx");

        let err = ContextBlob::read(&path).unwrap_err();
        assert!(err.to_string().contains("nope.ctx"), "{err}");
    }

    #[test]
    fn foreign_bytes_are_a_context_error() {
        let blob = ContextBlob::from_bytes(b"\x00\x01 not a saved context".to_vec());
        let err = blob.to_tpms().unwrap_err();
        assert!(matches!(
            err,
            Error::Context {
                step: Step::ContextLoad,
                ..
            }
        ));
    }

    #[test]
    fn debug_does_not_dump_contents() {
        let blob = ContextBlob::from_bytes(vec![0; 1024]);
        assert_eq!(format!("{blob:?}"), "ContextBlob(1024 bytes)");
    }
}
