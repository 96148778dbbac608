//! The provisioning pipeline, start to finish, and its restart path.

use std::path::Path;

use base16ct::HexDisplay;
use log::{info, warn};

use crate::{
    Result,
    blob::ContextBlob,
    config::{PersistentIndex, ProvisionConfig, SessionConfig},
    hierarchy, import, keys, persist,
    session::{HandleKind, Session},
};

/// What a provisioning run leaves behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub index: PersistentIndex,
    /// Name digest of the imported key.
    pub name: Vec<u8>,
    /// Stale transient objects flushed at startup.
    pub flushed: usize,
}

/// Closes `session` after `result` is known, keeping the first error.
fn finish<T>(session: Session, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            session.close()?;
            Ok(value)
        }
        Err(e) => {
            if let Err(close) = session.close() {
                warn!("release after failure also failed: {close}");
            }
            Err(e)
        }
    }
}

/// Decodes the key, imports it under a fresh primary and persists it.
pub fn provision(config: &ProvisionConfig) -> Result<Outcome> {
    let material = keys::decode_file(&config.key_path, &config.passphrase, config.key_format)?;
    let request = import::prepare(&material)?;
    drop(material);

    let mut session = Session::open(&config.session)?;
    let result = run(&mut session, config, &request);
    finish(session, result)
}

fn run(
    session: &mut Session,
    config: &ProvisionConfig,
    request: &import::ImportRequest,
) -> Result<Outcome> {
    let flushed = session.flush_transient(HandleKind::Transient)?;

    let mut primary = hierarchy::create_primary(session, &config.primary_template)?;
    if let Some(path) = &config.primary_context {
        primary.handle =
            hierarchy::reload_through_file(session, primary.handle.into(), path)?.into();
        info!("primary context saved to {}", path.display());
    }

    let imported = import::import(session, &primary, request)?;
    let mut key = persist::load(session, &primary, &imported)?;
    if let Some(path) = &config.key_context {
        key = hierarchy::reload_through_file(session, key, path)?;
        info!("key context saved to {}", path.display());
    }

    // The parent is not needed for promotion.
    session.release(primary.handle.into())?;

    let index = persist::promote(session, key, config.persistent_index)?;
    info!(
        "provisioned key {} at {index}",
        HexDisplay(imported.name.as_slice())
    );

    Ok(Outcome {
        index,
        name: imported.name,
        flushed,
    })
}

/// Persists a key from a previously saved context, without importing again.
///
/// When `primary_context` is given the primary is reloaded first, which checks
/// that its blob is still valid on this device.
pub fn resume(
    config: &SessionConfig,
    primary_context: Option<&Path>,
    key_context: &Path,
    index: PersistentIndex,
) -> Result<PersistentIndex> {
    let mut session = Session::open(config)?;
    let result = resume_with(&mut session, primary_context, key_context, index);
    finish(session, result)
}

fn resume_with(
    session: &mut Session,
    primary_context: Option<&Path>,
    key_context: &Path,
    index: PersistentIndex,
) -> Result<PersistentIndex> {
    session.flush_transient(HandleKind::Transient)?;

    if let Some(path) = primary_context {
        let primary = hierarchy::load_primary(session, &ContextBlob::read(path)?)?;
        session.release(primary.handle.into())?;
    }

    let key = hierarchy::load_context(session, &ContextBlob::read(key_context)?)?;
    let name = hierarchy::object_name(session, key)?;
    info!("key {} reloaded from context", HexDisplay(name.value()));

    persist::promote(session, key, index)
}
