//! Loading imported keys and moving them into the persistent range.

use base16ct::HexDisplay;
use log::{debug, info};
use tss_esapi::{
    constants::CapabilityType,
    handles::{ObjectHandle, TpmHandle},
    interface_types::{dynamic_handles::Persistent, resource_handles::Provision},
    constants::response_code::Tss2ResponseCodeKind,
    structures::CapabilityData,
};

use crate::{
    Error, Result, Step,
    config::PersistentIndex,
    error::response_kind,
    hierarchy::{StorageKey, read_public},
    import::ImportedKey,
    session::Session,
};

/// Loads an imported key under `parent` and checks the device agrees on its name.
pub fn load(session: &mut Session, parent: &StorageKey, key: &ImportedKey) -> Result<ObjectHandle> {
    session.reserve(Step::Load)?;
    let handle = session
        .authorized(|ctx| ctx.load(parent.handle, key.private.clone(), key.public.clone()))
        .map_err(|e| Error::device(Step::Load, None, e))?;
    session.track(handle.into());

    let (_, name, _) = read_public(session, handle.into())?;
    if name.value() != key.name.as_slice() {
        return Err(Error::NameMismatch {
            expected: HexDisplay(&key.name).to_string(),
            actual: HexDisplay(name.value()).to_string(),
        });
    }
    info!("imported key loaded, name {}", HexDisplay(name.value()));
    Ok(handle.into())
}

/// Whether an object currently occupies `index`.
pub fn is_occupied(session: &mut Session, index: PersistentIndex) -> Result<bool> {
    let (data, _) = session
        .context()
        .get_capability(CapabilityType::Handles, index.value(), 1)
        .map_err(|e| Error::device(Step::Capability, Some(index.value()), e))?;

    match data {
        CapabilityData::Handles(list) => Ok(list
            .iter()
            .next()
            .is_some_and(|h| u32::from(*h) == index.value())),
        other => Err(Error::Config(format!(
            "device answered a handle query with {other:?}"
        ))),
    }
}

/// Opens an ESYS handle for the object at `index`.
pub fn persistent_object(session: &mut Session, index: PersistentIndex) -> Result<ObjectHandle> {
    let handle = TpmHandle::Persistent(index.tpm_handle()?);
    session
        .context()
        .execute_without_session(|ctx| ctx.tr_from_tpm_public(handle))
        .map_err(|e| Error::device(Step::ReadPublic, Some(index.value()), e))
}

/// Evicts whatever occupies `index`. Returns `false` when it was already empty.
pub fn evict(session: &mut Session, index: PersistentIndex) -> Result<bool> {
    if !is_occupied(session, index)? {
        debug!("nothing persisted at {index}");
        return Ok(false);
    }

    let object = match persistent_object(session, index) {
        Ok(object) => object,
        // Raced with another evictor.
        Err(Error::Device { source, .. })
            if response_kind(&source) == Some(Tss2ResponseCodeKind::Handle) =>
        {
            return Ok(false);
        }
        Err(e) => return Err(e),
    };

    let persistent = Persistent::Persistent(index.tpm_handle()?);
    session
        .authorized(|ctx| ctx.evict_control(Provision::Owner, object, persistent))
        .map_err(|e| Error::device(Step::EvictControl, Some(index.value()), e))?;
    info!("evicted persistent object at {index}");
    Ok(true)
}

/// Makes the transient object at `handle` durable at `index`.
///
/// Any previous occupant is evicted first. The transient copy is flushed
/// afterwards, so `handle` is no longer valid once this returns.
pub fn promote(
    session: &mut Session,
    handle: ObjectHandle,
    index: PersistentIndex,
) -> Result<PersistentIndex> {
    let persistent = Persistent::Persistent(index.tpm_handle()?);

    evict(session, index)?;

    let mut persisted = session
        .authorized(|ctx| ctx.evict_control(Provision::Owner, handle, persistent))
        .map_err(|e| Error::device(Step::EvictControl, Some(index.value()), e))?;
    info!("key persisted at {index}");

    // The persistent object lives on in the device; only the ESYS resource goes.
    if let Err(e) = session.context().tr_close(&mut persisted) {
        debug!("failed to close ESYS handle for {index}: {e}");
    }

    session.release(handle)?;
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_maps_to_persistent_tpm_handle() {
        let index = PersistentIndex::new(0x8101_0102).unwrap();
        let handle = TpmHandle::Persistent(index.tpm_handle().unwrap());
        assert_eq!(u32::from(handle), 0x8101_0102);
    }
}
