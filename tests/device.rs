//! Tests against a real or simulated TPM.
//!
//! They only run when `TCTI` names a device, e.g.
//! `TCTI=mssim:host=localhost,port=2321 cargo test`.

use std::path::Path;
use std::sync::Mutex;

use tpm2_key_import::{
    Error,
    blob::ContextBlob,
    config::{
        DEFAULT_PERSISTENT_INDEX, PersistentIndex, PrimaryAttributes, PrimaryTemplate,
        AuthStrategy, ProvisionConfig, SessionConfig,
    },
    hierarchy, import,
    keys::{self, KeyFormat},
    persist, provision,
    session::{HandleKind, Session},
    sign,
};
use tss_esapi::structures::SymmetricDefinitionObject;

/// One device, one test at a time.
static DEVICE: Mutex<()> = Mutex::new(());

const SCRATCH_INDEX: u32 = 0x8101_0102;

fn session_config() -> Option<SessionConfig> {
    let tcti = std::env::var("TCTI").ok()?;
    Some(SessionConfig {
        tcti,
        ..SessionConfig::default()
    })
}

macro_rules! device_or_skip {
    () => {{
        let Some(config) = session_config() else {
            eprintln!("TCTI is not set, skipping");
            return;
        };
        let guard = DEVICE.lock().unwrap_or_else(|e| e.into_inner());
        (config, guard)
    }};
}

fn fixture(name: &str) -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/data")
        .join(name)
}

fn request(name: &str) -> import::ImportRequest {
    let material = keys::decode_file(&fixture(name), "", KeyFormat::Auto).unwrap();
    import::prepare(&material).unwrap()
}

#[test]
fn startup_flush_is_idempotent() {
    let (config, _guard) = device_or_skip!();
    let mut session = Session::open(&config).unwrap();

    session.flush_transient(HandleKind::Transient).unwrap();
    assert_eq!(session.flush_transient(HandleKind::Transient).unwrap(), 0);

    session.close().unwrap();
}

#[test]
fn context_round_trip_preserves_names() {
    let (config, _guard) = device_or_skip!();
    let mut session = Session::open(&config).unwrap();
    session.flush_transient(HandleKind::Transient).unwrap();

    let primary = hierarchy::create_primary(&mut session, &PrimaryTemplate::default()).unwrap();
    let blob = hierarchy::save_context(&mut session, primary.handle.into()).unwrap();
    let reloaded = hierarchy::load_context(&mut session, &blob).unwrap();
    let reloaded_name = hierarchy::object_name(&mut session, reloaded).unwrap();
    assert_eq!(reloaded_name.value(), primary.name.value());
    session.release(reloaded).unwrap();

    let request = request("rsa2048.pem");
    let imported = import::import(&mut session, &primary, &request).unwrap();
    let key = persist::load(&mut session, &primary, &imported).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let key = hierarchy::reload_through_file(&mut session, key, &dir.path().join("key.ctx"))
        .unwrap();
    let key_name = hierarchy::object_name(&mut session, key).unwrap();
    assert_eq!(key_name.value(), request.name());

    session.close().unwrap();
}

#[test]
fn device_name_matches_local_name() {
    let (config, _guard) = device_or_skip!();
    let mut session = Session::open(&config).unwrap();
    session.flush_transient(HandleKind::Transient).unwrap();

    let primary = hierarchy::create_primary(&mut session, &PrimaryTemplate::default()).unwrap();
    let request = request("rsa2048-pkcs1.pem");
    let imported = import::import(&mut session, &primary, &request).unwrap();
    assert_eq!(imported.name, request.name());

    // load() already compares the names; a mismatch would be an error here.
    persist::load(&mut session, &primary, &imported).unwrap();

    session.close().unwrap();
}

#[test]
fn import_under_non_storage_parent_is_rejected() {
    let (config, _guard) = device_or_skip!();
    let mut session = Session::open(&config).unwrap();
    session.flush_transient(HandleKind::Transient).unwrap();

    let template = PrimaryTemplate {
        symmetric: SymmetricDefinitionObject::Null,
        attributes: PrimaryAttributes {
            restricted: false,
            ..PrimaryAttributes::default()
        },
        ..PrimaryTemplate::default()
    };
    let parent = hierarchy::create_primary(&mut session, &template).unwrap();

    let err = import::import(&mut session, &parent, &request("rsa2048.pem")).unwrap_err();
    assert!(matches!(err, Error::ImportRejected { .. }), "{err}");

    session.close().unwrap();
}

#[test]
fn mismatched_public_and_private_halves_are_refused_by_device() {
    let (config, _guard) = device_or_skip!();
    let mut session = Session::open(&config).unwrap();
    session.flush_transient(HandleKind::Transient).unwrap();

    let primary = hierarchy::create_primary(&mut session, &PrimaryTemplate::default()).unwrap();

    let first = keys::decode_file(&fixture("rsa2048.pem"), "", KeyFormat::Auto).unwrap();
    let second = keys::decode_file(&fixture("rsa2048-second.pem"), "", KeyFormat::Auto).unwrap();
    let request = import::ImportRequest::new(
        import::key_public(&first).unwrap(),
        import::sensitive_area(second.prime()).unwrap(),
    )
    .unwrap();

    // The storage parent passes the local check; the device has to refuse.
    let err = import::import(&mut session, &primary, &request).unwrap_err();
    assert!(matches!(err, Error::ImportRejected { source: Some(_), .. }), "{err}");

    session.close().unwrap();
}

#[test]
fn hmac_session_survives_session_flush() {
    let (config, _guard) = device_or_skip!();
    let config = SessionConfig {
        auth_strategy: AuthStrategy::Hmac,
        ..config
    };
    let mut session = Session::open(&config).unwrap();
    session.flush_transient(HandleKind::Transient).unwrap();
    assert!(session.uses_hmac());

    assert!(session.flush_transient(HandleKind::LoadedSession).unwrap() >= 1);
    assert!(session.uses_hmac());

    // The owner-authorized command goes out under the new session.
    let primary = hierarchy::create_primary(&mut session, &PrimaryTemplate::default()).unwrap();
    session.release(primary.handle.into()).unwrap();

    session.close().unwrap();
}

#[test]
fn promotion_replaces_previous_occupant() {
    let (config, _guard) = device_or_skip!();
    let index = PersistentIndex::new(SCRATCH_INDEX).unwrap();
    let mut session = Session::open(&config).unwrap();
    session.flush_transient(HandleKind::Transient).unwrap();

    let primary = hierarchy::create_primary(&mut session, &PrimaryTemplate::default()).unwrap();

    let mut names = Vec::new();
    for key in ["rsa2048.pem", "rsa2048-second.pem"] {
        let request = request(key);
        let imported = import::import(&mut session, &primary, &request).unwrap();
        let handle = persist::load(&mut session, &primary, &imported).unwrap();
        assert_eq!(persist::promote(&mut session, handle, index).unwrap(), index);
        names.push(imported.name);
    }

    assert!(persist::is_occupied(&mut session, index).unwrap());
    let mut occupant = persist::persistent_object(&mut session, index).unwrap();
    let occupant_name = hierarchy::object_name(&mut session, occupant).unwrap();
    assert_eq!(occupant_name.value(), names[1].as_slice());
    assert_ne!(occupant_name.value(), names[0].as_slice());
    session.context().tr_close(&mut occupant).unwrap();

    // An empty index is not an error.
    assert!(persist::evict(&mut session, index).unwrap());
    assert!(!persist::evict(&mut session, index).unwrap());
    assert!(!persist::is_occupied(&mut session, index).unwrap());

    session.close().unwrap();
}

#[test]
fn transient_pool_is_bounded_and_recovers_after_flush() {
    let (config, _guard) = device_or_skip!();
    let mut session = Session::open(&config).unwrap();
    session.flush_transient(HandleKind::Transient).unwrap();

    let limit = session.transient_limit();
    let primary = hierarchy::create_primary(&mut session, &PrimaryTemplate::default()).unwrap();
    let blob = hierarchy::save_context(&mut session, primary.handle.into()).unwrap();

    for _ in 1..limit {
        hierarchy::load_context(&mut session, &blob).unwrap();
    }
    assert_eq!(session.transient_in_use(), limit);

    let err = hierarchy::load_context(&mut session, &blob).unwrap_err();
    assert!(matches!(err, Error::ResourceExhaustion { .. }), "{err}");
    assert!(err.is_recoverable());

    assert_eq!(session.flush_transient(HandleKind::Transient).unwrap(), limit);
    assert_eq!(session.transient_in_use(), 0);
    hierarchy::load_context(&mut session, &blob).unwrap();

    session.close().unwrap();
}

#[test]
fn foreign_context_blob_is_rejected() {
    let (config, _guard) = device_or_skip!();
    let mut session = Session::open(&config).unwrap();

    let err = hierarchy::load_context(&mut session, &ContextBlob::from_bytes(b"{}".to_vec()))
        .unwrap_err();
    assert!(matches!(err, Error::Context { .. }), "{err}");
    assert_eq!(session.transient_in_use(), 0);

    session.close().unwrap();
}

#[test]
fn provision_restart_and_sign() {
    let (config, _guard) = device_or_skip!();
    let index = DEFAULT_PERSISTENT_INDEX;
    let dir = tempfile::tempdir().unwrap();
    let primary_context = dir.path().join("primary.ctx");
    let key_context = dir.path().join("key.ctx");

    // The encrypted fixture uses the default passphrase.
    let mut provision_config =
        ProvisionConfig::new(config.clone(), fixture("rsa2048-encrypted.pem"));
    provision_config.persistent_index = index;
    provision_config.primary_context = Some(primary_context.clone());
    provision_config.key_context = Some(key_context.clone());

    let outcome = provision::provision(&provision_config).unwrap();
    assert_eq!(outcome.index, index);

    // Start over from the saved contexts only.
    let mut session = Session::open(&config).unwrap();
    assert!(persist::evict(&mut session, index).unwrap());
    session.close().unwrap();

    let resumed = provision::resume(&config, Some(&primary_context), &key_context, index).unwrap();
    assert_eq!(resumed, index);

    let message = b"signed inside the TPM";
    let mut session = Session::open(&config).unwrap();
    let signature = sign::sign(&mut session, index, message).unwrap();
    persist::evict(&mut session, index).unwrap();
    session.close().unwrap();

    let material = keys::decode_file(&fixture("rsa2048.pem"), "", KeyFormat::Auto).unwrap();
    let public = material.public_key().unwrap();
    sign::verify(&public, message, &signature).unwrap();
    assert!(sign::verify(&public, b"something else", &signature).is_err());
}
