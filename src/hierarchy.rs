//! The owner-hierarchy storage key every imported key is parented to.

use base16ct::HexDisplay;
use log::{debug, info, warn};
use p256::elliptic_curve::sec1::FromEncodedPoint;
use rsa::{BigUint, RsaPublicKey, pkcs8::EncodePublicKey, pkcs8::LineEnding};
use tss_esapi::{
    attributes::{ObjectAttributes, ObjectAttributesBuilder},
    handles::{KeyHandle, ObjectHandle},
    interface_types::{ecc::EccCurve, key_bits::RsaKeyBits, resource_handles::Hierarchy},
    structures::{
        Digest, EccPoint, EccScheme, KeyDerivationFunctionScheme, Name, Public,
        PublicEccParameters, PublicKeyRsa, PublicRsaParametersBuilder, RsaExponent, RsaScheme,
    },
};

use crate::{
    Error, Result, Step,
    blob::ContextBlob,
    config::{PrimaryTemplate, StorageAlgorithm},
    error::is_memory_exhausted,
    session::Session,
};

/// A loaded primary storage key.
#[derive(Debug, Clone)]
pub struct StorageKey {
    pub handle: KeyHandle,
    pub public: Public,
    pub name: Name,
}

fn object_attributes(template: &PrimaryTemplate) -> Result<ObjectAttributes> {
    let a = &template.attributes;
    ObjectAttributesBuilder::new()
        .with_fixed_tpm(a.fixed_tpm)
        .with_fixed_parent(a.fixed_parent)
        .with_sensitive_data_origin(a.sensitive_data_origin)
        .with_user_with_auth(a.user_with_auth)
        .with_restricted(a.restricted)
        .with_decrypt(a.decrypt)
        .with_no_da(a.no_da)
        .with_st_clear(false)
        .with_admin_with_policy(false)
        .with_encrypted_duplication(false)
        .with_sign_encrypt(false)
        .build()
        .map_err(|e| Error::Config(format!("invalid primary attributes: {e}")))
}

/// Builds the public template the primary is created from.
pub fn primary_public(template: &PrimaryTemplate) -> Result<Public> {
    let object_attributes = object_attributes(template)?;
    let invalid = |e: tss_esapi::Error| Error::Config(format!("invalid primary template: {e}"));

    let public = match template.algorithm {
        StorageAlgorithm::Rsa2048 => Public::Rsa {
            object_attributes,
            name_hashing_algorithm: template.name_hashing_algorithm,
            auth_policy: Digest::default(),
            parameters: PublicRsaParametersBuilder::new()
                .with_symmetric(template.symmetric)
                .with_scheme(RsaScheme::Null)
                .with_key_bits(RsaKeyBits::Rsa2048)
                .with_exponent(RsaExponent::default())
                .with_is_decryption_key(template.attributes.decrypt)
                .with_restricted(template.attributes.restricted)
                .build()
                .map_err(invalid)?,
            unique: PublicKeyRsa::default(),
        },
        StorageAlgorithm::EccP256 => Public::Ecc {
            object_attributes,
            name_hashing_algorithm: template.name_hashing_algorithm,
            auth_policy: Digest::default(),
            parameters: PublicEccParameters::builder()
                .with_curve(EccCurve::NistP256)
                .with_symmetric(template.symmetric)
                .with_ecc_scheme(EccScheme::Null)
                .with_key_derivation_function_scheme(KeyDerivationFunctionScheme::Null)
                .with_is_decryption_key(template.attributes.decrypt)
                .with_restricted(template.attributes.restricted)
                .build()
                .map_err(invalid)?,
            unique: EccPoint::default(),
        },
    };
    Ok(public)
}

/// Creates a fresh primary under the owner hierarchy.
pub fn create_primary(session: &mut Session, template: &PrimaryTemplate) -> Result<StorageKey> {
    let public = primary_public(template)?;

    session.reserve(Step::CreatePrimary)?;
    let result = session
        .authorized(|ctx| {
            ctx.create_primary(
                Hierarchy::Owner,
                public,
                None, // auth_value
                None, // initial_data
                None, // outside_info
                None, // creation_pcrs
            )
        })
        .map_err(|e| Error::device(Step::CreatePrimary, None, e))?;
    session.track(result.key_handle.into());

    let name = object_name(session, result.key_handle.into())?;
    info!("primary created, name {}", HexDisplay(name.value()));
    log_public_key(&result.out_public);

    Ok(StorageKey {
        handle: result.key_handle,
        public: result.out_public,
        name,
    })
}

/// Reads the device-computed name of a loaded object.
pub fn object_name(session: &mut Session, handle: ObjectHandle) -> Result<Name> {
    let (_, name, _) = read_public(session, handle)?;
    Ok(name)
}

pub(crate) fn read_public(
    session: &mut Session,
    handle: ObjectHandle,
) -> Result<(Public, Name, Name)> {
    session
        .context()
        .execute_without_session(|ctx| ctx.read_public(handle.into()))
        .map_err(|e| Error::device(Step::ReadPublic, None, e))
}

pub fn save_context(session: &mut Session, handle: ObjectHandle) -> Result<ContextBlob> {
    let context = session
        .context()
        .execute_without_session(|ctx| ctx.context_save(handle))
        .map_err(|e| Error::device(Step::ContextSave, None, e))?;
    ContextBlob::from_tpms(&context)
}

/// Reconstitutes a saved object into a new tracked transient handle.
pub fn load_context(session: &mut Session, blob: &ContextBlob) -> Result<ObjectHandle> {
    let context = blob.to_tpms()?;

    session.reserve(Step::ContextLoad)?;
    let handle = session
        .context()
        .execute_without_session(|ctx| ctx.context_load(context))
        .map_err(|e| {
            if is_memory_exhausted(&e) {
                Error::device(Step::ContextLoad, None, e)
            } else {
                Error::Context {
                    step: Step::ContextLoad,
                    source: Box::new(e),
                }
            }
        })?;
    session.track(handle);
    debug!("context loaded into {handle:?}");
    Ok(handle)
}

/// Reloads a previously saved primary and checks it is the expected object.
pub fn load_primary(session: &mut Session, blob: &ContextBlob) -> Result<StorageKey> {
    let handle = load_context(session, blob)?;
    let (public, name, _) = read_public(session, handle)?;
    info!("primary reloaded, name {}", HexDisplay(name.value()));

    Ok(StorageKey {
        handle: handle.into(),
        public,
        name,
    })
}

/// Saves `handle` to `path`, flushes it, and loads it back from the file.
///
/// The reloaded object must carry the same name as the original.
pub fn reload_through_file(
    session: &mut Session,
    handle: ObjectHandle,
    path: &std::path::Path,
) -> Result<ObjectHandle> {
    let name = object_name(session, handle)?;

    save_context(session, handle)?.write(path)?;
    session.release(handle)?;

    let reloaded = load_context(session, &ContextBlob::read(path)?)?;
    let reloaded_name = object_name(session, reloaded)?;
    if reloaded_name.value() != name.value() {
        return Err(Error::NameMismatch {
            expected: HexDisplay(name.value()).to_string(),
            actual: HexDisplay(reloaded_name.value()).to_string(),
        });
    }
    Ok(reloaded)
}

fn log_public_key(public: &Public) {
    match public {
        Public::Rsa {
            parameters, unique, ..
        } => {
            // An exponent of zero stands for the default 65537.
            let e = match parameters.exponent().value() {
                0 => 65537,
                e => e,
            };
            let pem = RsaPublicKey::new(BigUint::from_bytes_be(unique.as_slice()), e.into())
                .map_err(|e| e.to_string())
                .and_then(|key| {
                    key.to_public_key_pem(LineEnding::LF)
                        .map_err(|e| e.to_string())
                });
            match pem {
                Ok(pem) => debug!("primary public key:\n{pem}"),
                Err(e) => warn!("primary public key is not a valid RSA key: {e}"),
            }
        }
        Public::Ecc { unique, .. } => match p256_public_key(unique) {
            Ok(key) => debug!(
                "primary public key: {}",
                HexDisplay(key.to_sec1_bytes().as_ref())
            ),
            Err(e) => warn!("primary public key is not a valid P-256 point: {e}"),
        },
        other => debug!("primary public area: {other:?}"),
    }
}

/// Uncompressed TPM point to a P-256 key; both coordinates must be 32 bytes.
fn p256_public_key(point: &EccPoint) -> std::result::Result<p256::PublicKey, String> {
    let (x, y) = (point.x().as_slice(), point.y().as_slice());
    if x.len() != 32 || y.len() != 32 {
        return Err(format!(
            "expected 32-byte coordinates, got {} and {}",
            x.len(),
            y.len()
        ));
    }

    let encoded = p256::EncodedPoint::from_affine_coordinates(x.into(), y.into(), false);
    Option::from(p256::PublicKey::from_encoded_point(&encoded))
        .ok_or_else(|| "point is not on the curve".to_string())
}
