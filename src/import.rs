//! Encoding of external key material into the structures `TPM2_Import`
//! expects, and the import itself.
//!
//! The duplicate is sent without inner or outer wrapping, so no seed, no
//! symmetric key and no integrity HMAC are involved. That is only acceptable
//! on a local, trusted channel to the device.

use base16ct::HexDisplay;
use log::{debug, info, trace};
use sha2::{Digest as _, Sha256};
use tss_esapi::{
    attributes::ObjectAttributesBuilder,
    interface_types::{algorithm::HashingAlgorithm, key_bits::RsaKeyBits},
    constants::response_code::Tss2ResponseCodeKind,
    structures::{
        Auth, Digest, EncryptedSecret, Private, PrivateKeyRsa, Public, PublicKeyRsa,
        PublicRsaParametersBuilder, RsaExponent, RsaScheme, Sensitive, SensitiveBuffer,
        SymmetricDefinitionObject,
    },
    traits::Marshall,
};
use zeroize::Zeroizing;

use crate::{
    Error, Result, Step,
    error::{is_memory_exhausted, response_kind},
    hierarchy::StorageKey,
    keys::RsaKeyMaterial,
    session::Session,
};

const TPM_ALG_SHA256: u16 = 0x000B;

/// Everything the device needs to import one key, computed locally.
pub struct ImportRequest {
    public: Public,
    encoded_public: Vec<u8>,
    name: Vec<u8>,
    duplicate: Zeroizing<Vec<u8>>,
}

impl ImportRequest {
    /// Encodes `public` and `sensitive` into the form `TPM2_Import` takes.
    ///
    /// The two halves are not checked against each other here; the device
    /// refuses a mismatched pair.
    pub fn new(public: Public, sensitive: Sensitive) -> Result<Self> {
        let encoded_public = public.marshall().map_err(|e| Error::ImportRejected {
            reason: "cannot marshal public area".to_string(),
            source: Some(e),
        })?;
        let name = name_digest(&encoded_public);
        trace!("encoded public area: {}", HexDisplay(&encoded_public));
        debug!("import name: {}", HexDisplay(&name));

        let duplicate = pack_duplicate(sensitive)?;

        Ok(Self {
            public,
            encoded_public,
            name,
            duplicate,
        })
    }

    pub fn public(&self) -> &Public {
        &self.public
    }

    /// Canonical `TPMT_PUBLIC` encoding.
    pub fn encoded_public(&self) -> &[u8] {
        &self.encoded_public
    }

    /// `nameAlg || H(TPMT_PUBLIC)`, as the device will compute it.
    pub fn name(&self) -> &[u8] {
        &self.name
    }
}

/// The output of a successful import: private material now wrapped by the parent.
#[derive(Debug, Clone)]
pub struct ImportedKey {
    pub public: Public,
    pub private: Private,
    pub name: Vec<u8>,
}

fn key_bits(bits: u16) -> Result<RsaKeyBits> {
    match bits {
        1024 => Ok(RsaKeyBits::Rsa1024),
        2048 => Ok(RsaKeyBits::Rsa2048),
        3072 => Ok(RsaKeyBits::Rsa3072),
        4096 => Ok(RsaKeyBits::Rsa4096),
        other => Err(Error::ImportRejected {
            reason: format!("no TPM key size for a {other}-bit modulus"),
            source: None,
        }),
    }
}

/// Public area of an unrestricted RSA signing key carrying the literal modulus.
///
/// Decryption is deliberately not enabled for imported keys.
pub fn key_public(material: &RsaKeyMaterial) -> Result<Public> {
    let rejected = |what: &str, e: tss_esapi::Error| Error::ImportRejected {
        reason: format!("cannot encode {what}"),
        source: Some(e),
    };

    // fixedTPM and fixedParent must stay clear on anything that is imported.
    let object_attributes = ObjectAttributesBuilder::new()
        .with_user_with_auth(true)
        .with_sign_encrypt(true)
        .with_decrypt(false)
        .build()
        .map_err(|e| rejected("object attributes", e))?;

    let exponent =
        RsaExponent::create(material.exponent()).map_err(|e| rejected("exponent", e))?;

    let parameters = PublicRsaParametersBuilder::new()
        .with_scheme(RsaScheme::Null)
        .with_key_bits(key_bits(material.bits())?)
        .with_exponent(exponent)
        .with_is_signing_key(true)
        .with_is_decryption_key(false)
        .with_restricted(false)
        .build()
        .map_err(|e| rejected("RSA parameters", e))?;

    let unique = PublicKeyRsa::try_from(material.modulus().to_vec())
        .map_err(|e| rejected("modulus", e))?;

    Ok(Public::Rsa {
        object_attributes,
        name_hashing_algorithm: HashingAlgorithm::Sha256,
        auth_policy: Digest::default(),
        parameters,
        unique,
    })
}

/// Name digest over an encoded `TPMT_PUBLIC` with a SHA-256 name algorithm.
pub fn name_digest(encoded_public: &[u8]) -> Vec<u8> {
    let mut name = Vec::with_capacity(2 + 32);
    name.extend_from_slice(&TPM_ALG_SHA256.to_be_bytes());
    name.extend_from_slice(&Sha256::digest(encoded_public));
    name
}

/// Sensitive area of an RSA key: empty auth value, empty seed, prime `P`.
pub fn sensitive_area(prime: &[u8]) -> Result<Sensitive> {
    let sensitive = PrivateKeyRsa::try_from(prime.to_vec()).map_err(|e| Error::ImportRejected {
        reason: format!("a {}-byte prime does not fit the sensitive area", prime.len()),
        source: Some(e),
    })?;

    Ok(Sensitive::Rsa {
        auth_value: Auth::default(),
        seed_value: Digest::default(),
        sensitive,
    })
}

/// Canonical `TPMT_SENSITIVE` encoding.
pub fn encode_sensitive(sensitive: &Sensitive) -> Result<Zeroizing<Vec<u8>>> {
    sensitive
        .marshall()
        .map(Zeroizing::new)
        .map_err(|e| Error::ImportRejected {
            reason: "cannot marshal sensitive area".to_string(),
            source: Some(e),
        })
}

/// `TPM2B_SENSITIVE`, which is what an unwrapped duplicate consists of.
pub fn pack_duplicate(sensitive: Sensitive) -> Result<Zeroizing<Vec<u8>>> {
    SensitiveBuffer::try_from(sensitive)
        .and_then(|buffer| buffer.marshall())
        .map(Zeroizing::new)
        .map_err(|e| Error::ImportRejected {
            reason: "cannot pack duplicate".to_string(),
            source: Some(e),
        })
}

/// Runs every local encoding step ahead of talking to the device.
pub fn prepare(material: &RsaKeyMaterial) -> Result<ImportRequest> {
    ImportRequest::new(key_public(material)?, sensitive_area(material.prime())?)
}

/// Imports require a restricted decryption parent: only those can wrap children.
fn check_parent(parent: &StorageKey) -> Result<()> {
    let attributes = parent.public.object_attributes();
    if !(attributes.restricted() && attributes.decrypt()) {
        return Err(Error::ImportRejected {
            reason: "parent is not a restricted decryption key".to_string(),
            source: None,
        });
    }
    Ok(())
}

fn classify_import_error(e: tss_esapi::Error) -> Error {
    if is_memory_exhausted(&e) {
        return Error::device(Step::Import, None, e);
    }
    match response_kind(&e) {
        Some(
            kind @ (Tss2ResponseCodeKind::Attributes
            | Tss2ResponseCodeKind::Type
            | Tss2ResponseCodeKind::Binding
            | Tss2ResponseCodeKind::Parent
            | Tss2ResponseCodeKind::Integrity
            | Tss2ResponseCodeKind::KeySize
            | Tss2ResponseCodeKind::Key
            | Tss2ResponseCodeKind::Scheme
            | Tss2ResponseCodeKind::Symmetric
            | Tss2ResponseCodeKind::Size
            | Tss2ResponseCodeKind::Value),
        ) => Error::ImportRejected {
            reason: format!("device refused the key ({kind:?})"),
            source: Some(e),
        },
        _ => Error::device(Step::Import, None, e),
    }
}

/// Issues `TPM2_Import` under `parent` and returns the parent-wrapped private blob.
pub fn import(
    session: &mut Session,
    parent: &StorageKey,
    request: &ImportRequest,
) -> Result<ImportedKey> {
    check_parent(parent)?;

    let duplicate = Private::try_from(request.duplicate.to_vec()).map_err(|e| {
        Error::ImportRejected {
            reason: "duplicate does not fit a private buffer".to_string(),
            source: Some(e),
        }
    })?;

    let private = session
        .authorized(|ctx| {
            ctx.import(
                parent.handle.into(),
                None, // encryption_key
                request.public.clone(),
                duplicate,
                EncryptedSecret::default(), // in_sym_seed
                SymmetricDefinitionObject::Null,
            )
        })
        .map_err(classify_import_error)?;

    info!("key imported under primary {}", HexDisplay(parent.name.value()));

    Ok(ImportedKey {
        public: request.public.clone(),
        private,
        name: request.name.clone(),
    })
}
