//! Decoding of externally generated RSA private keys into the raw
//! components the TPM import needs.

use std::path::Path;

use log::debug;
use p12_keystore::KeyStore;
use pkcs8::{EncryptedPrivateKeyInfo, PrivateKeyInfo, SecretDocument};
use rsa::{
    BigUint, RsaPrivateKey, RsaPublicKey,
    pkcs1::DecodeRsaPrivateKey,
    traits::{PrivateKeyParts, PublicKeyParts},
};
use zeroize::Zeroizing;

/// Key sizes the TPM RSA parameters can express.
pub const SUPPORTED_KEY_BITS: [u16; 4] = [1024, 2048, 3072, 4096];

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("key container is neither valid PEM nor DER")]
    Pem(#[source] pkcs8::der::Error),
    #[error("unexpected PEM label {0:?}")]
    UnexpectedLabel(String),
    #[error("malformed PKCS#8 private key")]
    Pkcs8(#[source] pkcs8::Error),
    #[error("malformed PKCS#1 private key")]
    Pkcs1(#[source] rsa::pkcs1::Error),
    #[error("failed to decrypt private key, wrong passphrase?")]
    Passphrase(#[source] pkcs8::Error),
    #[error("failed to open PKCS#12 keystore, wrong passphrase?")]
    Pkcs12(#[source] p12_keystore::error::Error),
    #[error("PKCS#12 keystore holds no private key")]
    Pkcs12NoKey,
    #[error("unsupported key algorithm {0}, only RSA can be imported")]
    UnsupportedAlgorithm(String),
    #[error("unsupported RSA modulus size of {0} bits")]
    UnsupportedKeySize(usize),
    #[error("public exponent does not fit into 32 bits")]
    ExponentTooLarge,
    #[error("private key carries no prime factors")]
    MissingPrime,
}

/// Container layout of the supplied private key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeyFormat {
    /// Detected from the PEM label or the DER structure.
    #[default]
    Auto,
    /// `PrivateKeyInfo`, optionally wrapped in `EncryptedPrivateKeyInfo`.
    Pkcs8,
    /// Bare `RSAPrivateKey`.
    Pkcs1,
    /// PFX keystore (DER only); the first private key entry is used.
    Pkcs12,
}

impl std::str::FromStr for KeyFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "pkcs8" => Ok(Self::Pkcs8),
            "pkcs1" => Ok(Self::Pkcs1),
            "pkcs12" => Ok(Self::Pkcs12),
            unknown => Err(format!("unknown key format: {unknown:?}")),
        }
    }
}

/// The numeric triple the import engine consumes.
pub struct RsaKeyMaterial {
    modulus: Vec<u8>,
    exponent: u32,
    prime: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for RsaKeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsaKeyMaterial")
            .field("bits", &self.bits())
            .field("exponent", &self.exponent)
            .finish_non_exhaustive()
    }
}

impl RsaKeyMaterial {
    /// Big-endian modulus `N`.
    pub fn modulus(&self) -> &[u8] {
        &self.modulus
    }

    /// Public exponent `E`.
    pub fn exponent(&self) -> u32 {
        self.exponent
    }

    /// Big-endian first prime factor `P`.
    pub fn prime(&self) -> &[u8] {
        &self.prime
    }

    pub fn bits(&self) -> u16 {
        (self.modulus.len() * 8) as u16
    }

    pub fn public_key(&self) -> Result<RsaPublicKey, rsa::Error> {
        RsaPublicKey::new(
            BigUint::from_bytes_be(&self.modulus),
            BigUint::from(self.exponent),
        )
    }

    fn from_private_key(key: &RsaPrivateKey) -> Result<Self, DecodeError> {
        let modulus = key.n().to_bytes_be();
        let bits = modulus.len() * 8;
        if !SUPPORTED_KEY_BITS.iter().any(|b| usize::from(*b) == bits) {
            return Err(DecodeError::UnsupportedKeySize(bits));
        }

        let e = key.e().to_bytes_be();
        if e.len() > 4 {
            return Err(DecodeError::ExponentTooLarge);
        }
        let exponent = e.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b));

        let prime = key
            .primes()
            .first()
            .ok_or(DecodeError::MissingPrime)?
            .to_bytes_be();

        Ok(Self {
            modulus,
            exponent,
            prime: Zeroizing::new(prime),
        })
    }
}

/// Decodes a private key container into its `(N, E, P)` components.
pub fn decode(
    container: &[u8],
    passphrase: &str,
    format: KeyFormat,
) -> Result<RsaKeyMaterial, DecodeError> {
    let key = match std::str::from_utf8(container) {
        Ok(text) if text.trim_start().starts_with("-----BEGIN") => {
            decode_pem(text, passphrase, format)?
        }
        _ => decode_der(container, passphrase, format)?,
    };

    let material = RsaKeyMaterial::from_private_key(&key)?;
    debug!(
        "decoded RSA-{} key, exponent {}",
        material.bits(),
        material.exponent
    );
    Ok(material)
}

/// Reads a container from disk and decodes it.
pub fn decode_file(
    path: &Path,
    passphrase: &str,
    format: KeyFormat,
) -> crate::Result<RsaKeyMaterial> {
    let container = std::fs::read(path).map_err(|e| crate::Error::io(path, e))?;
    Ok(decode(&container, passphrase, format)?)
}

fn decode_pem(
    text: &str,
    passphrase: &str,
    format: KeyFormat,
) -> Result<RsaPrivateKey, DecodeError> {
    let (label, document) = SecretDocument::from_pem(text).map_err(DecodeError::Pem)?;

    match (label, format) {
        ("ENCRYPTED PRIVATE KEY", KeyFormat::Auto | KeyFormat::Pkcs8) => {
            decode_encrypted_pkcs8(document.as_bytes(), passphrase)
        }
        ("PRIVATE KEY", KeyFormat::Auto | KeyFormat::Pkcs8) => decode_pkcs8(document.as_bytes()),
        ("RSA PRIVATE KEY", KeyFormat::Auto | KeyFormat::Pkcs1) => {
            RsaPrivateKey::from_pkcs1_der(document.as_bytes()).map_err(DecodeError::Pkcs1)
        }
        (label, _) => Err(DecodeError::UnexpectedLabel(label.to_string())),
    }
}

fn decode_der(
    der: &[u8],
    passphrase: &str,
    format: KeyFormat,
) -> Result<RsaPrivateKey, DecodeError> {
    match format {
        KeyFormat::Pkcs1 => RsaPrivateKey::from_pkcs1_der(der).map_err(DecodeError::Pkcs1),
        KeyFormat::Pkcs12 => decode_pkcs12(der, passphrase),
        KeyFormat::Pkcs8 | KeyFormat::Auto => {
            if EncryptedPrivateKeyInfo::try_from(der).is_ok() {
                return decode_encrypted_pkcs8(der, passphrase);
            }
            match PrivateKeyInfo::try_from(der) {
                Ok(_) => decode_pkcs8(der),
                Err(_) if format == KeyFormat::Auto && looks_like_pfx(der) => {
                    decode_pkcs12(der, passphrase)
                }
                Err(_) if format == KeyFormat::Auto => {
                    RsaPrivateKey::from_pkcs1_der(der).map_err(DecodeError::Pkcs1)
                }
                Err(e) => Err(DecodeError::Pkcs8(e.into())),
            }
        }
    }
}

/// A PFX is a SEQUENCE whose first element is `INTEGER 3`.
fn looks_like_pfx(der: &[u8]) -> bool {
    let Some((&0x30, rest)) = der.split_first() else {
        return false;
    };
    let body = match rest.split_first() {
        Some((&len, body)) if len < 0x80 => body,
        // indefinite length (BER)
        Some((&0x80, body)) => body,
        Some((&len, body)) if (0x81..=0x84).contains(&len) => {
            body.get(usize::from(len - 0x80)..).unwrap_or_default()
        }
        _ => return false,
    };
    body.starts_with(&[0x02, 0x01, 0x03])
}

fn decode_pkcs12(der: &[u8], passphrase: &str) -> Result<RsaPrivateKey, DecodeError> {
    let keystore = KeyStore::from_pkcs12(der, passphrase).map_err(DecodeError::Pkcs12)?;
    let (alias, chain) = keystore
        .private_key_chain()
        .ok_or(DecodeError::Pkcs12NoKey)?;

    debug!("using PKCS#12 entry {alias:?}");
    if let Some(certificate) = chain.chain().first() {
        debug!("certificate subject: {}", certificate.subject());
    }

    decode_pkcs8(chain.key())
}

fn decode_encrypted_pkcs8(der: &[u8], passphrase: &str) -> Result<RsaPrivateKey, DecodeError> {
    let info = EncryptedPrivateKeyInfo::try_from(der)
        .map_err(|e| DecodeError::Pkcs8(e.into()))?;
    let document = info.decrypt(passphrase).map_err(DecodeError::Passphrase)?;
    decode_pkcs8(document.as_bytes())
}

fn decode_pkcs8(der: &[u8]) -> Result<RsaPrivateKey, DecodeError> {
    let info = PrivateKeyInfo::try_from(der).map_err(|e| DecodeError::Pkcs8(e.into()))?;

    if info.algorithm.oid != rsa::pkcs1::ALGORITHM_OID {
        return Err(DecodeError::UnsupportedAlgorithm(info.algorithm.oid.to_string()));
    }

    RsaPrivateKey::try_from(info).map_err(DecodeError::Pkcs8)
}
