use std::{path::PathBuf, str::FromStr};

use tss_esapi::{
    TctiNameConf,
    handles::PersistentTpmHandle,
    interface_types::algorithm::{HashingAlgorithm, SymmetricMode},
    interface_types::key_bits::AesKeyBits,
    structures::SymmetricDefinitionObject,
};

use crate::{Error, Result, keys::KeyFormat};

pub const DEFAULT_TCTI: &str = "device:/dev/tpmrm0";
pub const DEFAULT_PASSPHRASE: &str = "notasecret";
pub const DEFAULT_PERSISTENT_INDEX: PersistentIndex = PersistentIndex(0x8101_0002);

const PERSISTENT_FIRST: u32 = 0x8100_0000;
const PERSISTENT_LAST: u32 = 0x81FF_FFFF;

/// Parses a TCTI name, treating a bare filesystem path as a character device.
pub fn tcti_name_conf(tcti: &str) -> Result<TctiNameConf> {
    let tcti = if tcti.starts_with('/') {
        format!("device:{tcti}")
    } else {
        tcti.to_string()
    };
    TctiNameConf::from_str(&tcti).map_err(|e| Error::Config(format!("bad TCTI {tcti:?}: {e}")))
}

/// A slot in the persistent object range of the owner hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PersistentIndex(u32);

impl PersistentIndex {
    pub fn new(value: u32) -> Result<Self> {
        if !(PERSISTENT_FIRST..=PERSISTENT_LAST).contains(&value) {
            return Err(Error::Config(format!(
                "{value:#010x} is outside the persistent range {PERSISTENT_FIRST:#010x}..={PERSISTENT_LAST:#010x}"
            )));
        }
        Ok(Self(value))
    }

    pub fn value(self) -> u32 {
        self.0
    }

    pub(crate) fn tpm_handle(self) -> Result<PersistentTpmHandle> {
        PersistentTpmHandle::new(self.0)
            .map_err(|e| Error::Config(format!("invalid persistent handle {self}: {e}")))
    }
}

impl std::fmt::Display for PersistentIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl FromStr for PersistentIndex {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let value = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16),
            None => s.parse::<u32>(),
        }
        .map_err(|e| Error::Config(format!("bad persistent handle {s:?}: {e}")))?;
        Self::new(value)
    }
}

/// How commands needing authorization are authorized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AuthStrategy {
    /// Plaintext password session (`TPM_RS_PW`).
    #[default]
    Password,
    /// Unbound, unsalted HMAC session.
    Hmac,
}

impl FromStr for AuthStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "password" => Ok(Self::Password),
            "hmac" => Ok(Self::Hmac),
            unknown => Err(Error::Config(format!("unknown auth strategy: {unknown:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageAlgorithm {
    Rsa2048,
    EccP256,
}

impl FromStr for StorageAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rsa2048" => Ok(Self::Rsa2048),
            "p256" => Ok(Self::EccP256),
            unknown => Err(Error::Config(format!("unknown storage algorithm: {unknown:?}"))),
        }
    }
}

/// Object attribute flags of the primary storage key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimaryAttributes {
    pub fixed_tpm: bool,
    pub fixed_parent: bool,
    pub sensitive_data_origin: bool,
    pub user_with_auth: bool,
    pub restricted: bool,
    pub decrypt: bool,
    pub no_da: bool,
}

impl Default for PrimaryAttributes {
    fn default() -> Self {
        Self {
            fixed_tpm: true,
            fixed_parent: true,
            sensitive_data_origin: true,
            user_with_auth: true,
            restricted: true,
            decrypt: true,
            no_da: false,
        }
    }
}

/// Template for the owner-hierarchy storage key that parents imported keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryTemplate {
    pub algorithm: StorageAlgorithm,
    pub name_hashing_algorithm: HashingAlgorithm,
    pub symmetric: SymmetricDefinitionObject,
    pub attributes: PrimaryAttributes,
}

impl Default for PrimaryTemplate {
    fn default() -> Self {
        Self {
            algorithm: StorageAlgorithm::Rsa2048,
            name_hashing_algorithm: HashingAlgorithm::Sha256,
            symmetric: SymmetricDefinitionObject::Aes {
                key_bits: AesKeyBits::Aes128,
                mode: SymmetricMode::Cfb,
            },
            attributes: PrimaryAttributes::default(),
        }
    }
}

/// Everything needed to talk to the device.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub tcti: String,
    pub owner_auth: Vec<u8>,
    pub auth_strategy: AuthStrategy,
    /// Overrides the transient pool size reported by the device.
    pub transient_limit: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tcti: DEFAULT_TCTI.to_string(),
            owner_auth: Vec::new(),
            auth_strategy: AuthStrategy::default(),
            transient_limit: None,
        }
    }
}

/// A complete provisioning run.
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    pub session: SessionConfig,
    pub key_path: PathBuf,
    pub passphrase: String,
    pub key_format: KeyFormat,
    pub persistent_index: PersistentIndex,
    pub primary_template: PrimaryTemplate,
    /// Where to save the primary's context, if anywhere.
    pub primary_context: Option<PathBuf>,
    /// Where to save the imported key's context, if anywhere.
    pub key_context: Option<PathBuf>,
}

impl ProvisionConfig {
    pub fn new(session: SessionConfig, key_path: impl Into<PathBuf>) -> Self {
        Self {
            session,
            key_path: key_path.into(),
            passphrase: DEFAULT_PASSPHRASE.to_string(),
            key_format: KeyFormat::default(),
            persistent_index: DEFAULT_PERSISTENT_INDEX,
            primary_template: PrimaryTemplate::default(),
            primary_context: None,
            key_context: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_persistent_index() {
        let index: PersistentIndex = "0x81010002".parse().unwrap();
        assert_eq!(index, DEFAULT_PERSISTENT_INDEX);
        assert_eq!(index.to_string(), "0x81010002");

        let decimal: PersistentIndex = "2164326402".parse().unwrap();
        assert_eq!(decimal, DEFAULT_PERSISTENT_INDEX);
    }

    #[test]
    fn rejects_non_persistent_handles() {
        assert!("0x80000001".parse::<PersistentIndex>().is_err());
        assert!("0x01500000".parse::<PersistentIndex>().is_err());
        assert!("0x81zz".parse::<PersistentIndex>().is_err());
        assert!(PersistentIndex::new(0x81FF_FFFF).is_ok());
    }

    #[test]
    fn bare_paths_become_device_tcti() {
        assert!(tcti_name_conf("/dev/tpm0").is_ok());
        assert!(tcti_name_conf("mssim:host=localhost,port=2321").is_ok());
        assert!(tcti_name_conf("carrier-pigeon:").is_err());
    }

    #[test]
    fn default_template_is_restricted_decrypt() {
        let template = PrimaryTemplate::default();
        assert_eq!(template.algorithm, StorageAlgorithm::Rsa2048);
        assert!(template.attributes.restricted && template.attributes.decrypt);
        assert!(template.attributes.fixed_tpm && template.attributes.fixed_parent);
    }
}
