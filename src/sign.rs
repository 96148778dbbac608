//! Signing with a persisted key and checking the result off-device.

use log::debug;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha2::{Digest as _, Sha256};
use tss_esapi::{
    constants::tss::{TPM2_RH_NULL, TPM2_ST_HASHCHECK},
    interface_types::algorithm::HashingAlgorithm,
    structures::{Digest, HashScheme, HashcheckTicket, Signature, SignatureScheme},
    tss2_esys::TPMT_TK_HASHCHECK,
};

use crate::{
    Error, Result, Step, config::PersistentIndex, persist::persistent_object, session::Session,
};

/// RSASSA-PKCS1-v1_5 over SHA-256 of `message`, using the key at `index`.
pub fn sign(session: &mut Session, index: PersistentIndex, message: &[u8]) -> Result<Vec<u8>> {
    let digest = Digest::try_from(Sha256::digest(message).to_vec())
        .map_err(|e| Error::device(Step::Sign, None, e))?;

    // Unrestricted key, so the ticket can be null.
    let validation: HashcheckTicket = TPMT_TK_HASHCHECK {
        tag: TPM2_ST_HASHCHECK,
        hierarchy: TPM2_RH_NULL,
        digest: Default::default(),
    }
    .try_into()
    .map_err(|e| Error::device(Step::Sign, None, e))?;

    let scheme = SignatureScheme::RsaSsa {
        hash_scheme: HashScheme::new(HashingAlgorithm::Sha256),
    };

    let mut key = persistent_object(session, index)?;
    let signature = session
        .authorized(|ctx| ctx.sign(key.into(), digest, scheme, validation))
        .map_err(|e| Error::device(Step::Sign, Some(index.value()), e));

    if let Err(e) = session.context().tr_close(&mut key) {
        debug!("failed to close ESYS handle for {index}: {e}");
    }

    match signature? {
        Signature::RsaSsa(s) => Ok(s.signature().as_slice().to_vec()),
        other => Err(Error::Config(format!(
            "key at {index} produced an unexpected signature: {other:?}"
        ))),
    }
}

/// Checks a signature produced by [`sign`] against the public half of the key.
pub fn verify(public: &RsaPublicKey, message: &[u8], signature: &[u8]) -> rsa::Result<()> {
    let hashed = Sha256::digest(message);
    public.verify(Pkcs1v15Sign::new::<Sha256>(), &hashed, signature)
}

#[cfg(test)]
mod tests {
    use rsa::RsaPrivateKey;
    use rsa::pkcs8::DecodePrivateKey;
    use sha2::Digest as _;

    use super::*;

    const KEY: &str = include_str!("../tests/data/rsa2048.pem");

    #[test]
    fn verifies_pkcs1v15_sha256() {
        let private = RsaPrivateKey::from_pkcs8_pem(KEY).unwrap();
        let message = b"hello";
        let hashed = Sha256::digest(message);
        let signature = private
            .sign(Pkcs1v15Sign::new::<Sha256>(), &hashed)
            .unwrap();

        let public = private.to_public_key();
        assert!(verify(&public, message, &signature).is_ok());
        assert!(verify(&public, b"goodbye", &signature).is_err());
    }
}
