use std::path::PathBuf;

use anyhow::Context;
use base16ct::HexDisplay;
use clap::Parser;
use tpm2_key_import::{
    config::{
        AuthStrategy, DEFAULT_PASSPHRASE, DEFAULT_PERSISTENT_INDEX, DEFAULT_TCTI,
        PersistentIndex, PrimaryTemplate, ProvisionConfig, SessionConfig, StorageAlgorithm,
    },
    keys::KeyFormat,
    provision,
};

/// Import an RSA private key into the TPM and persist it under the owner hierarchy
#[derive(Parser)]
#[clap(about = "Import an RSA private key into the TPM and persist it")]
struct Args {
    /// Private key container, PKCS#8 or PKCS#1, PEM or DER
    key: PathBuf,

    /// TCTI name, or a path to a TPM character device
    #[clap(long, env = "TCTI", default_value = DEFAULT_TCTI)]
    tcti: String,

    /// Passphrase of an encrypted PKCS#8 container
    #[clap(long, env = "KEY_PASSPHRASE", default_value = DEFAULT_PASSPHRASE)]
    passphrase: String,

    /// Container format: auto, pkcs8, pkcs1 or pkcs12
    #[clap(long, default_value = "auto")]
    format: KeyFormat,

    /// Persistent handle to store the key at
    #[clap(long, default_value_t = DEFAULT_PERSISTENT_INDEX)]
    index: PersistentIndex,

    /// Save the primary's context here, and reload it from there
    #[clap(long)]
    primary_context: Option<PathBuf>,

    /// Save the imported key's context here, and reload it from there
    #[clap(long)]
    key_context: Option<PathBuf>,

    /// Authorization session: password or hmac
    #[clap(long, default_value = "password")]
    auth: AuthStrategy,

    /// Storage key algorithm: rsa2048 or p256
    #[clap(long, default_value = "rsa2048")]
    storage: StorageAlgorithm,

    /// Owner hierarchy authorization value
    #[clap(long, env = "TPM_OWNER_AUTH", default_value = "", hide_env_values = true)]
    owner_auth: String,

    /// Override the transient object limit reported by the device
    #[clap(long)]
    transient_limit: Option<usize>,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let session = SessionConfig {
        tcti: args.tcti,
        owner_auth: args.owner_auth.into_bytes(),
        auth_strategy: args.auth,
        transient_limit: args.transient_limit,
    };

    let mut config = ProvisionConfig::new(session, args.key);
    config.passphrase = args.passphrase;
    config.key_format = args.format;
    config.persistent_index = args.index;
    config.primary_template = PrimaryTemplate {
        algorithm: args.storage,
        ..PrimaryTemplate::default()
    };
    config.primary_context = args.primary_context;
    config.key_context = args.key_context;

    let outcome = provision::provision(&config).context("failed to provision key")?;

    log::info!(
        "flushed {} stale transient objects before starting",
        outcome.flushed
    );
    println!("{} {}", outcome.index, HexDisplay(outcome.name.as_slice()));

    Ok(())
}
