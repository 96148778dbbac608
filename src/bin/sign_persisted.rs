use std::path::PathBuf;

use anyhow::Context;
use base16ct::HexDisplay;
use clap::Parser;
use tpm2_key_import::{
    config::{
        AuthStrategy, DEFAULT_PASSPHRASE, DEFAULT_PERSISTENT_INDEX, DEFAULT_TCTI,
        PersistentIndex, SessionConfig,
    },
    keys::{self, KeyFormat},
    provision,
    session::Session,
    sign,
};

/// Sign with a persisted key and verify the signature against the original key
#[derive(Parser)]
#[clap(about = "Sign a message with a persisted key and verify it off-device")]
struct Args {
    /// Original private key container, used for its public half only
    key: PathBuf,

    /// Message to sign
    #[clap(long, default_value = "hello from the TPM")]
    message: String,

    /// TCTI name, or a path to a TPM character device
    #[clap(long, env = "TCTI", default_value = DEFAULT_TCTI)]
    tcti: String,

    #[clap(long, env = "KEY_PASSPHRASE", default_value = DEFAULT_PASSPHRASE)]
    passphrase: String,

    #[clap(long, default_value = "auto")]
    format: KeyFormat,

    /// Persistent handle holding the key
    #[clap(long, default_value_t = DEFAULT_PERSISTENT_INDEX)]
    index: PersistentIndex,

    /// Re-persist the key from this saved context before signing
    #[clap(long)]
    key_context: Option<PathBuf>,

    /// Saved primary context to validate alongside the key context
    #[clap(long, requires = "key_context")]
    primary_context: Option<PathBuf>,

    /// Authorization session: password or hmac
    #[clap(long, default_value = "password")]
    auth: AuthStrategy,

    #[clap(long, env = "TPM_OWNER_AUTH", default_value = "", hide_env_values = true)]
    owner_auth: String,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let material = keys::decode_file(&args.key, &args.passphrase, args.format)
        .context("failed to decode key")?;
    let public = material
        .public_key()
        .context("failed to build public key")?;
    drop(material);

    let config = SessionConfig {
        tcti: args.tcti,
        owner_auth: args.owner_auth.into_bytes(),
        auth_strategy: args.auth,
        transient_limit: None,
    };

    if let Some(key_context) = &args.key_context {
        provision::resume(
            &config,
            args.primary_context.as_deref(),
            key_context,
            args.index,
        )
        .context("failed to resume from saved contexts")?;
    }

    let mut session = Session::open(&config).context("failed to open session")?;
    let signature = sign::sign(&mut session, args.index, args.message.as_bytes())
        .context("failed to sign")?;
    session.close().context("failed to close session")?;

    sign::verify(&public, args.message.as_bytes(), &signature)
        .context("signature does not verify against the original key")?;

    log::info!("signature verified against the original public key");
    println!("{}", HexDisplay(&signature));

    Ok(())
}
