use anyhow::Context;
use clap::Parser;
use tpm2_key_import::{
    config::{DEFAULT_TCTI, SessionConfig},
    session::{HandleKind, Session},
};

/// Flush handles left behind by a crashed run
#[derive(Parser)]
#[clap(about = "Flush transient objects and sessions left loaded in the TPM")]
struct Args {
    /// Which handles to flush: transient, loaded, saved or all
    #[clap(default_value = "transient")]
    kind: String,

    /// TCTI name, or a path to a TPM character device
    #[clap(long, env = "TCTI", default_value = DEFAULT_TCTI)]
    tcti: String,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let kinds = HandleKind::parse_set(&args.kind).context("failed to parse handle kind")?;

    let config = SessionConfig {
        tcti: args.tcti,
        ..SessionConfig::default()
    };
    let mut session = Session::open(&config).context("failed to open session")?;

    let mut total = 0;
    for kind in kinds {
        total += session
            .flush_transient(kind)
            .with_context(|| format!("failed to flush {kind:?} handles"))?;
    }
    session.close().context("failed to close session")?;

    println!("{total}");
    Ok(())
}
