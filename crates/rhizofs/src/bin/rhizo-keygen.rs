#![forbid(unsafe_code)]

use clap::Parser;
use rhizo_common::keys;
use std::path::PathBuf;

/// Generates a key pair: `<name>` holds the public key, `<name>.secret`
/// the secret key (mode 0600). Both are Base58 text.
#[derive(Parser)]
#[command(name = "rhizo-keygen", about = "Generate a rhizofs key pair")]
#[command(version)]
struct Args {
    /// Path of the public key file; the secret goes next to it.
    name: PathBuf,

    /// Overwrite existing key files.
    #[arg(short, long)]
    force: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let pair = keys::generate_files(&args.name, args.force)?;
    eprintln!(
        "wrote {} and {}",
        args.name.display(),
        keys::secret_path(&args.name).display()
    );
    println!("{}", pair.public());
    Ok(())
}
