#![forbid(unsafe_code)]

use clap::Parser;
use rhizo_common::transport::TransportContext;
use rhizo_common::types::{EntryKind, FileAttributes};
use rhizofs::config::{load_config, Cli, Commands};
use rhizofs::{Client, ClientConfig, ClientError, SetTime};
use std::io::IsTerminal;
use tracing::debug;
use tracing_subscriber::EnvFilter;

// ── ANSI style helpers ──────────────────────────────────────────────

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const CYAN: &str = "\x1b[36m";

fn tty() -> bool {
    std::io::stdout().is_terminal()
}

fn init_tracing(cli: &Cli) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let directive = match cli.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        EnvFilter::new(directive)
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Loads the layered configuration and applies command-line overrides.
fn resolve_config(cli: &Cli) -> anyhow::Result<ClientConfig> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(ref endpoint) = cli.endpoint {
        config.endpoint = endpoint.clone();
    }
    if let Some(ref key) = cli.server_key {
        config.server_public_key = Some(key.clone());
        config.encrypt = true;
    }
    if let Some(ref keypair) = cli.keypair {
        config.keypair = Some(keypair.clone());
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;
    Ok(config)
}

// ── Pretty formatters ───────────────────────────────────────────────

fn kind_char(kind: EntryKind) -> char {
    match kind {
        EntryKind::Directory => 'd',
        EntryKind::Symlink => 'l',
        EntryKind::File => '-',
        EntryKind::Other => '?',
    }
}

fn mode_string(attrs: &FileAttributes) -> String {
    let perms = attrs.permissions();
    let mut s = String::with_capacity(10);
    s.push(kind_char(attrs.kind()));
    for shift in [6u32, 3, 0] {
        let bits = (perms >> shift) & 0o7;
        s.push(if bits & 4 != 0 { 'r' } else { '-' });
        s.push(if bits & 2 != 0 { 'w' } else { '-' });
        s.push(if bits & 1 != 0 { 'x' } else { '-' });
    }
    s
}

fn fmt_stat(path: &str, attrs: &FileAttributes) {
    if tty() {
        println!();
        println!("  {BOLD}{path}{RESET}");
        println!("  {DIM}Mode{RESET}       {} {DIM}({:04o}){RESET}", mode_string(attrs), attrs.permissions());
        println!("  {DIM}Size{RESET}       {}", attrs.size);
        println!("  {DIM}Owner{RESET}      {}:{}", attrs.uid, attrs.gid);
        println!("  {DIM}Links{RESET}      {}", attrs.nlink);
        println!("  {DIM}Inode{RESET}      {}", attrs.inode);
        println!("  {DIM}Accessed{RESET}   {}.{:09}", attrs.atime.secs, attrs.atime.nanos);
        println!("  {DIM}Modified{RESET}   {}.{:09}", attrs.mtime.secs, attrs.mtime.nanos);
        println!("  {DIM}Changed{RESET}    {}.{:09}", attrs.ctime.secs, attrs.ctime.nanos);
        println!();
    } else {
        println!(
            "{} {:o} {} {} {} {}.{:09} {}",
            kind_char(attrs.kind()),
            attrs.permissions(),
            attrs.size,
            attrs.uid,
            attrs.gid,
            attrs.mtime.secs,
            attrs.mtime.nanos,
            path
        );
    }
}

fn ok(what: &str) {
    if tty() {
        println!("  {GREEN}✓{RESET} {what}");
    }
}

fn report(err: &ClientError) {
    if tty() {
        eprintln!();
        if err.is_authorization_denied() {
            eprintln!("  {RED}✗{RESET} Not authorized by the server");
            eprintln!("    {DIM}Is this client's key in the server's authorized keys?{RESET}");
        } else {
            eprintln!("  {RED}✗{RESET} {err}");
        }
        eprintln!();
    } else {
        eprintln!("error: {err}");
    }
}

// ── Commands ────────────────────────────────────────────────────────

async fn run(client: &mut Client, command: &Commands) -> Result<(), ClientError> {
    match command {
        Commands::Ping => {
            client.ping().await?;
            if tty() {
                let mode = if client.is_encrypted() { "encrypted" } else { "plaintext" };
                println!("  {GREEN}●{RESET} server answered {DIM}({mode}){RESET}");
            } else {
                println!("pong");
            }
        }
        Commands::Stat { path } => {
            let attrs = client.stat(path).await?;
            fmt_stat(path, &attrs);
        }
        Commands::Ls { path } => {
            for entry in client.read_dir(path).await? {
                if tty() && entry.kind == EntryKind::Directory {
                    println!("{CYAN}{}/{RESET}", entry.name);
                } else {
                    println!("{}", entry.name);
                }
            }
        }
        Commands::Mkdir { path, mode } => {
            client.mkdir(path, *mode).await?;
            ok(&format!("created {path}"));
        }
        Commands::Rmdir { path } => {
            client.rmdir(path).await?;
            ok(&format!("removed {path}"));
        }
        Commands::Rm { path } => {
            client.unlink(path).await?;
            ok(&format!("removed {path}"));
        }
        Commands::Mv { from, to } => {
            client.rename(from, to).await?;
            ok(&format!("{from} → {to}"));
        }
        Commands::Ln { symbolic, target, link } => {
            if *symbolic {
                client.symlink(target, link).await?;
            } else {
                client.link(target, link).await?;
            }
            ok(&format!("{link} → {target}"));
        }
        Commands::Readlink { path } => {
            println!("{}", client.read_link(path).await?);
        }
        Commands::Truncate { path, size } => {
            client.truncate(path, *size).await?;
            ok(&format!("{path} is {size} bytes"));
        }
        Commands::Chmod { mode, path } => {
            let attrs = client.chmod(path, *mode).await?;
            ok(&format!("{path} {}", mode_string(&attrs)));
        }
        Commands::Touch { path } => {
            match client.create(path, 0o644).await {
                Ok(_) => {}
                Err(e) if e.errno() == Some(rhizo_common::Errno::Exist) => {
                    client.utimens(path, SetTime::Now, SetTime::Now).await?;
                }
                Err(e) => return Err(e),
            }
            ok(&format!("touched {path}"));
        }
        Commands::Statfs => {
            let stats = client.statfs().await?;
            let used = stats.blocks.saturating_sub(stats.blocks_free);
            if tty() {
                println!();
                println!("  {DIM}Block size{RESET}   {}", stats.block_size);
                println!("  {DIM}Blocks{RESET}       {} total, {used} used, {} available", stats.blocks, stats.blocks_available);
                println!("  {DIM}Inodes{RESET}       {} total, {} free", stats.files, stats.files_free);
                println!("  {DIM}Name max{RESET}     {}", stats.name_max);
                println!();
            } else {
                println!(
                    "{} {} {} {} {} {}",
                    stats.block_size, stats.blocks, stats.blocks_free, stats.blocks_available, stats.files, stats.files_free
                );
            }
        }
        Commands::Get { remote, local } => {
            let bytes = match local {
                Some(path) => {
                    let mut file = tokio::fs::File::create(path).await?;
                    client.download(remote, &mut file).await?
                }
                None => {
                    let mut stdout = tokio::io::stdout();
                    client.download(remote, &mut stdout).await?
                }
            };
            debug!(remote, bytes, "downloaded");
        }
        Commands::Put { local, remote, mode } => {
            let attrs = if local.as_os_str() == "-" {
                let mut stdin = tokio::io::stdin();
                client.upload(remote, &mut stdin, *mode).await?
            } else {
                let mut file = tokio::fs::File::open(local).await?;
                client.upload(remote, &mut file, *mode).await?
            };
            ok(&format!("uploaded {} bytes to {remote}", attrs.size));
        }
    }
    Ok(())
}

// ── Main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = resolve_config(&cli)?;
    let ctx = TransportContext::new().with_connect_timeout(config.connect_timeout());

    let mut client = match Client::connect(&ctx, &config).await {
        Ok(client) => client,
        Err(e) => {
            report(&e);
            std::process::exit(2);
        }
    };

    let result = run(&mut client, &cli.command).await;
    client.close().await;
    ctx.close();

    if let Err(e) = result {
        report(&e);
        std::process::exit(1);
    }
    Ok(())
}
