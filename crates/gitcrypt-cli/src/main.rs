//! git-crypt: transparent file encryption for git
//!
//! Filter commands (invoked by git, data on stdin/stdout):
//!   clean               - encrypt plaintext for the index
//!   smudge              - decrypt for the working tree
//!   diff <file>         - decrypt a blob for textconv
//!
//! Key commands:
//!   keygen <path>                 - create a new key file
//!   export-key <path>             - copy the local key file
//!   migrate-key <old> <new>       - convert a legacy key file
//!   unlock [<key file>...]        - install key files, or unwrap with the local age identity
//!   add-collaborator <age1...>... - share the key with collaborators
//!   ls-collaborators              - list wrapped keys in the repository
//!
//! Logs go to stderr; stdout carries file data.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use gitcrypt_core::config::expand_tilde;
use gitcrypt_core::GitCryptConfig;
use gitcrypt_crypto::{
    decrypt_with, encrypt_with, validate_key_name, CodecOptions, DecryptStatus, KeyFile,
    KeyFormat, ENVELOPE_KEY_VERSION,
};
use gitcrypt_keys::{find_age_identity, AgeWrapper, RepoKeyStore};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "git-crypt",
    version,
    about = "Transparent file encryption in git",
    long_about = "git-crypt: deterministic AES-256-CTR encryption of repository files, \
                  with keys shared to collaborators through age"
)]
struct Cli {
    /// Path to git-crypt.toml configuration file
    #[arg(long, short = 'c', env = "GITCRYPT_CONFIG", default_value = ".git/git-crypt.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, env = "GITCRYPT_LOG")]
    log: Option<String>,

    /// Log format; overrides the config file
    #[arg(long, env = "GITCRYPT_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum, PartialEq)]
enum LogFormat {
    Json,
    Text,
}

/// Which local key file a command operates on
#[derive(Args, Debug, Default)]
struct KeyArgs {
    /// Key name (default key when omitted)
    #[arg(long, short = 'k')]
    key_name: Option<String>,

    /// Explicit key file, bypassing the repository state directory
    #[arg(long)]
    key_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a new key file
    Keygen {
        /// Destination (must not exist)
        path: PathBuf,
        #[arg(long, short = 'k')]
        key_name: Option<String>,
    },

    /// Encrypt stdin to stdout (git clean filter)
    Clean {
        #[command(flatten)]
        key: KeyArgs,
    },

    /// Decrypt stdin to stdout (git smudge filter)
    Smudge {
        #[command(flatten)]
        key: KeyArgs,
    },

    /// Decrypt a file to stdout (git textconv)
    Diff {
        file: PathBuf,
        #[command(flatten)]
        key: KeyArgs,
    },

    /// Write the local key file to <path> ("-" for stdout)
    #[command(name = "export-key")]
    ExportKey {
        path: PathBuf,
        #[command(flatten)]
        key: KeyArgs,
    },

    /// Convert a legacy (pre key-file format 2) key to the current format
    #[command(name = "migrate-key")]
    MigrateKey { old: PathBuf, new: PathBuf },

    /// Install key files, or unwrap every key available to the local age identity
    Unlock {
        /// Key files to install
        key_files: Vec<PathBuf>,
    },

    /// Wrap the key for one or more age recipients
    #[command(name = "add-collaborator")]
    AddCollaborator {
        /// age recipients (age1...)
        #[arg(required = true)]
        recipients: Vec<String>,
        /// Skip recipient verification
        #[arg(long)]
        trusted: bool,
        #[arg(long, short = 'k')]
        key_name: Option<String>,
    },

    /// List collaborators with a wrapped copy of a key
    #[command(name = "ls-collaborators")]
    LsCollaborators,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = GitCryptConfig::load(&cli.config)
        .with_context(|| format!("loading config: {}", cli.config.display()))?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| parse_log_format(&config.log.format));
    init_logging(&level, &format);

    tracing::debug!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "git-crypt starting"
    );

    match cli.command {
        Commands::Keygen { path, key_name } => cmd_keygen(&path, key_name.as_deref()),
        Commands::Clean { key } => cmd_clean(&config, &key),
        Commands::Smudge { key } => cmd_smudge(&config, &key),
        Commands::Diff { file, key } => cmd_diff(&config, &file, &key),
        Commands::ExportKey { path, key } => cmd_export_key(&config, &path, &key),
        Commands::MigrateKey { old, new } => cmd_migrate_key(&old, &new),
        Commands::Unlock { key_files } => cmd_unlock(&config, &key_files),
        Commands::AddCollaborator {
            recipients,
            trusted,
            key_name,
        } => cmd_add_collaborator(&config, &recipients, trusted, key_name.as_deref()),
        Commands::LsCollaborators => cmd_ls_collaborators(&config),
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(io::stderr))
                .init();
        }
    }
}

fn parse_log_format(value: &str) -> LogFormat {
    match value {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    }
}

// ── Key file resolution ───────────────────────────────────────────────────────

/// `--key-file`, else `<state_dir>/keys/<key name or default>`.
fn key_file_path(config: &GitCryptConfig, key: &KeyArgs) -> Result<PathBuf> {
    if let Some(path) = &key.key_file {
        return Ok(expand_tilde(path));
    }
    internal_key_path(config, key.key_name.as_deref())
}

fn internal_key_path(config: &GitCryptConfig, key_name: Option<&str>) -> Result<PathBuf> {
    if let Some(name) = key_name {
        validate_key_name(name)?;
    }
    Ok(config.internal_keys_dir().join(key_name.unwrap_or("default")))
}

fn load_key_file(config: &GitCryptConfig, key: &KeyArgs) -> Result<KeyFile> {
    let path = key_file_path(config, key)?;
    if !path.exists() {
        anyhow::bail!(
            "no key file at {}; is the repository unlocked? Try: git-crypt unlock",
            path.display()
        );
    }
    KeyFile::load_from_file(&path).with_context(|| format!("loading key file: {}", path.display()))
}

// ── Filter commands ───────────────────────────────────────────────────────────

fn cmd_clean(config: &GitCryptConfig, key: &KeyArgs) -> Result<ExitCode> {
    let key_file = load_key_file(config, key)?;
    let entry = key_file.require_latest()?;
    let stdout = io::stdout();
    let bytes = encrypt_with(
        entry,
        io::stdin().lock(),
        BufWriter::new(stdout.lock()),
        &CodecOptions::from(&config.crypto),
    )
    .context("encrypting stdin")?;
    tracing::debug!(bytes, "clean finished");
    Ok(ExitCode::SUCCESS)
}

fn cmd_smudge(config: &GitCryptConfig, key: &KeyArgs) -> Result<ExitCode> {
    let key_file = load_key_file(config, key)?;
    let stdout = io::stdout();
    let status = decrypt_with(
        &key_file,
        io::stdin().lock(),
        BufWriter::new(stdout.lock()),
        &CodecOptions::from(&config.crypto),
    )
    .context("decrypting stdin")?;

    Ok(filter_outcome(&status, "stdin", true).into())
}

fn cmd_diff(config: &GitCryptConfig, file: &Path, key: &KeyArgs) -> Result<ExitCode> {
    let input = std::fs::File::open(file)
        .with_context(|| format!("opening {}", file.display()))?;
    let key_file = load_key_file(config, key)?;
    let stdout = io::stdout();
    let status = decrypt_with(
        &key_file,
        BufReader::new(input),
        BufWriter::new(stdout.lock()),
        &CodecOptions::from(&config.crypto),
    )
    .with_context(|| format!("decrypting {}", file.display()))?;

    let source = file.display().to_string();
    Ok(filter_outcome(&status, &source, false).into())
}

/// Result of a smudge or diff run, as seen by git
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FilterOutcome {
    Clean,
    Tampered,
}

impl From<FilterOutcome> for ExitCode {
    fn from(outcome: FilterOutcome) -> Self {
        match outcome {
            FilterOutcome::Clean => ExitCode::SUCCESS,
            FilterOutcome::Tampered => ExitCode::FAILURE,
        }
    }
}

/// Map a decrypt status to the filter outcome, logging anything unusual.
///
/// Plaintext input has already been passed through by the codec; smudge warns
/// about it, diff stays quiet since textconv sees unencrypted blobs routinely.
fn filter_outcome(status: &DecryptStatus, source: &str, warn_plaintext: bool) -> FilterOutcome {
    match status {
        DecryptStatus::Authentic { .. } => FilterOutcome::Clean,
        DecryptStatus::NotEncrypted { bytes } => {
            if warn_plaintext {
                // Plaintext committed before the file was marked for encryption.
                tracing::warn!(source, bytes, "file not encrypted; passed through unchanged");
            }
            FilterOutcome::Clean
        }
        DecryptStatus::Tampered { .. } => {
            tracing::error!(source, "encrypted file has been tampered with");
            FilterOutcome::Tampered
        }
    }
}

// ── Key commands ──────────────────────────────────────────────────────────────

fn cmd_keygen(path: &Path, key_name: Option<&str>) -> Result<ExitCode> {
    if path.exists() {
        anyhow::bail!("{}: file already exists", path.display());
    }
    let mut key_file = KeyFile::with_key_name(key_name)?;
    key_file.generate()?;
    key_file.store_to_file(path)?;
    println!("Generated key file {}", path.display());
    Ok(ExitCode::SUCCESS)
}

fn cmd_export_key(config: &GitCryptConfig, path: &Path, key: &KeyArgs) -> Result<ExitCode> {
    let key_file = load_key_file(config, key)?;
    if path == Path::new("-") {
        let mut stdout = io::stdout().lock();
        key_file.store(&mut stdout)?;
        stdout.flush()?;
    } else {
        key_file.store_to_file(path)?;
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_migrate_key(old: &Path, new: &Path) -> Result<ExitCode> {
    let data = std::fs::read(old).with_context(|| format!("reading {}", old.display()))?;
    let data = zeroize::Zeroizing::new(data);
    if KeyFormat::detect(&data) == KeyFormat::Tagged {
        anyhow::bail!("{} is already in the current key file format", old.display());
    }
    let key_file = KeyFile::load_legacy(data.as_slice())
        .with_context(|| format!("parsing legacy key: {}", old.display()))?;
    key_file.store_to_file(new)?;
    println!("Migrated {} -> {}", old.display(), new.display());
    Ok(ExitCode::SUCCESS)
}

fn cmd_unlock(config: &GitCryptConfig, key_files: &[PathBuf]) -> Result<ExitCode> {
    let unlocked = if key_files.is_empty() {
        let identity = find_age_identity(&config.identity)?;
        let store = RepoKeyStore::new(
            expand_tilde(&config.repo.keys_dir),
            AgeWrapper::from_provider(&identity)?,
        );
        let unwrapped = store.unwrap_all(ENVELOPE_KEY_VERSION)?;
        if unwrapped.is_empty() {
            anyhow::bail!(
                "no key in {} is wrapped for {}",
                config.repo.keys_dir.display(),
                identity.source
            );
        }
        unwrapped
    } else {
        key_files
            .iter()
            .map(|path| {
                KeyFile::load_from_file(&expand_tilde(path))
                    .with_context(|| format!("loading key file: {}", path.display()))
            })
            .collect::<Result<Vec<_>>>()?
    };

    for key_file in &unlocked {
        let path = internal_key_path(config, key_file.key_name())?;
        key_file.store_to_file(&path)?;
        println!(
            "Unlocked key {}",
            key_file.key_name().unwrap_or("default")
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_add_collaborator(
    config: &GitCryptConfig,
    recipients: &[String],
    trusted: bool,
    key_name: Option<&str>,
) -> Result<ExitCode> {
    let key = KeyArgs {
        key_name: key_name.map(str::to_owned),
        key_file: None,
    };
    let key_file = load_key_file(config, &key)?;
    let store = RepoKeyStore::new(
        expand_tilde(&config.repo.keys_dir),
        AgeWrapper::recipients_only(),
    );

    let recipients: Vec<&str> = recipients.iter().map(String::as_str).collect();
    let trusted = trusted || config.identity.trust_recipients;
    let written = store.add_collaborators(&key_file, &recipients, trusted)?;
    if written.is_empty() {
        println!("All recipients already have this key");
    }
    for path in written {
        println!("Added {}", path.display());
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_ls_collaborators(config: &GitCryptConfig) -> Result<ExitCode> {
    let store = RepoKeyStore::new(
        expand_tilde(&config.repo.keys_dir),
        AgeWrapper::recipients_only(),
    );
    let blobs = store.list()?;
    if blobs.is_empty() {
        println!("No collaborators");
    }
    for blob in blobs {
        println!(
            "{:<20} {:>4}  {}",
            blob.key_name.as_deref().unwrap_or("default"),
            blob.version,
            blob.fingerprint
        );
    }
    Ok(ExitCode::SUCCESS)
}
