//! Command-line front end for anonymous incident reporting.
//!
//! Reports are committed to a JSON-file ledger (`file://` endpoints) through
//! the library's submission manager and read back with signed grants.

use clap::{Args, Parser, Subcommand};
use incident_ledger::{
    encode_public_key_base64, load_signing_key, CancelOutcome, DecryptionAuthorization,
    Ed25519KeySource, FileLedger, GrantIssuer, GrantPolicy, IdempotencyToken, IncidentReporter,
    ReportError, ReportId, ReportKey, ReporterConfig, StaticKeyProvider, TokenStatus,
};
use rand::rngs::OsRng;
use rand::RngCore;
use rpassword::prompt_password;
use std::{
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing_subscriber::{fmt, EnvFilter};
use zeroize::Zeroizing;

fn fatal(message: &str) -> ! {
    eprintln!("{message}");
    std::process::exit(1);
}

#[derive(Parser)]
#[command(name = "incident")]
#[command(about = "Submit and retrieve encrypted incident reports")]
#[command(version)]
struct Cli {
    /// Reporter configuration file (JSON)
    #[arg(long, global = true, env = "IR_CONFIG")]
    config: Option<PathBuf>,

    /// Report key file (hex)
    #[arg(long, global = true, env = "IR_KEY_FILE", default_value = "report.key")]
    key_file: PathBuf,

    /// Block period of the file ledger, in milliseconds
    #[arg(long, global = true, env = "IR_BLOCK_MS", default_value_t = 1_000)]
    block_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Destination path
        #[arg(long, default_value = "incident.json")]
        out: PathBuf,
    },
    /// Generate a report encryption key
    Keygen {
        /// Overwrite an existing key file
        #[arg(long)]
        force: bool,
    },
    /// Issue a signed decryption grant for one report
    Grant(GrantArgs),
    /// Add a grant public key to an allowlist
    Allow {
        /// Allowlist file
        #[arg(long, default_value = "allowlist.json")]
        allowlist: PathBuf,
        /// Base64 ed25519 public key
        public_key: String,
    },
    /// Encrypt and commit a report
    Submit(SubmitArgs),
    /// Decrypt a committed report
    Retrieve {
        /// Report identifier
        report_id: ReportId,
        /// Grant JSON produced by `incident grant`
        #[arg(long)]
        grant: PathBuf,
        /// Allowlist of grant keys
        #[arg(long, default_value = "allowlist.json")]
        allowlist: PathBuf,
    },
    /// Re-query a submission by idempotency token
    Status {
        /// Token printed by `incident submit`
        token: String,
    },
}

#[derive(Args)]
struct GrantArgs {
    /// Report the grant covers
    report_id: ReportId,
    /// Signing key: ed25519://seed or a key file; prompts for a seed if omitted
    #[arg(long)]
    key: Option<String>,
    /// Seconds until the grant expires (0 = never)
    #[arg(long, default_value_t = 0)]
    expires_in: u64,
    /// Write the grant here instead of stdout
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args)]
struct SubmitArgs {
    /// Report text; read from --file or stdin if omitted
    #[arg(long, conflicts_with = "file")]
    message: Option<String>,
    /// File holding the report text
    #[arg(long)]
    file: Option<PathBuf>,
    /// Give up waiting after this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
}

fn load_config(path: Option<&Path>) -> ReporterConfig {
    let loaded = match path {
        Some(path) => ReporterConfig::load(path).and_then(|config| config.apply_env()),
        None => ReporterConfig::from_env(),
    };
    loaded.unwrap_or_else(|err| fatal(&format!("failed to load config: {err}")))
}

fn open_ledger(config: &ReporterConfig, block_ms: u64) -> Arc<FileLedger> {
    let Some(path) = config.ledger_endpoint.strip_prefix("file://") else {
        fatal(&format!(
            "unsupported ledger endpoint {}; only file:// is available",
            config.ledger_endpoint
        ));
    };
    let ledger = FileLedger::open(path, Duration::from_millis(block_ms))
        .unwrap_or_else(|err| fatal(&format!("failed to open ledger: {err}")));
    Arc::new(ledger)
}

fn load_keys(path: &Path) -> StaticKeyProvider {
    StaticKeyProvider::from_hex_file(path)
        .unwrap_or_else(|err| fatal(&format!("failed to load report key {}: {err}", path.display())))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn read_message(args: &SubmitArgs) -> String {
    if let Some(message) = &args.message {
        return message.clone();
    }
    if let Some(path) = &args.file {
        return fs::read_to_string(path)
            .unwrap_or_else(|err| fatal(&format!("failed to read {}: {err}", path.display())));
    }
    let mut buf = String::new();
    io::stdin()
        .read_to_string(&mut buf)
        .unwrap_or_else(|err| fatal(&format!("failed to read stdin: {err}")));
    buf
}

fn cmd_init(out: &Path) {
    if out.exists() {
        fatal(&format!("{} already exists", out.display()));
    }
    ReporterConfig::default()
        .save(out)
        .unwrap_or_else(|err| fatal(&format!("failed to write config: {err}")));
    println!("wrote {}", out.display());
}

fn cmd_keygen(path: &Path, force: bool) {
    if path.exists() && !force {
        fatal(&format!(
            "{} already exists; pass --force to replace it",
            path.display()
        ));
    }
    let mut bytes = Zeroizing::new([0u8; 32]);
    OsRng.fill_bytes(&mut bytes[..]);
    let key = ReportKey::from_bytes(*bytes);
    fs::write(path, key.to_hex().as_bytes())
        .unwrap_or_else(|err| fatal(&format!("failed to write {}: {err}", path.display())));
    println!("key_id: {:08x}", key.id());
    println!("wrote {}", path.display());
}

fn cmd_grant(args: &GrantArgs) {
    let spec = match &args.key {
        Some(spec) => spec.clone(),
        None => {
            let seed = Zeroizing::new(
                prompt_password("Grant seed: ")
                    .unwrap_or_else(|err| fatal(&format!("failed to read seed: {err}"))),
            );
            if seed.trim().is_empty() {
                fatal("grant seed must not be empty");
            }
            format!("ed25519://{}", seed.trim())
        }
    };
    let signing = load_signing_key(&Ed25519KeySource::from_spec(Some(&spec)))
        .unwrap_or_else(|err| fatal(&format!("failed to load grant key: {err}")));
    let issuer = GrantIssuer::new(signing);
    let expires_at = if args.expires_in == 0 {
        0
    } else {
        unix_now().saturating_add(args.expires_in)
    };
    let grant = issuer.issue(&args.report_id, expires_at);
    let json = serde_json::to_string_pretty(&grant)
        .unwrap_or_else(|err| fatal(&format!("failed to encode grant: {err}")));
    eprintln!(
        "public_key: {}",
        encode_public_key_base64(&issuer.verifying_key())
    );
    match &args.out {
        Some(path) => {
            fs::write(path, json)
                .unwrap_or_else(|err| fatal(&format!("failed to write {}: {err}", path.display())));
            println!("wrote {}", path.display());
        }
        None => println!("{json}"),
    }
}

fn cmd_allow(allowlist: &Path, public_key: &str) {
    let key = incident_ledger::decode_public_key_base64(public_key)
        .unwrap_or_else(|err| fatal(&format!("invalid public key: {err}")));
    GrantPolicy::append_to_allowlist(allowlist, &key)
        .unwrap_or_else(|err| fatal(&format!("failed to update allowlist: {err}")));
    println!("allowed {} in {}", public_key, allowlist.display());
}

fn describe_failure(err: &ReportError) -> String {
    match err {
        ReportError::TimedOut {
            token: Some(token),
            tx,
        } => match tx {
            Some(tx) => format!(
                "{err}; tx {tx} may still commit, re-query with `incident status {token}`"
            ),
            None => format!("{err}; re-query with `incident status {token}`"),
        },
        _ => err.to_string(),
    }
}

async fn cmd_submit(cli: &Cli, args: &SubmitArgs) {
    let config = load_config(cli.config.as_deref());
    let timeout = args
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.confirmation_timeout());
    let ledger = open_ledger(&config, cli.block_ms);
    let keys = load_keys(&cli.key_file);
    let reporter = IncidentReporter::new(
        config,
        ledger,
        Arc::new(keys),
        Arc::new(GrantPolicy::new([])),
    );
    let message = Zeroizing::new(read_message(args));
    let token = reporter
        .token_for(&message)
        .unwrap_or_else(|err| fatal(&err.to_string()));
    eprintln!("token: {token}");
    tokio::select! {
        result = reporter.submit_with_timeout(&message, timeout) => match result {
            Ok(report_id) => println!("report_id: {report_id}"),
            Err(err) => fatal(&describe_failure(&err)),
        },
        _ = tokio::signal::ctrl_c() => match reporter.cancel(&token).await {
            CancelOutcome::Stopped => fatal("cancelled; nothing was sent"),
            CancelOutcome::AlreadyBroadcast { tx: Some(tx) } => fatal(&format!(
                "cancelled locally; tx {tx} was already broadcast and may still commit"
            )),
            CancelOutcome::AlreadyBroadcast { tx: None } => fatal(
                "cancelled locally; a send was in progress and its outcome is unknown",
            ),
            CancelOutcome::NotInFlight => fatal("cancelled after the submission resolved"),
        },
    }
}

async fn cmd_retrieve(cli: &Cli, report_id: ReportId, grant: &Path, allowlist: &Path) {
    let config = load_config(cli.config.as_deref());
    let ledger = open_ledger(&config, cli.block_ms);
    let keys = load_keys(&cli.key_file);
    let policy = GrantPolicy::from_allowlist_path(allowlist)
        .unwrap_or_else(|err| fatal(&format!("failed to load allowlist: {err}")));
    let contents = fs::read_to_string(grant)
        .unwrap_or_else(|err| fatal(&format!("failed to read {}: {err}", grant.display())));
    let authorization: DecryptionAuthorization = serde_json::from_str(&contents)
        .unwrap_or_else(|err| fatal(&format!("invalid grant: {err}")));
    let reporter = IncidentReporter::new(config, ledger, Arc::new(keys), Arc::new(policy));
    match reporter.get_decrypted_report(&report_id, &authorization).await {
        Ok(plaintext) => println!("{plaintext}"),
        Err(err) => fatal(&err.to_string()),
    }
}

async fn cmd_status(cli: &Cli, token: &str) {
    let token = IdempotencyToken::from_hex(token.trim())
        .unwrap_or_else(|| fatal("token must be 64 hex characters"));
    let config = load_config(cli.config.as_deref());
    let ledger = open_ledger(&config, cli.block_ms);
    let keys = load_keys(&cli.key_file);
    let reporter = IncidentReporter::new(
        config,
        ledger,
        Arc::new(keys),
        Arc::new(GrantPolicy::new([])),
    );
    match reporter.status(&token).await {
        Ok(TokenStatus::Committed {
            report_id,
            submitted_at_block,
        }) => println!("committed report_id={report_id} block={submitted_at_block}"),
        Ok(TokenStatus::Unknown) => println!("unknown"),
        Ok(TokenStatus::InFlight(status)) => println!("in flight: {status:?}"),
        Err(err) => fatal(&err.to_string()),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    match &cli.command {
        Commands::Init { out } => cmd_init(out),
        Commands::Keygen { force } => cmd_keygen(&cli.key_file, *force),
        Commands::Grant(args) => cmd_grant(args),
        Commands::Submit(args) => cmd_submit(&cli, args).await,
        Commands::Allow {
            allowlist,
            public_key,
        } => cmd_allow(allowlist, public_key),
        Commands::Retrieve {
            report_id,
            grant,
            allowlist,
        } => cmd_retrieve(&cli, report_id.clone(), grant, allowlist).await,
        Commands::Status { token } => cmd_status(&cli, token).await,
    }
}
