//! CLI entry point for the OTR overlay.
//!
//! This binary manages the overlay's durable state (private keys,
//! fingerprint tables, configuration) and runs a local demonstration of two
//! accounts talking through the overlay over an in-memory transport.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use otr_overlay::{
    proxy::{Proxy, ProxyEvent},
    session::{PeerAuthentication, SessionEvent},
    transport::loopback::LoopbackInbox,
    utils::{LoggingConfig, DEFAULT_CONFIG_FILE},
    AccountIdentity, FingerprintValue, LoopbackTransport, Manager, ManagerEvent, OverlayConfig, Policy,
};
use std::path::PathBuf;
use std::time::Duration;

/// OTR Overlay - off-the-record encryption for plaintext messaging transports
#[derive(Parser)]
#[command(name = "otr-overlay")]
#[command(about = "Off-the-record encryption overlay with peer authentication")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = env!("CARGO_PKG_AUTHORS"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (can be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short, long)]
    quiet: bool,

    /// Data directory for keys, fingerprints and instance tags
    #[arg(short, long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate and inspect account private keys
    Keys {
        #[command(subcommand)]
        action: KeyCommands,
    },
    /// Manage known peer fingerprints
    Fingerprints {
        #[command(subcommand)]
        action: FingerprintCommands,
    },
    /// Generate and validate configuration files
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
    /// Show the encryption policy, or store a new one in the config file
    Policy {
        /// New policy (always, opportunistic, manual, never)
        value: Option<Policy>,
    },
    /// Run two local accounts through a private conversation
    Demo {
        /// Messages alice sends to bob
        #[arg(short, long, default_values_t = vec!["hello bob".to_string(), "this is private".to_string()])]
        message: Vec<String>,
        /// Question alice asks during peer authentication
        #[arg(long)]
        question: Option<String>,
        /// Secret alice authenticates with
        #[arg(long, default_value = "correct horse")]
        secret: String,
        /// Secret bob answers with; defaults to alice's
        #[arg(long)]
        answer: Option<String>,
        /// Policy for both accounts; defaults to the configured one
        #[arg(short, long)]
        policy: Option<Policy>,
    },
}

#[derive(Args)]
struct AccountArgs {
    /// Account identifier, also the storage subdirectory
    #[arg(short, long)]
    account: String,
    /// Account name seen by peers; defaults to the identifier
    #[arg(long)]
    name: Option<String>,
    /// Messaging protocol of the account
    #[arg(long, default_value = "jabber")]
    protocol: String,
}

impl AccountArgs {
    fn identity(&self) -> AccountIdentity {
        let name = self.name.clone().unwrap_or_else(|| self.account.clone());
        AccountIdentity::new(self.account.clone(), name, self.protocol.clone())
    }
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Generate the account's private key
    Generate {
        #[command(flatten)]
        account: AccountArgs,
        /// Replace an existing key
        #[arg(short, long)]
        force: bool,
    },
    /// Display the account's fingerprint and instance tag
    Show {
        #[command(flatten)]
        account: AccountArgs,
    },
}

#[derive(Subcommand)]
enum FingerprintCommands {
    /// List the peer keys the account has seen
    List {
        #[command(flatten)]
        account: AccountArgs,
    },
    /// Mark a peer key as verified
    Trust {
        #[command(flatten)]
        account: AccountArgs,
        /// Peer owning the key
        peer: String,
        /// Fingerprint, hex with optional spaces
        fingerprint: String,
    },
    /// Clear the verified mark of a peer key
    Distrust {
        #[command(flatten)]
        account: AccountArgs,
        /// Peer owning the key
        peer: String,
        /// Fingerprint, hex with optional spaces
        fingerprint: String,
    },
    /// Remove a peer key
    Forget {
        #[command(flatten)]
        account: AccountArgs,
        /// Peer owning the key
        peer: String,
        /// Fingerprint, hex with optional spaces
        fingerprint: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Generate a default configuration file
    Generate {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        file: Option<PathBuf>,
    },
    /// Show current configuration
    Show {
        /// Show only specific section
        #[arg(short, long)]
        section: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = OverlayConfig::load(cli.config.as_deref())?;

    // Initialize logging
    setup_logging(cli.verbose, cli.quiet, &config.logging);

    // Override data directory if provided
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir;
    }

    // Ensure directories exist
    config.ensure_directories()?;

    match cli.command {
        Commands::Keys { action } => handle_key_commands(action, &config).await,
        Commands::Fingerprints { action } => handle_fingerprint_commands(action, &config),
        Commands::Config { action } => handle_config_commands(action, &config),
        Commands::Policy { value } => handle_policy_command(value, cli.config, config),
        Commands::Demo {
            message,
            question,
            secret,
            answer,
            policy,
        } => {
            let policy = policy.unwrap_or(config.otr.policy);
            let answer = answer.unwrap_or_else(|| secret.clone());
            handle_demo_command(&config, policy, &message, question.as_deref(), &secret, &answer).await
        }
    }
}

fn setup_logging(verbose: u8, quiet: bool, logging: &LoggingConfig) {
    let log_level = if quiet {
        "error"
    } else {
        match verbose {
            0 => logging.level.as_str(),
            1 => "debug",
            _ => "trace",
        }
    };

    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level));
    if logging.timestamps {
        builder.format_timestamp_secs();
    } else {
        builder.format_timestamp(None);
    }
    builder.init();
}

async fn handle_key_commands(action: KeyCommands, config: &OverlayConfig) -> Result<()> {
    let manager = Manager::new(config);

    match action {
        KeyCommands::Generate { account, force } => {
            let account = account.identity();
            if manager.engine_state(&account)?.has_private_key() && !force {
                return Err(anyhow::anyhow!(
                    "Account {} already has a private key. Use --force to replace it.",
                    account
                ));
            }

            let mut events = manager.subscribe();
            if !manager.create_new_private_key(&account) {
                return Err(anyhow::anyhow!("Key generation for {} could not be started", account));
            }

            loop {
                match events.recv().await {
                    Ok(ManagerEvent::KeyGenerationFinished { account_id, error })
                        if account_id == account.account_id =>
                    {
                        if error {
                            return Err(anyhow::anyhow!("Key generation for {} failed", account));
                        }
                        break;
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Missed {} manager events", skipped);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        return Err(anyhow::anyhow!("Manager shut down during key generation"));
                    }
                }
            }

            let fingerprint = manager
                .fingerprint_for_account(&account)?
                .ok_or_else(|| anyhow::anyhow!("Key for {} was not installed", account))?;
            println!("✓ Private key generated");
            println!("  Account: {}", account);
            println!("  Fingerprint: {}", fingerprint);
        }
        KeyCommands::Show { account } => {
            let account = account.identity();
            match manager.fingerprint_for_account(&account)? {
                Some(fingerprint) => {
                    println!("Account: {}", account);
                    println!("Fingerprint: {}", fingerprint);
                    println!("Instance tag: {}", manager.instance_tag(&account)?);
                }
                None => {
                    return Err(anyhow::anyhow!(
                        "No private key for {}. Run 'keys generate' first.",
                        account
                    ))
                }
            }
        }
    }

    Ok(())
}

fn handle_fingerprint_commands(action: FingerprintCommands, config: &OverlayConfig) -> Result<()> {
    let manager = Manager::new(config);

    match action {
        FingerprintCommands::List { account } => {
            let account = account.identity();
            let known = manager.known_fingerprints(&account)?;
            if known.is_empty() {
                println!("No known fingerprints for {}", account);
            }
            for fingerprint in known {
                let mark = if fingerprint.trusted { "verified" } else { "unverified" };
                println!("{:<30} {}  {}", fingerprint.owner_peer, fingerprint.value, mark);
            }
        }
        FingerprintCommands::Trust {
            account,
            peer,
            fingerprint,
        } => set_trust(&manager, &account.identity(), &peer, &fingerprint, true)?,
        FingerprintCommands::Distrust {
            account,
            peer,
            fingerprint,
        } => set_trust(&manager, &account.identity(), &peer, &fingerprint, false)?,
        FingerprintCommands::Forget {
            account,
            peer,
            fingerprint,
        } => {
            let value = FingerprintValue::from_hex(&fingerprint)?;
            if !manager.forget_fingerprint(&account.identity(), &peer, &value)? {
                return Err(anyhow::anyhow!("Fingerprint {} of {} is unknown or in use", value, peer));
            }
            println!("✓ Forgot {} of {}", value, peer);
        }
    }

    Ok(())
}

fn set_trust(manager: &Manager, account: &AccountIdentity, peer: &str, fingerprint: &str, trust: bool) -> Result<()> {
    let value = FingerprintValue::from_hex(fingerprint)?;
    if !manager.trust_fingerprint(account, peer, &value, trust)? {
        return Err(anyhow::anyhow!("Fingerprint {} of {} is unknown", value, peer));
    }
    let state = if trust { "verified" } else { "unverified" };
    println!("✓ {} of {} is now {}", value, peer, state);
    Ok(())
}

fn handle_config_commands(action: ConfigCommands, config: &OverlayConfig) -> Result<()> {
    match action {
        ConfigCommands::Generate { output } => {
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            if output_path.exists() {
                return Err(anyhow::anyhow!(
                    "Configuration file already exists: {}",
                    output_path.display()
                ));
            }

            OverlayConfig::default().save(&output_path)?;
            println!("✓ Configuration written to {}", output_path.display());
        }
        ConfigCommands::Validate { file } => {
            let path = file.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            let loaded = OverlayConfig::from_file(&path)?;
            loaded.validate()?;
            println!("✓ Configuration is valid: {}", path.display());
        }
        ConfigCommands::Show { section } => {
            let rendered = match section.as_deref() {
                None => config.to_toml_string()?,
                Some("storage") => toml::to_string_pretty(&config.storage)?,
                Some("otr") => toml::to_string_pretty(&config.otr)?,
                Some("logging") => toml::to_string_pretty(&config.logging)?,
                Some("keygen") => toml::to_string_pretty(&config.keygen)?,
                Some(other) => return Err(anyhow::anyhow!("Unknown section: {}", other)),
            };
            println!("{}", rendered);
        }
    }

    Ok(())
}

fn handle_policy_command(value: Option<Policy>, config_file: Option<PathBuf>, mut config: OverlayConfig) -> Result<()> {
    let Some(policy) = value else {
        for policy in Policy::ALL {
            let marker = if policy == config.otr.policy { "*" } else { " " };
            println!("{} {}", marker, policy);
        }
        return Ok(());
    };

    let path = config_file.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    config.otr.policy = policy;
    config.validate()?;
    config.save(&path)?;
    info!("Policy {} written to {}", policy, path.display());
    println!("✓ Policy set to {}", policy);
    Ok(())
}

struct DemoPeer {
    name: &'static str,
    proxy: Proxy<LoopbackTransport>,
    inbox: LoopbackInbox,
}

impl DemoPeer {
    fn new(
        name: &'static str,
        peer: &str,
        config: &OverlayConfig,
        policy: Policy,
        end: (LoopbackTransport, LoopbackInbox),
    ) -> Result<Self> {
        let manager = Manager::new(config);
        manager.set_policy(policy);
        let account = AccountIdentity::new(format!("demo-{name}"), name, "loopback");
        let mut proxy = Proxy::new(manager, account, peer, end.0).with_auto_generate(config.keygen.auto_generate);
        proxy.connect_proxy()?;
        Ok(Self {
            name,
            proxy,
            inbox: end.1,
        })
    }

    fn report(&mut self) {
        for event in self.proxy.take_events() {
            match event {
                ProxyEvent::MessageReceived(message) => {
                    let marker = if message.encrypted { "🔒" } else { "  " };
                    println!("{} {} received: {}", marker, self.name, message.text);
                }
                ProxyEvent::MessageSent { token, .. } => info!("{} sent {}", self.name, token),
                ProxyEvent::MessageAcknowledged { token } => info!("{} acknowledged {}", self.name, token),
                ProxyEvent::Session(SessionEvent::TrustLevelChanged { level }) => {
                    println!("   {} is now {}", self.name, level);
                }
                ProxyEvent::Session(SessionEvent::PeerAuthentication(PeerAuthentication::Requested {
                    question,
                })) => {
                    let question = question.unwrap_or_else(|| "(shared secret)".to_string());
                    println!("   {} asked to authenticate: {}", self.name, question);
                }
                ProxyEvent::Session(SessionEvent::PeerAuthentication(PeerAuthentication::Concluded {
                    authenticated,
                })) => {
                    let outcome = if authenticated { "succeeded" } else { "failed" };
                    println!("   {} peer authentication {}", self.name, outcome);
                }
                ProxyEvent::Session(SessionEvent::Notice(notice)) => {
                    println!("   {} notice: {}", self.name, notice.text);
                }
                ProxyEvent::Session(other) => info!("{}: {:?}", self.name, other),
            }
        }
    }
}

/// Carry messages between the two peers until both inboxes stay empty
fn shuttle(a: &mut DemoPeer, b: &mut DemoPeer) -> Result<()> {
    loop {
        let mut moved = false;
        for peer in [&mut *a, &mut *b] {
            while let Ok(message) = peer.inbox.try_recv() {
                moved = true;
                if peer.proxy.is_connected() {
                    peer.proxy.message_received(message)?;
                }
            }
        }
        if !moved {
            return Ok(());
        }
    }
}

/// Shuttle until neither side waits on key generation
async fn settle(a: &mut DemoPeer, b: &mut DemoPeer) -> Result<()> {
    let settled = tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            a.proxy.pump()?;
            b.proxy.pump()?;
            shuttle(a, b)?;

            if !is_generating(a) && !is_generating(b) {
                return Ok::<(), anyhow::Error>(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;

    match settled {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!("Timed out waiting for key generation")),
    }
}

fn is_generating(peer: &DemoPeer) -> bool {
    peer.proxy
        .manager()
        .is_generating_key(&peer.proxy.account().account_id)
}

async fn handle_demo_command(
    config: &OverlayConfig,
    policy: Policy,
    messages: &[String],
    question: Option<&str>,
    secret: &str,
    answer: &str,
) -> Result<()> {
    info!("Running demo with policy {}", policy);
    let (alice_end, bob_end) = LoopbackTransport::pair("alice", "bob");
    let mut alice = DemoPeer::new("alice", "bob", config, policy, alice_end)?;
    let mut bob = DemoPeer::new("bob", "alice", config, policy, bob_end)?;

    alice.proxy.initialize()?;
    settle(&mut alice, &mut bob).await?;
    alice.report();
    bob.report();

    for text in messages {
        println!("-> alice sends: {}", text);
        if let Err(err) = alice.proxy.send_message(text, 0) {
            warn!("alice could not send: {}", err);
        }
        settle(&mut alice, &mut bob).await?;
        alice.report();
        bob.report();
    }

    let trusted = alice.proxy.session().is_some_and(|session| session.trust_level().is_private());
    if trusted {
        println!("-> alice starts peer authentication");
        alice.proxy.start_peer_authentication(question, secret)?;
        shuttle(&mut alice, &mut bob)?;
        bob.report();
        bob.proxy.respond_peer_authentication(answer)?;
        shuttle(&mut alice, &mut bob)?;
        alice.report();
        bob.report();
    } else {
        warn!("Conversation is not private; skipping peer authentication");
    }

    println!("-> alice ends the conversation");
    alice.proxy.disconnect_proxy()?;
    shuttle(&mut alice, &mut bob)?;
    alice.report();
    bob.report();

    bob.proxy.disconnect_proxy()?;
    Ok(())
}
