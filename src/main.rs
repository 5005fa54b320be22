//! `refcore` command line: runs the settlement core flows against a
//! JSON snapshot file, so operators can verify payments, replay
//! purchases, and drive claims without the surrounding service.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::Value;

use refcore::chain::{ChainReader, FixtureChainReader, IndexChainReader};
use refcore::config::CoreConfig;
use refcore::ledger::{MemberStore, StoreSnapshot};
use refcore::ops::{Core, PurchaseRequest};
use refcore::verify::PaymentVerifier;

#[derive(Parser)]
#[command(name = "refcore", version, about = "Membership payment and referral settlement core")]
struct Cli {
    /// Core configuration file (JSON). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Ledger snapshot file (JSON). Created on first mutation.
    #[arg(long, global = true, default_value = "store.json")]
    store: PathBuf,

    /// Optional chain fixture: a JSON object mapping tx hash to the
    /// indexer payload. When absent, lookups go to the configured
    /// index endpoint.
    #[arg(long, global = true)]
    chain_fixture: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Verify a payment and activate the buyer's package.
    Purchase {
        #[arg(long)]
        tx_hash: String,
        #[arg(long)]
        wallet: Option<String>,
        #[arg(long)]
        chat_id: Option<String>,
        #[arg(long)]
        referral_code: Option<String>,
        #[arg(long)]
        display_name: Option<String>,
    },
    /// Verify a payment and extend an expired membership.
    Renew {
        #[arg(long)]
        tx_hash: String,
        #[arg(long)]
        user_id: Option<String>,
        #[arg(long)]
        wallet: Option<String>,
    },
    /// Claim this month's token drip.
    ClaimTokens {
        #[arg(long)]
        user_id: Option<String>,
        #[arg(long)]
        wallet: Option<String>,
    },
    /// Claim this month's coin drip.
    ClaimCoins {
        #[arg(long)]
        user_id: Option<String>,
        #[arg(long)]
        wallet: Option<String>,
    },
    /// Withdraw from the rewards balance.
    Withdraw {
        #[arg(long)]
        user_id: String,
        #[arg(long)]
        amount: f64,
        #[arg(long)]
        destination: Option<String>,
    },
    /// Profile, token, reward and referral snapshot for one member.
    Dashboard {
        #[arg(long)]
        user_id: Option<String>,
        #[arg(long)]
        wallet: Option<String>,
    },
    /// Verify a payment without touching the ledger.
    Verify {
        #[arg(long)]
        tx_hash: String,
        #[arg(long)]
        wallet: Option<String>,
    },
    /// Print the ledger snapshot's merkle root.
    Root,
}

fn load_config(path: Option<&Path>) -> Result<CoreConfig, String> {
    match path {
        None => Ok(CoreConfig::default()),
        Some(path) => {
            let text = fs::read_to_string(path)
                .map_err(|e| format!("read {}: {e}", path.display()))?;
            serde_json::from_str(&text).map_err(|e| format!("parse {}: {e}", path.display()))
        }
    }
}

fn load_store(path: &Path) -> Result<MemberStore, String> {
    if !path.exists() {
        return Ok(MemberStore::new());
    }
    let text =
        fs::read_to_string(path).map_err(|e| format!("read {}: {e}", path.display()))?;
    let snapshot: StoreSnapshot =
        serde_json::from_str(&text).map_err(|e| format!("parse {}: {e}", path.display()))?;
    Ok(MemberStore::from(snapshot))
}

fn save_store(path: &Path, store: &MemberStore) -> Result<(), String> {
    let snapshot = store.snapshot();
    let text = serde_json::to_string_pretty(&snapshot)
        .map_err(|e| format!("serialize snapshot: {e}"))?;
    fs::write(path, text).map_err(|e| format!("write {}: {e}", path.display()))
}

fn build_reader(
    fixture: Option<&Path>,
    config: &CoreConfig,
) -> Result<Box<dyn ChainReader>, String> {
    if let Some(path) = fixture {
        let text =
            fs::read_to_string(path).map_err(|e| format!("read {}: {e}", path.display()))?;
        let map: BTreeMap<String, Value> =
            serde_json::from_str(&text).map_err(|e| format!("parse {}: {e}", path.display()))?;
        return Ok(Box::new(FixtureChainReader::from_map(map)));
    }
    match &config.index_endpoint {
        Some(endpoint) => Ok(Box::new(IndexChainReader::new(
            endpoint.clone(),
            config.index_api_key.clone(),
        ))),
        // Nothing to look up against: every non-mock hash reads as
        // not-found, which verification reports cleanly.
        None => Ok(Box::new(FixtureChainReader::new())),
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(err) => eprintln!("error: serialize output: {err}"),
    }
}

fn run(cli: Cli) -> Result<(), String> {
    let config = load_config(cli.config.as_deref())?;
    let store = load_store(&cli.store)?;
    let reader = build_reader(cli.chain_fixture.as_deref(), &config)?;
    let now = Utc::now();

    // Verify and Root are read-only; everything else rewrites the
    // snapshot after a successful flow.
    let command = match cli.command {
        Command::Verify { tx_hash, wallet } => {
            let verifier = PaymentVerifier::new(&config, &reader);
            let payment = verifier
                .verify(&tx_hash, wallet.as_deref())
                .map_err(|e| e.to_string())?;
            print_json(&payment);
            return Ok(());
        }
        Command::Root => {
            println!("{}", hex::encode(store.merkle_root()));
            return Ok(());
        }
        other => other,
    };

    let mut core = Core::new(config, reader, store);
    match command {
        Command::Purchase {
            tx_hash,
            wallet,
            chat_id,
            referral_code,
            display_name,
        } => {
            let receipt = core
                .purchase(
                    &PurchaseRequest {
                        wallet_address: wallet,
                        chat_id,
                        tx_hash,
                        referral_code,
                        display_name,
                    },
                    now,
                )
                .map_err(|e| e.to_string())?;
            print_json(&receipt);
        }
        Command::Renew {
            tx_hash,
            user_id,
            wallet,
        } => {
            let receipt = core
                .renew(user_id.as_deref(), wallet.as_deref(), &tx_hash, now)
                .map_err(|e| e.to_string())?;
            print_json(&receipt);
        }
        Command::ClaimTokens { user_id, wallet } => {
            let claim = core
                .claim_tokens(user_id.as_deref(), wallet.as_deref(), now)
                .map_err(|e| e.to_string())?;
            print_json(&claim);
        }
        Command::ClaimCoins { user_id, wallet } => {
            let claim = core
                .claim_coins(user_id.as_deref(), wallet.as_deref(), now)
                .map_err(|e| e.to_string())?;
            print_json(&claim);
        }
        Command::Withdraw {
            user_id,
            amount,
            destination,
        } => {
            let receipt = core
                .withdraw(&user_id, amount, destination.as_deref(), now)
                .map_err(|e| e.to_string())?;
            print_json(&receipt);
        }
        Command::Dashboard { user_id, wallet } => {
            let dash = core
                .dashboard(user_id.as_deref(), wallet.as_deref(), now)
                .map_err(|e| e.to_string())?;
            print_json(&dash);
        }
        Command::Verify { .. } | Command::Root => unreachable!(),
    }

    save_store(&cli.store, &core.store)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
