//! # rvnch: Channel and Fee-Delegation Tool
//!
//! Command-line front end for the `rvn-channels` library: compiles conditional
//! locking scripts into P2SH addresses, keeps their redeem scripts on disk,
//! decodes transactions, and runs the completer side of a fee delegation.
//!
//! ## Script Templates
//!
//! ```text
//!  basicMultisig          m-of-n CHECKMULTISIG
//!  renewableChannel       both parties, or sender alone after a CSV delay
//!  expiringChannel        both parties, or sender alone after a CLTV time
//!  tieredRelease          immediate key, or one delayed key per CLTV tier
//!  hybridMultisigTiered   immediate key, 5-of-5, or one delayed key per tier
//! ```
//!
//! Templates are read as JSON, for example:
//!
//! ```json
//! { "template": "renewableChannel",
//!   "sender": "02...", "receiver": "03...",
//!   "relativeLock": { "blocks": 144 } }
//! ```
//!
//! ## Fee Delegation
//!
//! ```text
//! ┌────────────┐  envelope (ANYONECANPAY|ALL)  ┌────────────┐  signed tx  ┌─────────┐
//! │ Originator │ ────────────────────────────> │ Completer  │ ──────────> │ Network │
//! │ asset only │                               │ adds fee   │             │         │
//! └────────────┘                               └────────────┘             └─────────┘
//! ```
//!
//! The completer checks the claim and change outputs and the signature flags
//! before appending its reserved input. A rejected envelope is discarded and
//! never broadcast.
//!
//! ## Usage
//!
//! ```bash
//! # Compile a template and store its redeem script
//! rvnch compile --params channel.json --eligible-at 2026-03-01T00:00:00Z --store scripts.json
//!
//! # Re-check a store file
//! rvnch check-store --store scripts.json
//!
//! # Decode a raw transaction
//! rvnch decode 0200000001...
//!
//! # Complete a fee delegation (signing key from RVN_SIGNING_WIF)
//! rvnch complete --envelope envelope.json --asset TOKEN
//! ```
//!
//! ## Configuration
//!
//! Read from `.env` and the environment: `RVN_NETWORK`, `RVN_RPC_URL`,
//! `RVN_RPC_USER`, `RVN_RPC_PASSWORD`, `RVN_EXPLORER_URL`, `RVN_FEE_RATE`,
//! `RVN_SIGNING_WIF`. Logging follows `RUST_LOG`.

use anyhow::{anyhow, Context, Result};
use bitcoin::{OutPoint, Txid};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use rvn_channels::{
    config::{delegation as delegation_config, env as config_env, EngineConfig},
    delegation::BridgeTerms,
    services::{Broadcaster, ExplorerClient, NodeRpcClient, UnspentSource},
    store::RedeemScriptRecord,
    tx::codec,
    ChainAddress, Completer, DelegationState, DelegationTerms, KeyPair, RedeemScriptStore,
    ScriptTemplate,
};
use std::{env, fs, str::FromStr};

#[derive(Parser)]
#[command(name = "rvnch")]
#[command(about = "Conditional scripts and fee-delegated payments for an asset-carrying chain")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a script template and print its persistence record
    Compile {
        /// Template parameters (JSON file)
        #[arg(short, long)]
        params: String,
        /// Time the script becomes spendable (RFC 3339, UTC)
        #[arg(short, long)]
        eligible_at: Option<DateTime<Utc>>,
        /// Redeem-script store to add the record to
        #[arg(short, long)]
        store: Option<String>,
    },
    /// Load a redeem-script store and re-check every record
    CheckStore {
        #[arg(short, long, default_value = "redeem_scripts.json")]
        store: String,
    },
    /// Attach a funding outpoint to a stored redeem script
    RecordFunding {
        #[arg(short, long, default_value = "redeem_scripts.json")]
        store: String,
        /// Eligibility time the record is stored under
        #[arg(short, long)]
        eligible_at: DateTime<Utc>,
        /// Funding output (txid:vout)
        outpoint: String,
    },
    /// Decode a raw transaction into JSON
    Decode {
        /// Transaction hex
        tx_hex: String,
    },
    /// Complete a fee-delegation envelope and broadcast the result
    Complete {
        /// Envelope JSON file
        #[arg(short, long)]
        envelope: String,
        /// Asset the claim is paid in
        #[arg(short, long)]
        asset: String,
        /// Flat asset amount claimed
        #[arg(short, long, default_value_t = delegation_config::DEFAULT_CLAIM_AMOUNT)]
        claim: u64,
        /// Bridge operator address, for the bridge variant
        #[arg(long, requires = "bridge_address")]
        bridge_operator: Option<String>,
        /// Foreign-chain address carried in the memo
        #[arg(long, requires = "bridge_operator")]
        bridge_address: Option<String>,
        #[arg(long, default_value_t = delegation_config::DEFAULT_BRIDGE_FEE)]
        bridge_fee: u64,
        /// Use the block explorer instead of node RPC
        #[arg(long)]
        explorer: bool,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let config = EngineConfig::from_env();

    match cli.command {
        Commands::Compile {
            params,
            eligible_at,
            store,
        } => compile(&config, &params, eligible_at, store.as_deref()),
        Commands::CheckStore { store } => check_store(&store),
        Commands::RecordFunding {
            store,
            eligible_at,
            outpoint,
        } => record_funding(&store, eligible_at, &outpoint),
        Commands::Decode { tx_hex } => decode(&config, &tx_hex),
        Commands::Complete {
            envelope,
            asset,
            claim,
            bridge_operator,
            bridge_address,
            bridge_fee,
            explorer,
        } => {
            let bridge = match (bridge_operator, bridge_address) {
                (Some(operator), Some(foreign_address)) => Some(BridgeTerms {
                    operator: ChainAddress::parse(&operator, config.network)?,
                    fee: bridge_fee,
                    foreign_address,
                }),
                _ => None,
            };
            complete(&config, &envelope, asset, claim, bridge, explorer)
        }
    }
}

fn compile(
    config: &EngineConfig,
    params: &str,
    eligible_at: Option<DateTime<Utc>>,
    store: Option<&str>,
) -> Result<()> {
    let json = fs::read_to_string(params).with_context(|| format!("reading {}", params))?;
    let template: ScriptTemplate = serde_json::from_str(&json)?;
    template.validate()?;

    let record = RedeemScriptRecord::new(&template, config.network)?;
    println!("📜 {} template", template.name());
    println!("  P2SH Address: {}", record.p2sh_address);
    println!("  Redeem Script: {} bytes", record.redeem_script_size);
    for branch in template.branches() {
        let path = template.branch_path(branch)?;
        println!(
            "  Branch {:?}: {} of {} key(s), selectors {:?}",
            branch,
            path.required,
            path.keys.len(),
            path.selectors
        );
    }

    match (store, eligible_at) {
        (Some(path), Some(at)) => {
            let mut store = RedeemScriptStore::open(path)?;
            store.insert(at, &template, config.network)?;
            store.save()?;
            println!("💾 Stored under {} in {}", at.to_rfc3339(), path);
        }
        (Some(_), None) => return Err(anyhow!("--store needs --eligible-at")),
        _ => println!("{}", serde_json::to_string_pretty(&record)?),
    }
    Ok(())
}

fn check_store(path: &str) -> Result<()> {
    let store = RedeemScriptStore::load(path)?;
    println!("✅ {} record(s) in {} pass the self-check", store.len(), path);
    for (key, record) in store.iter() {
        let funding = record
            .funding()
            .map_or_else(|| "unfunded".to_string(), |outpoint| outpoint.to_string());
        println!(
            "  {}  {}  {}  {}",
            key,
            record.original_params.name(),
            record.p2sh_address,
            funding
        );
    }
    Ok(())
}

fn record_funding(path: &str, eligible_at: DateTime<Utc>, outpoint: &str) -> Result<()> {
    let outpoint = parse_outpoint(outpoint)?;
    let mut store = RedeemScriptStore::load(path)?;
    store.record_funding(eligible_at, outpoint)?;
    store.save()?;
    println!("💾 Recorded funding {} for {}", outpoint, eligible_at.to_rfc3339());
    Ok(())
}

fn decode(config: &EngineConfig, tx_hex: &str) -> Result<()> {
    let tx = codec::decode_hex(tx_hex)?;
    let summary = codec::summarize(&tx, config.network);
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn complete(
    config: &EngineConfig,
    envelope_path: &str,
    asset: String,
    claim: u64,
    bridge: Option<BridgeTerms>,
    use_explorer: bool,
) -> Result<()> {
    let wif = env::var(config_env::SIGNING_WIF)
        .with_context(|| format!("{} is not set", config_env::SIGNING_WIF))?;
    let key = KeyPair::from_wif(&wif)?;
    let mut terms = DelegationTerms::new(asset, claim, key.address(config.network));
    terms.bridge = bridge;
    let completer = Completer::new(key, config.network, terms)?;

    let envelope = fs::read_to_string(envelope_path)
        .with_context(|| format!("reading {}", envelope_path))?;

    let state = if use_explorer {
        let client = ExplorerClient::new(config.explorer_url.clone())?;
        run_completer(&completer, &envelope, &client)?
    } else {
        let client = NodeRpcClient::from_config(config)?;
        run_completer(&completer, &envelope, &client)?
    };

    match state {
        DelegationState::Completed { txid } => println!("✅ Broadcast {}", txid),
        DelegationState::Aborted { reason } => {
            println!("🛑 Envelope discarded: {}", reason);
            std::process::exit(2);
        }
        DelegationState::Originated => {
            return Err(anyhow!("delegation did not reach a terminal state"))
        }
    }
    Ok(())
}

fn run_completer<C>(completer: &Completer, envelope: &str, client: &C) -> Result<DelegationState>
where
    C: UnspentSource + Broadcaster,
{
    Ok(completer.run(envelope, client, client)?)
}

fn parse_outpoint(text: &str) -> Result<OutPoint> {
    let (txid, vout) = text
        .split_once(':')
        .ok_or_else(|| anyhow!("Invalid outpoint format. Use txid:vout"))?;
    Ok(OutPoint::new(Txid::from_str(txid)?, vout.parse()?))
}
