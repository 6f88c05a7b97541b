use clap::{Parser, Subcommand, ValueEnum};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};

use settlement_engine::blockchain::types::Network;
use settlement_engine::blockchain::wallet::{HdWallet, SEED_ENV_VAR};

#[derive(Parser)]
#[command(name = "settlement-cli")]
#[command(about = "Management CLI for the settlement engine", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8081")]
    url: String,

    #[arg(short, long, env = "SETTLEMENT_ADMIN_API_KEY", default_value = "")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum NetworkArg {
    Mainnet,
    Testnet,
    Regtest,
}

impl From<NetworkArg> for Network {
    fn from(arg: NetworkArg) -> Self {
        match arg {
            NetworkArg::Mainnet => Network::Mainnet,
            NetworkArg::Testnet => Network::Testnet,
            NetworkArg::Regtest => Network::Regtest,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum LinkKindArg {
    Single,
    Multi,
    Recurring,
}

impl LinkKindArg {
    fn as_str(&self) -> &'static str {
        match self {
            LinkKindArg::Single => "SINGLE",
            LinkKindArg::Multi => "MULTI",
            LinkKindArg::Recurring => "RECURRING",
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Engine and indexer status
    Status,
    /// List watched addresses
    Watched,
    /// Show a transaction record
    Transaction { tx_id: String },
    /// Show a notification event and its delivery state
    Notification { id: String },
    /// Send a single test webhook to a merchant
    WebhookTest { owner: String },
    /// Create a payment link on a freshly derived address
    CreateLink {
        owner: String,
        #[arg(long, value_enum, default_value = "single")]
        kind: LinkKindArg,
        /// Expected amount in satoshis
        #[arg(long)]
        amount: Option<u64>,
        #[arg(long)]
        zero_conf: bool,
    },
    /// Register an escrow contract address
    RegisterContract { owner: String, address: String },
    /// Reconcile an address immediately
    Check { address: String },
    /// Sign and broadcast a payout from a derived address
    Payout {
        sender_index: u32,
        recipient: String,
        /// Amount in satoshis
        amount: u64,
    },
    /// Derive the receiving address for an index (offline, reads the seed env var)
    Derive {
        index: u32,
        #[arg(long, value_enum, default_value = "mainnet")]
        network: NetworkArg,
        #[arg(long, default_value_t = 0)]
        account: u32,
        #[arg(long, default_value = SEED_ENV_VAR)]
        seed_env: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Commands::Derive {
        index,
        network,
        account,
        seed_env,
    } = &cli.command
    {
        let wallet = HdWallet::from_env(seed_env, (*network).into(), *account)?;
        let address = wallet.derive_address(*index)?;
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "index": index,
                "cashaddr": address.to_cashaddr(),
                "legacy": address.to_legacy(),
            }))?
        );
        return Ok(());
    }

    let client = reqwest::Client::new();
    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );
    let get = |path: String| client.get(format!("{}{}", cli.url, path)).headers(headers.clone());
    let post = |path: String| client.post(format!("{}{}", cli.url, path)).headers(headers.clone());

    let res = match cli.command {
        Commands::Status => get("/admin/status".into()).send().await?,
        Commands::Watched => get("/admin/watched".into()).send().await?,
        Commands::Transaction { tx_id } => get(format!("/admin/transactions/{tx_id}")).send().await?,
        Commands::Notification { id } => get(format!("/admin/notifications/{id}")).send().await?,
        Commands::WebhookTest { owner } => {
            post(format!("/admin/merchants/{owner}/webhook-test")).send().await?
        }
        Commands::CreateLink {
            owner,
            kind,
            amount,
            zero_conf,
        } => {
            post("/admin/payment-links".into())
                .json(&json!({
                    "owner_id": owner,
                    "kind": kind.as_str(),
                    "amount": amount,
                    "accept_zero_conf": zero_conf,
                }))
                .send()
                .await?
        }
        Commands::RegisterContract { owner, address } => {
            post("/admin/contracts".into())
                .json(&json!({ "owner_id": owner, "address": address }))
                .send()
                .await?
        }
        Commands::Check { address } => post(format!("/admin/addresses/{address}/check")).send().await?,
        Commands::Payout {
            sender_index,
            recipient,
            amount,
        } => {
            post("/admin/payouts".into())
                .json(&json!({
                    "sender_index": sender_index,
                    "recipient": recipient,
                    "amount": amount,
                }))
                .send()
                .await?
        }
        Commands::Derive { .. } => return Ok(()),
    };
    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        std::process::exit(1);
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
