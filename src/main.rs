//! Engram host shell.
//!
//! Drives the wallet core from the command line: account files, settings,
//! Datapads, bridge credentials and a few read-only daemon queries.
//!
//! Usage:
//!   engram accounts
//!   engram create --name alice --password pw
//!   engram restore --name alice2 --password pw --seed "<25 words>"
//!   engram seed --name alice --password pw
//!   engram settings get network
//!   engram settings set endpoint 127.0.0.1:40402
//!   engram datapad --name alice --password pw list
//!   engram name-lookup bob123
//!   engram gas --signer <addr> --scid <scid> --entrypoint Register
//!   engram sc <scid>
//!   engram bridge --name alice --password pw
//!   engram price

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use engram::address::Address;
use engram::args::Arguments;
use engram::config::{AppPaths, EngramConfig};
use engram::datapads::Datapads;
use engram::datashard::Datashard;
use engram::events::EventSink;
use engram::keystore::{KeyStore, LANGUAGE_ENGLISH};
use engram::node_client::{NodeClient, ScQuery};
use engram::price::PriceFeed;
use engram::rpc_bridge::Credentials;
use engram::session::Core;
use engram::settings::Settings;
use engram::transfer::ContractCall;
use engram::wallet::{BackendError, Transfer, WalletBackend, WalletConnector};
use engram::{format_money, Scid};

/// Engram wallet core.
#[derive(Parser, Debug)]
#[command(name = "engram", version, about = "Wallet orchestration core")]
struct Cli {
    /// Application directory holding account files and datashards.
    #[arg(long, default_value = "./engram-data", global = true)]
    app_root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List accounts for the configured network.
    Accounts,

    /// Create a new account and print its seed.
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        password: String,
    },

    /// Recreate an account from a 25-word seed.
    Restore {
        #[arg(long)]
        name: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        seed: String,
    },

    /// Print an account's seed words.
    Seed {
        #[arg(long)]
        name: String,
        #[arg(long)]
        password: String,
    },

    /// Read or write pre-login settings.
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },

    /// Manage an account's Datapads.
    Datapad {
        #[arg(long)]
        name: String,
        #[arg(long)]
        password: String,
        #[command(subcommand)]
        action: DatapadAction,
    },

    /// Resolve a registered name to its address.
    NameLookup {
        name: String,
        /// Topoheight to resolve at; -1 is the tip.
        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        topoheight: i64,
    },

    /// Estimate gas for a contract call.
    Gas {
        #[arg(long)]
        signer: String,
        #[arg(long)]
        scid: String,
        #[arg(long)]
        entrypoint: String,
    },

    /// Show a contract's exported functions.
    Sc { scid: String },

    /// Show (generating if needed) an account's RPC bridge credentials.
    Bridge {
        #[arg(long)]
        name: String,
        #[arg(long)]
        password: String,
    },

    /// Fetch the configured price quote.
    Price,
}

#[derive(Subcommand, Debug)]
enum SettingsAction {
    Get { key: String },
    Set { key: String, value: String },
}

#[derive(Subcommand, Debug)]
enum DatapadAction {
    List,
    Show { pad: String },
    Write { pad: String, text: String },
    Delete { pad: String },
}

/// The CLI never logs in; account work goes through the key store directly.
struct NoWallet;

impl WalletConnector for NoWallet {
    fn connect(
        &self,
        _keys: &KeyStore,
        _runtime: &engram::settings::RuntimeSnapshot,
    ) -> Result<Arc<dyn WalletBackend>, BackendError> {
        Err(BackendError::Unreachable(
            "no wallet library is linked into the CLI".into(),
        ))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let paths = AppPaths::new(cli.app_root);
    let config = EngramConfig::load(paths.root());
    let core = Core::open(paths, config, Arc::new(NoWallet), EventSink::detached())?;

    match cli.command {
        Command::Accounts => {
            for name in core.accounts() {
                println!("{}", name);
            }
        }
        Command::Create { name, password } => {
            let keys = core.create_account(&name, &password, LANGUAGE_ENGLISH)?;
            println!("Address: {}", keys.address());
            println!("Seed:    {}", keys.seed_words()?.join(" "));
        }
        Command::Restore {
            name,
            password,
            seed,
        } => {
            let keys = core.restore_account(&name, &password, &seed)?;
            println!("Address: {}", keys.address());
        }
        Command::Seed { name, password } => {
            let keys = KeyStore::open(core.paths(), core.network(), &name, &password)?;
            println!("{}", keys.seed_words()?.join(" "));
        }
        Command::Settings { action } => match action {
            SettingsAction::Get { key } => println!("{}", core.settings().get(&key)?),
            SettingsAction::Set { key, value } => {
                core.settings().set(&key, &value)?;
                println!("{} = {}", key, core.settings().get(&key)?);
            }
        },
        Command::Datapad {
            name,
            password,
            action,
        } => {
            let (_keys, shard) = unlock(&core, &name, &password)?;
            cmd_datapad(Datapads::new(shard), action)?;
        }
        Command::NameLookup { name, topoheight } => {
            let node = NodeClient::new(core.runtime().clone());
            println!("{}", node.name_to_address(&name, topoheight).await?);
        }
        Command::Gas {
            signer,
            scid,
            entrypoint,
        } => {
            let scid: Scid = scid.parse()?;
            let call = ContractCall::new(scid, entrypoint).transfer(Transfer {
                scid: Scid::NATIVE,
                destination: engram::names::fee_address(core.network()).to_string(),
                amount: 0,
                burn: 0,
                payload: Arguments::new(),
            });
            let node = NodeClient::new(core.runtime().clone());
            let gas = node
                .gas_estimate(&signer, &call.transfers, &call.sc_args())
                .await?;
            println!("storage: {}  compute: {}", gas.gasstorage, gas.gascompute);
        }
        Command::Sc { scid } => {
            let scid: Scid = scid.parse()?;
            let node = NodeClient::new(core.runtime().clone());
            let state = node.get_sc(&scid, &ScQuery::code_only()).await?;
            println!("balance: {}", format_money(state.balance));
            for f in engram::dvm::exported_functions(&state.code)? {
                let params: Vec<String> = f
                    .params
                    .iter()
                    .map(|p| format!("{} {:?}", p.name, p.ty))
                    .collect();
                let mut burns = Vec::new();
                if f.uses_dero_value {
                    burns.push("DEROVALUE");
                }
                if f.uses_asset_value {
                    burns.push("ASSETVALUE");
                }
                println!("{}({}) {} {}", f.name, params.join(", "), f.returns, burns.join(" "));
            }
        }
        Command::Bridge { name, password } => {
            let (_keys, shard) = unlock(&core, &name, &password)?;
            let settings = Settings::bind(shard, core.runtime().clone());
            let creds = Credentials::load_or_generate(&settings)?;
            let addr = engram::rpc_bridge::bind_addr(&core.config().bridge, core.network())?;
            println!("bind:     {}", addr);
            println!("auth:     {}", settings.auth_mode()?);
            println!("user:     {}", creds.user);
            println!("password: {}", creds.pass);
        }
        Command::Price => {
            let feed = PriceFeed::new(core.config().price.clone(), core.runtime().clone());
            println!("{}", feed.quote().await?);
        }
    }
    Ok(())
}

/// Open an account's key store and its datashard.
fn unlock(
    core: &Core,
    name: &str,
    password: &str,
) -> Result<(KeyStore, Arc<Datashard>), Box<dyn std::error::Error>> {
    let keys = KeyStore::open(core.paths(), core.network(), name, password)?;
    let address: Address = keys.address();
    let path = core.paths().account_shard(&keys.shard_id());
    let shard = Arc::new(Datashard::open(&path, Some(Arc::new(keys.value_cipher())))?);
    tracing::debug!(address = %address, shard = %path.display(), "Account unlocked");
    Ok((keys, shard))
}

fn cmd_datapad(pads: Datapads, action: DatapadAction) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        DatapadAction::List => {
            for pad in pads.list()? {
                println!("{}", pad);
            }
        }
        DatapadAction::Show { pad } => println!("{}", pads.load(&pad)?),
        DatapadAction::Write { pad, text } => {
            if !pads.list()?.contains(&pad) {
                pads.create(&pad)?;
            }
            pads.save(&pad, &text)?;
        }
        DatapadAction::Delete { pad } => pads.delete(&pad)?,
    }
    Ok(())
}
