use anyhow::{Context, Result, anyhow};
use chrono::Local;
use clap::{Parser, Subcommand};
use gccore::codec;
use gccore::crypto::DefaultCallCrypto;
use gccore::keys::GroupCallKeys;
use gccore::types::{CallIdentity, CallStartData, GROUP_ID_LEN, GroupCallKey, GroupIdentity};
use groupcall::config::SUPPORTED_PROTOCOL_VERSION;
use groupcall::group_call::{PeekOutcome, SfuClient, validate_base_url};
use groupcall_ureq_http_client::UreqHttpClient;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

// Small operator tool for inspecting group calls on an SFU.
//
// Usage:
//   groupcall peek --sfu-url https://sfu.example.com --creator ECHOECHO \
//       --group-id 0102030405060708 --gck <64 hex chars> --token <sfu token>

#[derive(Parser)]
#[command(name = "groupcall", about = "Group call tooling")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ask the SFU whether a call is running and decrypt its call state.
    Peek {
        #[arg(long)]
        sfu_url: String,
        #[arg(long)]
        creator: String,
        /// Group id, hex encoded.
        #[arg(long)]
        group_id: String,
        /// Group call key, hex encoded.
        #[arg(long)]
        gck: String,
        #[arg(long)]
        token: String,
        #[arg(long, default_value_t = SUPPORTED_PROTOCOL_VERSION)]
        protocol_version: u32,
        /// Allowed SFU hostname suffix. May be repeated.
        #[arg(long = "allow-host")]
        allow_hosts: Vec<String>,
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    rt.block_on(async {
        match cli.command {
            Command::Peek {
                sfu_url,
                creator,
                group_id,
                gck,
                token,
                protocol_version,
                allow_hosts,
                timeout_secs,
            } => {
                let group_id: [u8; GROUP_ID_LEN] = hex::decode(&group_id)
                    .context("group id is not hex")?
                    .try_into()
                    .map_err(|_| anyhow!("group id must be {GROUP_ID_LEN} bytes"))?;
                let gck = GroupCallKey::from_slice(&hex::decode(&gck).context("gck is not hex")?)?;

                let base_url = validate_base_url(&sfu_url, &allow_hosts)?;
                let identity = CallIdentity::new(
                    GroupIdentity::new(creator, group_id),
                    CallStartData {
                        protocol_version,
                        gck,
                        sfu_base_url: base_url.clone(),
                    },
                );
                let call_id = identity.call_id();
                info!("Peeking call {} on {}", call_id.log_id(), base_url);

                let timeout = Duration::from_secs(timeout_secs);
                let http = Arc::new(UreqHttpClient::with_timeout(timeout));
                let sfu = SfuClient::new(http, base_url, timeout);
                match sfu.peek(&call_id, protocol_version, &token).await? {
                    PeekOutcome::NotFound => println!("call {call_id} is not running"),
                    PeekOutcome::Running(peek) => {
                        println!("call {call_id} is running");
                        println!("  started at:       {}", peek.started_at);
                        println!("  max participants: {}", peek.max_participants);
                        if let Some(sealed) = peek.encrypted_call_state {
                            let keys = GroupCallKeys::derive(identity.call_key())?;
                            let crypto = DefaultCallCrypto::new();
                            match codec::decrypt_call_state(&crypto, &keys, &sealed) {
                                Ok(state) => {
                                    println!("  created by:       {}", state.created_by);
                                    println!("  participants:     {}", state.participants.len());
                                }
                                Err(e) => warn!("Could not decrypt call state: {e}"),
                            }
                        }
                    }
                }
                Ok::<(), anyhow::Error>(())
            }
        }
    })
}
