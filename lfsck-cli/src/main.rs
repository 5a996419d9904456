//! Command-line client for the daemon's HTTP control surface: one
//! subcommand per public API operation, issuing a request with `reqwest`
//! and printing the JSON (or plain-text) response body.

use clap::{Parser, Subcommand};
use lfsck_proto::{LfsckRequest, StartParam, StopParam};
use serde_json::json;

#[derive(Parser, Debug)]
#[command(name = "lfsck-cli")]
#[command(about = "Client for the LFSCK engine's HTTP control surface")]
struct Args {
    /// Base URL of the lfsckd HTTP control surface.
    #[arg(long, default_value = "http://127.0.0.1:7878")]
    url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a new scan instance on a device.
    Register {
        device: String,
        #[arg(long, default_value_t = true)]
        master: bool,
    },
    /// Degister a scan instance.
    Degister { device: String },
    /// Start a scan. Objects are given as seq:oid:ver triples.
    Start {
        device: String,
        #[arg(long = "object", value_name = "SEQ:OID:VER")]
        objects: Vec<String>,
        #[arg(long)]
        speed_limit: Option<u32>,
        #[arg(long)]
        async_windows: Option<u16>,
    },
    /// Stop a running scan.
    Stop {
        device: String,
        #[arg(long, default_value_t = false)]
        failed: bool,
    },
    /// Send a control-protocol notify event.
    Notify {
        device: String,
        #[arg(value_enum)]
        event: EventArg,
        #[arg(long, default_value_t = 0)]
        index: u16,
        #[arg(long, default_value_t = lfsck_proto::component_mask::ALL)]
        active: u32,
    },
    /// Query component status.
    Query {
        device: String,
        #[arg(value_enum)]
        event: EventArg,
        #[arg(long, default_value_t = lfsck_proto::component_mask::ALL)]
        active: u32,
    },
    /// Read the current speed limit.
    GetSpeed { device: String },
    /// Set the speed limit, in items per tick.
    SetSpeed { device: String, limit: u32 },
    /// Read the current async-window size.
    GetWindows { device: String },
    /// Set the async-window size.
    SetWindows { device: String, windows: u16 },
    /// Dump every active component's internal status.
    Dump { device: String },
    /// Register a target descriptor (e.g. from a later-joining peer).
    AddTarget {
        device: String,
        index: u16,
        key: String,
        #[arg(long, default_value_t = true)]
        for_ost: bool,
    },
    /// Remove a target descriptor.
    DelTarget {
        device: String,
        index: u16,
        #[arg(long, default_value_t = true)]
        for_ost: bool,
    },
}

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
enum EventArg {
    Phase1Done,
    Phase2Done,
    FidAccessed,
    PeerExit,
    ConditionalDestroy,
    PairsVerify,
}

impl From<EventArg> for lfsck_proto::LfsckEvent {
    fn from(e: EventArg) -> Self {
        use lfsck_proto::LfsckEvent::*;
        match e {
            EventArg::Phase1Done => Phase1Done,
            EventArg::Phase2Done => Phase2Done,
            EventArg::FidAccessed => FidAccessed,
            EventArg::PeerExit => PeerExit,
            EventArg::ConditionalDestroy => ConditionalDestroy,
            EventArg::PairsVerify => PairsVerify,
        }
    }
}

fn parse_fid(s: &str) -> anyhow::Result<serde_json::Value> {
    let parts: Vec<&str> = s.split(':').collect();
    anyhow::ensure!(parts.len() == 3, "expected SEQ:OID:VER, got {s}");
    Ok(json!({
        "seq": parts[0].parse::<u64>()?,
        "oid": parts[1].parse::<u32>()?,
        "ver": parts[2].parse::<u32>()?,
    }))
}

async fn print_response(resp: reqwest::Response) -> anyhow::Result<()> {
    let status = resp.status();
    let body = resp.text().await?;
    if !body.is_empty() {
        println!("{body}");
    }
    anyhow::ensure!(status.is_success(), "request failed: {status}");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let client = reqwest::Client::new();
    let base = args.url.trim_end_matches('/').to_string();

    match args.command {
        Command::Register { device, master } => {
            let resp = client
                .post(format!("{base}/v1/targets/{device}/register"))
                .json(&json!({ "master": master }))
                .send()
                .await?;
            print_response(resp).await?;
        }
        Command::Degister { device } => {
            let resp = client.post(format!("{base}/v1/targets/{device}/degister")).send().await?;
            print_response(resp).await?;
        }
        Command::Start { device, objects, speed_limit, async_windows } => {
            let objects: Vec<serde_json::Value> =
                objects.iter().map(|s| parse_fid(s)).collect::<anyhow::Result<_>>()?;
            let start = StartParam {
                speed_limit,
                async_windows,
                error_handle: false,
                dryrun: false,
                flags: 0,
            };
            let resp = client
                .post(format!("{base}/v1/targets/{device}/start"))
                .json(&json!({ "start": start, "objects": objects }))
                .send()
                .await?;
            print_response(resp).await?;
        }
        Command::Stop { device, failed } => {
            let stop = StopParam { status: u16::from(failed), flags: 0 };
            let resp =
                client.post(format!("{base}/v1/targets/{device}/stop")).json(&stop).send().await?;
            print_response(resp).await?;
        }
        Command::Notify { device, event, index, active } => {
            let req = notify_request(event.into(), index, active);
            let resp =
                client.post(format!("{base}/v1/targets/{device}/notify")).json(&req).send().await?;
            print_response(resp).await?;
        }
        Command::Query { device, event, active } => {
            let req = notify_request(event.into(), 0, active);
            let resp =
                client.post(format!("{base}/v1/targets/{device}/query")).json(&req).send().await?;
            print_response(resp).await?;
        }
        Command::GetSpeed { device } => {
            let resp = client.get(format!("{base}/v1/targets/{device}/speed")).send().await?;
            print_response(resp).await?;
        }
        Command::SetSpeed { device, limit } => {
            let resp = client
                .put(format!("{base}/v1/targets/{device}/speed"))
                .json(&json!({ "limit": limit }))
                .send()
                .await?;
            print_response(resp).await?;
        }
        Command::GetWindows { device } => {
            let resp = client.get(format!("{base}/v1/targets/{device}/windows")).send().await?;
            print_response(resp).await?;
        }
        Command::SetWindows { device, windows } => {
            let resp = client
                .put(format!("{base}/v1/targets/{device}/windows"))
                .json(&json!({ "windows": windows }))
                .send()
                .await?;
            print_response(resp).await?;
        }
        Command::Dump { device } => {
            let resp = client.get(format!("{base}/v1/targets/{device}/dump")).send().await?;
            print_response(resp).await?;
        }
        Command::AddTarget { device, index, key, for_ost } => {
            let resp = client
                .post(format!("{base}/v1/targets/{device}/targets"))
                .json(&json!({ "index": index, "key": key, "for_ost": for_ost }))
                .send()
                .await?;
            print_response(resp).await?;
        }
        Command::DelTarget { device, index, for_ost } => {
            let resp = client
                .delete(format!("{base}/v1/targets/{device}/targets/{index}?for_ost={for_ost}"))
                .send()
                .await?;
            print_response(resp).await?;
        }
    }
    Ok(())
}

fn notify_request(event: lfsck_proto::LfsckEvent, index: u16, active: u32) -> LfsckRequest {
    LfsckRequest {
        event,
        index,
        status: 0,
        version: 1,
        active,
        param: 0,
        speed: 0,
        async_windows: 0,
        valid: 0,
    }
}
