//! Proxy test server
//!
//! Hosts `MyDerivedClassI` at identity `test` on the `TestAdapter` object
//! adapter, prints `listening at: <endpoint>` for every endpoint once
//! ready, and runs until a client calls `shutdown` or Ctrl-C is pressed.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use proxy_harness::common::{logging, paths, Properties};
use proxy_harness::rpc::{Communicator, Identity, InitializationData};
use proxy_harness::schema::Schema;
use proxy_harness::suite::MyDerivedClassI;
use proxy_harness::Result;

const ADAPTER_NAME: &str = "TestAdapter";
const SCHEMA_FILE: &str = "Test.yaml";

#[derive(Parser)]
#[command(name = "proxy-server", about = "Server side of the proxy conformance test")]
#[command(version, long_about = None)]
struct Args {
    /// Endpoints for the test adapter, unless TestAdapter.Endpoints is set
    #[arg(long, default_value = "default -p 12010 -t 10000")]
    endpoints: String,

    /// Interface definition file; Test.yaml is searched for when omitted
    #[arg(long)]
    schema: Option<PathBuf>,

    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Runtime properties after `--`, e.g. `-- --Rpc.Trace.Network=1`
    #[arg(last = true)]
    runtime_args: Vec<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let _log_guard = logging::init_server(args.log_file.as_deref());

    if let Err(e) = run(args).await {
        tracing::error!("Server failed: {}", e);
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let (mut properties, remaining) = Properties::from_args(&args.runtime_args)?;
    let remaining = properties.parse_command_line_options(ADAPTER_NAME, &remaining);
    let endpoints_key = format!("{ADAPTER_NAME}.Endpoints");
    if properties.get(&endpoints_key).is_none() {
        properties.set(&endpoints_key, &args.endpoints);
    }

    let schema_path = match args.schema {
        Some(path) => path,
        None => paths::resolve_schema(SCHEMA_FILE, &properties)?,
    };
    let schema = Schema::load(&schema_path)?;

    let communicator = Communicator::initialize(remaining, InitializationData::new(properties))?;
    let served = serve(&communicator, schema).await;
    let destroyed = communicator.destroy().await;
    served.and(destroyed)
}

async fn serve(communicator: &Communicator, schema: Schema) -> Result<()> {
    let adapter = communicator.create_object_adapter(ADAPTER_NAME)?;
    adapter.add(Arc::new(MyDerivedClassI::new(schema)?), Identity::new("test"))?;
    adapter.activate().await?;

    for endpoint in adapter.endpoints() {
        println!("listening at: {endpoint}");
    }
    std::io::stdout().flush()?;

    tokio::select! {
        _ = communicator.wait_for_shutdown() => {
            tracing::info!("Shutdown requested");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
        }
    }
    Ok(())
}
