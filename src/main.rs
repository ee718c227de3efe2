//! Proxy test client
//!
//! Runs the proxy conformance suite against a server started separately
//! (see `proxy-server`) and exits with 0 when every phase succeeded, 1
//! otherwise. Runtime properties are passed as `--Rpc.*` / `--Test.*`
//! arguments; `--Test.Proxy` names the object under test.

use proxy_harness::common::{logging, paths, Properties};
use proxy_harness::harness;
use proxy_harness::rpc::{Communicator, InitializationData};
use proxy_harness::schema::Schema;
use proxy_harness::suite::ProxySuite;
use proxy_harness::Result;

const SCHEMA_FILE: &str = "Test.yaml";

/// Properties, then interface definitions, then the communicator
fn bootstrap(args: Vec<String>) -> Result<(Communicator, ProxySuite)> {
    let (properties, remaining) = Properties::from_args(&args)?;
    let schema_path = paths::resolve_schema(SCHEMA_FILE, &properties)?;
    let schema = Schema::load(&schema_path)?;
    let communicator = Communicator::initialize(remaining, InitializationData::new(properties))?;
    Ok((communicator, ProxySuite::new(schema, false)))
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    logging::init_client();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let status = harness::run(args, bootstrap).await;

    std::process::exit(status.exit_code());
}
