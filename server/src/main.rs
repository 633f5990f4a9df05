use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use futures_util::FutureExt;
use log::{debug, info};
use serde_json::{Map, Value};

use server::context::{Hooks, ReducerError, Verdict};
use server::keys::{ServerKeypair, DEFAULT_KEY_FILE};
use server::network::Server;
use server::registry::HydrateFn;

// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[clap(short, long, default_value = "8080")]
    port: u16,

    /// Path of the persisted RSA keypair
    #[clap(short, long, default_value = DEFAULT_KEY_FILE)]
    key_file: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Warning: RUST_LOG environment variable not set. Set it to display logs!");
        eprintln!("Recommended: RUST_LOG=info cargo run");
    }

    let args = Args::parse();
    let addr = format!("{}:{}", args.host, args.port);

    let keypair = ServerKeypair::load_or_generate(&args.key_file)?;

    // Demo collaborators: every key hydrates to an empty document, the
    // filter accepts everything, and actions shallow-merge their fields
    // into the state. Real deployments inject their own set.
    let hydrate: Arc<HydrateFn> = Arc::new(|key: String, _identity| {
        async move {
            debug!("hydrating '{}' as an empty document", key);
            Ok(Some(Value::Object(Map::new())))
        }
        .boxed()
    });
    let hooks = Arc::new(Hooks {
        reducer: Box::new(merge_reducer),
        filter: Box::new(|_ctx, _action| Verdict::Accept),
    });

    info!("starting state-replication server on {}", addr);
    let server = Server::bind(&addr, keypair, hydrate, hooks).await?;
    server.run().await;

    Ok(())
}

/// Shallow-merges every field of the action except its `type` tag into the
/// state object.
fn merge_reducer(state: &Value, action: &Value) -> Result<Value, ReducerError> {
    let mut merged = state.as_object().cloned().unwrap_or_default();
    if let Some(fields) = action.as_object() {
        for (name, value) in fields {
            if name == "type" {
                continue;
            }
            merged.insert(name.clone(), value.clone());
        }
    }
    Ok(Value::Object(merged))
}
