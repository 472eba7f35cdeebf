//! Endpoint Policy CLI.

use anyhow::{bail, Result};
use clap::Parser;
use serde::Serialize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use zentinel_endpoint_policy::engine::EndpointReport;
use zentinel_endpoint_policy::profile::endpoints::RuleCompiler;
use zentinel_endpoint_policy::profile::metadata::NoSystemMetadata;
use zentinel_endpoint_policy::profile::store::MemoryProfileStore;
use zentinel_endpoint_policy::profile::{hierarchy, CFG_FILTER_LISTS_KEY};
use zentinel_endpoint_policy::{
    build_sources, Config, Decision, Flow, PolicyEngine, Profile, ProfileEnv, ProfileSource,
};

#[derive(Parser, Debug)]
#[command(name = "zentinel-endpoint-policy")]
#[command(about = "Endpoint policy for Zentinel - enrich remote endpoints and decide with filter lists and profile rules")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "endpoint-policy.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: String,

    /// Print example configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,

    /// Domain of the endpoint to check
    #[arg(long)]
    domain: Option<String>,

    /// IP address of the endpoint to check
    #[arg(long)]
    ip: Option<IpAddr>,

    /// CNAME of the domain (repeatable, in resolution order)
    #[arg(long = "cname")]
    cnames: Vec<String>,

    /// Filter list to enforce instead of the configured active lists (repeatable)
    #[arg(long = "list")]
    lists: Vec<String>,

    /// Endpoint rule of the checking profile, highest precedence first (repeatable)
    #[arg(long = "rule")]
    rules: Vec<String>,

    /// IP protocol number
    #[arg(long, default_value_t = 6)]
    protocol: u8,

    /// Remote port
    #[arg(long, default_value_t = 443)]
    port: u16,

    /// Treat the connection as inbound
    #[arg(long)]
    inbound: bool,
}

#[derive(Serialize)]
struct CheckOutput {
    endpoint: EndpointReport,
    decision: Decision,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --print-config
    if args.print_config {
        println!("{}", Config::example());
        return Ok(());
    }

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    // Load configuration
    info!(config = %args.config.display(), "Loading configuration");
    let config = Config::load(&args.config)?;

    // Handle --validate
    if args.validate {
        info!("Configuration is valid");
        return Ok(());
    }

    if args.domain.is_none() && args.ip.is_none() {
        bail!("nothing to check: pass --domain and/or --ip");
    }

    let (sources, list_index) = build_sources(&config)?;
    let engine = PolicyEngine::new(config, sources);

    let env = ProfileEnv {
        store: Arc::new(MemoryProfileStore::new()),
        compiler: Arc::new(RuleCompiler),
        list_ids: list_index,
        metadata: Arc::new(NoSystemMetadata),
    };
    let profile = Profile::new(env, ProfileSource::Local, "", "");
    // Each rule is inserted at the head.
    for rule in args.rules.iter().rev() {
        profile.add_endpoint(rule);
    }
    if !args.lists.is_empty() {
        let mut settings = profile.config();
        hierarchy::put_value(&mut settings, CFG_FILTER_LISTS_KEY, serde_json::json!(args.lists))?;
        profile.replace_config(settings);
    }
    if let Some(e) = profile.last_parse_error() {
        bail!("invalid profile settings: {}", e);
    }

    let flow = Flow {
        protocol: args.protocol,
        ip: args.ip,
        port: args.port,
        domain: args.domain,
        cnames: args.cnames,
        inbound: args.inbound,
    };

    let endpoint = engine.inspect(&flow, &args.lists).await;
    let entity = engine.observe(&flow).await;
    let decision = engine.decide(&profile, &entity, flow.inbound).await;

    let output = CheckOutput { endpoint, decision };
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}
