//! Resolver Simulator - drives the ledger engine against an in-memory pool.
//! Some nodes can be made silent, failing or byzantine to watch quorum handling.

use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::RngCore;
use serde_json::json;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use indy_resolver::pool::NodeBehaviour;
use indy_resolver::signer::AnySigner;
use indy_resolver::{
    CreateParams, InMemoryPool, KeyType, LedgerEngine, ReadOptions, ReadQuorum, ResolverConfig, SignerKey,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Number of nodes in the pool
    #[arg(short, long, default_value_t = 4)]
    nodes: usize,

    /// Nodes that never answer
    #[arg(long, default_value_t = 0)]
    silent: usize,

    /// Nodes that answer reads with a forged document
    #[arg(long, default_value_t = 0)]
    byzantine: usize,

    /// Per-node timeout in milliseconds
    #[arg(short, long, default_value_t = 500)]
    timeout_ms: u64,

    /// Accept reads on a simple majority instead of 2/3
    #[arg(long)]
    majority: bool,

    /// Use a P-256 key instead of secp256k1
    #[arg(long)]
    p256: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "indy_resolver=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    if args.silent + args.byzantine > args.nodes {
        bail!("{} faulty nodes requested for a pool of {}", args.silent + args.byzantine, args.nodes);
    }

    let mut config = ResolverConfig::from_env().context("reading INDY_RESOLVER_* settings")?;
    config.node_timeout = Duration::from_millis(args.timeout_ms);
    if args.majority {
        config.read_quorum = ReadQuorum::Majority;
    }

    let mut pool = InMemoryPool::new(args.nodes);
    for i in 0..args.silent {
        pool = pool.with_behaviour(i, NodeBehaviour::Silent);
    }
    for i in args.silent..args.silent + args.byzantine {
        pool = pool.with_behaviour(
            i,
            NodeBehaviour::Byzantine { document: Some(json!({"forged": true})), seq_no: 9_999 },
        );
    }
    info!("Pool ready: {} nodes ({} silent, {} byzantine)", args.nodes, args.silent, args.byzantine);

    let key_type = if args.p256 { KeyType::P256 } else { KeyType::Secp256k1 };
    let mut secret = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    secret[0] &= 0x7f;
    let key = SignerKey::new(secret.to_vec(), key_type);
    let verkey = key.public_key()?;

    let engine = LedgerEngine::new(config)?;
    let signer = AnySigner;

    // The steward DID is derived from the key and signs for itself.
    let steward = indy_resolver::Identifier::from_verkey(&engine.config().did_method, &verkey)?;
    let submitter = steward.to_string();

    match engine
        .nym_create(
            &pool,
            CreateParams { submitter: &submitter, verkey: Some(&verkey[..]), role: Some("TRUSTEE"), ..Default::default() },
            &signer,
            &key,
        )
        .await
    {
        Ok(id) => info!("NYM created: {}", id),
        Err(e) => error!("NYM create failed: {}", e),
    }

    let context = json!({
        "@context": {
            "name": "http://schema.org/name",
            "email": "http://schema.org/email"
        }
    });
    let context_id = match engine.context_create(&pool, &submitter, &signer, &key, &context).await {
        Ok(id) => {
            info!("Context created: {}", id);
            Some(id)
        }
        Err(e) => {
            error!("Context create failed: {}", e);
            None
        }
    };

    let doc = json!({
        "@context": "https://w3id.org/did/v1",
        "service": [{"type": "agent", "serviceEndpoint": "https://agent.example.com"}]
    });
    let did = match engine
        .did_create(&pool, CreateParams { submitter: &submitter, document: Some(doc), ..Default::default() }, &signer, &key)
        .await
    {
        Ok(id) => {
            info!("DID created: {}", id);
            Some(id)
        }
        Err(e) => {
            error!("DID create failed: {}", e);
            None
        }
    };

    if let Some(id) = &context_id {
        match engine.context_read(&pool, id.as_str()).await {
            Ok(_) => info!("Context read back from cache"),
            Err(e) => warn!("Context read failed: {}", e.report().kind),
        }
    }

    if let Some(id) = &did {
        match engine.did_read(&pool, id.as_str(), &ReadOptions::refresh()).await {
            Ok(doc) => info!("DID resolved from pool: {}", doc),
            Err(e) => warn!("DID read failed [{}]: {}", e.kind(), e),
        }
        if let Err(e) = engine.did_delete(&pool, &submitter, id.as_str(), &signer, &key).await {
            warn!("DID delete failed [{}]: {}", e.kind(), e);
        }
        match engine.did_read(&pool, id.as_str(), &ReadOptions::default()).await {
            Ok(_) => warn!("Deleted DID still resolves"),
            Err(e) => info!("Deleted DID read: {}", e.kind()),
        }
    }

    engine.monitor().render();
    let snapshot = engine.shutdown();
    info!("Final counters: {}", serde_json::to_string(&snapshot)?);
    Ok(())
}
