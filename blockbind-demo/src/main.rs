//! Blockbind demo
//!
//! Mounts the page schema of a fixture, loads every block, optionally drives
//! a selection on a filter block, and prints what each block would render.
//!
//! Usage:
//!   blockbind-demo --fixture fixtures/customers_orders.json --source customers --select 7

use anyhow::{anyhow, Context};
use blockbind::metadata::{CollectionDescriptor, InMemoryCollectionManager};
use blockbind::resource::HttpResourceClient;
use blockbind::{
    CollectionMetadata, EngineConfig, InMemoryResourceClient, Page, ResourceClient, SchemaNode,
};
use clap::Parser;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::rc::Rc;
use tracing::{info, warn};

/// Demo CLI arguments
#[derive(Parser, Debug)]
#[command(name = "blockbind-demo")]
#[command(about = "Mount a page fixture and drive cross-block filtering")]
struct Args {
    /// Page fixture: collections, records, schema
    #[arg(
        long,
        env = "BLOCKBIND_FIXTURE",
        default_value = "blockbind-demo/fixtures/customers_orders.json"
    )]
    fixture: PathBuf,

    /// Engine configuration file (TOML)
    #[arg(long, env = "BLOCKBIND_CONFIG")]
    config: Option<PathBuf>,

    /// Page size of data blocks that do not set one
    #[arg(long, env = "BLOCKBIND_PAGE_SIZE")]
    page_size: Option<u32>,

    /// Resource API base URL; the fixture records are served when absent
    #[arg(long, env = "BLOCKBIND_BASE_URL")]
    base_url: Option<String>,

    /// Bearer token for the resource API
    #[arg(long, env = "BLOCKBIND_TOKEN")]
    token: Option<String>,

    /// Name of the filter block to select rows in
    #[arg(long)]
    source: Option<String>,

    /// Row keys to select in the source block
    #[arg(long, value_delimiter = ',')]
    select: Vec<String>,

    /// Clear the selection again afterwards
    #[arg(long, default_value = "false")]
    clear: bool,
}

impl Args {
    /// Config file first, then flags on top.
    fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::load(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => EngineConfig::default(),
        };
        if let Some(page_size) = self.page_size {
            config.default_page_size = page_size;
        }
        if let Some(base_url) = &self.base_url {
            let mut http = config.http.take().unwrap_or(blockbind::config::HttpClientConfig {
                base_url: String::new(),
                token: None,
                timeout_secs: 30,
            });
            http.base_url = base_url.clone();
            if self.token.is_some() {
                http.token = self.token.clone();
            }
            config.http = Some(http);
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Deserialize)]
struct Fixture {
    collections: Vec<CollectionDescriptor>,
    /// `{"<collection>": [rows...]}`
    #[serde(default)]
    records: Value,
    schema: Value,
    /// Record the page is rendered for, if any.
    #[serde(default)]
    record: Value,
}

fn parse_key(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn render(page: &Page) -> anyhow::Result<Value> {
    let mut blocks = Vec::new();
    for node in page.blocks() {
        blocks.push(json!({
            "name": node.name,
            "kind": node.kind,
            "collection": node.collection.name,
            "props": page.table_props(node.id)?,
        }));
    }
    Ok(Value::Array(blocks))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("blockbind_demo=info".parse()?),
        )
        .with_ansi(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    tracing_log::LogTracer::init()?;

    let args = Args::parse();
    let config = args.engine_config()?;

    let content = std::fs::read_to_string(&args.fixture)
        .with_context(|| format!("reading fixture {}", args.fixture.display()))?;
    let fixture: Fixture = serde_json::from_str(&content)?;

    let metadata: Rc<dyn CollectionMetadata> =
        Rc::new(InMemoryCollectionManager::from_descriptors(fixture.collections)?);

    let client: Rc<dyn ResourceClient> = match &config.http {
        Some(http) => {
            info!("Using resource API at {}", http.base_url);
            Rc::new(HttpResourceClient::new(http)?)
        }
        None => {
            let client = InMemoryResourceClient::new().with_metadata(Rc::clone(&metadata));
            if !fixture.records.is_null() {
                client.seed_from_value(&fixture.records)?;
            }
            Rc::new(client)
        }
    };

    let page = Page::with_config(config, metadata, client);
    let schema = SchemaNode::from_value(fixture.schema)?;
    let mounted = page.mount_schema(&schema, fixture.record)?;
    info!("Mounted {} blocks", mounted.len());

    for (id, result) in page.load_all().await {
        if let Err(e) = result {
            warn!("Initial load of {} failed: {}", id, e);
        }
    }

    if let Some(source) = &args.source {
        let node = page
            .block_by_name(source)
            .ok_or_else(|| anyhow!("no block named `{}`", source))?;
        let keys: Vec<Value> = args.select.iter().map(|k| parse_key(k)).collect();
        let outcomes = page.on_row_selection_change(node.id, keys).await?;
        for outcome in &outcomes {
            info!(
                "{} refetched with filter {}",
                outcome.name,
                outcome
                    .filter
                    .as_ref()
                    .map(|f| f.to_value().to_string())
                    .unwrap_or_else(|| "none".into())
            );
            if let Err(e) = &outcome.result {
                warn!("{} failed: {}", outcome.name, e);
            }
        }
        if args.clear {
            page.clear_selection(node.id).await?;
        }
    }

    println!("{}", serde_json::to_string_pretty(&render(&page)?)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key() {
        assert_eq!(parse_key("7"), json!(7));
        assert_eq!(parse_key("A-1"), json!("A-1"));
    }

    #[test]
    fn test_flags_override_config() {
        let args = Args::parse_from([
            "blockbind-demo",
            "--page-size",
            "5",
            "--base-url",
            "http://localhost:13000/api",
        ]);
        let config = args.engine_config().unwrap();
        assert_eq!(config.default_page_size, 5);
        assert_eq!(config.http.unwrap().base_url, "http://localhost:13000/api");
    }

    #[test]
    fn test_bundled_fixture_parses() {
        let content = include_str!("../fixtures/customers_orders.json");
        let fixture: Fixture = serde_json::from_str(content).unwrap();
        assert!(InMemoryCollectionManager::from_descriptors(fixture.collections).is_ok());
        assert!(SchemaNode::from_value(fixture.schema).is_ok());
    }
}
