//! crm-engine: command-line access to rule validation, audience counting,
//! lookalike suggestions and simulated campaign runs over JSON files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use crm_campaigns::{CampaignOrchestrator, CampaignStore, NewCampaign, SimulatedVendor};
use crm_core::clock::system_clock;
use crm_core::config::AppConfig;
use crm_core::event_bus::noop_sink;
use crm_core::{Clock, Customer};
use crm_segmentation::{
    AudienceResolver, InMemoryCustomerStore, InMemorySegmentRepository, LookalikeContext, LookalikeSynthesizer,
    NewSegment, RuleNode, SegmentManager,
};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "crm-engine")]
#[command(about = "Customer segmentation and campaign engine")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML), overlaid by CRM_ENGINE__* variables
    #[arg(long, env = "CRM_ENGINE_CONFIG")]
    config: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long, env = "CRM_ENGINE__NODE_ID")]
    node_id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a rule document and print its normalized form
    Validate {
        #[arg(long)]
        rule: PathBuf,
    },
    /// Count customers matching a rule
    Count {
        #[arg(long)]
        customers: PathBuf,
        #[arg(long)]
        rule: PathBuf,
    },
    /// Count plus a sample of matching customers
    Preview {
        #[arg(long)]
        customers: PathBuf,
        #[arg(long)]
        rule: PathBuf,
    },
    /// Suggest a lookalike rule
    Lookalike {
        #[arg(long)]
        customers: PathBuf,
        /// Seed segment rule used as the reference population
        #[arg(long)]
        seed_rule: Option<PathBuf>,
    },
    /// Run a campaign against a rule with the simulated vendor
    RunCampaign {
        #[arg(long)]
        customers: PathBuf,
        #[arg(long)]
        rule: PathBuf,
        /// Message template with {{first_name}}-style placeholders
        #[arg(long)]
        template: String,
        #[arg(long, default_value = "cli campaign")]
        name: String,
        /// Vendor success probability (overrides config)
        #[arg(long)]
        success_rate: Option<f64>,
    },
}

fn read_json(path: &Path) -> anyhow::Result<serde_json::Value> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

struct Engine {
    config: AppConfig,
    clock: Arc<dyn Clock>,
    customers: Arc<InMemoryCustomerStore>,
    resolver: Arc<AudienceResolver>,
}

impl Engine {
    fn new(config: AppConfig) -> Self {
        let clock = system_clock();
        let customers = Arc::new(InMemoryCustomerStore::new());
        let resolver = Arc::new(AudienceResolver::new(
            customers.clone(),
            clock.clone(),
            config.segmentation.clone(),
        ));
        Self {
            config,
            clock,
            customers,
            resolver,
        }
    }

    fn load_customers(&self, path: &Path) -> anyhow::Result<()> {
        let list: Vec<Customer> = serde_json::from_value(read_json(path)?)
            .with_context(|| format!("{} is not a customer list", path.display()))?;
        for customer in list {
            self.customers.insert(customer)?;
        }
        info!(customers = self.customers.len(), "Customers loaded");
        Ok(())
    }

    fn rule(&self, path: &Path) -> anyhow::Result<RuleNode> {
        Ok(self.resolver.validate(&read_json(path)?)?)
    }

    fn segments(&self) -> Arc<SegmentManager> {
        Arc::new(SegmentManager::new(
            Arc::new(InMemorySegmentRepository::new()),
            self.resolver.clone(),
            noop_sink(),
            self.clock.clone(),
        ))
    }
}

#[derive(Serialize)]
struct CampaignReport {
    campaign: crm_campaigns::Campaign,
    logs: Vec<crm_campaigns::CommunicationLog>,
}

async fn run(cli: Cli, config: AppConfig) -> anyhow::Result<()> {
    let engine = Engine::new(config);

    match cli.command {
        Command::Validate { rule } => {
            let rule = engine.rule(&rule)?;
            info!(conditions = rule.condition_count(), depth = rule.depth(), "Rule is valid");
            print_json(&rule)
        }
        Command::Count { customers, rule } => {
            engine.load_customers(&customers)?;
            let rule = engine.rule(&rule)?;
            let count = engine.resolver.count(&rule).await?;
            print_json(&serde_json::json!({ "count": count }))
        }
        Command::Preview { customers, rule } => {
            engine.load_customers(&customers)?;
            let rule = engine.rule(&rule)?;
            print_json(&engine.resolver.preview(&rule).await?)
        }
        Command::Lookalike { customers, seed_rule } => {
            engine.load_customers(&customers)?;
            let seed_rule = seed_rule.map(|p| engine.rule(&p)).transpose()?;
            let synthesizer = LookalikeSynthesizer::new(
                engine.resolver.clone(),
                engine.clock.clone(),
                engine.config.lookalike.clone(),
            );
            print_json(&synthesizer.suggest(&LookalikeContext { seed_rule }).await)
        }
        Command::RunCampaign {
            customers,
            rule,
            template,
            name,
            success_rate,
        } => {
            engine.load_customers(&customers)?;
            let rule = engine.rule(&rule)?;
            let owner = Uuid::new_v4();
            let segments = engine.segments();
            let segment = segments.create(NewSegment::new(format!("{name} audience"), rule, owner)).await?;

            let rate = success_rate.unwrap_or(engine.config.campaigns.simulated_success_rate);
            let orchestrator = CampaignOrchestrator::new(
                Arc::new(CampaignStore::new()),
                segments,
                Arc::new(SimulatedVendor::new(rate)),
                noop_sink(),
                engine.clock.clone(),
                engine.config.campaigns.clone(),
            );
            let campaign = orchestrator
                .create_campaign(NewCampaign {
                    name,
                    segment_id: segment.id,
                    message_template: template,
                    created_by: owner,
                })
                .await?;
            orchestrator.launch(campaign.id)?;
            let campaign = orchestrator.execute(campaign.id).await?;
            let logs = orchestrator.store().logs_for(campaign.id);
            print_json(&CampaignReport { campaign, logs })
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries command output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "crm_engine=info,crm_segmentation=info,crm_campaigns=info".into()),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();

    let mut config = AppConfig::load_from(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });
    if let Some(node_id) = &cli.node_id {
        config.node_id = node_id.clone();
    }

    info!(
        node_id = %config.node_id,
        max_materialized_rows = config.segmentation.max_materialized_rows,
        query_timeout_ms = config.segmentation.query_timeout_ms,
        "Configuration loaded"
    );

    run(cli, config).await
}
