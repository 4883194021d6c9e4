use anyhow::Result;
use cardfeed_sync::{RunOptions, RunSummary};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cardfeed")]
#[command(about = "Budgeted, resumable harvester for card catalog and listing sources")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct HarvestArgs {
    /// Source category to harvest (e.g. 3 for Pokemon).
    #[arg(long, default_value_t = 3)]
    category: i64,
    /// Upper bound on groups (sets) to process this run.
    #[arg(long)]
    max_sets: Option<usize>,
    /// Resume offset: skip this many groups from the newest-first order.
    #[arg(long, default_value_t = 0)]
    skip_sets: usize,
    /// Hard budget on external API calls before a clean stop.
    #[arg(long)]
    max_api_calls: Option<u32>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Harvest catalog groups, products, and price variants.
    Catalog(HarvestArgs),
    /// Harvest graded listings from the search source.
    Listings {
        #[command(flatten)]
        harvest: HarvestArgs,
        /// Leading cards searched per group.
        #[arg(long)]
        cards_per_set: Option<usize>,
        /// Result limit per search query.
        #[arg(long)]
        per_search_limit: Option<u32>,
    },
}

fn print_summary(summary: &RunSummary) {
    println!(
        "{} harvest {}: groups={} seen={} skipped={} written={} calls={}",
        summary.kind,
        summary.run_id,
        summary.groups_processed,
        summary.records_seen,
        summary.records_skipped,
        summary.records_written,
        summary.calls_made,
    );
    // Budget exhaustion is a clean stop, not a failure: print the resume
    // instructions and exit 0.
    if let Some(hint) = summary.resume_hint() {
        println!("{hint}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Catalog(args) => {
            let opts = RunOptions {
                max_sets: args.max_sets,
                skip_sets: args.skip_sets,
                max_api_calls: args.max_api_calls,
                ..Default::default()
            };
            let summary = cardfeed_sync::run_catalog_from_env(args.category, opts).await?;
            print_summary(&summary);
        }
        Commands::Listings {
            harvest,
            cards_per_set,
            per_search_limit,
        } => {
            let opts = RunOptions {
                max_sets: harvest.max_sets,
                skip_sets: harvest.skip_sets,
                max_api_calls: harvest.max_api_calls,
                cards_per_set,
                per_search_limit,
            };
            let summary = cardfeed_sync::run_listings_from_env(harvest.category, opts).await?;
            print_summary(&summary);
        }
    }
    Ok(())
}
