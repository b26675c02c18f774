use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vodmill::cli::{Cli, Commands, DiscoverArgs, ResetArgs, RunArgs, StatusArgs};
use vodmill::config::PipelineConfig;
use vodmill::database::models::{NewCollection, SelectionPredicate, Stage, StageStatus};
use vodmill::database::repositories::{
    CollectionRepository, ItemStore, PartitionRepository, SqlxCollectionRepository, SqlxItemStore,
    SqlxPartitionRepository,
};
use vodmill::database::{self, DbPool, WritePool};
use vodmill::pipeline::discovery::run_discovery;
use vodmill::pipeline::report::format_status_table;
use vodmill::pipeline::workers::{
    ExportWorker, StageWorker, SubtitleConvertWorker, SubtitleFetchWorker, SummarizeWorker,
    TranscribeWorker,
};
use vodmill::pipeline::{CommandSourceLister, Pipeline, RunOptions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = PipelineConfig::load(cli.config.as_deref())?;

    let filter = cli
        .log_filter()
        .or_else(|| config.logging.filter().map(str::to_string));
    let _guard = vodmill::logging::init_logging(Path::new(&config.logging.dir), filter.as_deref())?;

    let database_url = cli.database_url(&config);
    info!(database = %database_url, "vodmill starting");

    let read = database::init_pool(&database_url).await?;
    let write = database::init_write_pool(&database_url).await?;
    database::run_migrations(&read).await?;

    match cli.command {
        Commands::Run(args) => run_pipeline(&config, read, write, args).await,
        Commands::Discover(args) => discover(&config, read, write, args).await,
        Commands::Status(args) => status(read, write, args).await,
        Commands::Partitions => partitions(read, write).await,
        Commands::Reset(args) => reset(read, write, args).await,
    }
}

/// Token tripped by the first Ctrl-C; in-flight items finish, nothing new is
/// dispatched.
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let handle = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, letting in-flight items finish");
            handle.cancel();
        }
    });
    cancel
}

async fn register_collections(
    config: &PipelineConfig,
    collections: &dyn CollectionRepository,
) -> vodmill::Result<()> {
    for entry in &config.discovery.collections {
        let mut collection = NewCollection::new(&entry.id, &entry.url);
        if let Some(title) = &entry.title {
            collection = collection.with_title(title);
        }
        collections.upsert_collection(&collection).await?;
    }
    Ok(())
}

fn build_worker(config: &PipelineConfig, stage: Stage) -> vodmill::Result<Arc<dyn StageWorker>> {
    let worker: Arc<dyn StageWorker> = match stage {
        Stage::Acquisition => Arc::new(SubtitleFetchWorker::new(
            &config.tools.fetcher,
            &config.paths.subtitles,
            config.tools.subtitle_langs.clone(),
        )),
        Stage::Conversion => Arc::new(SubtitleConvertWorker::new(&config.paths.text)),
        Stage::Transcription => Arc::new(TranscribeWorker::new(
            &config.tools.fetcher,
            &config.tools.transcriber,
            &config.paths.media,
            &config.paths.text,
        )),
        Stage::Summarization => Arc::new(SummarizeWorker::new(
            &config.summarize.endpoint,
            &config.summarize.model,
            config.summarize.api_key(),
            &config.summarize.prompt,
        )?),
        Stage::Export => Arc::new(ExportWorker::new(
            &config.tools.uploader,
            config.tools.remote_target(),
        )),
    };
    Ok(worker)
}

async fn run_pipeline(
    config: &PipelineConfig,
    read: DbPool,
    write: WritePool,
    args: RunArgs,
) -> anyhow::Result<()> {
    config.ensure_directories()?;

    let catalog: Arc<dyn ItemStore> = Arc::new(SqlxItemStore::catalog(read.clone(), write.clone()));
    let collections: Arc<dyn CollectionRepository> =
        Arc::new(SqlxCollectionRepository::new(read.clone(), write.clone()));
    let partitions = Arc::new(SqlxPartitionRepository::new(read, write));
    let lister = Arc::new(CommandSourceLister::new(&config.tools.fetcher));

    register_collections(config, collections.as_ref()).await?;

    let mut runner_config = config.stages.runner_config();
    if let Some(concurrency) = args.concurrency {
        runner_config.concurrency = concurrency;
    }
    if let Some(retry_limit) = args.retry_limit {
        runner_config.retry_limit = retry_limit;
    }
    if let Some(timeout_secs) = args.timeout_secs {
        runner_config.timeout_secs = timeout_secs;
    }

    let mut skipped_stages = Vec::new();
    let mut stage_limits = Vec::new();
    for stage in Stage::ALL {
        let toggle = config.stages.toggle(stage);
        if toggle.skip || args.skips(stage) {
            skipped_stages.push(stage);
        }
        if let Some(limit) = args.limit_for(stage).or_else(|| toggle.limit()) {
            stage_limits.push((stage, limit));
        }
    }

    let options = RunOptions {
        job: args.job.clone(),
        resume: args.resume,
        predicate: SelectionPredicate {
            collections: args.collections.clone(),
            title_keyword: args
                .keyword
                .clone()
                .or_else(|| config.discovery.keyword.clone()),
        },
        skip_discovery: args.skip_discovery || config.stages.discovery.skip,
        discovery_limit: args.limit_discovery.or_else(|| config.stages.discovery.limit()),
        skipped_stages,
        stage_limits,
        halt_on_error: args.halt_on_error,
        keep_going: args.keep_going,
    };

    let mut pipeline = Pipeline::new(
        catalog,
        collections,
        partitions,
        lister,
        &config.paths.export,
    )
    .with_runner_config(runner_config)
    .with_cancellation(interrupt_token());
    for stage in Stage::ALL {
        if options.skips(stage) {
            continue;
        }
        pipeline = pipeline.with_worker(stage, build_worker(config, stage)?);
    }

    let report = pipeline.run(&options).await?;
    print!("{}", report.render());

    if report.has_systemic_failure() {
        bail!("run finished with a systemic stage failure, see the report above");
    }
    Ok(())
}

async fn discover(
    config: &PipelineConfig,
    read: DbPool,
    write: WritePool,
    args: DiscoverArgs,
) -> anyhow::Result<()> {
    let catalog = SqlxItemStore::catalog(read.clone(), write.clone());
    let collections = SqlxCollectionRepository::new(read, write);
    register_collections(config, &collections).await?;

    let lister = CommandSourceLister::new(&config.tools.fetcher);
    let stats = run_discovery(&catalog, &collections, &lister, args.limit).await?;
    println!(
        "listed {} items from {} collections ({} failed), {} new or refreshed",
        stats.listed, stats.collections, stats.failed_collections, stats.upserted
    );
    Ok(())
}

/// The catalog, or the job's newest partition.
async fn resolve_store(
    read: &DbPool,
    write: &WritePool,
    job: Option<&str>,
) -> anyhow::Result<Arc<dyn ItemStore>> {
    match job {
        None => Ok(Arc::new(SqlxItemStore::catalog(
            read.clone(),
            write.clone(),
        ))),
        Some(job) => {
            let partitions = SqlxPartitionRepository::new(read.clone(), write.clone());
            let partition = partitions
                .latest(job)
                .await?
                .with_context(|| format!("job '{job}' has no partition"))?;
            Ok(Arc::new(partitions.store_for(&partition)))
        }
    }
}

async fn status(read: DbPool, write: WritePool, args: StatusArgs) -> anyhow::Result<()> {
    let store = resolve_store(&read, &write, args.job.as_deref()).await?;
    let table = format_status_table(store.as_ref()).await?;
    print!("{table}");
    Ok(())
}

async fn partitions(read: DbPool, write: WritePool) -> anyhow::Result<()> {
    let repo = SqlxPartitionRepository::new(read, write);
    let all = repo.list().await?;
    if all.is_empty() {
        println!("no partitions registered");
        return Ok(());
    }
    println!(
        "{:<42} {:<20} {:>8}  {}",
        "partition", "job", "items", "created"
    );
    for partition in &all {
        let items = repo.item_count(partition).await?;
        println!(
            "{:<42} {:<20} {:>8}  {}",
            partition.name, partition.job_name, items, partition.created_at
        );
    }
    Ok(())
}

async fn reset(read: DbPool, write: WritePool, args: ResetArgs) -> anyhow::Result<()> {
    let store = resolve_store(&read, &write, args.job.as_deref()).await?;
    // Back to PENDING means a fresh start, so the attempt budget resets too.
    let clear_attempts = args.to == StageStatus::Pending;
    let changed = store
        .reset_stage(args.stage, &args.from, args.to, clear_attempts)
        .await?;
    println!(
        "moved {changed} items to {} for stage {} in {}",
        args.to,
        args.stage,
        store.table()
    );
    Ok(())
}
