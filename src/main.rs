use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use time::OffsetDateTime;
use uuid::Uuid;

use sitebook::App;
use sitebook::config::AppConfig;
use sitebook::core::ProjectInfo;
use sitebook::core::db::{
    QueueDb, ReceiptQueueRepository, ResourceType, ServerDeleteRepository, UploadQueueEntry,
    UploadQueueRepository,
};
use sitebook::core::store::MediaType;
use sitebook::telemetry;

#[derive(Parser)]
#[command(name = "sitebook")]
#[command(about = "Offline-first construction project stores with background recovery queues")]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, global = true, default_value = "sitebook.toml")]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mount projects and drain the queues until Ctrl-C
    Run {
        /// Project to mount, as `id` or `id=name`
        #[arg(long = "project", value_name = "PROJECT")]
        projects: Vec<String>,
    },
    /// Queue a media upload for the recovery queue
    EnqueueUpload {
        #[arg(long)]
        organization: String,
        #[arg(long)]
        project: String,
        /// Item the media belongs to
        #[arg(long)]
        item: String,
        /// Local file path or file:// URI
        #[arg(long)]
        file: String,
        #[arg(long, value_enum, default_value_t = MediaArg::Photo)]
        media_type: MediaArg,
        #[arg(long, value_enum, default_value_t = ResourceArg::Photo)]
        resource_type: ResourceArg,
    },
    /// Print queue depths
    Status,
    /// Delete a project's local and remote store data
    Purge {
        #[arg(value_name = "PROJECT_ID")]
        project_id: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum MediaArg {
    Photo,
    Video,
}

impl From<MediaArg> for MediaType {
    fn from(arg: MediaArg) -> Self {
        match arg {
            MediaArg::Photo => MediaType::Photo,
            MediaArg::Video => MediaType::Video,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ResourceArg {
    Receipt,
    Invoice,
    Photo,
    Video,
}

impl From<ResourceArg> for ResourceType {
    fn from(arg: ResourceArg) -> Self {
        match arg {
            ResourceArg::Receipt => ResourceType::Receipt,
            ResourceArg::Invoice => ResourceType::Invoice,
            ResourceArg::Photo => ResourceType::Photo,
            ResourceArg::Video => ResourceType::Video,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    let config = AppConfig::from_file(&args.config)?;
    telemetry::init(&config.log.level, args.verbose);

    match args.command {
        Command::Run { projects } => run(config, projects).await,
        Command::EnqueueUpload {
            organization,
            project,
            item,
            file,
            media_type,
            resource_type,
        } => {
            let queues = QueueDb::open(config.queue_db_path()).await?;
            let entry = UploadQueueEntry {
                id: Uuid::new_v4().to_string(),
                media_type: media_type.into(),
                resource_type: resource_type.into(),
                organization_id: organization,
                project_id: project,
                item_id: item,
                local_uri: file,
                upload_date: OffsetDateTime::now_utc(),
                revision: 0,
            };
            queues.enqueue_upload(&entry).await?;
            println!("Queued upload {}", entry.id);
            queues.close().await
        }
        Command::Status => {
            let queues = QueueDb::open(config.queue_db_path()).await?;
            let uploads = queues.get_uploads().await?;
            let receipts = queues.get_receipts().await?;
            let deletes = queues.get_server_deletes().await?;
            println!("Uploads queued:        {}", uploads.len());
            println!("Receipts queued:       {}", receipts.len());
            println!("Server deletes queued: {}", deletes.len());
            if args.verbose {
                for entry in &uploads {
                    println!("  upload {} ({}) -> {}", entry.id, entry.project_id, entry.local_uri);
                }
                for entry in &receipts {
                    println!(
                        "  receipt {} from {} pending {:?}",
                        entry.id,
                        entry.from_project_id,
                        entry.pending_targets()
                    );
                }
            }
            queues.close().await
        }
        Command::Purge { project_id } => {
            let app = App::connect(config).await?;
            let result = app.controller.purge(&project_id).await;
            app.close().await?;
            if result.is_success() {
                println!("Purged project {}", project_id);
                Ok(())
            } else {
                anyhow::bail!("Purge of {} incomplete: {}", project_id, result.message)
            }
        }
    }
}

async fn run(config: AppConfig, projects: Vec<String>) -> anyhow::Result<()> {
    let app = App::connect(config).await?;
    for project in &projects {
        let (id, name) = project.split_once('=').unwrap_or((project.as_str(), project.as_str()));
        app.directory.upsert(ProjectInfo::new(id, name));
        app.registry.add([id]);
    }

    let running = app.start();
    tokio::signal::ctrl_c().await?;
    println!("Shutting down...");
    running.stop().await;
    app.close().await
}
