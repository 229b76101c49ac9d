use anyhow::Context as _;
use clap::{Parser, Subcommand};
use kube::{core::DynamicObject, ResourceExt};
use kube_dynamic::{
    kubeconfig, Backoff, BulkOptions, ErrorClass, Handler, InputPayload, ListSelector, PatchKind,
    RetryPolicy, WatchTarget,
};
use std::{path::PathBuf, time::Duration};

#[derive(Parser)]
struct Args {
    /// Path to kubeconfig; inferred when omitted
    #[arg(long)]
    kubeconfig: Option<PathBuf>,
    /// Kubeconfig context to use
    #[arg(long)]
    context: Option<String>,
    /// Namespace; defaults to the one from the config
    #[arg(short, long)]
    namespace: Option<String>,
    /// Send requests with dryRun=All
    #[arg(long)]
    dry_run: bool,
    /// Server-side timeout for list and watch, in seconds
    #[arg(long)]
    timeout: Option<u32>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create or update every document of a manifest
    Apply {
        file: PathBuf,
        /// Error classes to skip, e.g. Invalid
        #[arg(long)]
        ignore: Vec<ErrorClass>,
    },
    /// Delete every document of a manifest
    Delete {
        file: PathBuf,
        #[arg(long)]
        ignore: Vec<ErrorClass>,
    },
    Get {
        kind: String,
        name: String,
    },
    List {
        kind: String,
        #[arg(short = 'l', long)]
        selector: Option<String>,
        #[arg(long)]
        field_selector: Option<String>,
    },
    /// Print add/modify/delete notifications until interrupted
    Watch {
        kind: String,
        #[arg(long, conflicts_with = "selector")]
        name: Option<String>,
        #[arg(short = 'l', long)]
        selector: Option<String>,
        /// Stop after this many reconnects
        #[arg(long)]
        max_reconnects: Option<u32>,
        /// Back off exponentially between reconnects, up to this many seconds
        #[arg(long)]
        max_backoff: Option<u64>,
    },
    /// Patch an object with the patch document in `file`
    Patch {
        kind: String,
        name: String,
        file: PathBuf,
        /// strategic, merge or json
        #[arg(long = "type")]
        patch_type: Option<PatchKind>,
    },
}

fn print(obj: &DynamicObject) -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(obj).context("failed to serialize object")?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    tracing::info!("Connecting to kube");
    let config = kubeconfig::load_config(args.kubeconfig.as_deref(), args.context.as_deref())
        .await
        .context("failed to load cluster config")?;
    let client = kube::Client::try_from(config).context("failed to create client")?;
    let mut handler = Handler::from_client(client).with_dry_run(args.dry_run);
    if let Some(ns) = &args.namespace {
        handler = handler.with_namespace(ns);
    }
    handler.set_timeout(args.timeout);

    let scoped = |kind: &str| {
        let handler = handler.clone();
        let kind = kind.to_string();
        async move {
            let registry = handler.registry().await?;
            handler
                .for_resource(&registry, &kind)
                .with_context(|| format!("unknown kind {}", kind))
        }
    };

    match args.command {
        Command::Apply { file, ignore } => {
            let applied = handler
                .apply_manifest(file, &BulkOptions { ignore })
                .await?;
            for obj in &applied {
                println!("{} applied", obj.name_any());
            }
        }
        Command::Delete { file, ignore } => {
            let deleted = handler
                .delete_manifest(file, &BulkOptions { ignore })
                .await?;
            println!("{} objects deleted", deleted);
        }
        Command::Get { kind, name } => {
            print(&scoped(&kind).await?.get_by_name(&name).await?)?;
        }
        Command::List {
            kind,
            selector,
            field_selector,
        } => {
            let selector = match (selector, field_selector) {
                (Some(labels), _) => ListSelector::Labels(labels),
                (None, Some(fields)) => ListSelector::Fields(fields),
                (None, None) => ListSelector::All,
            };
            for obj in scoped(&kind).await?.list(selector).await? {
                println!("{}", obj.name_any());
            }
        }
        Command::Watch {
            kind,
            name,
            selector,
            max_reconnects,
            max_backoff,
        } => {
            let target = match (name, selector) {
                (Some(name), _) => WatchTarget::Name(name),
                (None, Some(selector)) => WatchTarget::Labels(selector),
                (None, None) => WatchTarget::Labels(String::new()),
            };
            let mut policy = RetryPolicy {
                max_reconnects,
                ..Default::default()
            };
            if let Some(max) = max_backoff {
                policy = policy.with_backoff(Backoff::Exponential {
                    base: Duration::from_secs(1),
                    max: Duration::from_secs(max),
                });
            }
            let mut on_event = kube_dynamic::callbacks(
                |obj: &DynamicObject| println!("ADDED {}", obj.name_any()),
                |obj: &DynamicObject| println!("MODIFIED {}", obj.name_any()),
                |obj: &DynamicObject| println!("DELETED {}", obj.name_any()),
            );
            scoped(&kind)
                .await?
                .with_retry_policy(policy)
                .watch(target, &mut on_event)
                .await?;
        }
        Command::Patch {
            kind,
            name,
            file,
            patch_type,
        } => {
            let handler = scoped(&kind).await?;
            let current = handler.get_by_name(&name).await?;
            let patched = handler
                .patch(current, InputPayload::from(file), patch_type)
                .await?;
            print(&patched)?;
        }
    }
    Ok(())
}
