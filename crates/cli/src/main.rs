mod snapshot;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use snapshot::{RecordRow, Snapshot, Stores};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use visit_core::catalog::import_template_dir;
use visit_core::config::{
    bool_from_env_value, duration_ms_from_env_value, resolve_template_dir,
    transition_policy_from_env_value, usize_from_env_value,
};
use visit_core::constants::{
    DEFAULT_USAGE_QUEUE_CAPACITY, DEFAULT_USAGE_TIMEOUT, DEFAULT_USAGE_WORKERS,
};
use visit_core::{
    merge, ActorId, ClinicalRecord, CopyRequest, CoreConfig, Document, FromTemplateRequest,
    MutationOutcome, MutationWarning, PatientId, RecordDraft, RecordId, RecordMutationEngine,
    RecordPatch, RequestContext, TemplateId, VersionExpectation, VisitDetails, WireEnum,
};

#[derive(Parser)]
#[command(name = "visit")]
#[command(about = "Clinical visit record CLI")]
struct Cli {
    /// Snapshot file holding records, templates and access grants
    #[arg(long, default_value = "visit-store.json")]
    store: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deep-merge two JSON documents and print the result
    Merge {
        /// Existing document (JSON file)
        existing: PathBuf,
        /// Update document (JSON file)
        update: PathBuf,
    },
    /// Create a visit record
    Create {
        #[arg(long)]
        patient: String,
        #[arg(long)]
        actor: String,
        /// Visit start (RFC 3339)
        #[arg(long)]
        started_at: DateTime<Utc>,
        /// Visit end (RFC 3339)
        #[arg(long)]
        ended_at: Option<DateTime<Utc>>,
        #[arg(long)]
        performed_by: String,
        #[arg(long)]
        visit_type: Option<String>,
        #[arg(long)]
        source_type: Option<String>,
        #[arg(long)]
        schedule: Option<String>,
        /// Initial content (JSON file)
        #[arg(long)]
        content: Option<PathBuf>,
    },
    /// Update a visit record
    Update {
        #[arg(long)]
        patient: String,
        #[arg(long)]
        record: String,
        #[arg(long)]
        actor: String,
        /// Version the edit is based on
        #[arg(long, conflicts_with = "overwrite")]
        expected_version: Option<i64>,
        /// Write without checking the version
        #[arg(long)]
        overwrite: bool,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        visit_type: Option<String>,
        #[arg(long)]
        performed_by: Option<String>,
        /// Visit end (RFC 3339)
        #[arg(long)]
        ended_at: Option<DateTime<Utc>>,
        /// Partial content to deep-merge (JSON file)
        #[arg(long)]
        content: Option<PathBuf>,
    },
    /// Show a visit record
    Show {
        #[arg(long)]
        patient: String,
        #[arg(long)]
        record: String,
        #[arg(long)]
        actor: String,
    },
    /// List a patient's visit records, newest first
    List {
        #[arg(long)]
        patient: String,
        #[arg(long)]
        actor: String,
    },
    /// Soft-delete a visit record
    Delete {
        #[arg(long)]
        patient: String,
        #[arg(long)]
        record: String,
        #[arg(long)]
        actor: String,
    },
    /// Copy a visit record, optionally to another patient
    Copy {
        #[arg(long)]
        source_patient: String,
        #[arg(long)]
        record: String,
        #[arg(long)]
        target_patient: String,
        #[arg(long)]
        actor: String,
        /// Modifications to deep-merge (JSON file)
        #[arg(long)]
        content: Option<PathBuf>,
    },
    /// Create a visit record from a content template
    FromTemplate {
        #[arg(long)]
        template: String,
        #[arg(long)]
        patient: String,
        #[arg(long)]
        actor: String,
        /// Overrides to deep-merge over the skeleton (JSON file)
        #[arg(long)]
        content: Option<PathBuf>,
    },
    /// Allow an actor to access a patient's records
    Grant {
        #[arg(long)]
        actor: String,
        #[arg(long)]
        patient: String,
    },
    /// Load template definitions from a directory of YAML files
    ImportTemplates {
        /// Template directory (defaults to VISIT_TEMPLATE_DIR or ./templates)
        dir: Option<PathBuf>,
    },
}

/// Reads `VISIT_*` settings once at startup.
fn config_from_env() -> anyhow::Result<CoreConfig> {
    let var = |name: &str| std::env::var(name).ok();

    let template_dir = resolve_template_dir(var("VISIT_TEMPLATE_DIR").map(PathBuf::from))?;
    let cfg = CoreConfig::new(
        template_dir,
        usize_from_env_value(
            "VISIT_USAGE_QUEUE_CAPACITY",
            var("VISIT_USAGE_QUEUE_CAPACITY"),
            DEFAULT_USAGE_QUEUE_CAPACITY,
        )?,
        usize_from_env_value(
            "VISIT_USAGE_WORKERS",
            var("VISIT_USAGE_WORKERS"),
            DEFAULT_USAGE_WORKERS,
        )?,
        duration_ms_from_env_value(
            "VISIT_USAGE_TIMEOUT_MS",
            var("VISIT_USAGE_TIMEOUT_MS"),
            DEFAULT_USAGE_TIMEOUT,
        )?,
        bool_from_env_value(
            "VISIT_ALLOW_BLIND_OVERWRITE",
            var("VISIT_ALLOW_BLIND_OVERWRITE"),
            true,
        )?,
        transition_policy_from_env_value(var("VISIT_TRANSITION_POLICY"))?,
    )?;
    Ok(cfg)
}

fn read_document(path: &Path) -> anyhow::Result<Document> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Document::parse(&text).with_context(|| format!("{} is not valid JSON", path.display()))
}

fn read_optional_document(path: Option<&Path>) -> anyhow::Result<Option<Document>> {
    path.map(read_document).transpose()
}

fn print_record(record: ClinicalRecord) -> anyhow::Result<()> {
    let row = RecordRow::from(record);
    println!("{}", serde_json::to_string_pretty(&row)?);
    Ok(())
}

fn print_outcome(outcome: MutationOutcome) -> anyhow::Result<()> {
    for warning in &outcome.warnings {
        match warning {
            MutationWarning::ExistingContentUnreadable => eprintln!(
                "warning: stored content was unreadable and has been replaced by the supplied content"
            ),
        }
    }
    print_record(outcome.record)
}

/// Cancels the returned token on Ctrl-C so an in-flight store call is abandoned.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted; cancelling request");
            trigger.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("visit=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    if let Commands::Merge { existing, update } = &cli.command {
        let merged = merge(&read_document(existing)?, &read_document(update)?);
        println!("{}", serde_json::to_string_pretty(&merged)?);
        return Ok(());
    }

    let cfg = Arc::new(config_from_env()?);
    let stores = Snapshot::load(&cli.store)?.into_stores()?;
    let engine = RecordMutationEngine::new(
        stores.records.clone(),
        stores.templates.clone(),
        stores.gate.clone(),
        Arc::clone(&cfg),
    );
    let ctx = RequestContext::with_cancellation(cancel_on_ctrl_c());

    let mutated = run(cli.command, &engine, &stores, &cfg, &ctx).await;
    engine.shutdown().await;

    if mutated? {
        Snapshot::capture(&stores)?.save(&cli.store)?;
        tracing::debug!(path = %cli.store.display(), "snapshot saved");
    }
    Ok(())
}

/// Runs one command. Returns whether the stores changed.
async fn run(
    command: Commands,
    engine: &RecordMutationEngine,
    stores: &Stores,
    cfg: &CoreConfig,
    ctx: &RequestContext,
) -> anyhow::Result<bool> {
    match command {
        Commands::Merge { .. } => Ok(false),
        Commands::Create {
            patient,
            actor,
            started_at,
            ended_at,
            performed_by,
            visit_type,
            source_type,
            schedule,
            content,
        } => {
            let draft = RecordDraft {
                visit_started_at: Some(started_at),
                visit_ended_at: ended_at,
                visit_type,
                performed_by: Some(performed_by),
                source_type,
                schedule_id: schedule,
                content: read_optional_document(content.as_deref())?,
            };
            let outcome = engine
                .create(ctx, &PatientId::parse(&patient)?, draft, &ActorId::new(actor)?)
                .await?;
            print_outcome(outcome)?;
            Ok(true)
        }
        Commands::Update {
            patient,
            record,
            actor,
            expected_version,
            overwrite,
            status,
            visit_type,
            performed_by,
            ended_at,
            content,
        } => {
            if expected_version.is_none() && !overwrite {
                bail!("pass exactly one of --expected-version or --overwrite");
            }
            let expectation = VersionExpectation::from_optional(expected_version);
            let patch = RecordPatch {
                visit_ended_at: ended_at,
                visit_type,
                performed_by,
                status,
                content: read_optional_document(content.as_deref())?,
                ..Default::default()
            };
            let outcome = engine
                .update(
                    ctx,
                    &PatientId::parse(&patient)?,
                    &RecordId::parse(&record)?,
                    patch,
                    expectation,
                    &ActorId::new(actor)?,
                )
                .await?;
            print_outcome(outcome)?;
            Ok(true)
        }
        Commands::Show {
            patient,
            record,
            actor,
        } => {
            let record = engine
                .get(
                    ctx,
                    &PatientId::parse(&patient)?,
                    &RecordId::parse(&record)?,
                    &ActorId::new(actor)?,
                )
                .await?;
            print_record(record)?;
            Ok(false)
        }
        Commands::List { patient, actor } => {
            let records = engine
                .list(ctx, &PatientId::parse(&patient)?, &ActorId::new(actor)?)
                .await?;
            if records.is_empty() {
                println!("No records found.");
            }
            for record in records {
                println!(
                    "{}  {}  {:<13}  {:<11}  v{}",
                    record.record_id,
                    record.visit_started_at.to_rfc3339(),
                    record.visit_type.as_str(),
                    record.status.as_str(),
                    record.version
                );
            }
            Ok(false)
        }
        Commands::Delete {
            patient,
            record,
            actor,
        } => {
            let outcome = engine
                .delete(
                    ctx,
                    &PatientId::parse(&patient)?,
                    &RecordId::parse(&record)?,
                    &ActorId::new(actor)?,
                )
                .await?;
            println!(
                "Deleted record {} (version {})",
                outcome.record.record_id, outcome.record.version
            );
            Ok(true)
        }
        Commands::Copy {
            source_patient,
            record,
            target_patient,
            actor,
            content,
        } => {
            let request = CopyRequest {
                source_patient_id: PatientId::parse(&source_patient)?,
                source_record_id: RecordId::parse(&record)?,
                target_patient_id: PatientId::parse(&target_patient)?,
                modifications: read_optional_document(content.as_deref())?,
                details: VisitDetails::default(),
            };
            let outcome = engine.copy(ctx, request, &ActorId::new(actor)?).await?;
            print_outcome(outcome)?;
            Ok(true)
        }
        Commands::FromTemplate {
            template,
            patient,
            actor,
            content,
        } => {
            let request = FromTemplateRequest {
                template_id: TemplateId::parse(&template)?,
                patient_id: PatientId::parse(&patient)?,
                overrides: read_optional_document(content.as_deref())?,
                details: VisitDetails::default(),
            };
            let outcome = engine
                .create_from_template(ctx, request, &ActorId::new(actor)?)
                .await?;
            print_outcome(outcome)?;
            Ok(true)
        }
        Commands::Grant { actor, patient } => {
            let actor = ActorId::new(actor)?;
            let patient_id = PatientId::parse(&patient)?;
            stores.gate.grant(actor.clone(), patient_id)?;
            tracing::info!(%actor, %patient_id, "access granted");
            println!("Granted {} access to patient {}", actor, patient_id);
            Ok(true)
        }
        Commands::ImportTemplates { dir } => {
            let dir = match dir.as_deref().or(cfg.template_dir()) {
                Some(dir) => dir.to_path_buf(),
                None => bail!("no template directory given and none configured"),
            };
            let count = import_template_dir(&dir, &stores.templates)?;
            println!("Imported {} template(s) from {}", count, dir.display());
            Ok(count > 0)
        }
    }
}
