//! docflow CLI: dispatcher daemon, one-shot dispatch, and workflow starts.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use docflow::clock::SystemClock;
use docflow::config::Config;
use docflow::coord::Coordination;
use docflow::db::{Db, PgmqQueue};
use docflow::engine::{Dispatcher, WorkflowEngine};
use docflow::model::NewInvocation;
use docflow::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
use docflow::workflows::{builtin_catalog, maintenance};
use secrecy::ExposeSecret;

#[derive(Parser)]
#[command(name = "docflow", about = "Durable step workflows for a shared document")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatcher loop until interrupted
    Serve,
    /// Dispatch at most one queued invocation, then exit
    Dispatch,
    /// Enqueue the first step of a workflow
    Start {
        /// Workflow name
        workflow: String,
        /// First step name
        step: String,
        /// JSON parameters
        #[arg(long)]
        params: Option<String>,
        /// Priority (higher = more urgent)
        #[arg(long, default_value_t = 0)]
        priority: i32,
    },
    /// Run one step directly from a host trigger message
    /// (`{"type":"RUN_STEP","workflowName":..,"stepName":..,"params":..}`)
    RunStep {
        /// The trigger message as JSON
        message: String,
    },
    /// Enqueue the cache purge for the current hour
    Purge,
    /// Check the database and report queue depth
    Health,
}

struct App {
    engine: WorkflowEngine,
    db: Arc<Db>,
    telemetry: TelemetryGuard,
}

async fn setup() -> anyhow::Result<App> {
    let config = Config::from_env()?;

    let telemetry = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "docflow".to_string(),
        default_filter: config.log_level.clone(),
    })?;

    let db = Arc::new(Db::connect(config.database_url.expose_secret()).await?);
    db.migrate().await?;

    let coordination = &config.coordination;
    let queue = PgmqQueue::new(
        Arc::clone(&db),
        coordination.queue_name.clone(),
        coordination.visibility_timeout_seconds,
    );
    queue.create().await?;

    let coord = Coordination::new(
        db.clone(),
        db.clone(),
        Arc::new(SystemClock),
        coordination.clone(),
    );
    let engine = WorkflowEngine::new(
        Arc::new(queue),
        coord,
        Arc::new(builtin_catalog(db.clone())),
    );

    Ok(App {
        engine,
        db,
        telemetry,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let app = setup().await?;

    match cli.command {
        Command::Serve => cmd_serve(&app).await,
        Command::Dispatch => cmd_dispatch(&app).await,
        Command::Start {
            workflow,
            step,
            params,
            priority,
        } => cmd_start(&app, workflow, step, params, priority).await,
        Command::RunStep { message } => cmd_run_step(&app, &message).await,
        Command::Purge => {
            let invocation = maintenance::start(&app.engine).await?;
            println!("Enqueued: {} ({}/{})", invocation.id, invocation.workflow, invocation.step);
            Ok(())
        }
        Command::Health => cmd_health(&app).await,
    }
}

async fn cmd_serve(app: &App) -> anyhow::Result<()> {
    let dispatcher = Dispatcher::new(app.engine.clone());

    let ctrl = dispatcher.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        ctrl.shutdown();
    });

    dispatcher.run().await?;
    Ok(())
}

async fn cmd_dispatch(app: &App) -> anyhow::Result<()> {
    let dispatcher = Dispatcher::new(app.engine.clone());
    let report = dispatcher.dispatch_next().await?;
    println!("{}", report.as_str());
    app.telemetry.force_flush();
    Ok(())
}

async fn cmd_run_step(app: &App, message: &str) -> anyhow::Result<()> {
    let message: serde_json::Value = serde_json::from_str(message)?;
    let dispatcher = Dispatcher::new(app.engine.clone());
    let report = dispatcher.dispatch_message(message).await;
    println!("{}", report.as_str());
    app.telemetry.force_flush();
    Ok(())
}

async fn cmd_start(
    app: &App,
    workflow: String,
    step: String,
    params: Option<String>,
    priority: i32,
) -> anyhow::Result<()> {
    let params: serde_json::Value = match params {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::json!({}),
    };

    let invocation = app
        .engine
        .enqueue(
            NewInvocation::new(&workflow, &step)
                .params(params)
                .priority(priority)
                .queued_by("cli"),
        )
        .await?;

    println!("Enqueued: {} ({workflow}/{step})", invocation.id);
    Ok(())
}

async fn cmd_health(app: &App) -> anyhow::Result<()> {
    app.db.health_check().await?;
    let depth = app.engine.queue().len().await?;
    let registry = app.engine.register_all_workflows()?;

    println!("Database:   ok");
    println!("Queue:      {depth} waiting");
    println!("Workflows:");
    for (workflow, step) in registry.pairs() {
        println!("  {workflow}/{step}");
    }
    Ok(())
}
