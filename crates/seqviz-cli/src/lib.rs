//! `seqviz` command surface.
//!
//! Each workflow subcommand opens the `SQLite` document store, runs one
//! simulated workflow against a fresh controller and prints the result. Step
//! transitions are rendered to stderr as they happen; stdout carries only the
//! final result so it can be piped.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use parking_lot::Mutex;
use seqviz_core::{ControllerConfig, ControllerHandle, EngineSnapshot, Step, StepStatus};
use seqviz_driver::{
    AuthMode, CartAction, Credentials, DriverConfig, DriverError, LoopControl, LoopRunner,
    WorkflowDriver, WorkflowReport,
};
use seqviz_shop::{Category, Product, Shop, User};
use seqviz_store_sqlite::SqliteDocumentStore;
use seqviz_telemetry::{HttpTelemetrySink, TelemetrySink, TracingTelemetrySink};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{oneshot, watch};

#[derive(Debug, Parser)]
#[command(name = "seqviz")]
#[command(about = "Step-by-step sequence visualizer for simulated storefront workflows")]
pub struct Cli {
    #[arg(long, default_value = "./seqviz.sqlite3")]
    db: PathBuf,

    #[arg(long, default_value_t = 300)]
    step_delay_ms: u64,

    #[arg(long, default_value_t = 3500)]
    loop_delay_ms: u64,

    /// POST telemetry events here instead of logging them.
    #[arg(long)]
    telemetry_url: Option<String>,

    #[arg(long, default_value_t = 2000)]
    telemetry_timeout_ms: u64,

    #[arg(long)]
    no_telemetry: bool,

    /// Keep at most this many archived runs (at least 1).
    #[arg(long, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    history_capacity: Option<usize>,

    /// Used when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print the full result document instead of a one-line summary.
    #[arg(long)]
    json: bool,

    /// Do not render the step timeline on stderr.
    #[arg(long)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Login(LoginArgs),
    Signup(SignupArgs),
    Search {
        query: String,
    },
    Purchase {
        product_id: String,
    },
    Cart {
        #[command(subcommand)]
        command: CartCommand,
    },
    Filter {
        #[arg(value_enum)]
        category: CategoryArg,
    },
    Logout,
    /// List the catalog without running a workflow.
    Products {
        #[arg(long, value_enum)]
        category: Option<CategoryArg>,
    },
    /// Scripted tour: search, filter, cart add, purchase, logout.
    Demo(DemoArgs),
}

#[derive(Debug, Args)]
pub struct LoginArgs {
    #[arg(long, default_value = seqviz_shop::DEMO_EMAIL)]
    email: String,
    #[arg(long, default_value = seqviz_shop::DEMO_PASSWORD)]
    password: String,
}

#[derive(Debug, Args)]
pub struct SignupArgs {
    #[arg(long)]
    email: String,
    #[arg(long)]
    password: String,
    #[arg(long)]
    name: String,
}

#[derive(Debug, Subcommand)]
pub enum CartCommand {
    Add { product_id: String },
    Remove { product_id: String },
}

#[derive(Debug, Args)]
pub struct DemoArgs {
    /// Repeat the tour until interrupted or `--iterations` is reached.
    #[arg(long = "loop")]
    looping: bool,
    #[arg(long)]
    iterations: Option<usize>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CategoryArg {
    Laptops,
    Mobiles,
    Accessories,
    Wearables,
}

impl From<CategoryArg> for Category {
    fn from(value: CategoryArg) -> Self {
        match value {
            CategoryArg::Laptops => Self::Laptops,
            CategoryArg::Mobiles => Self::Mobiles,
            CategoryArg::Accessories => Self::Accessories,
            CategoryArg::Wearables => Self::Wearables,
        }
    }
}

/// Execute a parsed command line.
///
/// # Errors
/// Returns an error when the store cannot be opened, the telemetry URL is
/// invalid, a product id is unknown, or output cannot be serialized.
pub fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(&cli.log_level);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    runtime.block_on(run_command(cli))
}

fn init_tracing(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_err()
    {
        tracing::debug!("tracing subscriber already installed");
    }
}

fn open_shop(cli: &Cli) -> Result<Shop> {
    let store = SqliteDocumentStore::open(&cli.db)?;
    store.migrate()?;
    Ok(Shop::open(Box::new(store)))
}

fn build_driver(cli: &Cli, shop: Shop) -> Result<WorkflowDriver> {
    let telemetry: Arc<dyn TelemetrySink> = match &cli.telemetry_url {
        Some(url) => Arc::new(HttpTelemetrySink::new(
            url,
            Duration::from_millis(cli.telemetry_timeout_ms),
        )?),
        None => Arc::new(TracingTelemetrySink),
    };
    let config = DriverConfig {
        step_delay: Duration::from_millis(cli.step_delay_ms),
        loop_delay: Duration::from_millis(cli.loop_delay_ms),
        telemetry_enabled: !cli.no_telemetry,
    };
    let controller = ControllerHandle::new(&ControllerConfig {
        history_capacity: cli.history_capacity,
    });
    Ok(WorkflowDriver::new(
        controller,
        Arc::new(Mutex::new(shop)),
        telemetry,
        config,
    ))
}

async fn run_command(cli: Cli) -> Result<()> {
    let shop = open_shop(&cli)?;

    if let Command::Products { category } = &cli.command {
        let products: Vec<Product> = match category {
            Some(category) => shop.products_in((*category).into()),
            None => shop.products().to_vec(),
        };
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&products)?);
        } else {
            for product in &products {
                println!(
                    "{} {:<24} {:>6} {:<12} stock={}",
                    product.image, product.name, product.price, product.category, product.stock
                );
            }
        }
        return Ok(());
    }

    let driver = build_driver(&cli, shop)?;
    let renderer = (!cli.quiet).then(|| spawn_timeline(driver.controller().subscribe()));

    let result = dispatch(&cli, &driver).await;

    if let Some((stop, task)) = renderer {
        if stop.send(()).is_ok() {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "timeline renderer failed");
            }
        }
    }

    let output = result?;
    if cli.json {
        let document = json!({
            "result": output.result,
            "snapshot": driver.controller().snapshot(),
        });
        println!("{}", serde_json::to_string_pretty(&document)?);
    } else {
        for line in output.summary {
            println!("{line}");
        }
    }
    Ok(())
}

struct CommandOutput {
    result: Value,
    summary: Vec<String>,
}

impl CommandOutput {
    fn single<T: Serialize>(report: &WorkflowReport<T>) -> Result<Self> {
        Ok(Self {
            result: serde_json::to_value(report)?,
            summary: vec![summary_line(report)],
        })
    }
}

fn summary_line<T>(report: &WorkflowReport<T>) -> String {
    let mut line = format!(
        "{} {} sequence={}",
        report.kind,
        report.outcome.as_str(),
        report.sequence_id
    );
    if !report.archived {
        line.push_str(" (superseded)");
    }
    if let Some(error) = &report.error {
        line.push_str(&format!(" error={error}"));
    }
    line
}

fn public_user(report: WorkflowReport<User>) -> WorkflowReport<User> {
    WorkflowReport {
        value: report.value.map(|user| User {
            password: None,
            ..user
        }),
        ..report
    }
}

async fn dispatch(cli: &Cli, driver: &WorkflowDriver) -> Result<CommandOutput> {
    match &cli.command {
        Command::Login(args) => {
            let credentials = Credentials {
                email: args.email.clone(),
                password: args.password.clone(),
                name: None,
            };
            let report = driver.run_auth(AuthMode::Login, credentials).await?;
            CommandOutput::single(&public_user(report))
        }
        Command::Signup(args) => {
            let credentials = Credentials {
                email: args.email.clone(),
                password: args.password.clone(),
                name: Some(args.name.clone()),
            };
            let report = driver.run_auth(AuthMode::Signup, credentials).await?;
            CommandOutput::single(&public_user(report))
        }
        Command::Search { query } => CommandOutput::single(&driver.run_search(query).await?),
        Command::Purchase { product_id } => {
            CommandOutput::single(&driver.run_purchase(product_id).await?)
        }
        Command::Cart { command } => {
            let (action, product_id) = match command {
                CartCommand::Add { product_id } => (CartAction::Add, product_id),
                CartCommand::Remove { product_id } => (CartAction::Remove, product_id),
            };
            let product = driver
                .shop()
                .lock()
                .get_product(product_id)
                .cloned()
                .ok_or_else(|| DriverError::UnknownProduct(product_id.clone()))?;
            CommandOutput::single(&driver.run_cart(action, product).await?)
        }
        Command::Filter { category } => {
            CommandOutput::single(&driver.run_filter((*category).into()).await?)
        }
        Command::Logout => CommandOutput::single(&driver.run_logout().await?),
        Command::Demo(args) => run_demo(driver, args).await,
        Command::Products { .. } => Ok(CommandOutput {
            result: Value::Null,
            summary: Vec::new(),
        }),
    }
}

async fn run_demo(driver: &WorkflowDriver, args: &DemoArgs) -> Result<CommandOutput> {
    let control = LoopControl::new(args.looping);
    let runner = LoopRunner::new(control, driver.config().loop_delay);
    let max_iterations = if args.looping { args.iterations } else { Some(1) };
    let collected: Arc<Mutex<Vec<(Value, String)>>> = Arc::new(Mutex::new(Vec::new()));

    let iterations = runner
        .run(max_iterations, |iteration| {
            let driver = driver.clone();
            let collected = Arc::clone(&collected);
            async move {
                tracing::info!(iteration, "demo tour starting");
                let results = demo_tour(&driver).await?;
                collected.lock().extend(results);
                Ok(())
            }
        })
        .await?;

    let collected = std::mem::take(&mut *collected.lock());
    let (results, summary): (Vec<Value>, Vec<String>) = collected.into_iter().unzip();
    Ok(CommandOutput {
        result: json!({ "iterations": iterations, "runs": results }),
        summary,
    })
}

async fn demo_tour(driver: &WorkflowDriver) -> Result<Vec<(Value, String)>, DriverError> {
    fn entry<T: Serialize>(report: &WorkflowReport<T>) -> (Value, String) {
        (
            serde_json::to_value(report).unwrap_or(Value::Null),
            summary_line(report),
        )
    }

    let mut results = Vec::with_capacity(5);
    results.push(entry(&driver.run_search("neural").await?));
    results.push(entry(&driver.run_filter(Category::Mobiles).await?));

    let product = driver.shop().lock().get_product("mob-1").cloned();
    if let Some(product) = product {
        results.push(entry(&driver.run_cart(CartAction::Add, product).await?));
    }
    results.push(entry(&driver.run_purchase("mob-1").await?));
    results.push(entry(&driver.run_logout().await?));
    Ok(results)
}

fn spawn_timeline(
    mut updates: watch::Receiver<EngineSnapshot>,
) -> (oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let mut seen = updates.borrow_and_update().clone();
        loop {
            tokio::select! {
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let next = updates.borrow_and_update().clone();
                    for line in timeline_lines(&seen, &next) {
                        eprintln!("{line}");
                    }
                    seen = next;
                }
                _ = &mut stop_rx => {
                    let next = updates.borrow().clone();
                    for line in timeline_lines(&seen, &next) {
                        eprintln!("{line}");
                    }
                    break;
                }
            }
        }
    });
    (stop_tx, task)
}

/// Lines describing what changed between two published snapshots.
///
/// Snapshots may be coalesced by the channel, so this diffs whole states
/// rather than assuming one transition per update.
#[must_use]
pub fn timeline_lines(previous: &EngineSnapshot, next: &EngineSnapshot) -> Vec<String> {
    let mut lines = Vec::new();

    // Several runs can terminate between two observed snapshots; render every
    // newly archived one, oldest first.
    let seen_head = previous.history.first().map(|entry| entry.sequence_id);
    let archived: Vec<_> = next
        .history
        .iter()
        .take_while(|entry| Some(entry.sequence_id) != seen_head)
        .collect();

    for entry in archived.into_iter().rev() {
        let before = (previous.sequence_id == Some(entry.sequence_id)).then_some(previous.steps.as_slice());
        if before.is_none() {
            lines.push(format!(
                "▶ {} started ({} steps) [{}]",
                entry.kind,
                entry.steps.len(),
                entry.sequence_id
            ));
        }
        push_step_changes(&mut lines, before, &entry.steps);
        lines.push(format!(
            "■ {} {} [{}]",
            entry.kind,
            entry.outcome.as_str(),
            entry.sequence_id
        ));
    }

    if let (Some(id), Some(kind)) = (next.sequence_id, next.kind.as_deref()) {
        let before = (previous.sequence_id == Some(id)).then_some(previous.steps.as_slice());
        if before.is_none() {
            lines.push(format!("▶ {kind} started ({} steps) [{id}]", next.steps.len()));
        }
        push_step_changes(&mut lines, before, &next.steps);
    }

    lines
}

fn push_step_changes(lines: &mut Vec<String>, before: Option<&[Step]>, after: &[Step]) {
    let total = after.len();
    for (index, step) in after.iter().enumerate() {
        let seen = before.and_then(|steps| steps.get(index)).map(|step| step.status);
        if seen == Some(step.status) {
            continue;
        }
        if let Some(line) = step_line(index, total, step) {
            lines.push(line);
        }
    }
}

fn step_line(index: usize, total: usize, step: &Step) -> Option<String> {
    let position = format!("[{}/{total}]", index + 1);
    match step.status {
        StepStatus::Pending => None,
        StepStatus::Active => {
            let route = match &step.target {
                Some(target) => format!("{} ⇢ {target}", step.source),
                None => step.source.clone(),
            };
            Some(format!("  → {position} {} · {route} {}", step.label, step.action))
        }
        StepStatus::Completed => Some(match step.duration_ms() {
            Some(ms) => format!("  ✔ {position} {} ({ms} ms)", step.label),
            None => format!("  ✔ {position} {}", step.label),
        }),
        StepStatus::Error => {
            let error = step
                .payload
                .as_ref()
                .and_then(|payload| payload.get("error"))
                .and_then(Value::as_str)
                .unwrap_or("failed");
            Some(format!("  ✖ {position} {}: {error}", step.label))
        }
    }
}
