use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use intakeflow::config::IntakeConfig;
use intakeflow::flows::answers::AnswerValue;
use intakeflow::flows::db::{KeyValueStore, SqliteStore};
use intakeflow::flows::draft::DraftAdapter;
use intakeflow::flows::medicare::validate_medicare;
use intakeflow::flows::session::{FlowSession, MountOutcome, RecoveryChoice};
use intakeflow::flows::state::{AuthContext, BlockedReason, FlowError, FlowInstance, Navigation};
use intakeflow::flows::submit::HttpCheckoutClient;
use intakeflow::flows::types::FlowDefinition;
use intakeflow::flows::{self, sequencer};
use intakeflow::observability;

#[derive(Parser, Debug)]
#[command(name = "intakeflow", version, about = "Telehealth intake flow controller")]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print Prometheus counters after the command
    #[arg(long, global = true)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List flows with their steps, stages and time estimates
    Flows,
    /// Validate a directory of flow TOML files
    Check { dir: PathBuf },
    /// Validate a Medicare card number
    Medicare { number: String },
    /// Replay answers through a flow and print the step path
    Simulate {
        flow: String,
        #[arg(long)]
        answers: PathBuf,
        #[command(flatten)]
        auth: AuthArgs,
    },
    /// Inspect or delete stored drafts
    Draft {
        #[command(subcommand)]
        action: DraftAction,
    },
    /// Replay answers, then hand them to the checkout endpoint
    Submit {
        flow: String,
        #[arg(long)]
        answers: PathBuf,
        #[command(flatten)]
        auth: AuthArgs,
    },
}

#[derive(Subcommand, Debug)]
enum DraftAction {
    /// Print the stored draft for a flow
    Show { flow: String },
    /// Delete the stored draft for a flow
    Clear { flow: String },
    /// List every stored key
    List,
}

#[derive(clap::Args, Debug)]
struct AuthArgs {
    /// Treat the patient as signed in
    #[arg(long)]
    authenticated: bool,
    /// Signed in but without a stored profile yet
    #[arg(long, requires = "authenticated")]
    needs_onboarding: bool,
}

impl AuthArgs {
    fn context(&self) -> AuthContext {
        if self.authenticated {
            AuthContext::signed_in("cli-patient", self.needs_onboarding)
        } else {
            AuthContext::anonymous()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = IntakeConfig::load(cli.config.as_deref())?;
    observability::init_tracing(&config.logging.level);

    match cli.command {
        Command::Flows => list_flows(&config)?,
        Command::Check { ref dir } => check_dir(dir)?,
        Command::Medicare { ref number } => match validate_medicare(number) {
            Ok(normalized) => println!("valid: {normalized}"),
            Err(e) => bail!("invalid Medicare number: {e}"),
        },
        Command::Simulate {
            ref flow,
            ref answers,
            ref auth,
        } => simulate(&config, flow, answers, &auth.context())?,
        Command::Draft { ref action } => draft(&config, action)?,
        Command::Submit {
            ref flow,
            ref answers,
            ref auth,
        } => submit(&config, flow, answers, &auth.context()).await?,
    }

    if cli.metrics {
        print!("{}", observability::metrics().render()?);
    }
    Ok(())
}

fn load_definitions(config: &IntakeConfig) -> Result<HashMap<String, FlowDefinition>> {
    flows::load_all(config.flows_dir().as_deref())
}

fn find_flow(config: &IntakeConfig, name: &str) -> Result<Arc<FlowDefinition>> {
    let mut defs = load_definitions(config)?;
    match defs.remove(name) {
        Some(def) => Ok(Arc::new(def)),
        None => {
            let mut known: Vec<_> = defs.into_keys().collect();
            known.sort();
            bail!("unknown flow '{name}' (available: {})", known.join(", "))
        }
    }
}

fn read_answers(path: &Path) -> Result<BTreeMap<String, AnswerValue>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

fn list_flows(config: &IntakeConfig) -> Result<()> {
    let defs = load_definitions(config)?;
    let mut names: Vec<_> = defs.keys().collect();
    names.sort();
    for name in names {
        let def = &defs[name];
        println!("{} ({})", def.name, def.variant);
        if let Some(ref d) = def.description {
            println!("  {d}");
        }
        for step in &def.steps {
            let progress = def.progress(&step.id);
            let remaining = progress.map(|p| p.minutes_remaining).unwrap_or_default();
            let skip = match step.skip_when {
                Some(cond) => format!(" [skipped when {cond:?}]"),
                None => String::new(),
            };
            println!("  - {:<14} {:<9} ~{remaining} min left{skip}", step.id, step.stage);
        }
    }
    Ok(())
}

fn check_dir(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }
    let defs = flows::load_flows(dir)?;
    let mut names: Vec<_> = defs.keys().cloned().collect();
    names.sort();
    println!("{} flow(s) valid: {}", names.len(), names.join(", "));
    Ok(())
}

/// Advance until the flow stops moving forward. Returns the visited steps
/// and the reason it stopped, if not at the end.
fn walk(
    mut step: impl FnMut() -> Result<Navigation, FlowError>,
    limit: usize,
) -> (Vec<String>, Option<FlowError>) {
    let mut path = Vec::new();
    for _ in 0..limit {
        match step() {
            Ok(Navigation::Moved { to, .. }) => path.push(to),
            Ok(Navigation::Stayed) => return (path, None),
            Err(e) => return (path, Some(e)),
        }
    }
    (path, None)
}

fn simulate(config: &IntakeConfig, name: &str, answers: &Path, auth: &AuthContext) -> Result<()> {
    let def = find_flow(config, name)?;
    let limit = def.steps.len() * 2;
    let mut flow = FlowInstance::new(Arc::clone(&def));
    flow.restore(read_answers(answers)?);

    println!("visible: {}", sequencer::visible_steps(&def, auth).join(" -> "));
    let (path, stop) = walk(|| flow.next(auth), limit);
    println!("path: {} -> {}", def.first_step(), path.join(" -> "));
    match stop {
        Some(FlowError::Blocked(reason)) => {
            println!("blocked at '{}': {reason}", flow.current_step());
            let link = match reason {
                BlockedReason::GatingUpgradeRequired => def.upgrade_path.as_deref(),
                BlockedReason::SafetyKnockout => def.knockout_resource.as_deref(),
            };
            if let Some(link) = link {
                println!("see: {link}");
            }
        }
        Some(e) => println!("stopped at '{}': {e}", flow.current_step()),
        None => println!("reached '{}'", flow.current_step()),
    }
    if let Some(progress) = flow.progress() {
        println!(
            "stage {}/{} ({}), ~{} min left",
            progress.stage_index + 1,
            progress.stage_count,
            progress.stage,
            progress.minutes_remaining
        );
    }
    Ok(())
}

fn open_store(config: &IntakeConfig) -> Result<Arc<SqliteStore>> {
    let path = config.storage_path();
    let store = SqliteStore::open(&path)
        .with_context(|| format!("failed to open draft store {}", path.display()))?;
    Ok(Arc::new(store))
}

fn draft(config: &IntakeConfig, action: &DraftAction) -> Result<()> {
    let store = open_store(config)?;
    let opts = config.session_options();
    let adapter = |flow: &str| -> Result<DraftAdapter> {
        let def = find_flow(config, flow)?;
        Ok(DraftAdapter::new(
            store.clone(),
            &def.storage_key,
            &opts.transfer_key,
            opts.max_age,
        ))
    };
    match action {
        DraftAction::Show { flow } => {
            let drafts = adapter(flow.as_str())?;
            match drafts.peek() {
                Some(snapshot) => {
                    println!("key: {}", drafts.key());
                    println!("{}", serde_json::to_string_pretty(&snapshot)?);
                    let age = snapshot.age(chrono::Utc::now());
                    if age >= opts.max_age {
                        println!("(expired: {}h old)", age.num_hours());
                    }
                }
                None => println!("no draft under '{}'", drafts.key()),
            }
        }
        DraftAction::Clear { flow } => {
            adapter(flow.as_str())?.discard();
            println!("draft for '{flow}' cleared");
        }
        DraftAction::List => {
            for key in store.keys()? {
                println!("{key}");
            }
        }
    }
    Ok(())
}

async fn submit(config: &IntakeConfig, name: &str, answers: &Path, auth: &AuthContext) -> Result<()> {
    let def = find_flow(config, name)?;
    let limit = def.steps.len() * 2;
    let store: Arc<dyn KeyValueStore> = open_store(config)?;
    let mut session = FlowSession::new(def, store, config.session_options());

    if let MountOutcome::RecoveryOffered(offer) = session.mount() {
        tracing::info!(
            "discarding saved draft at '{}' in favour of the answers file",
            offer.current_step
        );
        session.resolve_recovery(RecoveryChoice::StartFresh, auth)?;
    }
    for (field, value) in read_answers(answers)? {
        session.set_answer(&field, value)?;
    }

    let (_, stop) = walk(|| session.next(auth), limit);
    if let Some(e) = stop {
        bail!("cannot reach payment: {e}");
    }

    let client = HttpCheckoutClient::new(&config.checkout.endpoint, config.checkout_timeout())?;
    tracing::info!("submitting '{name}' to {}", client.endpoint());
    match session.submit(auth, &client).await {
        Ok(url) => {
            println!("{url}");
            Ok(())
        }
        Err(e) => bail!("{}", e.user_message()),
    }
}
