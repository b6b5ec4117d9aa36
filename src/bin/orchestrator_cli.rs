//! Orchestration Command Line Interface
//!
//! Plans, composes and runs onboarding cases against the standard domain set.
//!
//! # Usage
//!
//! ```bash
//! # Show the staged execution plan for a case
//! orchestrator_cli plan --entity-type CORPORATE --jurisdiction US --products CUSTODY,TRADING
//!
//! # Print the composed master DSL
//! orchestrator_cli compose --entity-type TRUST --jurisdiction GB --products CUSTODY
//!
//! # Create a session and run instructions through it
//! orchestrator_cli demo -i "verify identity documents" -i "open custody account"
//!
//! # List orchestration verbs
//! orchestrator_cli verbs --category workflow
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;

use ob_orchestration::{
    register_standard_domains, AnalysisInput, CompositionEngine, CompositionRequest,
    ComplianceTier, ContextAnalyzer, CreateSessionRequest, DomainRegistry, ExecutionPlan,
    ExecutionPlanner, OrchestrationVocabulary, Orchestrator, OrchestratorConfig, VerbCategory,
    WorkflowType,
};

#[derive(Parser)]
#[command(name = "orchestrator_cli")]
#[command(version = "0.1.0")]
#[command(about = "Plan, compose and run cross-domain onboarding workflows")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format: json or pretty (default)
    #[arg(long, short = 'o', global = true, default_value = "pretty", value_enum)]
    format: OutputFormat,

    /// YAML configuration file; ORCH_* environment variables otherwise
    #[arg(long, global = true, env = "ORCH_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Pretty,
}

#[derive(clap::Args, Clone)]
struct CaseArgs {
    /// CORPORATE, INDIVIDUAL, TRUST, PARTNERSHIP (or their aliases)
    #[arg(long, default_value = "CORPORATE")]
    entity_type: String,

    /// ISO country code or a regional code such as EU
    #[arg(long, default_value = "US")]
    jurisdiction: String,

    /// Comma separated product codes
    #[arg(long, value_delimiter = ',')]
    products: Vec<String>,

    /// ONBOARDING, INVESTMENT or KYC_REFRESH
    #[arg(long, default_value = "ONBOARDING")]
    workflow: String,

    /// HIGH forces the enhanced compliance tier
    #[arg(long)]
    risk_profile: Option<String>,

    /// SIMPLIFIED, STANDARD or ENHANCED
    #[arg(long)]
    tier: Option<String>,

    #[arg(long, default_value = "Demo Entity")]
    name: String,
}

impl CaseArgs {
    fn workflow_type(&self) -> Result<WorkflowType> {
        self.workflow.parse().map_err(|e: String| anyhow!(e))
    }

    fn tier(&self) -> Result<Option<ComplianceTier>> {
        self.tier
            .as_deref()
            .map(|t| t.parse::<ComplianceTier>().map_err(|e| anyhow!(e)))
            .transpose()
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Analyse a case and print its staged execution plan
    Plan {
        #[command(flatten)]
        case: CaseArgs,
    },

    /// Compose the master DSL document for a case
    Compose {
        #[command(flatten)]
        case: CaseArgs,
    },

    /// Create a session and route instructions through it
    Demo {
        #[command(flatten)]
        case: CaseArgs,

        /// Instruction to execute; repeatable. Phrases such as
        /// "initialize shared state" run orchestration verbs instead.
        #[arg(short, long = "instruction")]
        instructions: Vec<String>,

        /// Run every stage in order after the instructions
        #[arg(long)]
        run_stages: bool,
    },

    /// List orchestration verbs
    Verbs {
        /// context, state, workflow, communication or product
        #[arg(short, long)]
        category: Option<String>,

        /// Print the full Markdown vocabulary reference
        #[arg(long)]
        docs: bool,
    },
}

// =============================================================================
// MAIN
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match &cli.command {
        Commands::Plan { case } => cmd_plan(case, cli.format),
        Commands::Compose { case } => cmd_compose(case, cli.format),
        Commands::Demo {
            case,
            instructions,
            run_stages,
        } => cmd_demo(&cli, case, instructions, *run_stages).await,
        Commands::Verbs { category, docs } => cmd_verbs(category.as_deref(), *docs, cli.format),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if cli.format == OutputFormat::Json {
                println!("{}", serde_json::json!({ "error": format!("{:#}", e) }));
            } else {
                eprintln!("{}: {:#}", "error".red().bold(), e);
            }
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<OrchestratorConfig> {
    match path {
        Some(path) => {
            let yaml = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            Ok(OrchestratorConfig::from_yaml_str(&yaml)?)
        }
        None => Ok(OrchestratorConfig::from_env()?),
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// =============================================================================
// COMMAND IMPLEMENTATIONS
// =============================================================================

fn analyze_and_plan(case: &CaseArgs) -> Result<(ob_orchestration::ContextAnalysis, ExecutionPlan)> {
    let analysis = ContextAnalyzer::new().analyze(&AnalysisInput {
        entity_type: &case.entity_type,
        jurisdiction: &case.jurisdiction,
        products: &case.products,
        workflow_type: case.workflow_type()?,
        risk_profile: case.risk_profile.as_deref(),
        requested_tier: case.tier()?,
    })?;
    let plan = ExecutionPlanner::default().plan(&analysis)?;
    Ok((analysis, plan))
}

fn cmd_plan(case: &CaseArgs, format: OutputFormat) -> Result<()> {
    let (analysis, plan) = analyze_and_plan(case)?;

    if format == OutputFormat::Json {
        return print_json(&serde_json::json!({ "analysis": analysis, "plan": plan }));
    }

    println!(
        "{} primary {} | tier {} | complexity {}",
        "Plan".cyan().bold(),
        analysis.primary_domain.bold(),
        analysis.compliance_tier,
        analysis.estimated_complexity
    );
    print_plan(&plan);
    Ok(())
}

fn print_plan(plan: &ExecutionPlan) {
    for stage in &plan.stages {
        let mode = if stage.parallel { "parallel" } else { "sequential" };
        println!(
            "  {} {} [{}] ~{}ms",
            format!("stage {}", stage.number).yellow(),
            stage.domains.join(", "),
            mode.dimmed(),
            stage.estimated_duration_ms
        );
        if !stage.dependencies.is_empty() {
            println!("      after {}", stage.dependencies.join(", ").dimmed());
        }
    }
    println!("  critical path: {}", plan.critical_path.join(" -> "));
}

fn cmd_compose(case: &CaseArgs, format: OutputFormat) -> Result<()> {
    let mut request = CompositionRequest::new(
        "cli-session",
        &case.name,
        &case.entity_type,
        &case.jurisdiction,
        chrono::Utc::now(),
    )
    .with_products(case.products.iter().cloned());
    request.workflow_type = case.workflow_type()?;
    request.risk_profile = case.risk_profile.clone();
    request.compliance_tier = case.tier()?;

    let result = CompositionEngine::default().compose(&request)?;
    if format == OutputFormat::Json {
        return print_json(&result);
    }

    for warning in &result.warnings {
        println!("{} {}", "warning:".yellow().bold(), warning);
    }
    println!("{}", result.master_dsl);
    Ok(())
}

async fn cmd_demo(cli: &Cli, case: &CaseArgs, instructions: &[String], run_stages: bool) -> Result<()> {
    let config = load_config(cli.config.as_ref())?;
    let registry = DomainRegistry::new();
    register_standard_domains(&registry)?;
    let orchestrator = Orchestrator::new(Arc::new(registry), config)?;

    let mut request = CreateSessionRequest::new(&case.name, &case.entity_type, &case.jurisdiction)
        .with_products(case.products.iter().cloned())
        .with_workflow_type(case.workflow_type()?);
    if let Some(risk) = &case.risk_profile {
        request = request.with_risk_profile(risk);
    }
    if let Some(tier) = case.tier()? {
        request = request.with_compliance_tier(tier);
    }
    let session = orchestrator.create_session(request).await?;
    let pretty = cli.format == OutputFormat::Pretty;

    if pretty {
        println!(
            "{} {} ({} domains)",
            "Session".green().bold(),
            session.session_id,
            session.active_domains.len()
        );
        print_plan(&session.execution_plan);
    }

    for instruction in instructions {
        if looks_like_orchestration(instruction) {
            let processing = orchestrator
                .execute_orchestration_instruction(&session.session_id, instruction)
                .await?;
            if pretty {
                report(instruction, processing.success, &processing.processed_verbs, &processing.errors);
            }
        } else {
            let result = orchestrator
                .execute_instruction(&session.session_id, instruction)
                .await?;
            if pretty {
                report(instruction, result.success, &result.processed_domains, &result.errors);
            }
        }
    }

    if run_stages {
        while orchestrator
            .get_session(&session.session_id)
            .await?
            .next_stage()
            .is_some()
        {
            let result = orchestrator
                .run_next_stage(&session.session_id, "continue onboarding")
                .await?;
            if pretty {
                report("next stage", result.success, &result.processed_domains, &result.errors);
            }
            if !result.success {
                break;
            }
        }
    }

    let status = orchestrator
        .get_session_status(&session.session_id, true)
        .await?;
    if !pretty {
        return print_json(&status);
    }

    println!(
        "{} {} version {}",
        "State".cyan().bold(),
        status.current_state,
        status.version
    );
    if let Some(dsl) = &status.unified_dsl {
        println!("{}", dsl);
    }
    let metrics = orchestrator.get_metrics().await;
    println!(
        "{} {} domain fragments",
        "Coordinated".dimmed(),
        metrics.domains_coordinated.values().sum::<u64>()
    );
    Ok(())
}

fn looks_like_orchestration(instruction: &str) -> bool {
    let lowered = instruction.trim_start().to_lowercase();
    lowered.starts_with('(')
        || ["initiali", "sync", "collect", "broadcast", "execute"]
            .iter()
            .any(|prefix| lowered.starts_with(prefix))
}

fn report(label: &str, success: bool, handled: &[String], errors: &[String]) {
    let mark = if success { "OK".green() } else { "FAIL".red() };
    println!("{} {} -> {}", mark, label.bold(), handled.join(", "));
    for error in errors {
        println!("    {}", error.red());
    }
}

fn cmd_verbs(category: Option<&str>, docs: bool, format: OutputFormat) -> Result<()> {
    let vocabulary = OrchestrationVocabulary::standard();
    if docs {
        println!("{}", vocabulary.generate_documentation());
        return Ok(());
    }

    let categories: Vec<VerbCategory> = match category {
        Some(name) => vec![VerbCategory::all()
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| anyhow!("unknown verb category '{}'", name))?],
        None => VerbCategory::all().to_vec(),
    };

    if format == OutputFormat::Json {
        let verbs: Vec<_> = categories
            .iter()
            .flat_map(|c| vocabulary.verbs_in(*c))
            .collect();
        return print_json(&verbs);
    }

    for category in categories {
        println!("{}", format!("Category: {}", category).cyan().bold());
        for verb in vocabulary.verbs_in(category) {
            let required: Vec<&str> = verb.required_parameters().collect();
            println!("  {} {}", verb.name.green(), verb.description.dimmed());
            if !required.is_empty() {
                println!("      requires {}", required.join(", "));
            }
        }
        println!();
    }
    Ok(())
}
