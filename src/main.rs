use bi_agent::agent::{BiAgent, PipelineOutcome};
use bi_agent::config::AppConfig;
use bi_agent::evaluation::{load_cases, Evaluator};
use bi_agent::execution::{connect, Database, QueryExecutor};
use bi_agent::llm::{Generator, OpenAiGenerator};
use bi_agent::schema::CachedSchemaProvider;
use bi_agent::sql::SqlSafetyValidator;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Rows printed for a result table
const DISPLAY_ROWS: usize = 20;

#[derive(Parser)]
#[command(name = "bi-agent")]
#[command(about = "Ask business questions in plain language; get validated SQL, a chart and an explanation")]
#[command(version)]
struct Args {
    /// Database URL: sqlite://path or postgres://... (or set BI_DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// OpenAI API key (or set OPENAI_API_KEY env var)
    #[arg(long, global = true)]
    api_key: Option<String>,

    /// Chat completions model (or set OPENAI_MODEL)
    #[arg(long, global = true)]
    model: Option<String>,

    /// OpenAI-compatible base URL (or set OPENAI_BASE_URL)
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Row cap for unbounded queries (or set BI_MAX_ROWS)
    #[arg(long, global = true)]
    max_rows: Option<usize>,

    /// Per-query timeout in seconds (or set BI_QUERY_TIMEOUT_SECS)
    #[arg(long, global = true)]
    query_timeout: Option<u64>,

    /// Whole-run budget in seconds, 0 to disable (or set BI_RUN_BUDGET_SECS)
    #[arg(long, global = true)]
    run_budget: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer one question
    Ask {
        /// The business question in natural language
        question: String,

        /// Session id for follow-up questions
        #[arg(long)]
        session: Option<String>,

        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },
    /// Answer questions read line by line from stdin, sharing one session
    Chat {
        #[arg(long, default_value = "cli")]
        session: String,
    },
    /// Print the schema text the SQL generator sees
    Schema {
        #[arg(long)]
        json: bool,
    },
    /// Run the safety validator on a SQL string without executing it
    Validate { sql: String },
    /// Validate and execute a SQL string
    Query {
        sql: String,

        #[arg(long)]
        json: bool,
    },
    /// Score SQL generation against a JSON file of {question, ground_truth_sql} cases
    Eval {
        cases: PathBuf,

        /// Seconds to wait between cases
        #[arg(long, default_value_t = 0)]
        pause_secs: u64,

        #[arg(long)]
        json: bool,
    },
    /// Check the database connection
    Ping,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    match args.command {
        Commands::Ask { question, session, json } => run_ask(&config, &question, session.as_deref(), json).await,
        Commands::Chat { session } => run_chat(&config, &session).await,
        Commands::Schema { json } => run_schema(&config, json).await,
        Commands::Validate { sql } => run_validate(&config, &sql).await,
        Commands::Query { sql, json } => run_query(&config, &sql, json).await,
        Commands::Eval { cases, pause_secs, json } => run_eval(&config, &cases, pause_secs, json).await,
        Commands::Ping => run_ping(&config).await,
    }
}

fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = AppConfig::from_env()?;

    if let Some(url) = &args.database_url {
        config.database_url = Some(url.clone());
    }
    if let Some(key) = &args.api_key {
        config.generator.api_key = Some(key.clone());
    }
    if let Some(model) = &args.model {
        config.generator.model = model.clone();
    }
    if let Some(base_url) = &args.base_url {
        config.generator.base_url = base_url.trim_end_matches('/').to_string();
    }
    if let Some(max_rows) = args.max_rows {
        if max_rows == 0 {
            return Err(anyhow!("--max-rows must be at least 1"));
        }
        config.execution.max_rows = max_rows;
    }
    if let Some(secs) = args.query_timeout {
        if secs == 0 {
            return Err(anyhow!("--query-timeout must be at least 1"));
        }
        config.execution.query_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = args.run_budget {
        config.run_budget = (secs > 0).then(|| Duration::from_secs(secs));
    }
    Ok(config)
}

async fn open_database(config: &AppConfig) -> Result<Database> {
    let url = config.require_database_url()?;
    let database = connect(url, config.pool_size)
        .await
        .context("failed to connect to the database")?;
    info!(engine = database.engine.name(), "Connected");
    Ok(database)
}

fn generator(config: &AppConfig) -> Result<Arc<dyn Generator>> {
    let generator = OpenAiGenerator::new(&config.generator)?;
    Ok(Arc::new(generator))
}

fn print_outcome(outcome: &PipelineOutcome, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
        return Ok(());
    }

    match outcome {
        PipelineOutcome::Answered {
            sql,
            table,
            chart_spec,
            explanation,
            ..
        } => {
            println!("\n=== SQL ===\n{}", sql);
            println!("\n=== Results ({} rows, {} ms) ===", table.row_count(), table.elapsed_ms());
            print!("{}", table.render_table(DISPLAY_ROWS));
            if table.truncated() {
                println!("(truncated at the row cap)");
            }
            println!("\n=== Chart ===\n{}", serde_json::to_string_pretty(chart_spec)?);
            println!("\n=== Explanation ===\n{}", explanation);
        }
        PipelineOutcome::Failed {
            failed_at_stage,
            code,
            reason,
            ..
        } => {
            println!("\nFailed at stage '{}' [{}]: {}", failed_at_stage, code, reason);
        }
    }
    Ok(())
}

async fn run_ask(config: &AppConfig, question: &str, session: Option<&str>, json: bool) -> Result<()> {
    let database = open_database(config).await?;
    let agent = BiAgent::from_database(&database, generator(config)?, config)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling the run");
            on_interrupt.cancel();
        }
    });

    let outcome = agent.run_with_cancel(question, session, cancel).await;
    print_outcome(&outcome, json)?;
    if !outcome.is_answered() {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_chat(config: &AppConfig, session: &str) -> Result<()> {
    let database = open_database(config).await?;
    let agent = BiAgent::from_database(&database, generator(config)?, config)?;

    let stdin = io::stdin();
    print!("> ");
    io::stdout().flush()?;
    for line in stdin.lock().lines() {
        let question = line?;
        if question.trim().is_empty() {
            print!("> ");
            io::stdout().flush()?;
            continue;
        }
        if matches!(question.trim(), "exit" | "quit") {
            break;
        }
        let outcome = agent.run_pipeline(&question, Some(session)).await;
        print_outcome(&outcome, false)?;
        print!("\n> ");
        io::stdout().flush()?;
    }
    Ok(())
}

async fn run_schema(config: &AppConfig, json: bool) -> Result<()> {
    let database = open_database(config).await?;
    let schema = CachedSchemaProvider::new(database.catalog.clone());
    let snapshot = schema.snapshot().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(snapshot.as_ref())?);
    } else {
        print!("{}", snapshot.render_for_prompt(config.schema_max_tables));
    }
    Ok(())
}

async fn validator(database: &Database, config: &AppConfig) -> Result<SqlSafetyValidator> {
    let schema = CachedSchemaProvider::new(database.catalog.clone());
    let snapshot = schema.snapshot().await?;
    Ok(SqlSafetyValidator::new(snapshot, config.execution.max_rows))
}

async fn run_validate(config: &AppConfig, sql: &str) -> Result<()> {
    let database = open_database(config).await?;
    match validator(&database, config).await?.validate(sql) {
        Ok(query) => {
            println!("accepted (row cap {})", query.row_cap());
            println!("{}", query.sql());
            Ok(())
        }
        Err(reason) => Err(anyhow!("rejected [{}]: {}", reason.code(), reason)),
    }
}

async fn run_query(config: &AppConfig, sql: &str, json: bool) -> Result<()> {
    let database = open_database(config).await?;
    let query = validator(&database, config)
        .await?
        .validate(sql)
        .map_err(|reason| anyhow!("rejected [{}]: {}", reason.code(), reason))?;

    let executor = QueryExecutor::new(database.engine.clone(), config.execution.clone());
    let result = executor.execute(&query).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("{}", query.sql());
        print!("{}", result.render_table(DISPLAY_ROWS));
        println!(
            "{} rows in {} ms{}",
            result.row_count(),
            result.elapsed_ms(),
            if result.truncated() { " (truncated)" } else { "" }
        );
    }
    Ok(())
}

async fn run_eval(config: &AppConfig, cases: &PathBuf, pause_secs: u64, json: bool) -> Result<()> {
    let cases = load_cases(cases).with_context(|| format!("failed to read {}", cases.display()))?;
    let database = open_database(config).await?;
    let schema = Arc::new(CachedSchemaProvider::new(database.catalog.clone()));
    let executor = Arc::new(QueryExecutor::new(database.engine.clone(), config.execution.clone()));

    let evaluator = Evaluator::new(schema, executor, generator(config)?, config)?
        .with_pause(Duration::from_secs(pause_secs));
    let report = evaluator.evaluate(&cases).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for (i, case) in report.cases.iter().enumerate() {
            println!("\n[{}/{}] {}", i + 1, report.total, case.question);
            if let Some(sql) = &case.generated_sql {
                println!("   Generated SQL: {}", sql);
            }
            println!("   {:?}", case.verdict);
        }
        println!("\nFinal Score: {}/{} ({:.0}%)", report.correct, report.total, report.score() * 100.0);
    }
    Ok(())
}

async fn run_ping(config: &AppConfig) -> Result<()> {
    let database = open_database(config).await?;
    let version = database.engine.health_check().await?;
    println!("Connected: {}", version);
    Ok(())
}
