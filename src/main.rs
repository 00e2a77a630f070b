//! StepRunner CLI Entry Point
//!
//! Builds and executes a definitions file with the built-in runners.
//!
//! # Usage
//!
//! ```bash
//! # Execute a definitions file
//! steprunner run.yaml
//!
//! # Build only and list the nodes
//! steprunner run.yaml --check
//!
//! # Limit parallelism and the whole run's duration
//! steprunner run.yaml --parallel 8 --timeout 30
//! ```

use std::env;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use log::{error, info};

use steprunner::execution::{Engine, RunContext, RunReport};
use steprunner::workflow::{load_definitions, Graph, NodeStatus};
use steprunner::{builtin, ExecuteError, APP_NAME, VERSION};

/// Default definitions file used when none is specified.
const DEFAULT_DEFINITIONS: &str = "steprunner.yaml";

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    definitions_path: String,
    max_parallel: Option<usize>,
    timeout: Option<Duration>,
    check: bool,
    timeline: bool,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            definitions_path: DEFAULT_DEFINITIONS.to_string(),
            max_parallel: None,
            timeout: None,
            check: false,
            timeline: false,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Declarative Workflow Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: steprunner [OPTIONS] <DEFINITIONS_FILE>");
    println!();
    println!("Arguments:");
    println!("  <DEFINITIONS_FILE>  Path to a YAML definitions file (default: {})", DEFAULT_DEFINITIONS);
    println!();
    println!("Options:");
    println!("  --parallel N        Maximum nodes running at once (default: CPU count)");
    println!("  --timeout SECS      Deadline for the whole run");
    println!("  --check             Build the graph and list its nodes without running");
    println!("  --timeline          Print a Gantt chart after the run");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Built-in runners: echo, sleep, fail, increment (resource kind: counter)");
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut positional_seen = false;
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--check" => config.check = true,
            "--timeline" => config.timeline = true,
            "--verbose" | "-v" => config.verbose = true,
            "--parallel" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or("--parallel requires a number argument")?;
                let parallel: usize = value
                    .parse()
                    .map_err(|_| format!("Invalid parallel value: {}", value))?;
                if parallel == 0 {
                    return Err("--parallel must be at least 1".to_string());
                }
                config.max_parallel = Some(parallel);
            }
            "--timeout" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or("--timeout requires a number of seconds")?;
                let secs: f64 = value
                    .parse()
                    .ok()
                    .filter(|s: &f64| s.is_finite() && *s > 0.0)
                    .ok_or_else(|| format!("Invalid timeout value: {}", value))?;
                config.timeout = Some(Duration::from_secs_f64(secs));
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if positional_seen {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.definitions_path = arg.clone();
                positional_seen = true;
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Prints the nodes of a built graph in execution order.
fn print_graph(graph: &Graph) {
    println!("{}", "Execution graph:".bold());
    for node in graph.nodes() {
        let after: Vec<&str> = node.predecessors.iter().map(|p| p.as_str()).collect();
        if after.is_empty() {
            println!("  {:24} {}", node.id.as_str(), node.describe());
        } else {
            println!(
                "  {:24} {}  (after {})",
                node.id.as_str(),
                node.describe(),
                after.join(", ")
            );
        }
    }
    println!();
    println!("{} nodes, {} edges", graph.len(), graph.edge_count());
}

/// Prints the final status of every node.
fn print_report(report: &RunReport, show_timeline: bool) {
    println!();
    println!(
        "{} (started {})",
        "Run summary:".bold(),
        report.started_at.format("%Y-%m-%d %H:%M:%S")
    );
    let durations = report.timeline.get_durations();
    for (id, status) in &report.statuses {
        let label = match status {
            NodeStatus::Succeeded => "ok".green().to_string(),
            NodeStatus::Failed(reason) => format!("{} {}", "failed".red(), reason),
            NodeStatus::Skipped(reason) => format!("{} {}", "skipped".yellow(), reason),
            other => format!("{:?}", other),
        };
        match durations.get(id.as_str()) {
            Some(ms) => println!("  {:24} {} ({}ms)", id.as_str(), label, ms),
            None => println!("  {:24} {}", id.as_str(), label),
        }
    }
    for destroy_error in &report.destroy_errors {
        println!("  {} {}", "warning:".yellow(), destroy_error);
    }
    println!();
    println!("{}", report.summary());

    if show_timeline {
        println!("{}", report.timeline.gantt_chart());
    }
}

/// Main application entry point.
async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    let defs = load_definitions(&config.definitions_path).map_err(|e| {
        error!("Failed to load definitions: {}", e);
        format!(
            "Could not load definitions from '{}': {}",
            config.definitions_path, e
        )
    })?;

    let registry = Arc::new(builtin::registry());
    let graph = Graph::build(&defs, &registry)?;
    info!("Graph built: {} nodes, {} edges", graph.len(), graph.edge_count());

    if config.check {
        print_graph(&graph);
        return Ok(());
    }

    let mut engine = Engine::new(registry);
    if let Some(parallel) = config.max_parallel {
        engine.set_max_parallel(parallel);
    }
    if let Some(timeout) = config.timeout {
        engine.set_timeout(timeout);
    }

    match engine.execute(RunContext::new(), graph).await {
        Ok(report) => {
            print_report(&report, config.timeline);
            println!("{}", "Run completed successfully".green().bold());
            Ok(())
        }
        Err(err) => {
            if let Some(report) = err.report() {
                print_report(report, config.timeline);
            }
            match &err {
                ExecuteError::Failed { node, .. } => {
                    println!("{} {}", "Root cause:".red().bold(), node.as_str());
                }
                ExecuteError::Stalled { pending, .. } => {
                    for id in pending {
                        println!("{} {}", "Never started:".red().bold(), id.as_str());
                    }
                }
                _ => {}
            }
            Err(err.into())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
