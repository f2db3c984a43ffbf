use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::Parser;
use console::style;
use nagare::{Config, ConfigError, Nagare, NagareError};
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Front-end asset pipeline.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
struct Args {
    /// Task to run.
    #[arg(index = 1, default_value = "default")]
    task: String,

    /// Configuration file, `nagare.toml` in the current directory by default.
    #[arg(long, short)]
    config: Option<Utf8PathBuf>,

    /// List the defined tasks and exit.
    #[arg(long)]
    list: bool,

    /// Print the plan of the task as a Mermaid flowchart and exit.
    #[arg(long)]
    graph: bool,

    /// After running, write a Mermaid diagram of the plan colored by task
    /// duration.
    #[arg(long, value_name = "FILE")]
    mermaid: Option<Utf8PathBuf>,
}

/// Exit code for configuration errors, task failures exit with 1.
const EXIT_CONFIG: u8 = 2;

fn main() -> anyhow::Result<ExitCode> {
    init_tracing();
    let args = Args::parse();

    let nagare = match Config::load(args.config.as_deref()).and_then(Nagare::standard) {
        Ok(nagare) => nagare,
        Err(e) => return Ok(config_error(e)),
    };

    if args.list {
        for task in nagare.graph().tasks() {
            let mut deps = task.dependencies.join(", ");
            for group in &task.sequence {
                deps.push_str(&format!(" then [{}]", group.join(", ")));
            }
            println!("{:<12} {}", style(&task.name).cyan(), style(deps).dim());
        }
        return Ok(ExitCode::SUCCESS);
    }

    if args.graph {
        return match nagare.plan([&args.task]) {
            Ok(plan) => {
                print!("{plan}");
                Ok(ExitCode::SUCCESS)
            }
            Err(e) => Ok(config_error(e)),
        };
    }

    match nagare.run([&args.task]) {
        Ok(diagnostics) => {
            if let Some(path) = &args.mermaid {
                let plan = nagare.plan([&args.task])?;
                diagnostics.render_mermaid_to_file(&plan, path)?;
                tracing::info!("wrote {}", path);
            }

            if diagnostics.failed() {
                Ok(ExitCode::FAILURE)
            } else {
                Ok(ExitCode::SUCCESS)
            }
        }
        Err(NagareError::Config(e)) => Ok(config_error(e)),
        Err(e) => {
            tracing::error!("{e}");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn config_error(e: ConfigError) -> ExitCode {
    tracing::error!("{}", NagareError::from(e));
    ExitCode::from(EXIT_CONFIG)
}

/// Log to stderr through the progress bars, `RUST_LOG` overrides the
/// default `info` level.
fn init_tracing() {
    let indicatif_layer = IndicatifLayer::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(indicatif_layer.get_stderr_writer()),
        )
        .with(indicatif_layer)
        .init();
}
