mod commands;

use clap::{Parser, Subcommand};
use commands::{EXIT_CONFIG_ERROR, EXIT_FAILURE};
use esmbt_schema::DEFAULT_PROJECT_FILE;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "esmbt",
    version,
    about = "Build the server extension, reset the database and redeploy the game server"
)]
struct Cli {
    /// Path to the project file.
    #[arg(long, default_value = DEFAULT_PROJECT_FILE, global = true)]
    project: PathBuf,

    /// Output the run report as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build the extension, stop the server, reset the database and start the server again.
    Run {
        /// Build the 32-bit extension instead of the 64-bit one.
        #[arg(short = 'x', long, default_value_t = false)]
        use_x32: bool,
        /// Target operating system.
        #[arg(short, long, default_value = "windows")]
        target: String,
        /// Log level baked into the extension and passed to the server.
        #[arg(short, long, default_value = "debug")]
        log_level: String,
        /// Environment profile for the build and the database reset.
        #[arg(short, long, default_value = "development")]
        env: String,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("ESMBT_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Run {
            use_x32,
            target,
            log_level,
            env,
        } => commands::run::run(
            &cli.project,
            &commands::run::RunArgs {
                use_x32,
                target: &target,
                log_level: &log_level,
                environment: &env,
            },
            cli.json,
        ),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("configuration error:") {
                EXIT_CONFIG_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}
