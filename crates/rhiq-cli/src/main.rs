use clap::{Parser, Subcommand};
use tracing::info;

mod soak;
mod verify;

#[derive(Parser)]
#[command(name = "rhiq")]
#[command(about = "rhiq - asynchronous GPU submission and resource recycling")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive the pipeline with concurrent producers on the simulated backend
    Soak {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<String>,

        /// How long to run, in seconds
        #[arg(short, long, default_value_t = 10)]
        duration: u64,

        /// Number of recording threads
        #[arg(short, long, default_value_t = 4)]
        producers: usize,

        /// Simulated GPU latency per submit, in microseconds
        #[arg(long, default_value_t = 500)]
        latency_us: u64,

        /// Upper bound of the random pause between two payloads, in microseconds
        #[arg(long, default_value_t = 200)]
        jitter_us: u64,

        /// Most command lists recorded into one payload
        #[arg(long, default_value_t = 4)]
        max_lists: usize,

        /// Lose the device after this many seconds and run recovery
        #[arg(long)]
        lose_device_after: Option<u64>,

        /// Number of device recreations that fail before one succeeds
        #[arg(long, default_value_t = 0)]
        failed_recreations: u32,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Check the configuration, the simulated pipeline and the Vulkan backend
    Verify {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    rhiq_common::init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Soak {
            config,
            duration,
            producers,
            latency_us,
            jitter_us,
            max_lists,
            lose_device_after,
            failed_recreations,
        } => {
            let config_path = config.unwrap_or_else(rhiq_core::config::default_config_path);
            let pipeline_config = rhiq_core::PipelineConfig::load_or_default(&config_path);
            info!("starting soak run for {}s with {} producers", duration, producers);

            let options = soak::SoakOptions {
                duration: std::time::Duration::from_secs(duration),
                producers: producers.max(1),
                latency: std::time::Duration::from_micros(latency_us),
                jitter: std::time::Duration::from_micros(jitter_us),
                max_lists: max_lists.max(1),
                lose_device_after: lose_device_after.map(std::time::Duration::from_secs),
                failed_recreations,
            };
            let report = soak::run_soak(pipeline_config, options)?;
            report.print();
        }

        Commands::Config { config } => {
            let config_path = config.unwrap_or_else(rhiq_core::config::default_config_path);
            let pipeline_config = rhiq_core::PipelineConfig::load_or_default(&config_path);
            let toml = pipeline_config
                .to_toml()
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            println!("# effective configuration ({})", config_path);
            print!("{}", toml);
        }

        Commands::Verify { config } => {
            let config_path = config.unwrap_or_else(rhiq_core::config::default_config_path);
            verify::run_verify(&config_path)?;
        }
    }

    Ok(())
}
