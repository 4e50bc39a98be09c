use anyhow::Context;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use vrm_atlas::config::{CliArgs, PipelineConfig};
use vrm_atlas::pipeline::Pipeline;

fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    // Logs go to stderr so --json output stays machine readable
    let filter = if args.verbose {
        EnvFilter::new("vrm_atlas=debug")
    } else {
        EnvFilter::new("vrm_atlas=info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config: PipelineConfig = args.into();

    if let Some(threads) = config.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .context("Failed to configure rayon thread pool")?;
    }

    match Pipeline::run(&config) {
        Ok(result) => {
            if !config.json_report {
                println!(
                    "Done: {} materials merged into {} atlases in {:.2}s",
                    result.report.materials_atlased,
                    result.report.atlases.len(),
                    result.duration.as_secs_f64()
                );
            }
            Ok(())
        }
        Err(e) => {
            error!(%e, "Pipeline failed");
            Err(anyhow::anyhow!(e)).context("vrm-atlas pipeline failed")
        }
    }
}
