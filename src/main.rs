//! linc-convert command line entry point.

use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use linc_convert::{
    config::{Cli, Command},
    error::EXIT_SUCCESS,
    ConversionJob, ConvertError, DarkFieldParams, LightSheetParams, PsOctParams, ReaderParams,
    Result,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.command.common().verbose);

    match run(cli.command).await {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(ConvertError::Cancelled) => {
            warn!("Conversion interrupted; the store has no metadata and is incomplete");
            ExitCode::from(ConvertError::Cancelled.exit_code())
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(command: Command) -> Result<()> {
    let output = command.output()?;
    let config = command.common().to_config();
    let params = reader_params(&command)?;

    info!(
        "Converting {} input(s) as {} into {}",
        command.inputs().len(),
        params.modality(),
        output.display()
    );

    let job = ConversionJob::new(&output, config);

    // First Ctrl-C stops scheduling new chunks; in-flight writes finish
    let cancel = job.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after in-flight chunks");
            cancel.cancel();
        }
    });

    let report = job.run_params(params).await?;
    println!("{}", report.summary());
    Ok(())
}

fn reader_params(command: &Command) -> Result<ReaderParams> {
    let params = match command {
        Command::DarkField(args) => {
            let mut params = DarkFieldParams::new(args.inputs.clone());
            if let Some(thickness) = args.slice_thickness {
                params = params.with_slice_thickness(thickness);
            }
            if let Some(staining) = &args.staining {
                params = params.with_staining(staining.clone());
            }
            ReaderParams::DarkField(params)
        }
        Command::LightSheet(args) => {
            let mut params = LightSheetParams::new(args.input.clone());
            if let Some(grid) = &args.tile_grid {
                match grid.as_slice() {
                    [rows, columns] => params = params.with_tile_grid(*rows, *columns),
                    _ => {
                        return Err(ConvertError::InvalidConfig(format!(
                            "tile grid must be given as Z,Y, got {} value(s)",
                            grid.len()
                        )))
                    }
                }
            }
            ReaderParams::LightSheet(params)
        }
        Command::PsOct(args) => {
            let mut params = PsOctParams::new(args.inputs.clone());
            if let Some(meta) = &args.meta {
                params = params.with_meta(meta.clone());
            }
            if let Some(key) = &args.key {
                params = params.with_key(key.clone());
            }
            if let Some(channels) = args.polarization_channels {
                params = params.with_polarization_channels(channels);
            }
            ReaderParams::PsOct(params)
        }
        Command::Detect(args) => ReaderParams::detect(&args.inputs)?,
    };
    Ok(params)
}

/// Initialize logging with the specified verbosity
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "linc_convert=debug"
    } else {
        "linc_convert=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
