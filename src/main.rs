use anyhow::Result;
use clap::{Parser, Subcommand};
use forecast_engine::{
    commands::{forecast, forecast_db, time_range, ForecastArgs},
    context::AppContext,
    error::ForecastError,
};
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "forecast-engine")]
#[command(about = "Hourly demand forecasting with tuned gradient boosting")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Tune, train and forecast from a CSV file with a date_time column
    Forecast {
        /// CSV file to forecast from
        #[arg(long, value_name = "PATH")]
        file: PathBuf,
        #[command(flatten)]
        args: ForecastArgs,
        /// Write the JSON response here instead of stdout
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Tune, train and forecast from a time range of the feature table
    ForecastDb {
        /// First timestamp to load (inclusive)
        #[arg(long)]
        start: Option<String>,
        /// Last timestamp to load (inclusive)
        #[arg(long)]
        stop: Option<String>,
        #[command(flatten)]
        args: ForecastArgs,
        /// Write the JSON response here instead of stdout
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Print the earliest and latest timestamps of the feature table
    TimeRange,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let Cli { command } = Cli::parse();

    match run(command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => report_failure(&err),
    }
}

async fn run(command: Commands) -> Result<()> {
    let app_context = AppContext::from_env()?;
    info!("Starting forecast engine");

    match command {
        Commands::Forecast { file, args, output } => {
            forecast::run(&app_context, &file, &args, output.as_deref()).await?;
        }
        Commands::ForecastDb {
            start,
            stop,
            args,
            output,
        } => {
            forecast_db::run(
                &app_context,
                start.as_deref(),
                stop.as_deref(),
                &args,
                output.as_deref(),
            )
            .await?;
        }
        Commands::TimeRange => {
            time_range::run(&app_context).await?;
        }
    }

    Ok(())
}

// Client mistakes exit with 2, everything else with 1.
fn report_failure(err: &anyhow::Error) -> ExitCode {
    match err.downcast_ref::<ForecastError>() {
        Some(forecast_err) if forecast_err.is_client_error() => {
            error!("Request rejected ({}): {}", forecast_err.kind(), forecast_err);
            ExitCode::from(2)
        }
        Some(forecast_err) => {
            error!("Request failed ({}): {}", forecast_err.kind(), forecast_err);
            ExitCode::from(1)
        }
        None => {
            error!("Request failed: {:#}", err);
            ExitCode::from(1)
        }
    }
}
