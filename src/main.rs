use std::process::ExitCode;
use std::time::Instant;

use chrono::Local;
use clap::Parser;

use do_backup_lib::backup::Backup;
use do_backup_lib::cli::Cli;
use do_backup_lib::settings::Settings;
use do_backup_lib::util::elapsed;

const EXIT_FAILED: u8 = 1;
const EXIT_ERROR: u8 = 2;
// 128 + SIGINT
const EXIT_INTERRUPTED: i32 = 130;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // init logger
    let mut env_logger = env_logger::builder();
    if std::env::var_os("RUST_LOG").is_none() || cli.debug || cli.warn {
        env_logger.filter_level(cli.log_level());
    }
    env_logger.init();

    // rsync receives the same SIGINT and stops on its own
    if let Err(e) = ctrlc::set_handler(|| {
        log::error!("Interrupted. Exiting.");
        std::process::exit(EXIT_INTERRUPTED);
    }) {
        log::warn!("Installing the interrupt handler failed: {e}");
    }

    let settings = match &cli.config {
        Some(path) => match Settings::load(path) {
            Ok(settings) => settings,
            Err(e) => {
                log::error!("{e}");
                return ExitCode::from(EXIT_ERROR);
            }
        },
        None => Settings::default(),
    };
    let backup = Backup::new(cli.into_config(settings));

    let timer = Instant::now();
    log::info!(
        "Start running at {} ({} {})",
        Local::now().to_rfc3339(),
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
    );
    log::debug!("src-type: {}", backup.config().transfer_mode);

    let exit_code = match backup.run() {
        Ok(true) => {
            log::info!("Finished running successfully at {}", Local::now().to_rfc3339());
            ExitCode::SUCCESS
        }
        Ok(false) => {
            log::error!("Failed running (ended at {})", Local::now().to_rfc3339());
            ExitCode::from(EXIT_FAILED)
        }
        Err(e) => {
            log::error!("Backup aborted: {e}");
            log::debug!("{e:?}");
            ExitCode::from(EXIT_ERROR)
        }
    };

    log::info!("{}", elapsed::summary(timer.elapsed()));
    exit_code
}
