use std::{
    path::PathBuf,
    process,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::{Parser, Subcommand, ValueHint};
use log::{debug, error, info, LevelFilter};

use scrobd::{
    config::Config,
    monitor, mpd,
    reactor::Reactor,
    scrobble::{self, Scrobbler},
    signal,
    transport::TlsContext,
};

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Watch MPD and submit scrobbles
    Run {
        /// Configuration file
        ///
        /// [default: <platform config dir>/scrobd/scrobd.toml]
        #[arg(value_name = "CONFIG", value_hint = ValueHint::FilePath)]
        config: Option<PathBuf>,
    },

    /// Interactively authenticate against a scrobbling service
    Auth {
        /// Scrobbler protocol to authenticate, e.g. "as20"
        protocol: String,

        /// Service endpoint
        ///
        /// [default: the protocol's built-in service URL]
        #[arg(value_name = "TARGET_URL", value_hint = ValueHint::Url)]
        target_url: Option<String>,

        /// API key; must be given together with the secret
        api_key: Option<String>,

        /// API shared secret
        api_secret: Option<String>,
    },
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            // Quiet and verbose are mutually exclusive, so 0 means quiet.
            0 => LevelFilter::Warn,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Leave external crates at the default level.
        logger.filter_module(module_path!(), level);
    }

    logger.init();
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("scrobd/scrobd.toml"))
}

/// Daemon mode: load the configuration, fabricate the scrobblers and watch
/// MPD until interrupted.
fn run_daemon(runtime: &tokio::runtime::Runtime, config: Option<PathBuf>) -> i32 {
    let Some(path) = config.or_else(default_config_path) else {
        error!("no configuration directory available on this platform");
        return 1;
    };

    let config = match Config::load(&path) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {e}");
            return 1;
        }
    };
    let host = config.mpd_host();
    let port = match config.mpd_port() {
        Ok(port) => port,
        Err(e) => {
            error!("failed to load configuration: {e}");
            return 1;
        }
    };

    let tls = TlsContext::new();
    let reactor = Reactor::new(runtime.handle().clone());

    // A failing section skips only that scrobbler; having none left is what
    // makes fabrication fatal.
    let mut scrobblers: Vec<Box<dyn Scrobbler>> = Vec::new();
    for section in config.sections() {
        match scrobble::build(section, &reactor, &tls) {
            Ok(scrobbler) => scrobblers.push(scrobbler),
            Err(e) => error!(
                "got an error while setting up scrobbler {}: {e}",
                section.name()
            ),
        }
    }
    if scrobblers.is_empty() {
        error!("no scrobblers set up");
        return 1;
    }

    let stop = Arc::new(AtomicBool::new(false));
    if let Err(e) = watch(runtime, &host, port, &mut scrobblers, &stop) {
        error!("fatal error: {e}");
    }

    // Give already-scheduled submissions a chance to complete, then drop the
    // scrobblers so their pending queues hit the cache files.
    runtime.block_on(reactor.drain());
    drop(scrobblers);

    0
}

/// Connects to MPD, installs the shutdown signal handling and runs the
/// control loop on this thread.
fn watch(
    runtime: &tokio::runtime::Runtime,
    host: &str,
    port: u16,
    scrobblers: &mut Vec<Box<dyn Scrobbler>>,
    stop: &Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = mpd::Client::connect(host, port)?;
    let interrupt = client.interrupt_handle()?;

    let stop_flag = Arc::clone(stop);
    runtime.spawn(async move {
        match signal::Handler::new() {
            Ok(mut signals) => {
                let received = signals.recv().await;
                info!("received {received}, shutting down gracefully");
                stop_flag.store(true, Ordering::SeqCst);
                interrupt.interrupt();
            }
            Err(e) => error!("cannot install signal handlers: {e}"),
        }
    });

    monitor::run(&mut client, scrobblers, stop)?;
    Ok(())
}

/// Interactive authentication flow.
fn run_auth(
    runtime: &tokio::runtime::Runtime,
    protocol: &str,
    target_url: Option<&str>,
    api_key: Option<&str>,
    api_secret: Option<&str>,
) -> i32 {
    if api_key.is_some() != api_secret.is_some() {
        error!("api_key and api_secret must be provided together");
        return 1;
    }

    let tls = TlsContext::new();
    match scrobble::authenticate(
        protocol,
        runtime.handle(),
        &tls,
        target_url,
        api_key,
        api_secret,
    ) {
        Ok(()) => 0,
        Err(e) => {
            error!("authentication process failure: {e}");
            1
        }
    }
}

fn main() {
    let args = Args::parse();
    init_logger(&args);

    // Dump the arguments first; it helps debugging whatever comes next.
    debug!("Command {args:#?}");

    info!(
        "starting {}/{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start the runtime: {e}");
            process::exit(1);
        }
    };

    let code = match &args.command {
        Command::Run { config } => run_daemon(&runtime, config.clone()),
        Command::Auth {
            protocol,
            target_url,
            api_key,
            api_secret,
        } => run_auth(
            &runtime,
            protocol,
            target_url.as_deref(),
            api_key.as_deref(),
            api_secret.as_deref(),
        ),
    };

    process::exit(code);
}
