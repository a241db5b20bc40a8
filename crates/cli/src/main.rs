use clap::Parser;
use config::Config;
use flume::bounded;
use kernel::State;
use preheat::{
    cli::Cli,
    pidlock::{PidLock, PidLockError},
    priority,
    signals::{ignore_sigpipe, wait_for_signal, SignalEvent},
};
use tokio::time;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Exit code when another instance already holds the PID lock.
const EXIT_LOCK_CONTENDED: i32 = 3;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // NOTE: the verbosity flag takes precedence over the environment
    // variable for log control: `PREHEAT_LOG=warn preheat -vvv` still logs
    // at trace level. The environment variable can set per-crate levels,
    // e.g. `PREHEAT_LOG=kernel=debug`.
    let env_filter = EnvFilter::builder()
        .with_env_var("PREHEAT_LOG")
        .from_env()?
        .add_directive(cli.verbosity.log_level_filter().as_str().parse()?);

    let layer = tracing_subscriber::fmt::layer()
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(layer)
        .with(env_filter)
        .init();

    ignore_sigpipe();

    // single-instance guarantee, before anything touches the state file
    let pidlock = match PidLock::acquire(&cli.pidfile) {
        Ok(lock) => lock,
        Err(PidLockError::Contended(path)) => {
            error!(path = %path.display(), "another preheat instance is running");
            std::process::exit(EXIT_LOCK_CONTENDED);
        }
        Err(err) => return Err(err.into()),
    };

    priority::lower_process_priority();

    let config = load_config(&cli);
    debug!(?config, ?cli);

    // install signal handlers
    let (signals_tx, signals_rx) = bounded(8);
    let mut signal_handle = tokio::spawn(wait_for_signal(signals_tx));

    let autosave = config.system.autosave;

    // initialize the state and start ticking
    let state = State::load(config, Some(cli.statefile.clone()))?;
    let state_clone = state.clone();
    let mut state_handle = tokio::spawn(state_clone.start());

    // autosave on its own timer
    let state_clone = state.clone();
    let mut saver_handle = tokio::spawn(saver(state_clone, autosave));

    loop {
        tokio::select! {
            // bubble up any errors from the signal handler
            res = &mut signal_handle => {
                let res = res?;
                if let Err(err) = &res {
                    error!("error happened during handling signals: {}", err);
                }
                res?
            }

            // bubble up any errors from the saver
            res = &mut saver_handle => {
                let res = res?;
                if let Err(err) = &res {
                    error!("error happened during saving state: {}", err);
                }
                res?
            }

            // bubble up any errors from the tick loop
            res = &mut state_handle => {
                let res = res?;
                if let Err(err) = &res {
                    error!("error happened in state: {}", err);
                }
                res?;
            }

            // handle the signal events
            event_res = signals_rx.recv_async() => {
                let event = event_res?;
                debug!(?event, "received signal event");

                match event {
                    SignalEvent::ReloadConfig => {
                        let config = load_config(&cli);
                        if let Err(err) = state.reload_config(config).await {
                            warn!(%err, "config reload failed, keeping previous config");
                        } else {
                            info!("config reloaded");
                        }
                    }
                    SignalEvent::DumpStateInfo => {
                        state.dump_info().await;
                    }
                    SignalEvent::SaveState => {
                        if let Err(err) = state.write().await {
                            warn!(%err, "manual save failed");
                        }
                    }
                    SignalEvent::Shutdown => break,
                }
            }
        }
    }

    info!("shutting down");
    signal_handle.abort();
    saver_handle.abort();
    state_handle.abort();

    // final save; the dirty flag makes this a no-op when nothing changed
    if let Err(err) = state.write().await {
        warn!(%err, "final state save failed");
    }
    drop(pidlock);
    Ok(())
}

/// Load the configuration, never aborting the daemon on config problems.
fn load_config(cli: &Cli) -> Config {
    match Config::load_multiple(cli.config_candidates()) {
        Ok(config) => config,
        Err(err) => {
            warn!(%err, "failed to load configuration, using defaults");
            Config::default()
        }
    }
}

/// Periodically persist the model if it changed.
async fn saver(state: State, period: std::time::Duration) -> anyhow::Result<()> {
    debug!(?period, "autosave interval");
    loop {
        time::sleep(period).await;
        match state.write().await {
            Ok(true) => debug!("autosaved state"),
            Ok(false) => {}
            // keep the dirty flag, retry next period
            Err(err) => warn!(%err, "autosave failed"),
        }
    }
}
