// src/main.rs

//! etw-dump: console consumer that prints every event of the configured
//! providers.
//!
//! 1. Parse configuration & set up structured logging
//! 2. Refuse to run without elevation, resolve provider names to GUIDs
//! 3. Start the session, enable providers, open the real-time trace
//! 4. Register render listeners, Ctrl-C handler and optional duration timer
//! 5. Run blocking or in the background, then stop and close cleanly
//!
// ───── std / 3rd-party imports ──────────────────────────────────────────────
use anyhow::{Context, Result};
use chrono::Local;
use fern::Dispatch;
use log::LevelFilter;
use std::{
    env,
    path::{Path, PathBuf},
    process,
    thread,
};

// ───── local imports ────────────────────────────────────────────────────────
use etw::config::{self, Config};

const DEFAULT_CONFIG: &str = "etw-dump.toml";

// ───── helpers ──────────────────────────────────────────────────────────────

/// Print an error with context and terminate the process.
macro_rules! fatal {
    ($ctx:expr, $($arg:tt)+) => {{
        eprintln!(
            "[{}][ERROR][{}] {}",
            chrono::Local::now().to_rfc3339(),
            $ctx,
            format!($($arg)+)
        );
        std::process::exit(1);
    }};
}

/// Directory that contains the running executable.
fn exe_dir() -> Result<PathBuf> {
    let exe = env::current_exe().context("cannot determine executable path")?;
    exe.parent()
        .map(Path::to_path_buf)
        .context("executable must live in some directory")
}

/// First CLI argument, or `etw-dump.toml` next to the executable.
fn config_path() -> Result<PathBuf> {
    match env::args_os().nth(1) {
        Some(arg) => Ok(PathBuf::from(arg)),
        None => Ok(exe_dir()?.join(DEFAULT_CONFIG)),
    }
}

/// Configure global logging as requested in `cfg.logging`. A relative log
/// file lands next to the configuration file.
fn setup_logging(base: &Path, cfg: &Config) -> Result<(), fern::InitError> {
    let level = match cfg.logging.level.to_uppercase().as_str() {
        "ERROR" => LevelFilter::Error,
        "WARN" => LevelFilter::Warn,
        "DEBUG" => LevelFilter::Debug,
        "TRACE" => LevelFilter::Trace,
        "OFF" => LevelFilter::Off,
        _ => LevelFilter::Info,
    };

    let log_path = cfg
        .logging
        .enable
        .then(|| base.join(cfg.logging.file.as_deref().unwrap_or("etw-dump.log")));

    // events go to stdout, so diagnostics go to stderr
    let mut dispatch = Dispatch::new()
        .format(|out, msg, record| {
            out.finish(format_args!(
                "[{}][{:5}][{}][pid={}][tid={:?}] {}",
                Local::now().to_rfc3339(),
                record.level(),
                record.target(),
                process::id(),
                thread::current().id(),
                msg
            ))
        })
        .level(level)
        .chain(std::io::stderr());

    if let Some(path) = log_path {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }

    dispatch.apply()?;
    Ok(())
}

// ───── live tracing ─────────────────────────────────────────────────────────

#[cfg(windows)]
mod live {
    use anyhow::{Context, Result, bail};
    use crossbeam::channel;
    use std::io::{self, Write};
    use std::thread;
    use std::time::Duration;

    use etw::config::{Config, ProviderConfig, ProviderSelector, RunMode};
    use etw::etw::native::is_elevated;
    use etw::etw::{EventRecord, EventSchema, Guid, ProviderList, StopHandle, Trace, TraceSession};

    /// Render one record to stdout. Decode failures are logged; the stream
    /// carries on with the next record.
    fn print_event(record: &dyn EventRecord) {
        let printed = EventSchema::new(record).and_then(|schema| {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            schema.write_to(&mut out)?;
            writeln!(out)?;
            Ok(())
        });
        if let Err(e) = printed {
            let header = record.header();
            log::warn!("event {} of {}: {e}", header.descriptor.id, header.provider_id);
        }
    }

    fn resolve(providers: &[ProviderConfig]) -> Result<Vec<(Guid, &ProviderConfig)>> {
        let by_name = providers.iter().any(|p| matches!(p.selector, ProviderSelector::Name(_)));
        let registered = if by_name {
            ProviderList::enumerate().context("enumerating registered providers")?
        } else {
            ProviderList::default()
        };

        providers
            .iter()
            .map(|p| {
                let guid = match &p.selector {
                    ProviderSelector::Guid(guid) => *guid,
                    ProviderSelector::Name(name) => registered.guid(name)?,
                };
                Ok((guid, p))
            })
            .collect()
    }

    fn arm_timer(stopper: StopHandle, after: Duration) -> Result<()> {
        thread::Builder::new()
            .name("etw-dump-timer".into())
            .spawn(move || {
                thread::sleep(after);
                log::info!("duration of {} elapsed, stopping", humantime::format_duration(after));
                stopper.stop();
            })
            .context("spawning duration timer")?;
        Ok(())
    }

    pub fn run(cfg: &Config) -> Result<()> {
        if !is_elevated() {
            bail!("etw-dump must run elevated to control trace sessions");
        }
        if cfg.providers.is_empty() {
            log::warn!("no providers configured, only session events would arrive");
        }

        let targets = resolve(&cfg.providers)?;

        let session = TraceSession::start(cfg.session.name.as_str()).context("starting trace session")?;
        for (guid, p) in &targets {
            session
                .enable_with_keywords(guid, p.level, p.keywords)
                .with_context(|| format!("enabling provider {guid}"))?;
        }

        let trace = Trace::open_realtime(&session).context("opening real-time trace")?;
        trace.set_join_timeout(cfg.session.join_timeout);

        for (guid, p) in &targets {
            if p.event_ids.is_empty() {
                trace.on_provider_event(*guid, print_event);
            } else {
                for &id in &p.event_ids {
                    trace.on_event_id(*guid, id, print_event);
                }
            }
        }

        let (done_tx, done_rx) = channel::unbounded::<Option<u32>>();
        trace.on_stop({
            let done_tx = done_tx.clone();
            move || {
                let _ = done_tx.send(None);
            }
        });
        trace.on_error(move |status| {
            let _ = done_tx.send(Some(status));
        });

        let (interrupt_tx, interrupt_rx) = channel::bounded::<()>(1);
        let stopper = trace.stop_handle();
        ctrlc::set_handler(move || {
            log::warn!("interrupt received, stopping trace");
            let _ = interrupt_tx.try_send(());
            stopper.stop();
        })
        .context("installing Ctrl-C handler")?;

        if let Some(duration) = cfg.session.duration {
            arm_timer(trace.stop_handle(), duration)?;
        }

        log::info!("tracing {} provider(s) on '{}'", targets.len(), session.name());
        let outcome = match cfg.session.mode {
            RunMode::Blocking => trace.run().context("delivery loop failed"),
            RunMode::Background => {
                trace.run_async().context("starting delivery thread")?;
                // an abandoned worker never reports back; an interrupt is enough
                crossbeam::select! {
                    recv(done_rx) -> msg => match msg {
                        Ok(Some(status)) => Err(anyhow::anyhow!("delivery loop failed with status {status}")),
                        _ => Ok(()),
                    },
                    recv(interrupt_rx) -> _ => Ok(()),
                }
            }
        };

        let stopped = trace.stop();
        log::info!("trace stopped ({stopped:?})");
        drop(trace);
        session.close().context("closing trace session")?;
        outcome
    }
}

#[cfg(not(windows))]
mod live {
    use anyhow::{Result, bail};

    use etw::config::Config;

    pub fn run(_cfg: &Config) -> Result<()> {
        bail!("real-time tracing is only available on Windows")
    }
}

fn main() {
    // 1 ─ Context
    let path = config_path().unwrap_or_else(|e| fatal!("config", "{:#}", e));
    let cfg = config::load(&path).unwrap_or_else(|e| fatal!("config", "{}: {}", path.display(), e));

    // 2 ─ Logging
    let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
    setup_logging(&base, &cfg).unwrap_or_else(|e| fatal!("logging", "{}", e));
    log::info!("etw-dump starting with {}", path.display());

    // 3 ─ Trace until stopped
    if let Err(e) = live::run(&cfg) {
        fatal!("main", "{:#}", e);
    }
    log::info!("etw-dump finished cleanly");
}
