//! magpie-server: the deployable XMPP daemon.
//!
//! Loads the configuration, assembles the extension pipeline, serves the
//! HTTP admin surface, and handles process signals. The raw XMPP stream
//! transport attaches sessions through the `magpie_xmpp` session API.

mod config;
mod http;
mod logging;
mod passwd;
mod statsd;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use magpie_xmpp::archive::ArchiveExtension;
use magpie_xmpp::auth::PasswordProvider;
use magpie_xmpp::disco::DiscoExtension;
use magpie_xmpp::muc::MucExtension;
use magpie_xmpp::presence::PresenceExtension;
use magpie_xmpp::privacy::PrivacyExtension;
use magpie_xmpp::proxy65::Proxy65Extension;
use magpie_xmpp::roster::RosterExtension;
use magpie_xmpp::share::ShareExtension;
use magpie_xmpp::turn::TurnExtension;
use magpie_xmpp::xep::{
    DiagExtension, PingExtension, PrivateStorageExtension, TimeExtension, VcardExtension,
    VersionExtension,
};
use magpie_xmpp::{MemoryStorage, Metrics, ServerBuilder};

use crate::config::Config;
use crate::logging::{LogSink, LogWriter};
use crate::passwd::FilePasswords;
use crate::statsd::StatsdSink;

/// XMPP server with file-share coordination.
#[derive(Debug, Parser)]
#[command(name = "magpie-server", version)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config_path = args.config.clone();
    let config = Config::load(&config_path)?;

    let sink = Arc::new(LogSink::open(config.log_file.clone())?);
    let writer = LogWriter(Arc::clone(&sink));
    let filter = EnvFilter::try_new(config.log_level.clone().unwrap_or_else(|| "info".into()))
        .context("invalid log_level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(sink.is_stdout())
        .with_writer(writer)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        domain = %config.domain,
        "starting"
    );

    let storage = Arc::new(MemoryStorage::new());
    let passwords: Arc<dyn PasswordProvider> = match &config.passwords.file {
        Some(path) => Arc::new(
            FilePasswords::load(path)
                .with_context(|| format!("loading passwords from {}", path.display()))?,
        ),
        None => Arc::new(FilePasswords::empty()),
    };
    let metrics = match &config.statsd {
        Some(statsd) => Metrics::new(Arc::new(StatsdSink::new(
            &statsd.host,
            statsd.port,
            &statsd.prefix,
        )?)),
        None => Metrics::disabled(),
    };

    let diag = Arc::new(DiagExtension::new());
    let server = ServerBuilder::new(&config.domain, storage, Arc::clone(&passwords))
        .metrics(metrics)
        .extension(Arc::new(ArchiveExtension::new()))
        .extension(Arc::clone(&diag) as Arc<dyn magpie_xmpp::Extension>)
        .extension(Arc::new(DiscoExtension::new()))
        .extension(Arc::new(MucExtension::new(config.muc.clone())))
        .extension(Arc::new(PingExtension::new()))
        .extension(Arc::new(PresenceExtension::new()))
        .extension(Arc::new(PrivacyExtension::new(config.privacy.clone())))
        .extension(Arc::new(PrivateStorageExtension::new()))
        .extension(Arc::new(Proxy65Extension::new(config.proxy65.clone())))
        .extension(Arc::new(RosterExtension::new()))
        .extension(Arc::new(ShareExtension::new(config.share.clone())))
        .extension(Arc::new(TimeExtension::new()))
        .extension(Arc::new(TurnExtension::new(config.turn.clone())))
        .extension(Arc::new(VcardExtension::new()))
        .extension(Arc::new(VersionExtension::new()))
        .build();

    server.start().await.context("starting extensions")?;

    if config.c2s.enabled {
        // the raw stream transport is layered on top of the session API
        info!(port = config.c2s.port, "c2s configured");
    }
    if config.s2s.enabled {
        info!(port = config.s2s.port, "s2s configured");
    }

    // HTTP admin surface
    let admin_state = http::AdminState {
        server: Arc::clone(&server),
        diag: Arc::clone(&diag),
        passwords,
        admin_mode: config.http.admin_mode,
    };
    let router = http::router(admin_state, config.http.auth_path.as_deref());
    let listener =
        tokio::net::TcpListener::bind((config.http.host.as_str(), config.http.port))
            .await
            .with_context(|| format!("binding http on {}:{}", config.http.host, config.http.port))?;
    info!(host = %config.http.host, port = config.http.port, "admin surface listening");

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                warn!(error = %e, "http server failed");
            }
        });
    }

    // SIGHUP reopens the log sink; SIGINT/SIGTERM shut down, twice forces
    // an exit
    let forced = Arc::new(AtomicBool::new(false));
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        {
            let sink = Arc::clone(&sink);
            let mut hangup = signal(SignalKind::hangup())?;
            tokio::spawn(async move {
                while hangup.recv().await.is_some() {
                    let log_file = Config::load(&config_path)
                        .ok()
                        .and_then(|config| config.log_file);
                    match sink.reopen(log_file) {
                        Ok(()) => info!(version = env!("CARGO_PKG_VERSION"), "reloaded"),
                        Err(e) => warn!(error = %e, "could not reopen log sink"),
                    }
                }
            });
        }

        for kind in [SignalKind::interrupt(), SignalKind::terminate()] {
            let shutdown = shutdown.clone();
            let forced = Arc::clone(&forced);
            let mut stream = signal(kind)?;
            tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    if forced.swap(true, Ordering::SeqCst) {
                        std::process::exit(1);
                    }
                    shutdown.cancel();
                }
            });
        }
    }
    #[cfg(not(unix))]
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown.cancel();
        });
    }

    shutdown.cancelled().await;
    info!("shutting down");
    server.stop().await;
    info!("exiting");
    Ok(())
}
