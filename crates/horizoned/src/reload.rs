//! The view reload lifecycle.  Reloads come from three places - an
//! HTTP POST, a SIGHUP, and the answers-file watcher - and all funnel
//! into one channel, so at most one reload runs at a time and a
//! half-installed view can never be observed.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, oneshot};

use view_resolver::view::{AnswerView, ViewError};

use crate::config::Config;
use crate::metrics::VIEW_RELOADS_TOTAL;
use crate::server::Server;

/// How often the answers file is polled for changes when
/// metadata-driven reloads are on.
const WATCH_PERIOD: Duration = Duration::from_secs(2);

/// A reload request.  The HTTP endpoint wants to hear how it went;
/// the signal handler and the watcher do not.
pub struct ReloadRequest {
    pub reply: Option<oneshot::Sender<Result<(), String>>>,
}

pub type ReloadSender = mpsc::Sender<ReloadRequest>;

/// An error loading the answers snapshot.
#[derive(Debug)]
pub enum ReloadError {
    Read(io::Error),
    Parse(ViewError),
}

impl std::fmt::Display for ReloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ReloadError::Read(error) => write!(f, "could not read answers file: {error}"),
            ReloadError::Parse(error) => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for ReloadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReloadError::Read(error) => Some(error),
            ReloadError::Parse(error) => Some(error),
        }
    }
}

/// Read, parse, and prepare a view from the configured answers file.
/// This is used both at startup and on every reload.
pub async fn load_view(config: &Config) -> Result<AnswerView, ReloadError> {
    let data = tokio::fs::read_to_string(&config.answers_file)
        .await
        .map_err(ReloadError::Read)?;
    let mut view = AnswerView::from_json(&data).map_err(ReloadError::Parse)?;
    apply_view_policy(&mut view, config);
    Ok(view)
}

/// Configuration-driven touch-ups a freshly-parsed view gets before
/// installation: forbidden recursers are stripped, and the metadata
/// name is pinned under every authoritative zone.
fn apply_view_policy(view: &mut AnswerView, config: &Config) {
    view.strip_recursers(&config.never_recurse_to);

    if !config.metadata_answer.is_empty() {
        let zones: Vec<String> = view
            .authoritative_suffixes()
            .iter()
            .map(|suffix| suffix.trim_start_matches('.').to_string())
            .collect();
        for zone in zones {
            view.add_default_a(&format!("metadata.{zone}"), config.metadata_answer.clone());
        }
    }
}

/// The single consumer of reload requests.  A failed reload keeps the
/// previous view and reports the error back to whoever asked.
pub async fn reload_task(server: Arc<Server>, mut rx: mpsc::Receiver<ReloadRequest>) {
    while let Some(request) = rx.recv().await {
        let start = Instant::now();
        let result = match load_view(server.config()).await {
            Ok(view) => {
                server.install_view(view).await;
                VIEW_RELOADS_TOTAL.with_label_values(&["success"]).inc();
                tracing::info!(duration_seconds = %start.elapsed().as_secs_f64(), "reload done");
                Ok(())
            }
            Err(error) => {
                VIEW_RELOADS_TOTAL.with_label_values(&["failure"]).inc();
                tracing::error!(%error, "reload failed, keeping previous view");
                Err(error.to_string())
            }
        };

        if let Some(reply) = request.reply {
            // the caller may have hung up, which is fine
            let _ = reply.send(result);
        }
    }
}

/// Reload on SIGHUP, exactly like a POST to the reload endpoint.
pub async fn sighup_task(tx: ReloadSender) {
    let mut stream = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!(?error, "could not subscribe to SIGHUP");
            std::process::exit(1);
        }
    };

    loop {
        stream.recv().await;
        tracing::info!("received SIGHUP");
        if tx.send(ReloadRequest { reply: None }).await.is_err() {
            return;
        }
    }
}

/// Watch the answers file and reload when the generator rewrites it.
/// Used when a metadata server is configured, since the generator
/// then updates the snapshot behind our back.
pub async fn watch_answers_task(tx: ReloadSender, path: impl AsRef<Path>) {
    let path = path.as_ref();
    let mut last_modified = modified_time(path).await;

    loop {
        tokio::time::sleep(WATCH_PERIOD).await;

        let modified = modified_time(path).await;
        if modified != last_modified {
            tracing::info!(?path, "answers file changed");
            last_modified = modified;
            if tx.send(ReloadRequest { reply: None }).await.is_err() {
                return;
            }
        }
    }
}

async fn modified_time(path: &Path) -> Option<SystemTime> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata.modified().ok(),
        Err(_) => None,
    }
}
