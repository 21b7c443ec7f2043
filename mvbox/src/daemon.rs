//! Process wiring: shared context, both workers, restarts and shutdown

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::{AppConfig, ReconnectConfig};
use crate::error::{MvboxError, Result};
use crate::store::sqlite::SqliteBackend;
use crate::store::{MessageStore, StoreStats};
use crate::transport::imap::ImapTransport;
use crate::transport::{Interrupt, MailTransport};
use crate::worker::{FolderRole, FolderWorker, SharedContext, WorkerSettings};

fn open_store(config: &AppConfig) -> Result<MessageStore> {
    let path = config.database_path()?;
    let backend = SqliteBackend::open(&path)?;
    MessageStore::open(Box::new(backend))
}

/// Run both workers until Ctrl-C or until one of them halts for good
pub async fn run(config: AppConfig) -> Result<()> {
    let imap = config.imap_settings()?;
    let store = open_store(&config)?;
    let ctx = Arc::new(SharedContext::new(store));
    let settings = config.worker_settings();

    info!(
        "Moving chat messages from {} to {}",
        settings.source_folder, settings.target_folder
    );

    let ctrl_c = tokio::spawn({
        let ctx = ctx.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Interrupted, shutting down");
                    ctx.interrupt_all(Interrupt::Shutdown);
                }
                Err(e) => warn!("Cannot listen for Ctrl-C: {}", e),
            }
        }
    });

    let result = run_workers(ctx.clone(), settings, config.reconnect.clone(), move || {
        ImapTransport::new(imap.clone())
    })
    .await;
    ctrl_c.abort();

    if let Err(e) = ctx.store.lock().await.flush() {
        error!("Final flush failed: {}", e);
    }

    result
}

/// Spawn the target and source workers and wait for both
pub async fn run_workers<T, F>(
    ctx: Arc<SharedContext>,
    settings: WorkerSettings,
    reconnect: ReconnectConfig,
    make_transport: F,
) -> Result<()>
where
    T: MailTransport + 'static,
    F: Fn() -> T + Clone + Send + Sync + 'static,
{
    let mut handles = Vec::new();
    for role in [FolderRole::Target, FolderRole::Source] {
        let task = supervise(
            role,
            settings.clone(),
            ctx.clone(),
            reconnect.clone(),
            make_transport.clone(),
        );
        handles.push((role, tokio::spawn(task)));
    }

    let mut result = Ok(());
    for (role, handle) in handles {
        let outcome = handle.await.unwrap_or_else(|e| {
            error!("{} worker task failed: {}", role, e);
            Err(MvboxError::PeerStopped(role.to_string()))
        });
        if let Err(e) = outcome {
            if result.is_ok() {
                result = Err(e);
            }
        }
    }

    result
}

fn restartable(e: &MvboxError) -> bool {
    e.is_transport() || matches!(e, MvboxError::PeerStopped(_))
}

/// Run one worker, restarting it after recoverable failures when enabled
async fn supervise<T, F>(
    role: FolderRole,
    settings: WorkerSettings,
    ctx: Arc<SharedContext>,
    reconnect: ReconnectConfig,
    make_transport: F,
) -> Result<()>
where
    T: MailTransport + 'static,
    F: Fn() -> T + Send + Sync + 'static,
{
    let mut backoff = reconnect.backoff();
    let interrupt = ctx.interrupt_receiver(role);

    loop {
        let mut worker = FolderWorker::new(role, settings.clone(), ctx.clone(), make_transport());
        let err = match worker.run().await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        if !reconnect.enabled || !restartable(&err) {
            // The pair is useless with one side gone
            ctx.interrupt_all(Interrupt::Shutdown);
            return Err(err);
        }

        // Failures of a worker that never got through a cycle keep growing the delay
        if worker.completed_cycle() {
            backoff.reset();
        }
        let Some(delay) = backoff.next_delay() else {
            error!("{} worker gave up after {} restarts", role, backoff.retries());
            ctx.interrupt_all(Interrupt::Shutdown);
            return Err(err);
        };

        warn!(
            "Restarting {} worker in {:?} (attempt {})",
            role,
            delay,
            backoff.retries()
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            signal = interrupt.recv_async() => {
                if matches!(signal, Ok(Interrupt::Shutdown) | Err(_)) {
                    return Ok(());
                }
            }
        }
    }
}

/// Statistics of the persisted state, without connecting anywhere
pub fn status(config: &AppConfig) -> Result<StoreStats> {
    Ok(open_store(config)?.stats())
}

pub fn print_status(stats: &StoreStats, json: bool) -> Result<()> {
    if json {
        let text = serde_json::to_string_pretty(stats)
            .map_err(|e| MvboxError::Parse(format!("Failed to encode status: {}", e)))?;
        println!("{}", text);
        return Ok(());
    }

    println!("messages:      {}", stats.total);
    println!("  in source:   {}", stats.in_source);
    println!("  in target:   {}", stats.in_target);
    println!("  stuck:       {}", stats.stuck);
    println!("  to be moved: {}", stats.pending_moves);
    for (folder, watermark) in &stats.watermarks {
        println!("watermark {}: {}", folder, watermark);
    }
    Ok(())
}
