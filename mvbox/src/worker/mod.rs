//! Per-folder control loop
//!
//! One worker watches the source folder and moves chat messages out of it,
//! the other watches the target folder so that messages which already live
//! there are known before the source worker classifies anything.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use flume::Receiver;
use serde::{Deserialize, Serialize};
use thread_classifier::{ClassifierConfig, Message};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::engine::{CascadeResolver, MoveScheduler};
use crate::error::{MvboxError, Result};
use crate::transport::{parse_headers, ChangeEvent, HeaderFetch, Interrupt, MailTransport};

pub mod context;

pub use context::{InitialPoll, SharedContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FolderRole {
    Source,
    Target,
}

impl fmt::Display for FolderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FolderRole::Source => write!(f, "source"),
            FolderRole::Target => write!(f, "target"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Connecting,
    EnsureFolder,
    Ready,
    RunJobs,
    FetchAndClassify,
    SignalInitialPollDone,
    Housekeeping,
    IdleWait,
    /// Stopped on request
    Stopped,
    /// Stopped by a fatal error
    Halted,
}

/// Settings shared by both workers
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub source_folder: String,
    pub target_folder: String,
    pub idle_timeout: Duration,
    pub housekeeping_interval: Duration,
    pub stuck_timeout: chrono::Duration,
    pub classifier: ClassifierConfig,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            source_folder: "INBOX".to_string(),
            target_folder: "DeltaChat".to_string(),
            idle_timeout: Duration::from_secs(30),
            housekeeping_interval: Duration::from_secs(60),
            stuck_timeout: chrono::Duration::hours(1),
            classifier: ClassifierConfig::default(),
        }
    }
}

/// Outcome of one fetch pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchReport {
    pub fetched: usize,
    pub stored: usize,
    pub skipped: usize,
}

/// Block until the target worker finished its first pass, or shutdown
async fn wait_for_target(ctx: &SharedContext, interrupt: &Receiver<Interrupt>) -> Result<()> {
    if ctx.initial_poll() == InitialPoll::Complete {
        return Ok(());
    }

    info!("Waiting for the target folder scan before classifying");
    loop {
        tokio::select! {
            result = ctx.wait_initial_poll() => return result,
            signal = interrupt.recv_async() => {
                if matches!(signal, Ok(Interrupt::Shutdown) | Err(_)) {
                    return Err(MvboxError::Shutdown);
                }
            }
        }
    }
}

pub struct FolderWorker<T: MailTransport> {
    role: FolderRole,
    folder: String,
    settings: WorkerSettings,
    ctx: Arc<SharedContext>,
    transport: T,
    interrupt: Receiver<Interrupt>,
    resolver: CascadeResolver,
    scheduler: Option<MoveScheduler>,
    state: WorkerState,
    passed_gate: bool,
    completed_cycle: bool,
    last_housekeeping: Option<Instant>,
}

impl<T: MailTransport> FolderWorker<T> {
    pub fn new(role: FolderRole, settings: WorkerSettings, ctx: Arc<SharedContext>, transport: T) -> Self {
        let folder = match role {
            FolderRole::Source => settings.source_folder.clone(),
            FolderRole::Target => settings.target_folder.clone(),
        };
        let scheduler = match role {
            FolderRole::Source => Some(MoveScheduler::new(settings.target_folder.clone())),
            FolderRole::Target => None,
        };

        Self {
            role,
            folder,
            resolver: CascadeResolver::new(settings.classifier.clone()),
            interrupt: ctx.interrupt_receiver(role),
            settings,
            ctx,
            transport,
            scheduler,
            state: WorkerState::Connecting,
            passed_gate: false,
            completed_cycle: false,
            last_housekeeping: None,
        }
    }

    pub fn role(&self) -> FolderRole {
        self.role
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// True once a full jobs, fetch and bookkeeping round went through
    pub fn completed_cycle(&self) -> bool {
        self.completed_cycle
    }

    /// Run until shutdown or a fatal error
    pub async fn run(&mut self) -> Result<()> {
        let span = info_span!("worker", folder = %self.folder);
        let result = match self.run_loop().instrument(span).await {
            Err(MvboxError::Shutdown) => Ok(()),
            other => other,
        };

        match &result {
            Ok(()) => {
                self.state = WorkerState::Stopped;
                info!("{} worker for {} stopped", self.role, self.folder);
            }
            Err(e) => {
                error!("{} worker for {} halted in {:?}: {}", self.role, self.folder, self.state, e);
                self.state = WorkerState::Halted;
                if self.role == FolderRole::Target {
                    self.ctx.signal_initial_poll_halted();
                }
            }
        }

        result
    }

    async fn run_loop(&mut self) -> Result<()> {
        self.state = WorkerState::Connecting;
        self.transport.connect().await?;

        if self.role == FolderRole::Target {
            self.state = WorkerState::EnsureFolder;
            self.transport.ensure_folder_exists(&self.folder).await?;
        }

        let exists = self.transport.select_folder(&self.folder).await?;
        self.state = WorkerState::Ready;
        info!("Watching {} ({} messages)", self.folder, exists);

        loop {
            self.check_interrupts()?;

            self.state = WorkerState::RunJobs;
            self.run_jobs().await?;

            self.state = WorkerState::FetchAndClassify;
            if self.role == FolderRole::Source && !self.passed_gate {
                wait_for_target(&self.ctx, &self.interrupt).await?;
                self.passed_gate = true;
            }
            let report = self.fetch_and_classify().await?;
            if report.fetched > 0 {
                info!(
                    "Fetched {} messages from {}: {} stored, {} skipped",
                    report.fetched, self.folder, report.stored, report.skipped
                );
            }

            match self.role {
                FolderRole::Target => {
                    self.state = WorkerState::SignalInitialPollDone;
                    self.ctx.signal_initial_poll_done();
                    self.completed_cycle = true;
                }
                FolderRole::Source => {
                    self.state = WorkerState::Housekeeping;
                    self.housekeeping().await;
                    self.completed_cycle = true;

                    if self.ctx.store.lock().await.has_pending_moves() {
                        debug!("Moves pending, skipping idle");
                        continue;
                    }
                }
            }

            self.state = WorkerState::IdleWait;
            let events = self
                .transport
                .long_poll_wait(self.settings.idle_timeout, &self.interrupt)
                .await?;
            for event in &events {
                match event {
                    ChangeEvent::Interrupted(Interrupt::Shutdown) => return Err(MvboxError::Shutdown),
                    other => debug!("Change in {}: {:?}", self.folder, other),
                }
            }
        }
    }

    /// Drain queued interrupts; a queued shutdown ends the loop
    fn check_interrupts(&self) -> Result<()> {
        if self.interrupt.try_iter().any(|signal| signal == Interrupt::Shutdown) {
            return Err(MvboxError::Shutdown);
        }
        Ok(())
    }

    async fn run_jobs(&mut self) -> Result<()> {
        if let Some(scheduler) = &self.scheduler {
            let moved = scheduler.run(&self.ctx.store, &mut self.transport).await?;
            if moved > 0 {
                let mut store = self.ctx.store.lock().await;
                if let Err(e) = store.flush() {
                    warn!("Failed to persist moves, retrying next cycle: {}", e);
                }
            }
        }
        Ok(())
    }

    /// Fetch everything above the folder watermark and classify it.
    ///
    /// The watermark advances message by message, and the pass ends with a
    /// single flush. A failed flush is retried on the next pass.
    pub async fn fetch_and_classify(&mut self) -> Result<FetchReport> {
        let watermark = self.ctx.store.lock().await.watermark(&self.folder);
        let fetched = self.transport.fetch_headers_since(watermark).await?;

        let mut report = FetchReport::default();
        for (&seq, fetch) in fetched.iter().filter(|(seq, _)| **seq > watermark) {
            report.fetched += 1;
            if self.process(seq, fetch).await? {
                report.stored += 1;
            } else {
                report.skipped += 1;
            }
        }

        let mut store = self.ctx.store.lock().await;
        if let Err(e) = store.flush() {
            warn!("Flush after fetching {} failed, retrying next cycle: {}", self.folder, e);
        }

        Ok(report)
    }

    /// Handle one fetched message. Returns true if it was newly stored.
    async fn process(&mut self, seq: u32, fetch: &HeaderFetch) -> Result<bool> {
        let headers = match parse_headers(&fetch.headers) {
            Ok(headers) => headers,
            Err(e) => {
                warn!("Unparsable headers for {} in {}, skipping: {}", seq, self.folder, e);
                self.ctx.store.lock().await.advance_watermark(&self.folder, seq);
                return Ok(false);
            }
        };

        let Some(id) = headers.message_id.clone() else {
            warn!("Message {} in {} has no Message-ID, skipping", seq, self.folder);
            self.ctx.store.lock().await.advance_watermark(&self.folder, seq);
            return Ok(false);
        };

        if self.ctx.store.lock().await.has(&id) {
            let mut store = self.ctx.store.lock().await;
            self.handle_known(&mut store, &id)?;
            store.advance_watermark(&self.folder, seq);
            return Ok(false);
        }

        let body = self.transport.fetch_full_body(seq).await?;
        let actual = parse_headers(&body)?.message_id;
        if actual.as_deref() != Some(id.as_str()) {
            return Err(MvboxError::MessageIdMismatch {
                seq,
                expected: id,
                actual: actual.unwrap_or_default(),
            });
        }

        let mut store = self.ctx.store.lock().await;
        // The other worker may have stored it while the body was in flight
        if store.has(&id) {
            self.handle_known(&mut store, &id)?;
            store.advance_watermark(&self.folder, seq);
            return Ok(false);
        }

        let now = Utc::now();
        match self.role {
            FolderRole::Source => {
                store.put(Message::new_in_source(
                    id.clone(),
                    headers.parent_id,
                    headers.is_protocol_message,
                    seq,
                    fetch.size,
                    now,
                ))?;
                let (settled, report) = self.resolver.admit(&mut store, &id)?;
                debug!(
                    "Stored {} (uid {}, {} bytes), settled: {}, cascade: {:?}",
                    id, seq, fetch.size, settled, report
                );
            }
            FolderRole::Target => {
                store.put(Message::new_in_target(
                    id.clone(),
                    headers.parent_id,
                    headers.is_protocol_message,
                    fetch.size,
                    now,
                ))?;
                let report = self.resolver.cascade_from(&mut store, &id)?;
                debug!("Stored {} as already moved, cascade: {:?}", id, report);
            }
        }
        store.advance_watermark(&self.folder, seq);

        Ok(true)
    }

    fn handle_known(&self, store: &mut crate::store::MessageStore, id: &str) -> Result<()> {
        match self.role {
            FolderRole::Source => debug!("{} already stored", id),
            FolderRole::Target => {
                self.resolver.observe_in_target(store, id)?;
            }
        }
        Ok(())
    }

    /// Release long-stuck messages, at most once per housekeeping interval
    async fn housekeeping(&mut self) {
        let due = self
            .last_housekeeping
            .map_or(true, |at| at.elapsed() >= self.settings.housekeeping_interval);
        if !due {
            return;
        }
        self.last_housekeeping = Some(Instant::now());

        let mut store = self.ctx.store.lock().await;
        let released = match self
            .resolver
            .release_expired(&mut store, Utc::now(), self.settings.stuck_timeout)
        {
            Ok(released) => released,
            Err(e) => {
                warn!("Housekeeping failed: {}", e);
                return;
            }
        };
        if released > 0 {
            if let Err(e) = store.flush() {
                warn!("Flush after housekeeping failed, retrying next cycle: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryBackend;
    use crate::store::MessageStore;
    use crate::transport::memory::MemoryServer;
    use thread_classifier::Location;

    fn settings() -> WorkerSettings {
        WorkerSettings {
            idle_timeout: Duration::from_millis(50),
            ..Default::default()
        }
    }

    fn context(backend: &MemoryBackend) -> Arc<SharedContext> {
        let store = MessageStore::open(Box::new(backend.clone())).unwrap();
        Arc::new(SharedContext::new(store))
    }

    fn chat(id: &str, parent: Option<&str>) -> String {
        match parent {
            Some(parent) => format!(
                "Message-ID: <{}>\r\nIn-Reply-To: <{}>\r\nChat-Version: 1.0\r\n\r\nhi",
                id, parent
            ),
            None => format!("Message-ID: <{}>\r\nChat-Version: 1.0\r\n\r\nhi", id),
        }
    }

    fn plain(id: &str, parent: Option<&str>) -> String {
        match parent {
            Some(parent) => format!("Message-ID: <{}>\r\nIn-Reply-To: <{}>\r\n\r\nhi", id, parent),
            None => format!("Message-ID: <{}>\r\n\r\nhi", id),
        }
    }

    async fn connected_worker(
        role: FolderRole,
        ctx: &Arc<SharedContext>,
        server: &MemoryServer,
    ) -> FolderWorker<crate::transport::memory::MemoryTransport> {
        let mut worker = FolderWorker::new(role, settings(), ctx.clone(), server.transport());
        worker.transport.connect().await.unwrap();
        worker.transport.ensure_folder_exists(&worker.folder).await.unwrap();
        worker.transport.select_folder(&worker.folder.clone()).await.unwrap();
        worker
    }

    #[tokio::test]
    async fn test_source_waits_for_target_first_pass() {
        let server = MemoryServer::new(&["INBOX"]);
        server.deliver("INBOX", &chat("a@x", None));
        let ctx = context(&MemoryBackend::default());

        let source = tokio::spawn({
            let ctx = ctx.clone();
            let server = server.clone();
            async move {
                let mut worker = FolderWorker::new(FolderRole::Source, settings(), ctx, server.transport());
                worker.run().await
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(server.moves().is_empty());
        assert!(!ctx.store.lock().await.has("a@x"));

        let target = tokio::spawn({
            let ctx = ctx.clone();
            let server = server.clone();
            async move {
                let mut worker = FolderWorker::new(FolderRole::Target, settings(), ctx, server.transport());
                worker.run().await
            }
        });

        for _ in 0..50 {
            if !server.moves().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(server.has_folder("DeltaChat"));
        assert_eq!(server.moves().len(), 1);
        assert_eq!(server.folder_len("INBOX"), 0);

        ctx.interrupt_all(Interrupt::Shutdown);
        source.await.unwrap().unwrap();
        target.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_previously_moved_message_is_not_moved_again() {
        let server = MemoryServer::new(&["INBOX", "DeltaChat"]);
        server.deliver("DeltaChat", &chat("a@x", None));
        // A copy of the same message reappears in the source folder
        server.deliver("INBOX", &chat("a@x", None));
        server.deliver("INBOX", &plain("b@x", Some("a@x")));
        let ctx = context(&MemoryBackend::default());

        let mut target = connected_worker(FolderRole::Target, &ctx, &server).await;
        target.fetch_and_classify().await.unwrap();
        ctx.signal_initial_poll_done();

        let mut source = connected_worker(FolderRole::Source, &ctx, &server).await;
        let report = source.fetch_and_classify().await.unwrap();
        assert_eq!(report, FetchReport { fetched: 2, stored: 1, skipped: 1 });

        let store = ctx.store.lock().await;
        assert_eq!(store.get("a@x").unwrap().location, Location::Target);
        // The reply hangs off a moved parent and follows it
        assert_eq!(store.move_batch(), vec![("b@x".to_string(), 2)]);
    }

    #[tokio::test]
    async fn test_refetch_is_idempotent() {
        let server = MemoryServer::new(&["INBOX", "DeltaChat"]);
        server.deliver("INBOX", &plain("a@x", None));
        server.deliver("INBOX", &chat("b@x", Some("a@x")));
        let ctx = context(&MemoryBackend::default());
        let mut source = connected_worker(FolderRole::Source, &ctx, &server).await;

        assert_eq!(source.fetch_and_classify().await.unwrap().stored, 2);
        let before: Vec<Message> = {
            let store = ctx.store.lock().await;
            let mut all: Vec<Message> = store.messages().cloned().collect();
            all.sort_by(|a, b| a.id.cmp(&b.id));
            all
        };

        assert_eq!(source.fetch_and_classify().await.unwrap(), FetchReport::default());

        let store = ctx.store.lock().await;
        let mut after: Vec<Message> = store.messages().cloned().collect();
        after.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(before, after);
        assert_eq!(store.watermark("INBOX"), 2);
    }

    #[tokio::test]
    async fn test_message_without_id_advances_watermark() {
        let server = MemoryServer::new(&["INBOX", "DeltaChat"]);
        server.deliver("INBOX", "Subject: no id\r\n\r\nhi");
        server.deliver("INBOX", &chat("a@x", None));
        let ctx = context(&MemoryBackend::default());
        let mut source = connected_worker(FolderRole::Source, &ctx, &server).await;

        let report = source.fetch_and_classify().await.unwrap();
        assert_eq!(report, FetchReport { fetched: 2, stored: 1, skipped: 1 });
        let store = ctx.store.lock().await;
        assert_eq!(store.len(), 1);
        assert_eq!(store.watermark("INBOX"), 2);
    }

    #[tokio::test]
    async fn test_parent_moved_in_target_releases_stuck_child() {
        let server = MemoryServer::new(&["INBOX", "DeltaChat"]);
        server.deliver("INBOX", &plain("c@x", Some("p@x")));
        let ctx = context(&MemoryBackend::default());
        ctx.signal_initial_poll_done();

        let mut source = connected_worker(FolderRole::Source, &ctx, &server).await;
        source.fetch_and_classify().await.unwrap();
        assert!(ctx.store.lock().await.get("c@x").unwrap().stuck);

        // The parent turns up in the target folder, moved by another client
        server.deliver("DeltaChat", &chat("p@x", None));
        let mut target = connected_worker(FolderRole::Target, &ctx, &server).await;
        target.fetch_and_classify().await.unwrap();

        let store = ctx.store.lock().await;
        let c = store.get("c@x").unwrap();
        assert!(!c.stuck);
        assert_eq!(c.target_location, Location::Target);
    }

    #[tokio::test]
    async fn test_pending_moves_skip_idle_wait() {
        let server = MemoryServer::new(&["INBOX", "DeltaChat"]);
        let ctx = context(&MemoryBackend::default());
        ctx.signal_initial_poll_done();

        let mut worker = FolderWorker::new(
            FolderRole::Source,
            WorkerSettings {
                idle_timeout: Duration::from_secs(3600),
                ..Default::default()
            },
            ctx.clone(),
            server.transport(),
        );
        let handle = tokio::spawn(async move { worker.run().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        // Arrives while the worker sits in its hour-long wait
        server.deliver("INBOX", &chat("a@x", None));

        for _ in 0..50 {
            if !server.moves().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(server.moves().len(), 1);

        ctx.interrupt_all(Interrupt::Shutdown);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_move_halts_source_worker() {
        let server = MemoryServer::new(&["INBOX", "DeltaChat"]);
        server.deliver("INBOX", &chat("a@x", None));
        server.fail_next_move();
        let ctx = context(&MemoryBackend::default());
        ctx.signal_initial_poll_done();

        let mut worker = FolderWorker::new(FolderRole::Source, settings(), ctx.clone(), server.transport());
        let err = worker.run().await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(worker.state(), WorkerState::Halted);

        // The decision survived and is still queued
        assert_eq!(ctx.store.lock().await.move_batch().len(), 1);
    }

    #[tokio::test]
    async fn test_restart_resumes_from_persisted_state() {
        let server = MemoryServer::new(&["INBOX", "DeltaChat"]);
        server.deliver("INBOX", &chat("a@x", None));
        server.deliver("INBOX", &plain("b@x", None));
        let backend = MemoryBackend::default();

        {
            let ctx = context(&backend);
            let mut source = connected_worker(FolderRole::Source, &ctx, &server).await;
            source.fetch_and_classify().await.unwrap();
        }

        let ctx = context(&backend);
        {
            let store = ctx.store.lock().await;
            assert_eq!(store.watermark("INBOX"), 2);
            assert_eq!(store.move_batch(), vec![("a@x".to_string(), 1)]);
        }

        let mut source = connected_worker(FolderRole::Source, &ctx, &server).await;
        assert_eq!(source.fetch_and_classify().await.unwrap(), FetchReport::default());
        source.run_jobs().await.unwrap();
        assert_eq!(server.moves().len(), 1);
        assert_eq!(server.folder_len("INBOX"), 1);
    }

    #[tokio::test]
    async fn test_housekeeping_releases_and_persists_then_waits_for_interval() {
        let server = MemoryServer::new(&["INBOX", "DeltaChat"]);
        server.deliver("INBOX", &plain("c@x", Some("p@x")));
        let backend = MemoryBackend::default();
        let ctx = context(&backend);
        ctx.signal_initial_poll_done();

        let mut source = connected_worker(FolderRole::Source, &ctx, &server).await;
        source.settings.stuck_timeout = chrono::Duration::zero();
        source.fetch_and_classify().await.unwrap();
        assert!(ctx.store.lock().await.get("c@x").unwrap().stuck);

        tokio::time::sleep(Duration::from_millis(5)).await;
        source.housekeeping().await;
        assert!(!ctx.store.lock().await.get("c@x").unwrap().stuck);
        // The release reached the backend
        let reopened = MessageStore::open(Box::new(backend.clone())).unwrap();
        let c = reopened.get("c@x").unwrap();
        assert!(!c.stuck);
        assert_eq!(c.target_location, Location::Source);

        // A second stuck message is left alone until the interval passes
        server.deliver("INBOX", &plain("d@x", Some("q@x")));
        source.fetch_and_classify().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        source.housekeeping().await;
        assert!(ctx.store.lock().await.get("d@x").unwrap().stuck);
    }

    #[tokio::test]
    async fn test_target_halt_releases_waiting_source() {
        let server = MemoryServer::new(&["INBOX"]);
        let ctx = context(&MemoryBackend::default());

        let source = tokio::spawn({
            let ctx = ctx.clone();
            let server = server.clone();
            async move {
                let mut worker = FolderWorker::new(FolderRole::Source, settings(), ctx, server.transport());
                worker.run().await
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        ctx.signal_initial_poll_halted();
        let err = source.await.unwrap().unwrap_err();
        assert!(matches!(err, MvboxError::PeerStopped(_)));
    }
}
