use std::collections::BTreeMap;
use std::time::Duration;

use async_imap::extensions::idle::IdleResponse;
use async_imap::imap_proto::{MailboxDatum, Response};
use async_imap::types::Fetch;
use async_imap::Session;
use async_native_tls::TlsStream;
use async_trait::async_trait;
use flume::Receiver;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, info, warn};

use super::{ChangeEvent, HeaderFetch, Interrupt, MailTransport, FETCHED_HEADERS};
use crate::error::{MvboxError, Result};

// An IMAP session is generic over the stream type: TLS-encrypted TCP
// wrapped in a tokio compat layer.
pub type ImapSession = Session<TlsStream<Compat<TcpStream>>>;

/// Connection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

/// [`MailTransport`] over a single IMAP connection
pub struct ImapTransport {
    settings: ImapSettings,
    session: Option<ImapSession>,
    can_idle: bool,
}

impl ImapTransport {
    pub fn new(settings: ImapSettings) -> Self {
        Self {
            settings,
            session: None,
            can_idle: false,
        }
    }

    fn session(&mut self) -> Result<&mut ImapSession> {
        self.session
            .as_mut()
            .ok_or_else(|| MvboxError::Transport("Not connected".into()))
    }
}

fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(|u| u.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// UID range above the watermark. At the top of the UID space the range
/// only matches the watermark itself, which the caller filters out.
fn fetch_range(watermark: u32) -> String {
    format!("{}:*", watermark.saturating_add(1))
}

fn header_fetch(fetch: &Fetch) -> HeaderFetch {
    HeaderFetch {
        size: fetch.size.unwrap_or(0),
        flags: fetch.flags().map(|f| format!("{:?}", f)).collect(),
        headers: fetch.header().unwrap_or(&[]).to_vec(),
    }
}

fn change_event(response: &Response) -> ChangeEvent {
    match response {
        Response::MailboxData(MailboxDatum::Exists(exists)) => ChangeEvent::NewMessages {
            exists: *exists,
        },
        Response::Expunge(seq) => ChangeEvent::Expunged { seq: *seq },
        other => ChangeEvent::Other(format!("{:?}", other)),
    }
}

#[async_trait]
impl MailTransport for ImapTransport {
    async fn connect(&mut self) -> Result<()> {
        let host = self.settings.host.clone();
        let port = self.settings.port;
        info!(host = %host, port = port, user = %self.settings.user, "Connecting to IMAP server");

        let tcp = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| MvboxError::Transport(format!("TCP connection failed: {}", e)))?;

        let tcp = tcp.compat();
        let tls = async_native_tls::TlsConnector::new();
        let tls_stream = tls
            .connect(host.as_str(), tcp)
            .await
            .map_err(|e| MvboxError::Transport(format!("TLS handshake failed: {}", e)))?;

        let client = async_imap::Client::new(tls_stream);

        let mut session = client
            .login(&self.settings.user, &self.settings.password)
            .await
            .map_err(|(e, _)| MvboxError::Transport(format!("Login failed: {}", e)))?;

        let capabilities = session.capabilities().await?;
        self.can_idle = capabilities.has_str("IDLE");
        debug!("Server supports IDLE: {}", self.can_idle);

        self.session = Some(session);
        Ok(())
    }

    async fn select_folder(&mut self, name: &str) -> Result<u32> {
        let mailbox = self
            .session()?
            .select(name)
            .await
            .map_err(|e| MvboxError::Transport(format!("SELECT {} failed: {}", name, e)))?;
        info!("Folder {} has {} messages", name, mailbox.exists);
        Ok(mailbox.exists)
    }

    async fn ensure_folder_exists(&mut self, name: &str) -> Result<()> {
        match self.session()?.create(name).await {
            Ok(()) => {
                info!("Created folder {}", name);
                Ok(())
            }
            Err(e) => {
                let text = e.to_string().to_lowercase();
                if text.contains("alreadyexists") || text.contains("already exists") {
                    debug!("Folder {} already exists", name);
                    Ok(())
                } else {
                    Err(MvboxError::Transport(format!("CREATE {} failed: {}", name, e)))
                }
            }
        }
    }

    async fn fetch_headers_since(&mut self, watermark: u32) -> Result<BTreeMap<u32, HeaderFetch>> {
        let range = fetch_range(watermark);
        let query = format!(
            "(UID RFC822.SIZE FLAGS BODY.PEEK[HEADER.FIELDS ({})])",
            FETCHED_HEADERS.join(" ")
        );

        let fetches: Vec<Fetch> = self
            .session()?
            .uid_fetch(&range, &query)
            .await
            .map_err(|e| MvboxError::Transport(format!("FETCH {} failed: {}", range, e)))?
            .try_collect()
            .await
            .map_err(|e| MvboxError::Transport(format!("Collect failed: {}", e)))?;

        // "n:*" always matches the highest UID, even when it is below n
        let headers = fetches
            .iter()
            .filter_map(|fetch| fetch.uid.map(|uid| (uid, header_fetch(fetch))))
            .filter(|(uid, _)| *uid > watermark)
            .collect();

        Ok(headers)
    }

    async fn fetch_full_body(&mut self, seq: u32) -> Result<Vec<u8>> {
        let fetches: Vec<Fetch> = self
            .session()?
            .uid_fetch(seq.to_string(), "(UID BODY.PEEK[])")
            .await
            .map_err(|e| MvboxError::Transport(format!("FETCH body {} failed: {}", seq, e)))?
            .try_collect()
            .await
            .map_err(|e| MvboxError::Transport(format!("Collect body failed: {}", e)))?;

        fetches
            .iter()
            .find(|f| f.uid == Some(seq))
            .and_then(|f| f.body())
            .map(|body| body.to_vec())
            .ok_or_else(|| MvboxError::Transport(format!("No body returned for UID {}", seq)))
    }

    async fn move_messages(&mut self, seqs: &[u32], dest_folder: &str) -> Result<()> {
        let set = uid_set(seqs);
        self.session()?
            .uid_mv(&set, dest_folder)
            .await
            .map_err(|e| MvboxError::Transport(format!("MOVE {} failed: {}", set, e)))?;
        info!("IMAP MOVE to {}: {} -> done", dest_folder, set);
        Ok(())
    }

    async fn long_poll_wait(
        &mut self,
        timeout: Duration,
        interrupt: &Receiver<Interrupt>,
    ) -> Result<Vec<ChangeEvent>> {
        if !self.can_idle {
            // No IDLE: a plain timed wait, the next fetch picks up changes
            return Ok(tokio::select! {
                _ = tokio::time::sleep(timeout) => vec![],
                signal = interrupt.recv_async() => match signal {
                    Ok(signal) => vec![ChangeEvent::Interrupted(signal)],
                    Err(_) => vec![],
                },
            });
        }

        let session = self
            .session
            .take()
            .ok_or_else(|| MvboxError::Transport("Not connected".into()))?;
        let mut handle = session.idle();
        handle
            .init()
            .await
            .map_err(|e| MvboxError::Transport(format!("IDLE failed: {}", e)))?;

        let (response, received) = {
            let (idle_wait, stop) = handle.wait_with_timeout(timeout);
            tokio::pin!(idle_wait);
            tokio::select! {
                response = &mut idle_wait => (response, None),
                signal = interrupt.recv_async() => {
                    // Dropping the stop source ends the IDLE wait
                    drop(stop);
                    (idle_wait.await, signal.ok())
                }
            }
        };

        let session = handle
            .done()
            .await
            .map_err(|e| MvboxError::Transport(format!("IDLE DONE failed: {}", e)))?;
        self.session = Some(session);

        let mut events = Vec::new();
        match response {
            Ok(IdleResponse::NewData(data)) => {
                let event = change_event(data.parsed());
                debug!("Server sent: {:?}", event);
                events.push(event);
            }
            Ok(IdleResponse::Timeout) => debug!("Server sent: nothing"),
            Ok(IdleResponse::ManualInterrupt) => debug!("IDLE interrupted"),
            Err(e) => warn!("IDLE wait failed: {}", e),
        }
        if let Some(signal) = received {
            events.push(ChangeEvent::Interrupted(signal));
        }

        Ok(events)
    }
}
