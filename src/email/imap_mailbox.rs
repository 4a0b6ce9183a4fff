use std::future::Future;

use async_imap::Session;
use async_native_tls::{TlsConnector, TlsStream};
use async_trait::async_trait;
use futures::stream::StreamExt;
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

use super::{MailFilter, MailSource, Message};
use crate::config::ImapConfig;
use crate::failure::PipelineError;

type ImapSession = Session<TlsStream<Compat<TcpStream>>>;

/// Listing only peeks; the seen flag is set once the attempt is stored.
const FETCH_QUERY: &str = "(UID INTERNALDATE BODY.PEEK[])";
const SEEN_FLAG: &str = "+FLAGS (\\Seen)";

/// IMAP-backed mail source. Opens a fresh session on every poll.
pub struct ImapMailbox {
    config: ImapConfig,
}

impl ImapMailbox {
    pub fn new(config: ImapConfig) -> Self {
        ImapMailbox { config }
    }

    /// Same mailbox, but processed messages keep their unseen flag.
    pub fn peek_only(mut self) -> Self {
        self.config.mark_seen = false;
        self
    }

    async fn bounded<T, E, F>(&self, step: &str, fut: F) -> Result<T, PipelineError>
    where
        F: Future<Output = Result<T, E>>,
        E: std::fmt::Debug,
    {
        match tokio::time::timeout(self.config.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(PipelineError::Connection(format!("{}: {:?}", step, e))),
            Err(_) => Err(PipelineError::Connection(format!(
                "{}: timed out after {}s",
                step,
                self.config.timeout.as_secs()
            ))),
        }
    }

    async fn connect(&self) -> Result<ImapSession, PipelineError> {
        info!("Connecting to IMAP server {}:{}", self.config.server, self.config.port);

        // Create the TCP connection
        let tcp_stream = self
            .bounded(
                "TCP connect",
                TcpStream::connect((self.config.server.as_str(), self.config.port)),
            )
            .await?;

        // Wrap it in TLS
        let tls = TlsConnector::new();
        let tls_stream = self
            .bounded("TLS handshake", tls.connect(&self.config.server, tcp_stream.compat()))
            .await?;

        // Authenticate
        let client = async_imap::Client::new(tls_stream);

        let session = self
            .bounded("login", async move {
                client
                    .login(&self.config.username, &self.config.password)
                    .await
                    .map_err(|e| e.0)
            })
            .await?;

        debug!("IMAP session established for {}", self.config.username);
        Ok(session)
    }

    async fn list(&self, session: &mut ImapSession, filter: &MailFilter) -> Result<Vec<Message>, PipelineError> {
        let mailbox = self
            .bounded("select", session.select(&self.config.mailbox))
            .await?;
        let uid_validity = mailbox.uid_validity.unwrap_or(0);

        let criteria = search_criteria(filter);
        debug!("UID SEARCH {}", criteria);
        let found = self.bounded("search", session.uid_search(&criteria)).await?;

        let uids = newest_uids(found, self.config.fetch_limit);
        if uids.is_empty() {
            info!("No unseen message in {}", self.config.mailbox);
            return Ok(Vec::new());
        }

        let uid_set = join_uids(&uids);
        debug!("UID FETCH {} {}", uid_set, FETCH_QUERY);

        let fetched = self
            .bounded("fetch", async {
                let stream = session.uid_fetch(&uid_set, FETCH_QUERY).await?;
                Ok::<_, async_imap::error::Error>(stream.collect::<Vec<_>>().await)
            })
            .await?;

        let mut messages = Vec::with_capacity(fetched.len());
        for item in fetched {
            let fetch = match item {
                Ok(fetch) => fetch,
                Err(e) => {
                    warn!("Skipping unreadable FETCH response: {:?}", e);
                    continue;
                }
            };
            let Some(uid) = fetch.uid else {
                warn!("FETCH response without UID, skipping");
                continue;
            };
            let received = fetch
                .internal_date()
                .map(|d| d.with_timezone(&chrono::Utc));
            let raw = fetch.body().unwrap_or_default();
            let message = Message::from_rfc822(format!("{}:{}", uid_validity, uid), raw, received);
            messages.push((uid, message));
        }

        messages.sort_by_key(|(uid, _)| *uid);
        let candidates: Vec<Message> = messages
            .into_iter()
            .map(|(_, message)| message)
            .filter(|message| filter.matches(message))
            .collect();

        info!(
            "{} candidate message(s) out of {} unseen in {}",
            candidates.len(),
            uids.len(),
            self.config.mailbox
        );
        Ok(candidates)
    }

    async fn flag_seen(&self, session: &mut ImapSession, messages: &[Message]) -> Result<usize, PipelineError> {
        let mailbox = self
            .bounded("select", session.select(&self.config.mailbox))
            .await?;
        let uids = uids_to_flag(messages, mailbox.uid_validity.unwrap_or(0));
        if uids.is_empty() {
            return Ok(0);
        }

        let uid_set = join_uids(&uids);
        debug!("UID STORE {} {}", uid_set, SEEN_FLAG);
        self.bounded("store", async {
            // The stream must be drained before the next command
            let stream = session.uid_store(&uid_set, SEEN_FLAG).await?;
            let _updates: Vec<_> = stream.collect().await;
            Ok::<_, async_imap::error::Error>(())
        })
        .await?;

        Ok(uids.len())
    }

    async fn logout(&self, mut session: ImapSession) {
        match tokio::time::timeout(self.config.timeout, session.logout()).await {
            Ok(Ok(())) => debug!("IMAP logout done"),
            Ok(Err(e)) => warn!("IMAP logout failed: {:?}", e),
            Err(_) => warn!("IMAP logout timed out"),
        }
    }
}

#[async_trait]
impl MailSource for ImapMailbox {
    async fn fetch_candidates(&self, filter: &MailFilter) -> Result<Vec<Message>, PipelineError> {
        let mut session = self.connect().await?;
        let result = self.list(&mut session, filter).await;
        self.logout(session).await;
        result
    }

    async fn mark_processed(&self, messages: &[Message]) -> Result<(), PipelineError> {
        if !self.config.mark_seen || messages.is_empty() {
            return Ok(());
        }

        let mut session = self.connect().await?;
        let result = self.flag_seen(&mut session, messages).await;
        self.logout(session).await;

        let flagged = result?;
        info!("✅ {} processed message(s) flagged as seen", flagged);
        Ok(())
    }
}

/// UIDs of `messages` that belong to the current UIDVALIDITY epoch.
fn uids_to_flag(messages: &[Message], uid_validity: u32) -> Vec<u32> {
    messages
        .iter()
        .filter_map(|message| match parse_message_id(&message.id) {
            Some((validity, uid)) if validity == uid_validity => Some(uid),
            Some(_) => {
                warn!("Mailbox UIDVALIDITY changed, not flagging {}", message.id);
                None
            }
            None => {
                warn!("Message id {} is not an IMAP id, not flagging it", message.id);
                None
            }
        })
        .collect()
}

/// Split a `"<uidvalidity>:<uid>"` id.
fn parse_message_id(id: &str) -> Option<(u32, u32)> {
    let (validity, uid) = id.split_once(':')?;
    Some((validity.parse().ok()?, uid.parse().ok()?))
}

fn join_uids(uids: &[u32]) -> String {
    uids.iter()
        .map(|uid| uid.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Unseen messages, narrowed server side by sender when possible.
fn search_criteria(filter: &MailFilter) -> String {
    if filter.sender.trim().is_empty() {
        return "UNSEEN".to_string();
    }
    let quoted = filter.sender.replace('\\', "\\\\").replace('"', "\\\"");
    format!("UNSEEN FROM \"{}\"", quoted)
}

/// The `limit` highest UIDs, ascending.
fn newest_uids(found: impl IntoIterator<Item = u32>, limit: usize) -> Vec<u32> {
    let mut uids: Vec<u32> = found.into_iter().collect();
    uids.sort_unstable();
    let skip = uids.len().saturating_sub(limit);
    uids.split_off(skip)
}
