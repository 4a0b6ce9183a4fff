pub mod common;
pub mod imap_mailbox;

use async_trait::async_trait;

use crate::failure::PipelineError;

// Re-export commonly used items
pub use common::{MailFilter, Message, SenderMatch};
pub use imap_mailbox::ImapMailbox;

/// Source of candidate messages for one cycle.
///
/// Implementations hold no connection state between calls: every call
/// connects, lists, and disconnects.
#[async_trait]
pub trait MailSource: Send + Sync {
    /// Matching unseen messages in ascending receipt order. An empty
    /// mailbox is `Ok(vec![])`, never an error.
    ///
    /// Listing never changes message flags.
    async fn fetch_candidates(&self, filter: &MailFilter) -> Result<Vec<Message>, PipelineError>;

    /// Flag messages whose attempt is already stored so later polls stop
    /// returning them. Called after the store, never before.
    async fn mark_processed(&self, messages: &[Message]) -> Result<(), PipelineError>;
}
