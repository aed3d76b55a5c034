//! Conversation lookup and the open/closed switch moderators control.

use std::sync::Arc;

use domains::{Conversation, ConversationId, ConversationRepo, ConversationToken, DomainError, UserId};
use tracing::info;

type Result<T> = std::result::Result<T, DomainError>;

pub struct ConversationService {
    conversations: Arc<dyn ConversationRepo>,
}

impl ConversationService {
    pub fn new(conversations: Arc<dyn ConversationRepo>) -> Self {
        Self { conversations }
    }

    /// Resolve the public invite token. The internal id never leaves the server.
    pub async fn by_token(&self, token: &ConversationToken) -> Result<Conversation> {
        self.conversations
            .find_by_token(token)
            .await?
            .ok_or_else(|| DomainError::not_found("conversation", token))
    }

    /// Close or reopen a conversation. Moderators only.
    pub async fn set_active(&self, conversation: ConversationId, by: UserId, active: bool) -> Result<()> {
        if self.conversations.find_by_id(conversation).await?.is_none() {
            return Err(DomainError::not_found("conversation", conversation));
        }
        if !self.conversations.is_moderator(conversation, by).await? {
            return Err(DomainError::Forbidden("moderator rights required".into()));
        }
        self.conversations.set_active(conversation, active).await?;
        info!(conversation = %conversation, by = %by, active, "conversation state changed");
        Ok(())
    }
}
