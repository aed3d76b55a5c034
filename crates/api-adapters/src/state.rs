use std::sync::Arc;

use services::{
    CommentService, ConversationService, MathCache, ParticipantService, SelectionService,
    VoteService,
};

use crate::metrics::ApiMetrics;

/// Everything a handler can reach. Cloned per request; every field is shared.
#[derive(Clone)]
pub struct AppState {
    pub conversations: Arc<ConversationService>,
    pub participants: Arc<ParticipantService>,
    pub votes: Arc<VoteService>,
    pub comments: Arc<CommentService>,
    pub selection: Arc<SelectionService>,
    pub math: Arc<MathCache>,
    pub metrics: Arc<ApiMetrics>,
}
