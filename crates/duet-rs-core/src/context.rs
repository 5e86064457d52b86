//! Context window construction.

use duet_rs_protocol::{ContextMessage, ConversationContext, Message, MessageStatus, Role};
use log::debug;

/// Builds the bounded history slice sent to adapters for one turn.
#[derive(Debug, Clone, Copy)]
pub struct ContextWindow {
    size: usize,
}

impl ContextWindow {
    /// Window holding up to `size` prior messages (at least one).
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Build the context for a turn. `history` ends with the user turn being
    /// answered, which is always kept.
    ///
    /// Only completed exchanges (a user message followed by a final assistant
    /// reply) are eligible, so failed replies and the prompts that produced
    /// them never reach an adapter. The window then takes the last `size`
    /// eligible messages and widens by one if it would open on an assistant
    /// reply.
    pub fn build(&self, history: &[Message]) -> ConversationContext {
        let Some((turn, prior)) = history.split_last() else {
            return ConversationContext::default();
        };

        let eligible = completed_exchanges(prior);
        let mut start = eligible.len().saturating_sub(self.size);
        if start > 0 && eligible[start].role == Role::Assistant {
            start -= 1;
        }

        let messages: Vec<ContextMessage> = eligible[start..]
            .iter()
            .copied()
            .chain(std::iter::once(turn))
            .map(to_context_message)
            .collect();
        debug!(
            "built context window (history={}, eligible={}, window={})",
            history.len(),
            eligible.len(),
            messages.len()
        );
        ConversationContext::new(messages)
    }
}

fn completed_exchanges(prior: &[Message]) -> Vec<&Message> {
    let mut eligible = Vec::with_capacity(prior.len());
    let mut index = 0;
    while index < prior.len() {
        let message = &prior[index];
        match prior.get(index + 1) {
            Some(reply)
                if message.role == Role::User
                    && reply.role == Role::Assistant
                    && reply.status == MessageStatus::Final =>
            {
                eligible.push(message);
                eligible.push(reply);
                index += 2;
            }
            _ => index += 1,
        }
    }
    eligible
}

fn to_context_message(message: &Message) -> ContextMessage {
    ContextMessage {
        role: message.role,
        text: message.text.clone(),
        images: message.image_refs.clone(),
    }
}
