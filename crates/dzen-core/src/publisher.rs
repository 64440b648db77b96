use std::{sync::Arc, time::Duration};

use crate::{chat::port::ChatClient, domain::ChatTarget, errors::Error, Result};

/// Sends transformed text back out through the chat client.
pub struct Publisher {
    chat: Arc<dyn ChatClient>,
    timeout: Duration,
}

impl Publisher {
    pub fn new(chat: Arc<dyn ChatClient>, timeout: Duration) -> Self {
        Self { chat, timeout }
    }

    /// Deliver `text` to `target`; rejections and timeouts come back as `Error::Delivery`.
    pub async fn publish(&self, target: &ChatTarget, text: &str) -> Result<()> {
        match tokio::time::timeout(self.timeout, self.chat.send_message(target, text)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(Error::Delivery { target, reason })) => Err(Error::Delivery { target, reason }),
            Ok(Err(e)) => Err(Error::Delivery {
                target: target.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::Delivery {
                target: target.to_string(),
                reason: format!("timed out after {}ms", self.timeout.as_millis()),
            }),
        }
    }
}
