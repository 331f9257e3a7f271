/// Capabilities / limits of a messenger implementation.
#[derive(Clone, Copy, Debug)]
pub struct MessagingCapabilities {
    pub max_message_len: usize,
}

impl MessagingCapabilities {
    /// Clamp `text` to the transport limit, on a char boundary.
    pub fn fit(&self, text: &str) -> String {
        if text.chars().count() <= self.max_message_len {
            return text.to_string();
        }
        let keep = self.max_message_len.saturating_sub(3);
        let mut out = text.chars().take(keep).collect::<String>();
        out.push_str("...");
        out
    }
}
