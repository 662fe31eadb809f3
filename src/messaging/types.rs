//! Shared messaging types: capabilities, chat actions, inline keyboards.

/// Feature flags of a messaging adapter. The renderer degrades gracefully
/// when a capability is absent.
#[derive(Clone, Copy, Debug)]
pub struct MessagingCapabilities {
    pub supports_html: bool,
    pub supports_edit: bool,
    pub supports_reactions: bool,
    pub supports_chat_actions: bool,
    pub supports_inline_keyboards: bool,
    pub max_message_len: usize,
}

/// Outgoing chat action (typing indicator and friends).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChatAction {
    Typing,
    UploadPhoto,
    UploadDocument,
}

/// Inline keyboard attached to a question message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InlineKeyboard {
    pub buttons: Vec<InlineButton>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InlineButton {
    pub label: String,
    pub callback_data: String,
}

impl InlineKeyboard {
    pub fn new(buttons: Vec<InlineButton>) -> Self {
        Self { buttons }
    }

    /// One button per row, labels truncated, callback data carrying the
    /// request id and option index (`askuser:<request_id>:<index>`).
    pub fn one_per_row(request_id: &str, options: &[String], max_label_len: usize) -> Self {
        let buttons = options
            .iter()
            .enumerate()
            .map(|(idx, opt)| {
                let label = if opt.chars().count() > max_label_len {
                    format!("{}...", opt.chars().take(max_label_len).collect::<String>())
                } else {
                    opt.clone()
                };
                InlineButton {
                    label,
                    callback_data: format!("askuser:{request_id}:{idx}"),
                }
            })
            .collect();
        Self { buttons }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_per_row_callback_data() {
        let kb = InlineKeyboard::one_per_row(
            "req123",
            &["yes".to_string(), "a very long option label indeed".to_string()],
            10,
        );
        assert_eq!(kb.buttons.len(), 2);
        assert_eq!(kb.buttons[0].callback_data, "askuser:req123:0");
        assert_eq!(kb.buttons[1].callback_data, "askuser:req123:1");
        assert_eq!(kb.buttons[1].label, "a very lon...");
    }
}
