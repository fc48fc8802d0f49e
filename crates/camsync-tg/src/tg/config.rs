use serde::Deserialize;
use teloxide::types::ChatId;

#[derive(Deserialize, Clone)]
pub(crate) struct Config {
    pub(crate) token: String,

    /// The only chat where the bot accepts commands and sends notifications
    /// to. The operator owns the device, so the commands have full control
    /// over it.
    pub(crate) chat_id: ChatId,
}
