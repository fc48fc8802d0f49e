//! Rust analyzer is very slow on processing requester extension here, so extracted
//! it to a separate module to limit the scope of analysis.

use easy_ext::ext;
use teloxide::prelude::*;
use teloxide::requests::Requester;
use teloxide::types::Message;
use teloxide::utils::markdown;

/// Telegram refuses messages longer than this number of UTF-16 code units.
/// We count chars instead, which is a bit more conservative for most texts.
const MAX_MESSAGE_LEN: usize = 4096;

/// There is [`RequesterExt`] in [`teloxide::prelude`]. We name this symbol
/// different to avoid collisions.
#[ext(UtilRequesterExt)]
pub(crate) impl<T: Requester> T {
    /// Reply to the message with plain text escaped for MarkdownV2
    fn reply_text(&self, msg: &Message, text: &str) -> Self::SendMessage {
        self.reply_md(msg, escape_truncated(text))
    }

    /// Reply to the message with the text in a monospace code block
    fn reply_code_block(&self, msg: &Message, code: &str) -> Self::SendMessage {
        self.reply_md(msg, code_block_truncated(code))
    }

    fn reply_help_md_escaped<Cmd: teloxide::utils::command::BotCommands>(
        &self,
        msg: &Message,
    ) -> Self::SendMessage {
        self.reply_text(msg, &Cmd::descriptions().to_string())
    }

    fn reply_md(&self, msg: &Message, md: String) -> Self::SendMessage {
        self.send_message(msg.chat.id, md)
            .reply_to_message_id(msg.id)
            .allow_sending_without_reply(true)
    }
}

/// [`markdown::escape`] that fits the result into a single message. The text
/// is cut before escaping, so an escape sequence is never split in half.
pub(crate) fn escape_truncated(text: &str) -> String {
    markdown::escape(prefix_within(text, MAX_MESSAGE_LEN, markdown::escape))
}

/// [`markdown::code_block`] that fits the result into a single message with
/// the closing fence in place.
pub(crate) fn code_block_truncated(code: &str) -> String {
    let fences = markdown::code_block("").chars().count();
    let budget = MAX_MESSAGE_LEN.saturating_sub(fences);
    markdown::code_block(prefix_within(code, budget, markdown::escape_code))
}

/// Longest prefix of the text that takes at most `budget` chars once escaped
fn prefix_within(text: &str, budget: usize, escape: fn(&str) -> String) -> &str {
    let mut len = 0;
    let mut buf = [0; 4];

    for (i, char) in text.char_indices() {
        len += escape(char.encode_utf8(&mut buf)).chars().count();
        if len > budget {
            return &text[..i];
        }
    }

    text
}
