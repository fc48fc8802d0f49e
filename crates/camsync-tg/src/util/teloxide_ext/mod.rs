mod requester;

use easy_ext::ext;
use teloxide::types::{Chat, User};

pub(crate) use requester::{code_block_truncated, escape_truncated};

pub(crate) mod prelude {
    pub(crate) use super::{requester::UtilRequesterExt as _, ChatExt as _, UserExt as _};
}

#[ext(UserExt)]
pub(crate) impl User {
    /// `@username (id)` or `Full Name (id)` for the logs
    fn debug_id(&self) -> String {
        match &self.username {
            Some(username) => format!("@{username} ({})", self.id),
            None => format!("{} ({})", self.full_name(), self.id),
        }
    }
}

#[ext(ChatExt)]
pub(crate) impl Chat {
    fn debug_id(&self) -> String {
        let title = self.title().or_else(|| self.username()).unwrap_or("private");
        format!("{title} ({})", self.id)
    }
}
