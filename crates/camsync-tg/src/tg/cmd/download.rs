use super::CommandError;
use crate::prelude::*;
use crate::tg::{self, DownloadRequest};
use crate::{err, Result};
use chrono::prelude::*;
use percent_encoding::percent_decode_str;
use std::str::FromStr;
use teloxide::prelude::*;
use url::Url;

#[derive(Debug, PartialEq)]
pub(crate) struct DownloadCmd {
    url: Url,
    file_name: String,
}

impl FromStr for DownloadCmd {
    type Err = crate::Error;

    fn from_str(input: &str) -> Result<Self> {
        let args = shlex::split(input).ok_or_else(|| err!(CommandError::DownloadUsage))?;

        let (url, file_name) = match args.as_slice() {
            [url] => (url, None),
            [url, flag, name] if flag == "-n" => (url, Some(name.clone())),
            _ => return Err(err!(CommandError::DownloadUsage)),
        };

        let url: Url = url
            .parse()
            .map_err(|source| err!(CommandError::InvalidUrl { url, source }))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(err!(CommandError::UnsupportedScheme {
                scheme: url.scheme()
            }));
        }

        let file_name = file_name.unwrap_or_else(|| file_name_from_url(&url));

        if file_name.is_empty()
            || file_name.contains(['/', '\\'])
            || file_name == "."
            || file_name == ".."
        {
            return Err(err!(CommandError::InvalidFileName { name: file_name }));
        }

        Ok(Self { url, file_name })
    }
}

/// Last segment of the URL path, or a generated name if there is none.
/// The segment is percent-decoded, so it may turn out to contain a path
/// separator, which is rejected by the caller.
fn file_name_from_url(url: &Url) -> String {
    url.path_segments()
        .and_then(|segments| segments.last())
        .map(|segment| percent_decode_str(segment).decode_utf8_lossy().into_owned())
        .filter(|segment| !segment.is_empty())
        .unwrap_or_else(|| format!("download_{}.mkv", Utc::now().timestamp()))
}

impl DownloadCmd {
    #[instrument(skip(ctx, msg))]
    pub(crate) async fn handle(self, ctx: &tg::Ctx, msg: &Message) -> Result {
        let Self { url, file_name } = self;

        let already_queued = ctx
            .downloads
            .snapshot()
            .pending
            .iter()
            .any(|job| job.payload.url == url && job.payload.file_name == file_name);

        if already_queued {
            return Err(err!(CommandError::AlreadyQueued));
        }

        let status = ctx
            .bot
            .reply_text(msg, &format!("⏳ Queued: {file_name}"))
            .await?;

        let request = DownloadRequest {
            url,
            file_name,
            chat_id: msg.chat.id,
            status_msg: status.id,
        };

        if !ctx.downloads.enqueue(request) {
            return Err(err!(CommandError::AlreadyQueued));
        }

        info!("Download queued");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::expect;

    fn parse(input: &str) -> String {
        match input.parse::<DownloadCmd>() {
            Ok(cmd) => format!("{} -> {}", cmd.url, cmd.file_name),
            Err(err) => err.kind().to_string(),
        }
    }

    #[test]
    fn parses_arguments() {
        expect!["https://example.com/videos/clip.mkv -> clip.mkv"]
            .assert_eq(&parse("https://example.com/videos/clip.mkv"));

        expect!["https://example.com/get?id=1 -> my clip.mkv"]
            .assert_eq(&parse("https://example.com/get?id=1 -n 'my clip.mkv'"));

        expect!["Usage: /download <url> [-n <file name>]"].assert_eq(&parse(""));
        expect!["Usage: /download <url> [-n <file name>]"]
            .assert_eq(&parse("https://example.com/a.mkv b.mkv"));

        expect!["The URL is invalid: not a url"].assert_eq(&parse("'not a url'"));

        expect!["Only http and https URLs are supported, but got: ftp"]
            .assert_eq(&parse("ftp://example.com/a.mkv"));

        expect!["The file name must not be empty or contain path separators: ../a.mkv"]
            .assert_eq(&parse("https://example.com/a.mkv -n ../a.mkv"));
    }

    #[test]
    fn file_name_from_url_is_percent_decoded() {
        expect!["https://example.com/videos/my%20clip%E2%84%962.mkv -> my clip№2.mkv"]
            .assert_eq(&parse("https://example.com/videos/my%20clip%E2%84%962.mkv"));

        expect!["The file name must not be empty or contain path separators: ../a.mkv"]
            .assert_eq(&parse("https://example.com/..%2Fa.mkv"));
    }

    #[test]
    fn generates_file_name_when_url_has_none() {
        let cmd: DownloadCmd = "https://example.com/".parse().unwrap();
        assert!(cmd.file_name.starts_with("download_"), "{}", cmd.file_name);
        assert!(cmd.file_name.ends_with(".mkv"), "{}", cmd.file_name);
    }
}
