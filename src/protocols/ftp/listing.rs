//! `LIST` output to HTML

use bytes::Bytes;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use regex::Regex;
use std::fmt::Write as _;
use std::sync::LazyLock;
use url::Url;

/// Unix `ls -l` line: mode, the middle up to the year or time field, a name
/// that may contain spaces, and an optional ` -> target`.
static LISTING_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        ^([-a-z][-a-z]{3}[-a-z]{3}[-a-z]{3})             # type and permissions
        ([\x20\t]+.*[\x20\t]+[0-9]{2}:?[0-9]{2}[\x20\t]+) # links .. yyyy or hh:mm
        ((?:[^-]|-[^>])+)                                 # name
        ([\x20\t]+->.*)?                                  # symlink target
        $",
    )
    .expect("valid listing pattern")
});

/// Characters left alone when a file name becomes an href
const HREF_SAFE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'_')
    .remove(b'.')
    .remove(b'-')
    .remove(b'~')
    .remove(b'/');

/// Incremental `LIST` to HTML conversion
#[derive(Debug)]
pub struct ListingTranscoder {
    url: String,
    base: Option<Url>,
    partial: String,
    started: bool,
    finished: bool,
}

impl ListingTranscoder {
    /// `url` is the directory URL; it should end with `/`.
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            base: Url::parse(&url).ok(),
            url,
            partial: String::new(),
            started: false,
            finished: false,
        }
    }

    /// Feed raw listing bytes; returns the HTML for every completed line.
    pub fn push(&mut self, chunk: &[u8]) -> Bytes {
        let mut html = String::new();
        self.start(&mut html);

        self.partial.extend(chunk.iter().map(|&b| char::from(b)));
        while let Some(nl) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=nl).collect();
            self.render_line(&line[..line.len() - 1], &mut html);
        }
        encode_latin1(&html)
    }

    /// Flush the last unterminated line and close the document.
    pub fn finish(&mut self) -> Bytes {
        if self.finished {
            return Bytes::new();
        }
        self.finished = true;

        let mut html = String::new();
        self.start(&mut html);
        let rest = std::mem::take(&mut self.partial);
        if !rest.is_empty() {
            self.render_line(&rest, &mut html);
        }
        html.push_str("</PRE>\n</BODY>\n");
        encode_latin1(&html)
    }

    fn start(&mut self, html: &mut String) {
        if self.started {
            return;
        }
        self.started = true;
        let url = escape_html(&self.url);
        let _ = write!(
            html,
            "<HTML>\n<HEAD><TITLE>FTP Directory: {url}</TITLE></HEAD>\n\
             <BODY>\n<H1>FTP Directory: {url}</H1>\n<PRE>"
        );
    }

    fn render_line(&self, line: &str, html: &mut String) {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let Some(caps) = LISTING_LINE.captures(line) else {
            html.push_str(&escape(line));
            html.push('\n');
            return;
        };

        let mode = &caps[1];
        let raw_name = &caps[3];
        let mut name = escape(raw_name);
        let mut href = self.href(raw_name);
        let is_dir = (mode.len() == 10 && mode.starts_with('d')) || name.ends_with('/');
        if is_dir {
            if !name.ends_with('/') {
                name.push('/');
            }
            if !href.ends_with('/') {
                href.push('/');
            }
        }

        let symlink = caps.get(4).map_or(String::new(), |m| escape(m.as_str()));
        let _ = writeln!(
            html,
            "{}{}<A HREF={}>{}</A>{}",
            escape(mode),
            escape(&caps[2]),
            quote_attr(&href),
            name,
            symlink
        );
    }

    fn href(&self, name: &str) -> String {
        let quoted = utf8_percent_encode(name, HREF_SAFE).to_string();
        self.base
            .as_ref()
            .and_then(|base| base.join(&quoted).ok())
            .map_or(quoted, String::from)
    }
}

/// `&`, `<` and `>` only
fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Quotes too, for text inside the header
fn escape_html(text: &str) -> String {
    escape(text).replace('"', "&quot;").replace('\'', "&#x27;")
}

fn quote_attr(value: &str) -> String {
    let escaped = escape(value)
        .replace('"', "&quot;")
        .replace('\n', "&#10;")
        .replace('\r', "&#13;")
        .replace('\t', "&#9;");
    format!("\"{escaped}\"")
}

/// Latin-1 where possible, character references for the rest
fn encode_latin1(text: &str) -> Bytes {
    let mut out = Vec::with_capacity(text.len());
    for c in text.chars() {
        match u8::try_from(u32::from(c)) {
            Ok(byte) => out.push(byte),
            Err(_) => out.extend_from_slice(format!("&#{};", u32::from(c)).as_bytes()),
        }
    }
    Bytes::from(out)
}
