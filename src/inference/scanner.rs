//! Streaming tag scanner — separates prose from `<ToolCall>…</ToolCall>` spans.
//!
//! Models that lack native tool calling embed calls in their text reply:
//!
//! ```text
//! Let me check that file.
//! <ToolCall>{"tool": "read_file", "parameters": {"path": "/tmp/a.txt"}}</ToolCall>
//! ```
//!
//! The reply arrives as arbitrary fragments, so a tag can be split anywhere
//! (`"<Tool"` + `"Call>{…"`). The scanner holds back text only while it could
//! still be the start of an opening tag, and emits everything else as content
//! as soon as it is disproven. The concatenated `Content` output is identical
//! however the input was fragmented.
//!
//! Tag names are matched ASCII case-insensitively and accept an underscore
//! variant (`<tool_call>`).

use super::tool_call_parser;

/// Recognized opening tags (lowercase).
const OPEN_TAGS: &[&str] = &["<toolcall>", "<tool_call>"];

/// Recognized closing tags (lowercase).
const CLOSE_TAGS: &[&str] = &["</toolcall>", "</tool_call>"];

// ─── Public Types ────────────────────────────────────────────────────────────

/// Output of the scanner, in input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// Prose to surface to the user.
    Content(String),
    /// Body of one complete tool-call span (text between the tags).
    ToolSpan(String),
}

/// How a buffered candidate starting with `<` relates to the tag grammar.
#[derive(Debug, PartialEq, Eq)]
enum Candidate {
    /// A complete open+close pair: the span body and the bytes consumed.
    Span { body_start: usize, body_end: usize, consumed: usize },
    /// A complete opening tag whose closing tag has not arrived yet.
    Open { body_start: usize },
    /// A proper prefix of an opening tag; need more input.
    Pending,
    /// The `<` does not start a tag.
    NotATag,
}

// ─── TagScanner ──────────────────────────────────────────────────────────────

/// Incremental scanner state for one reply.
#[derive(Debug, Default)]
pub struct TagScanner {
    /// Held-back candidate text; always starts with `<` when non-empty.
    buffer: String,
    /// Whether `buffer` is live (the scanner is in the buffering state).
    buffering: bool,
    /// Body offset in `buffer` once a full opening tag is buffered.
    open_body: Option<usize>,
    /// Bytes of `buffer` already searched for a closing tag.
    searched: usize,
}

impl TagScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether text is currently being held back.
    pub fn is_buffering(&self) -> bool {
        self.buffering
    }

    /// Feed one fragment and return the events it completes.
    pub fn push(&mut self, fragment: &str) -> Vec<ScanEvent> {
        let mut events = Vec::new();
        if !self.buffering {
            self.scan(fragment, &mut events);
            return events;
        }

        self.buffer.push_str(fragment);

        if let Some(body_start) = self.open_body {
            // Only the new tail, plus a closing tag split across fragments,
            // can hold the close.
            let from = self
                .searched
                .saturating_sub(max_close_len() - 1)
                .max(body_start);
            let Some((close_at, close_len)) = find_close_tag(self.buffer.as_bytes(), from) else {
                self.searched = self.buffer.len();
                return events;
            };

            let buffered = self.take_buffer();
            events.push(ScanEvent::ToolSpan(buffered[body_start..close_at].to_string()));
            self.scan(&buffered[close_at + close_len..], &mut events);
            return events;
        }

        let buffered = self.take_buffer();
        self.scan(&buffered, &mut events);
        events
    }

    /// Flush at end of stream.
    ///
    /// A held-back candidate is content, unless it is an opening tag whose
    /// (unterminated) body still parses as at least one tool call.
    pub fn finish(mut self) -> Vec<ScanEvent> {
        if !self.buffering || self.buffer.is_empty() {
            return Vec::new();
        }

        let open_body = self.open_body;
        let buffered = self.take_buffer();
        if let Some(body_start) = open_body {
            let body = &buffered[body_start..];
            if tool_call_parser::parses_as_tool_call(body) {
                tracing::debug!(
                    body_len = body.len(),
                    "accepting unterminated tool call span at end of stream"
                );
                return vec![ScanEvent::ToolSpan(body.to_string())];
            }
        }

        vec![ScanEvent::Content(buffered)]
    }

    fn take_buffer(&mut self) -> String {
        self.buffering = false;
        self.open_body = None;
        self.searched = 0;
        std::mem::take(&mut self.buffer)
    }

    fn hold(&mut self, candidate: &str, open_body: Option<usize>) {
        self.buffer = candidate.to_string();
        self.buffering = true;
        self.open_body = open_body;
        self.searched = candidate.len();
    }

    fn scan(&mut self, text: &str, events: &mut Vec<ScanEvent>) {
        let mut content = String::new();
        let mut rest = text;

        loop {
            let Some(lt) = rest.find('<') else {
                content.push_str(rest);
                break;
            };
            content.push_str(&rest[..lt]);
            let candidate = &rest[lt..];

            match classify(candidate) {
                Candidate::Span {
                    body_start,
                    body_end,
                    consumed,
                } => {
                    flush_content(&mut content, events);
                    events.push(ScanEvent::ToolSpan(
                        candidate[body_start..body_end].to_string(),
                    ));
                    rest = &candidate[consumed..];
                }
                Candidate::Open { body_start } => {
                    flush_content(&mut content, events);
                    self.hold(candidate, Some(body_start));
                    return;
                }
                Candidate::Pending => {
                    flush_content(&mut content, events);
                    self.hold(candidate, None);
                    return;
                }
                Candidate::NotATag => {
                    // Emit the `<` and resume right after it: a real tag may
                    // start later in the same candidate.
                    content.push('<');
                    rest = &candidate[1..];
                }
            }
        }

        flush_content(&mut content, events);
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn flush_content(content: &mut String, events: &mut Vec<ScanEvent>) {
    if !content.is_empty() {
        events.push(ScanEvent::Content(std::mem::take(content)));
    }
}

/// Classify text that starts with `<`.
fn classify(candidate: &str) -> Candidate {
    let bytes = candidate.as_bytes();

    for tag in OPEN_TAGS {
        if starts_with_ignore_case(bytes, tag.as_bytes()) {
            let body_start = tag.len();
            return match find_close_tag(bytes, body_start) {
                Some((close_at, close_len)) => Candidate::Span {
                    body_start,
                    body_end: close_at,
                    consumed: close_at + close_len,
                },
                None => Candidate::Open { body_start },
            };
        }
    }

    if OPEN_TAGS
        .iter()
        .any(|tag| starts_with_ignore_case(tag.as_bytes(), bytes))
    {
        Candidate::Pending
    } else {
        Candidate::NotATag
    }
}

fn starts_with_ignore_case(haystack: &[u8], prefix: &[u8]) -> bool {
    haystack.len() >= prefix.len() && haystack[..prefix.len()].eq_ignore_ascii_case(prefix)
}

fn max_close_len() -> usize {
    CLOSE_TAGS.iter().map(|tag| tag.len()).max().unwrap_or(1)
}

/// Earliest closing tag at or after byte `from`: `(position, tag_len)`.
fn find_close_tag(haystack: &[u8], from: usize) -> Option<(usize, usize)> {
    let tail = haystack.get(from..)?;
    CLOSE_TAGS
        .iter()
        .filter_map(|tag| {
            let tag = tag.as_bytes();
            tail.windows(tag.len())
                .position(|w| w.eq_ignore_ascii_case(tag))
                .map(|pos| (from + pos, tag.len()))
        })
        .min_by_key(|(pos, _)| *pos)
}

/// Run a complete text through a fresh scanner.
///
/// Returns the visible content (spans removed) and the span bodies in order.
pub fn split_tool_spans(text: &str) -> (String, Vec<String>) {
    let mut scanner = TagScanner::new();
    let mut events = scanner.push(text);
    events.extend(scanner.finish());

    let mut content = String::new();
    let mut spans = Vec::new();
    for event in events {
        match event {
            ScanEvent::Content(c) => content.push_str(&c),
            ScanEvent::ToolSpan(s) => spans.push(s),
        }
    }
    (content, spans)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
