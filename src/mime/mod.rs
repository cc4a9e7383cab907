//! Flattens a parsed MIME tree into one text body.
//!
//! At each node: plain text is taken as is; a multipart node is scanned child
//! by child, where the first plain-text child ends the scan of that level and
//! HTML children are appended without ending it; any other leaf contributes
//! its decoded body.
use mailparse::ParsedMail;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractOptions {
    /// Render HTML parts as text instead of appending the markup.
    pub convert_html: bool,
    pub wrap_width: usize,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            convert_html: true,
            wrap_width: 80,
        }
    }
}

/// HTML to plain text conversion.
pub trait TextExtractor: Send + Sync {
    fn html_to_text(&self, html: &str, width: usize) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Html2TextExtractor;

impl TextExtractor for Html2TextExtractor {
    fn html_to_text(&self, html: &str, width: usize) -> String {
        html2text::config::plain_no_decorate()
            .string_from_read(html.as_bytes(), width)
            .unwrap_or_else(|e| {
                debug!(error = %e, "html2text failed; keeping markup");
                html.to_string()
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    PlainText,
    Html,
    Multipart,
    Opaque,
}

impl ContentKind {
    pub fn of(part: &ParsedMail) -> Self {
        let mimetype = part.ctype.mimetype.to_ascii_lowercase();
        if mimetype == "text/plain" {
            ContentKind::PlainText
        } else if mimetype == "text/html" {
            ContentKind::Html
        } else if mimetype.starts_with("multipart/") {
            ContentKind::Multipart
        } else {
            ContentKind::Opaque
        }
    }
}

pub fn extract_text(parsed: &ParsedMail, options: &ExtractOptions) -> String {
    extract_text_with(parsed, options, &Html2TextExtractor)
}

pub fn extract_text_with(
    parsed: &ParsedMail,
    options: &ExtractOptions,
    extractor: &dyn TextExtractor,
) -> String {
    let mut out = String::new();
    match ContentKind::of(parsed) {
        ContentKind::PlainText => push_fragment(&mut out, &body_text(parsed)),
        ContentKind::Multipart => flatten_multipart(parsed, options, extractor, &mut out),
        // Only multipart children get the HTML treatment; a bare HTML body
        // is passed through like any other leaf.
        ContentKind::Html | ContentKind::Opaque => push_fragment(&mut out, &body_text(parsed)),
    }
    out
}

/// Parses `raw` and extracts its text. Unparseable input comes back as a
/// lossy string of the raw bytes.
pub fn extract_message(raw: &[u8], options: &ExtractOptions) -> String {
    match mailparse::parse_mail(raw) {
        Ok(parsed) => extract_text(&parsed, options),
        Err(e) => {
            debug!(error = %e, "MIME parse failed; using raw bytes");
            String::from_utf8_lossy(raw).into_owned()
        }
    }
}

fn flatten_multipart(
    node: &ParsedMail,
    options: &ExtractOptions,
    extractor: &dyn TextExtractor,
    out: &mut String,
) {
    for child in &node.subparts {
        match ContentKind::of(child) {
            ContentKind::PlainText => {
                // Plain text wins: later siblings at this level are skipped,
                // earlier HTML stays in the output.
                push_fragment(out, &body_text(child));
                break;
            }
            ContentKind::Html => {
                let html = body_text(child);
                if options.convert_html {
                    let text = extractor.html_to_text(&html, options.wrap_width);
                    out.push_str(text.trim());
                    out.push('\n');
                } else {
                    out.push_str(&html);
                }
            }
            ContentKind::Multipart => flatten_multipart(child, options, extractor, out),
            ContentKind::Opaque => {}
        }
    }
}

fn push_fragment(out: &mut String, text: &str) {
    out.push('\n');
    out.push_str(text);
}

fn body_text(part: &ParsedMail) -> String {
    let text = part.get_body().unwrap_or_else(|_| {
        String::from_utf8_lossy(part.get_body_raw().unwrap_or_default().as_ref()).into_owned()
    });
    text.trim_end_matches(['\r', '\n']).to_string()
}

pub fn header_value(parsed: &ParsedMail, header_name: &str) -> Option<String> {
    parsed
        .headers
        .iter()
        .find(|h| h.get_key().eq_ignore_ascii_case(header_name))
        .map(|h| h.get_value())
}
