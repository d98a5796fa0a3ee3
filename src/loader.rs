// Document Loaders
// Routes a fetched blob to the right parser by filename suffix: PDF/DOCX go
// to the structure-aware parse service, plain text and markdown are loaded
// locally, anything else is an unsupported format.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use crate::errors::RagError;

/// One ordered span of parsed source text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedBlock {
    pub text: String,
    /// Breadcrumb of headings above this span, e.g. "Install > Linux".
    pub heading_path: String,
    pub page_number: Option<u32>,
}

/// A fully parsed document: ordered blocks plus overall page count.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedDocument {
    pub blocks: Vec<ParsedBlock>,
    pub page_count: Option<u32>,
}

/// File classes the ingestion queue routing cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileClass {
    /// Needs the structure-aware parser (CPU/GPU heavy).
    Structured,
    /// Plain text family, parsed in-process.
    Plain,
    Unsupported,
}

/// Classify a filename by suffix.
pub fn classify(filename: &str) -> FileClass {
    let suffix = Path::new(filename)
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_default();

    match suffix.as_str() {
        "pdf" | "docx" | "doc" => FileClass::Structured,
        "txt" | "md" => FileClass::Plain,
        _ => FileClass::Unsupported,
    }
}

/// Load a plain-text or markdown file as parsed blocks.
///
/// Markdown gets lightweight structure awareness: ATX headings update the
/// heading path and split blocks, so chunk prefixes carry real context.
/// Plain text becomes a single block.
pub fn load_plain(filename: &str, content: &str) -> ParsedDocument {
    let is_markdown = Path::new(filename)
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.eq_ignore_ascii_case("md"))
        .unwrap_or(false);

    if !is_markdown {
        return ParsedDocument {
            blocks: vec![ParsedBlock {
                text: content.to_string(),
                heading_path: String::new(),
                page_number: None,
            }],
            page_count: None,
        };
    }

    let mut blocks = Vec::new();
    // Heading text per level currently open (index 0 = h1).
    let mut heading_stack: Vec<(usize, String)> = Vec::new();
    let mut current = String::new();

    let flush = |current: &mut String, stack: &[(usize, String)], blocks: &mut Vec<ParsedBlock>| {
        let text = current.trim();
        if !text.is_empty() {
            blocks.push(ParsedBlock {
                text: text.to_string(),
                heading_path: stack
                    .iter()
                    .map(|(_, h)| h.as_str())
                    .collect::<Vec<_>>()
                    .join(" > "),
                page_number: None,
            });
        }
        current.clear();
    };

    for line in content.lines() {
        let trimmed = line.trim_start();
        let level = trimmed.chars().take_while(|c| *c == '#').count();
        if (1..=6).contains(&level) && trimmed.chars().nth(level) == Some(' ') {
            flush(&mut current, &heading_stack, &mut blocks);
            let title = trimmed[level + 1..].trim().to_string();
            heading_stack.retain(|(l, _)| *l < level);
            heading_stack.push((level, title));
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    flush(&mut current, &heading_stack, &mut blocks);

    ParsedDocument {
        blocks,
        page_count: None,
    }
}

// Wire types for the structured parse service.

#[derive(Serialize)]
struct ParseRequest<'a> {
    filename: &'a str,
    /// Raw file bytes, base64-encoded.
    content: String,
}

#[derive(Deserialize)]
struct ParseResponse {
    blocks: Vec<ParsedBlock>,
    page_count: Option<u32>,
}

/// Client for the out-of-process structure-aware parser.
///
/// PDF and DOCX parsing runs as a separate service (it is model-driven and
/// GPU-hungry); this client ships the raw bytes over and gets ordered
/// (text, heading-path, page) blocks back.
pub struct StructuredParserClient {
    client: reqwest::Client,
    base_url: String,
}

impl StructuredParserClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn parse(&self, filename: &str, bytes: &[u8]) -> Result<ParsedDocument> {
        use base64::Engine as _;

        let request = ParseRequest {
            filename,
            content: base64::engine::general_purpose::STANDARD.encode(bytes),
        };

        let response = self
            .client
            .post(format!("{}/parse", self.base_url))
            .json(&request)
            .send()
            .await
            .context("parse service request failed")?
            .error_for_status()
            .context("parse service returned an error status")?;

        let parsed: ParseResponse = response.json().await?;
        info!(
            filename,
            blocks = parsed.blocks.len(),
            pages = ?parsed.page_count,
            "Structured parse completed"
        );
        Ok(ParsedDocument {
            blocks: parsed.blocks,
            page_count: parsed.page_count,
        })
    }
}

/// Parse a fetched blob according to its filename suffix.
pub async fn load_document(
    filename: &str,
    bytes: &[u8],
    parser: Option<&StructuredParserClient>,
) -> Result<ParsedDocument> {
    match classify(filename) {
        FileClass::Structured => {
            let parser = parser.ok_or_else(|| {
                RagError::ParseFailed(format!(
                    "no structured parser configured for {filename}"
                ))
            })?;
            debug!(filename, "Routing to structured parser");
            parser
                .parse(filename, bytes)
                .await
                .map_err(|e| RagError::ParseFailed(format!("{e:#}")).into())
        }
        FileClass::Plain => {
            let content = std::str::from_utf8(bytes)
                .map_err(|_| RagError::ParseFailed(format!("{filename} is not valid UTF-8")))?;
            Ok(load_plain(filename, content))
        }
        FileClass::Unsupported => {
            Err(RagError::UnsupportedFormat(filename.to_string()).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_suffixes() {
        assert_eq!(classify("report.pdf"), FileClass::Structured);
        assert_eq!(classify("notes.DOCX"), FileClass::Structured);
        assert_eq!(classify("legacy.doc"), FileClass::Structured);
        assert_eq!(classify("readme.md"), FileClass::Plain);
        assert_eq!(classify("log.txt"), FileClass::Plain);
        assert_eq!(classify("sheet.xlsx"), FileClass::Unsupported);
        assert_eq!(classify("no_extension"), FileClass::Unsupported);
    }

    #[test]
    fn test_plain_text_single_block() {
        let doc = load_plain("log.txt", "line one\nline two");
        assert_eq!(doc.blocks.len(), 1);
        assert_eq!(doc.blocks[0].text, "line one\nline two");
        assert_eq!(doc.blocks[0].heading_path, "");
    }

    #[test]
    fn test_markdown_heading_paths() {
        let md = "\
# Install
intro text
## Linux
apt-get install
## macOS
brew install
# Usage
run the binary";
        let doc = load_plain("guide.md", md);
        assert_eq!(doc.blocks.len(), 4);
        assert_eq!(doc.blocks[0].heading_path, "Install");
        assert_eq!(doc.blocks[1].heading_path, "Install > Linux");
        assert_eq!(doc.blocks[1].text, "apt-get install");
        assert_eq!(doc.blocks[2].heading_path, "Install > macOS");
        assert_eq!(doc.blocks[3].heading_path, "Usage");
    }

    #[tokio::test]
    async fn test_unsupported_format_errors() {
        let err = load_document("deck.pptx", b"bytes", None).await.unwrap_err();
        let kind = err.downcast_ref::<RagError>().expect("typed error");
        assert_eq!(kind.code(), "UNSUPPORTED_FORMAT");
    }

    #[tokio::test]
    async fn test_structured_without_parser_fails_as_parse_error() {
        let err = load_document("x.pdf", b"%PDF", None).await.unwrap_err();
        let kind = err.downcast_ref::<RagError>().expect("typed error");
        assert_eq!(kind.code(), "PARSE_FAILED");
    }

    #[tokio::test]
    async fn test_invalid_utf8_plain_file() {
        let err = load_document("x.txt", &[0xff, 0xfe], None).await.unwrap_err();
        let kind = err.downcast_ref::<RagError>().expect("typed error");
        assert_eq!(kind.code(), "PARSE_FAILED");
    }
}
