// Chunker
// Length-bounded recursive splitting with small-to-big parent chunks. Child
// chunks are the unit of embedding and indexing; each carries its parent's id
// and content so retrieval can collapse children back to parents.

use uuid::Uuid;

use crate::loader::ParsedDocument;
use crate::types::ChunkParams;

/// Parents span this many child-chunk lengths.
const PARENT_FACTOR: usize = 4;

/// Split separators, coarsest first; a final hard character split backstops
/// text with no separators at all.
const SEPARATORS: [&str; 3] = ["\n\n", "\n", " "];

/// One chunk ready for embedding and indexing.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Emitted text: `"{heading-path}\n{raw}"` when a heading path exists.
    pub text: String,
    pub heading_path: String,
    pub page_number: Option<u32>,
    pub parent_id: Option<String>,
    pub parent_content: Option<String>,
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn tail_chars(s: &str, n: usize) -> String {
    let len = char_len(s);
    if len <= n {
        return s.to_string();
    }
    s.chars().skip(len - n).collect()
}

fn hard_split(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(size)
        .map(|c| c.iter().collect())
        .collect()
}

/// Break text into pieces no longer than `size` chars, preferring coarse
/// separators and descending only when a piece is still too long.
fn split_pieces(text: &str, sep_idx: usize, size: usize) -> Vec<String> {
    if char_len(text) <= size {
        return vec![text.to_string()];
    }
    if sep_idx >= SEPARATORS.len() {
        return hard_split(text, size);
    }

    let sep = SEPARATORS[sep_idx];
    let parts: Vec<&str> = text.split_inclusive(sep).collect();
    if parts.len() <= 1 {
        return split_pieces(text, sep_idx + 1, size);
    }

    let mut pieces = Vec::new();
    for part in parts {
        if char_len(part) <= size {
            pieces.push(part.to_string());
        } else {
            pieces.extend(split_pieces(part, sep_idx + 1, size));
        }
    }
    pieces
}

/// Greedily merge pieces into chunks of at most `size` chars, carrying
/// `overlap` trailing chars from one chunk into the next.
fn merge_pieces(pieces: Vec<String>, size: usize, overlap: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for piece in pieces {
        if !current.is_empty() && char_len(&current) + char_len(&piece) > size {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                chunks.push(trimmed.to_string());
            }
            current = tail_chars(&current, overlap);
            // A large piece after the overlap tail would blow the bound;
            // overlap yields to the size limit.
            if char_len(&current) + char_len(&piece) > size {
                current.clear();
            }
        }
        current.push_str(&piece);
    }

    let trimmed = current.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
    chunks
}

/// Recursive length-bounded text splitter.
pub fn split_text(text: &str, params: ChunkParams) -> Vec<String> {
    let pieces = split_pieces(text, 0, params.size());
    merge_pieces(pieces, params.size(), params.overlap())
}

fn with_heading(heading_path: &str, raw: &str) -> String {
    if heading_path.is_empty() {
        raw.to_string()
    } else {
        format!("{heading_path}\n{raw}")
    }
}

/// Chunk a parsed document into indexable child chunks.
///
/// Each block is first cut into parent spans of `PARENT_FACTOR * chunk_size`
/// chars, then each parent into child chunks with the knowledge base's
/// size/overlap. Children inherit the block's heading path as an emitted-text
/// prefix and point at their parent for small-to-big collapse.
pub fn chunk_document(parsed: &ParsedDocument, params: ChunkParams) -> Vec<Chunk> {
    let parent_params = ChunkParams::new(params.size() * PARENT_FACTOR, 0)
        .expect("parent span params are always valid");

    let mut chunks = Vec::new();
    for block in &parsed.blocks {
        for parent_text in split_text(&block.text, parent_params) {
            let parent_id = Uuid::new_v4().to_string();
            let parent_content = with_heading(&block.heading_path, &parent_text);

            for child_raw in split_text(&parent_text, params) {
                chunks.push(Chunk {
                    text: with_heading(&block.heading_path, &child_raw),
                    heading_path: block.heading_path.clone(),
                    page_number: block.page_number,
                    parent_id: Some(parent_id.clone()),
                    parent_content: Some(parent_content.clone()),
                });
            }
        }
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::ParsedBlock;

    fn params(size: usize, overlap: usize) -> ChunkParams {
        ChunkParams::new(size, overlap).unwrap()
    }

    #[test]
    fn test_short_text_is_one_chunk() {
        let chunks = split_text("short text", params(100, 10));
        assert_eq!(chunks, vec!["short text".to_string()]);
    }

    #[test]
    fn test_chunks_respect_size_bound() {
        let text = "word ".repeat(200);
        let chunks = split_text(&text, params(50, 5));
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 50, "oversized chunk: {chunk:?}");
        }
    }

    #[test]
    fn test_paragraph_boundaries_preferred() {
        let text = format!("{}\n\n{}", "a".repeat(40), "b".repeat(40));
        let chunks = split_text(&text, params(50, 0));
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].starts_with('a'));
        assert!(chunks[1].starts_with('b'));
    }

    #[test]
    fn test_overlap_carries_tail() {
        let text = "one two three four five six seven eight nine ten ".repeat(4);
        let chunks = split_text(&text, params(60, 20));
        assert!(chunks.len() >= 2);
        // The tail of chunk N reappears at the head of chunk N+1.
        let tail: String = chunks[0].chars().skip(chunks[0].chars().count() - 10).collect();
        assert!(chunks[1].contains(tail.trim()));
    }

    #[test]
    fn test_unbroken_text_hard_splits() {
        let text = "x".repeat(120);
        let chunks = split_text(&text, params(50, 0));
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 50));
    }

    #[test]
    fn test_chunk_document_heading_prefix_and_parents() {
        let parsed = ParsedDocument {
            blocks: vec![ParsedBlock {
                text: "sentence one. ".repeat(60),
                heading_path: "Install > Linux".to_string(),
                page_number: Some(3),
            }],
            page_count: Some(10),
        };

        let chunks = chunk_document(&parsed, params(100, 10));
        assert!(chunks.len() > 1);

        for chunk in &chunks {
            assert!(chunk.text.starts_with("Install > Linux\n"));
            assert_eq!(chunk.page_number, Some(3));
            assert!(chunk.parent_id.is_some());
            assert!(chunk.parent_content.is_some());
        }

        // Several children share one parent span.
        let first_parent = chunks[0].parent_id.clone();
        let siblings = chunks
            .iter()
            .filter(|c| c.parent_id == first_parent)
            .count();
        assert!(siblings > 1);

        // Parent content contains its children's raw text.
        let parent_content = chunks[0].parent_content.as_deref().unwrap();
        assert!(parent_content.starts_with("Install > Linux\n"));
        assert!(parent_content.len() >= chunks[0].text.len() - 20);
    }

    #[test]
    fn test_chunk_document_no_heading() {
        let parsed = ParsedDocument {
            blocks: vec![ParsedBlock {
                text: "plain body".to_string(),
                heading_path: String::new(),
                page_number: None,
            }],
            page_count: None,
        };
        let chunks = chunk_document(&parsed, params(100, 0));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "plain body");
    }
}
