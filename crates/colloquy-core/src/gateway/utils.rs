//! Shared gateway utilities.

const FENCE: &str = "```";

/// Split a message into chunks of at most `max_len` bytes, preferring to
/// break at newlines when possible. Never splits a UTF-8 character.
pub fn chunk_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_owned()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_owned());
            break;
        }

        let mut limit = max_len;
        while limit > 0 && !remaining.is_char_boundary(limit) {
            limit -= 1;
        }
        if limit == 0 {
            // max_len is smaller than the next character.
            limit = remaining
                .char_indices()
                .nth(1)
                .map_or(remaining.len(), |(i, _)| i);
        }

        // Try to find a newline to break at
        let slice = &remaining[..limit];
        let break_at = match slice.rfind('\n') {
            Some(0) | None => limit,
            Some(i) => i,
        };

        chunks.push(remaining[..break_at].to_owned());
        remaining = remaining[break_at..].trim_start_matches('\n');
    }

    chunks
}

/// A piece of an outgoing reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyPart {
    Text(String),
    /// Body of a fenced code block, language tag included, fences removed.
    Code(String),
}

impl ReplyPart {
    /// Text to send. Code is re-fenced with MarkdownV2 escaping applied.
    pub fn render(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Code(body) => {
                let escaped = body.replace('\\', "\\\\").replace('`', "\\`");
                format!("{FENCE}{escaped}{FENCE}")
            }
        }
    }

    pub fn is_code(&self) -> bool {
        matches!(self, Self::Code(_))
    }
}

/// Split a reply on code fences so code blocks can be sent on their own.
///
/// Unbalanced fences leave the text as a single plain part. Blank text
/// between blocks is dropped.
pub fn split_code_blocks(text: &str) -> Vec<ReplyPart> {
    let pieces: Vec<&str> = text.split(FENCE).collect();
    if pieces.len() % 2 == 0 {
        return vec![ReplyPart::Text(text.to_owned())];
    }

    pieces
        .into_iter()
        .enumerate()
        .filter_map(|(i, piece)| {
            if i % 2 == 1 {
                Some(ReplyPart::Code(piece.to_owned()))
            } else if piece.trim().is_empty() {
                None
            } else {
                Some(ReplyPart::Text(piece.trim().to_owned()))
            }
        })
        .collect()
}

/// Code-fence split followed by length chunking.
pub fn reply_parts(text: &str, max_len: usize) -> Vec<ReplyPart> {
    // Room for the fences wrapped around each code chunk.
    let code_len = max_len.saturating_sub(2 * FENCE.len()).max(1);
    split_code_blocks(text)
        .into_iter()
        .flat_map(|part| match part {
            ReplyPart::Text(t) => chunk_message(&t, max_len)
                .into_iter()
                .map(ReplyPart::Text)
                .collect::<Vec<_>>(),
            ReplyPart::Code(c) => chunk_message(&c, code_len)
                .into_iter()
                .map(ReplyPart::Code)
                .collect(),
        })
        .collect()
}
