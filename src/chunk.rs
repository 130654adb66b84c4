//! Sentence-boundary text splitter.
//!
//! Splits free text into sentences at whitespace that directly follows a
//! terminal `.`, `!`, or `?`. Terminal punctuation stays attached to its
//! sentence. Used to derive sentence units from extracted text and to break
//! raw ingested text into the sequence of steps that form a move chain.

/// Split text into trimmed, non-empty sentences.
///
/// Text without any terminator followed by whitespace yields a single
/// sentence; blank text yields none.
pub fn sentence_split(text: &str) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    let mut sentences = Vec::new();
    let mut start = 0;
    let mut prev: Option<char> = None;
    let mut chars = text.char_indices().peekable();

    while let Some((idx, ch)) = chars.next() {
        if ch.is_whitespace() && matches!(prev, Some('.' | '!' | '?')) {
            push_trimmed(&mut sentences, &text[start..idx]);
            // Swallow the rest of the whitespace run.
            let mut end = idx + ch.len_utf8();
            while let Some(&(next_idx, next)) = chars.peek() {
                if !next.is_whitespace() {
                    break;
                }
                end = next_idx + next.len_utf8();
                chars.next();
            }
            start = end;
            prev = None;
            continue;
        }
        prev = Some(ch);
    }
    push_trimmed(&mut sentences, &text[start..]);

    sentences
}

fn push_trimmed(out: &mut Vec<String>, piece: &str) {
    let trimmed = piece.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
}
