/// Capabilities / limits of a messenger implementation.
#[derive(Clone, Copy, Debug)]
pub struct MessagingCapabilities {
    pub max_message_len: usize,
    pub max_caption_len: usize,
}

impl Default for MessagingCapabilities {
    fn default() -> Self {
        Self {
            max_message_len: 4096,
            max_caption_len: 1024,
        }
    }
}

/// Split `text` into chunks of at most `limit` chars, preferring line breaks.
pub fn split_text(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    if text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    let mut out = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for line in text.split_inclusive('\n') {
        let line_len = line.chars().count();
        if current_len + line_len <= limit {
            current.push_str(line);
            current_len += line_len;
            continue;
        }
        if !current.is_empty() {
            out.push(std::mem::take(&mut current));
            current_len = 0;
        }
        // Hard-split lines longer than the limit.
        let mut chars = line.chars().peekable();
        while chars.peek().is_some() {
            let piece: String = chars.by_ref().take(limit).collect();
            let piece_len = piece.chars().count();
            if piece_len == limit {
                out.push(piece);
            } else {
                current = piece;
                current_len = piece_len;
            }
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Truncate to `max` chars, appending an ellipsis when cut.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}
