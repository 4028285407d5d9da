const SENTENCE_END: [char; 4] = ['.', '!', '?', '…'];
const CLOSING: [char; 5] = ['"', '\'', '”', '’', ')'];

/// Splits prose into sentences, keeping terminal punctuation and closing quotes.
pub fn sentences(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut out = Vec::new();
    let mut current = String::new();

    for (i, &ch) in chars.iter().enumerate() {
        current.push(ch);
        let terminal = SENTENCE_END.contains(&ch)
            || (CLOSING.contains(&ch) && i > 0 && SENTENCE_END.contains(&chars[i - 1]));
        if !terminal {
            continue;
        }
        match chars.get(i + 1) {
            None => {}
            Some(next) if next.is_whitespace() => {}
            _ => continue,
        }
        let sentence = current.trim();
        if !sentence.is_empty() {
            out.push(sentence.to_string());
        }
        current.clear();
    }

    let rest = current.trim();
    if !rest.is_empty() {
        out.push(rest.to_string());
    }
    out
}

/// The last `count` sentences of `text`, joined by single spaces.
pub fn tail_sentences(text: &str, count: usize) -> String {
    let all = sentences(text);
    let start = all.len().saturating_sub(count);
    all[start..].join(" ")
}

pub fn bullet_list(items: &[String]) -> String {
    if items.is_empty() {
        return "(none)".to_string();
    }
    items
        .iter()
        .map(|item| format!("- {}", item))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Cuts `text` to at most `max` characters, marking the cut with "...".
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let head: String = text.chars().take(max).collect();
    format!("{}...", head.trim_end())
}
