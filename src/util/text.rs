use std::borrow::Cow;

use unicode_width::UnicodeWidthChar;

/// Ellipsis appended to truncated excerpts
const ELLIPSIS: &str = "...";
const ELLIPSIS_WIDTH: usize = 3;

/// Quote characters stripped from both ends of extracted titles.
const SURROUNDING_QUOTES: &[char] = &['"', '\'', '“', '”', '‘', '’', '«', '»', '`'];

/// Normalizes text pulled out of markup or feed fields.
///
/// - strips control characters and ANSI escapes (feed text is attacker-controlled)
/// - collapses every whitespace run (including newlines and NBSP) into one space
/// - trims, then removes matching-or-not surrounding quote characters
///
/// # Examples
///
/// ```
/// use blogwatch::util::clean_text;
///
/// assert_eq!(clean_text("  Hello\n\t  world  "), "Hello world");
/// assert_eq!(clean_text("“Quoted title”"), "Quoted title");
/// ```
pub fn clean_text(s: &str) -> String {
    let stripped = strip_control_chars(s);
    let collapsed = stripped
        .split(|c: char| c.is_whitespace() || c == '\u{a0}')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    collapsed
        .trim_matches(|c| SURROUNDING_QUOTES.contains(&c))
        .trim()
        .to_string()
}

/// Converts an HTML fragment (feed summary, `<description>`) into clean plain text.
///
/// Entities are decoded by the HTML parser; tags are dropped.
pub fn strip_markup(fragment: &str) -> String {
    if !fragment.contains('<') && !fragment.contains('&') {
        return clean_text(fragment);
    }
    let parsed = scraper::Html::parse_fragment(fragment);
    let text: String = parsed.root_element().text().collect::<Vec<_>>().join(" ");
    clean_text(&text)
}

/// Truncates a string to a maximum display width, appending "..." when cut.
///
/// Width is measured in terminal columns so CJK text and emoji in excerpts
/// are not over-counted or split mid-character.
///
/// # Examples
///
/// ```
/// use blogwatch::util::truncate_to_width;
///
/// assert_eq!(truncate_to_width("Short", 10), "Short");
/// assert_eq!(truncate_to_width("Hello World", 8), "Hello...");
/// ```
pub fn truncate_to_width(s: &str, max_width: usize) -> Cow<'_, str> {
    let total: usize = s.chars().map(|c| c.width().unwrap_or(0)).sum();
    if total <= max_width {
        return Cow::Borrowed(s);
    }
    if max_width <= ELLIPSIS_WIDTH {
        return Cow::Owned(take_columns(s, max_width).to_string());
    }

    let kept = take_columns(s, max_width - ELLIPSIS_WIDTH).trim_end();
    Cow::Owned(format!("{kept}{ELLIPSIS}"))
}

/// Longest prefix of `s` that fits in `columns` display columns.
fn take_columns(s: &str, columns: usize) -> &str {
    let mut used = 0;
    for (idx, c) in s.char_indices() {
        let w = c.width().unwrap_or(0);
        if used + w > columns {
            return &s[..idx];
        }
        used += w;
    }
    s
}

/// Strips ASCII control characters and ANSI escape sequences.
///
/// Tab, newline and carriage return survive (they are whitespace that
/// [`clean_text`] collapses anyway). Returns `Cow::Borrowed` for clean input.
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    let is_control = |c: char| c == '\x1b' || c == '\x7f' || (c < ' ' && !matches!(c, '\t' | '\n' | '\r'));

    if !s.chars().any(is_control) {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            match chars.peek() {
                // CSI: parameters until a final byte in 0x40..=0x7e
                Some('[') => {
                    chars.next();
                    for n in chars.by_ref() {
                        if ('\x40'..='\x7e').contains(&n) {
                            break;
                        }
                    }
                }
                // OSC: until BEL or ESC-backslash
                Some(']') => {
                    chars.next();
                    while let Some(n) = chars.next() {
                        if n == '\x07' {
                            break;
                        }
                        if n == '\x1b' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                _ => {}
            }
            continue;
        }
        if !is_control(c) {
            out.push(c);
        }
    }
    Cow::Owned(out)
}
