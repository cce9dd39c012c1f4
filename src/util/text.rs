use std::borrow::Cow;

/// SEC-001: Drop control characters from feed-supplied text.
///
/// Titles and names end up in terminal output and table rows; anything below
/// 0x20 except tab/newline/CR, DEL and the C1 range is removed. An ESC byte
/// goes with it, which defuses ANSI sequences without parsing them.
///
/// Returns `Cow::Borrowed` when nothing needs removing.
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    fn is_control(c: char) -> bool {
        matches!(c, '\u{0}'..='\u{8}' | '\u{b}' | '\u{c}' | '\u{e}'..='\u{1f}' | '\u{7f}'..='\u{9f}')
    }

    if !s.chars().any(is_control) {
        return Cow::Borrowed(s);
    }
    Cow::Owned(s.chars().filter(|c| !is_control(*c)).collect())
}
