use crate::types::ArgumentMap;

const POSITIONAL_KEY: &str = "input";

/// Turns a loosely structured action input such as
/// `filepath=a.txt, content='hi, there'` into a parameter map.
///
/// Input without any `=` becomes a single positional `input` entry. Commas
/// inside a single- or double-quoted span do not split, only the first `=` of
/// a segment separates key from value, and one layer of matching quotes is
/// stripped from each trimmed value. Segments without `=` are skipped. This
/// never fails: if nothing well-formed is found the whole text is returned as
/// the positional entry, and the action itself reports what is missing.
pub fn parse_action_input(text: &str) -> ArgumentMap {
    if !text.contains('=') {
        return positional(text);
    }

    let mut parsed = ArgumentMap::new();
    for segment in split_unquoted_commas(text) {
        let Some((key, value)) = segment.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        parsed.insert(key.to_owned(), strip_matching_quotes(value.trim()).to_owned());
    }

    if parsed.is_empty() {
        return positional(text);
    }
    parsed
}

fn positional(text: &str) -> ArgumentMap {
    ArgumentMap::from([(POSITIONAL_KEY.to_owned(), text.to_owned())])
}

fn split_unquoted_commas(text: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut active_quote: Option<char> = None;

    for ch in text.chars() {
        match ch {
            '"' | '\'' => {
                match active_quote {
                    None => active_quote = Some(ch),
                    Some(open) if open == ch => active_quote = None,
                    Some(_) => {}
                }
                current.push(ch);
            }
            ',' if active_quote.is_none() => {
                segments.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

/// Removes one layer of surrounding `"..."` or `'...'`.
pub fn strip_matching_quotes(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if first == last && (first == b'"' || first == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::{parse_action_input, strip_matching_quotes};

    #[test]
    fn text_without_equals_is_one_positional_argument() {
        let parsed = parse_action_input("  notes/todo.md ");
        assert_eq!(parsed.len(), 1);
        assert_eq!(
            parsed.get("input").map(String::as_str),
            Some("  notes/todo.md ")
        );
    }

    #[test]
    fn comma_inside_quotes_does_not_split() {
        let parsed = parse_action_input("filepath=a.txt, content='hi, there'");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.get("filepath").map(String::as_str), Some("a.txt"));
        assert_eq!(parsed.get("content").map(String::as_str), Some("hi, there"));
    }

    #[test]
    fn only_first_equals_separates_key_and_value() {
        let parsed = parse_action_input("command=\"echo a=b\", timeout=5");
        assert_eq!(parsed.get("command").map(String::as_str), Some("echo a=b"));
        assert_eq!(parsed.get("timeout").map(String::as_str), Some("5"));
    }

    #[test]
    fn mismatched_quote_types_stay_inside_the_active_span() {
        let parsed = parse_action_input("content=\"it's, fine\", filepath=b.txt");
        assert_eq!(parsed.get("content").map(String::as_str), Some("it's, fine"));
        assert_eq!(parsed.get("filepath").map(String::as_str), Some("b.txt"));
    }

    #[test]
    fn malformed_segments_are_ignored() {
        let parsed = parse_action_input("old_name=a.txt, garbage, new_name = b.txt ");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.get("old_name").map(String::as_str), Some("a.txt"));
        assert_eq!(parsed.get("new_name").map(String::as_str), Some("b.txt"));
    }

    #[test]
    fn nothing_well_formed_falls_back_to_positional() {
        let parsed = parse_action_input("=orphan");
        assert_eq!(parsed.get("input").map(String::as_str), Some("=orphan"));
    }

    #[test]
    fn quote_stripping_needs_a_matching_pair() {
        assert_eq!(strip_matching_quotes("'x'"), "x");
        assert_eq!(strip_matching_quotes("\"x'"), "\"x'");
        assert_eq!(strip_matching_quotes("\""), "\"");
        assert_eq!(strip_matching_quotes("''"), "");
    }
}
