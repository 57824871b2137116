//! Extraction of integer answers from free-text model replies.
//!
//! Grammar for a single question: the first integer token that lies inside
//! the question's response range. A token is a run of digits that is not
//! glued to a letter, digit or underscore on either side (`Q1`, `4th`), is
//! not a decimal (`3.5`), and is negative when a `-` directly precedes it
//! after a non-word character.
//!
//! For turns covering several questions, a reply is read in two passes:
//!
//! 1. labelled: `Q1: 4`, `1) 4`, `[Q1] = 4`, `Question 1 - 4`. Used only if
//!    every question id of the turn is found.
//! 2. positional: the integer tokens of the reply, if there are exactly as
//!    many as there are questions, are assigned in order.
//!
//! Anything else is ambiguous and every question of the turn is
//! `Unparseable`.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::ParseError;
use crate::instrument::ResponseScale;

static NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+(?:\.\d+)?").unwrap());

/// A numeric token found in a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumberToken {
    pub value: i64,
    /// Byte offset of the first character (including a leading `-`).
    pub start: usize,
    /// Byte offset one past the last digit.
    pub end: usize,
    pub is_integer: bool,
}

fn is_word(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// All standalone numbers in `text`, integers and decimals alike.
pub fn number_tokens(text: &str) -> impl Iterator<Item = NumberToken> + '_ {
    NUMBER.find_iter(text).filter_map(move |m| {
        let before = &text[..m.start()];
        let mut prev_chars = before.chars().rev();
        let prev = prev_chars.next();
        let next = text[m.end()..].chars().next();

        if prev.is_some_and(is_word) || next.is_some_and(is_word) {
            return None;
        }

        let digits = m.as_str();
        let is_integer = !digits.contains('.') && prev != Some('.');

        let negative = prev == Some('-') && !prev_chars.next().is_some_and(is_word);
        let start = if negative { m.start() - 1 } else { m.start() };

        let magnitude = digits
            .split('.')
            .next()
            .and_then(|int| int.parse::<i64>().ok())
            .unwrap_or(i64::MAX);
        let value = if negative { -magnitude } else { magnitude };

        Some(NumberToken {
            value,
            start,
            end: m.end(),
            is_integer,
        })
    })
}

/// Integer tokens only.
pub fn integer_tokens(text: &str) -> impl Iterator<Item = NumberToken> + '_ {
    number_tokens(text).filter(|t| t.is_integer)
}

fn check_range(value: i64, scale: &ResponseScale) -> Result<i64, ParseError> {
    if scale.contains(value) {
        Ok(value)
    } else {
        Err(ParseError::OutOfRange {
            value,
            min: scale.min,
            max: scale.max,
        })
    }
}

/// Parse the answer to a single question.
pub fn parse_single(reply: &str, scale: &ResponseScale) -> Result<i64, ParseError> {
    let mut first_out_of_range = None;
    for token in integer_tokens(reply) {
        if scale.contains(token.value) {
            return Ok(token.value);
        }
        first_out_of_range.get_or_insert(token.value);
    }
    match first_out_of_range {
        Some(value) => Err(ParseError::OutOfRange {
            value,
            min: scale.min,
            max: scale.max,
        }),
        None => Err(ParseError::Unparseable),
    }
}

/// Label and value must sit on the same line.
///
/// A purely numeric id is only a label at the start of a line (or after
/// `,`/`;`), or after a `Q`/`Question`/`[` prefix; elsewhere `1-5` or a
/// list of answers would read as labels.
fn label_pattern(id: &str) -> Option<Regex> {
    let id_pattern = regex::escape(id);
    const VALUE: &str = r"[ \t]*(-?\d+(?:\.\d+)?)(?:$|[^\w])";
    let pattern = if id.chars().all(|c| c.is_ascii_digit()) {
        format!(
            r"(?im)(?:(?:^|[,;])[ \t]*(?:[-*][ \t]*)?\[?{id}\]?[ \t]*[:=).\]]{value}|(?:^|[^\w])(?:q(?:uestion)?[ \t]*\[?|\[){id}\]?[ \t]*[:=)\].\-]{value})",
            id = id_pattern,
            value = VALUE,
        )
    } else {
        format!(
            r"(?im)(?:^|[^\w])(?:q(?:uestion)?[ \t]*)?\[?{id}\]?[ \t]*[:=)\].\-]{value}",
            id = id_pattern,
            value = VALUE,
        )
    };
    Regex::new(&pattern).ok()
}

fn labelled_value(reply: &str, id: &str) -> Option<Result<i64, ParseError>> {
    let captures = label_pattern(id)?.captures(reply)?;
    let raw = captures.get(1).or_else(|| captures.get(2))?.as_str();
    if raw.contains('.') {
        return Some(Err(ParseError::Unparseable));
    }
    Some(raw.parse::<i64>().map_err(|_| ParseError::Unparseable))
}

/// Parse one answer per question of a turn, in question order.
pub fn parse_turn(reply: &str, questions: &[(&str, &ResponseScale)]) -> Vec<Result<i64, ParseError>> {
    match questions {
        [] => Vec::new(),
        [(_, scale)] => vec![parse_single(reply, scale)],
        _ => {
            let labelled: Option<Vec<_>> = questions
                .iter()
                .map(|(id, _)| labelled_value(reply, id))
                .collect();
            if let Some(values) = labelled {
                return values
                    .into_iter()
                    .zip(questions)
                    .map(|(value, (_, scale))| value.and_then(|v| check_range(v, scale)))
                    .collect();
            }

            let tokens: Vec<_> = integer_tokens(reply).collect();
            if tokens.len() == questions.len() {
                tokens
                    .iter()
                    .zip(questions)
                    .map(|(token, (_, scale))| check_range(token.value, scale))
                    .collect()
            } else {
                vec![Err(ParseError::Unparseable); questions.len()]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn likert() -> ResponseScale {
        ResponseScale::likert(1, 5)
    }

    fn values(text: &str) -> Vec<i64> {
        integer_tokens(text).map(|t| t.value).collect()
    }

    #[test]
    fn test_tokenizer_skips_glued_and_decimal_numbers() {
        assert_eq!(values("Q1: 4"), vec![4]);
        assert_eq!(values("the 4th option, 3.5 or 2"), vec![2]);
        assert_eq!(values("-2 then 1-5"), vec![-2, 1, 5]);
        assert_eq!(values("value: .5"), Vec::<i64>::new());
    }

    #[test]
    fn test_single_plain_number() {
        assert_eq!(parse_single("4", &likert()), Ok(4));
        assert_eq!(parse_single("  I would say 3.\n", &likert()), Ok(3));
    }

    #[test]
    fn test_single_first_in_range_wins() {
        assert_eq!(parse_single("Not 7, more like 2 or 3", &likert()), Ok(2));
    }

    #[test]
    fn test_single_out_of_range() {
        assert_eq!(
            parse_single("10", &likert()),
            Err(ParseError::OutOfRange { value: 10, min: 1, max: 5 })
        );
        assert_eq!(
            parse_single("-1", &likert()),
            Err(ParseError::OutOfRange { value: -1, min: 1, max: 5 })
        );
    }

    #[test]
    fn test_single_no_numbers() {
        assert_eq!(parse_single("I strongly agree", &likert()), Err(ParseError::Unparseable));
        assert_eq!(parse_single("", &likert()), Err(ParseError::Unparseable));
    }

    #[test]
    fn test_single_decimal_is_unparseable() {
        assert_eq!(parse_single("3.5", &likert()), Err(ParseError::Unparseable));
    }

    #[test]
    fn test_single_huge_number_is_out_of_range() {
        assert!(matches!(
            parse_single("99999999999999999999999", &likert()),
            Err(ParseError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_turn_positional() {
        let scale = likert();
        let qs = [("Q1", &scale), ("Q2", &scale)];
        assert_eq!(parse_turn("I'd say 4 and 3", &qs), vec![Ok(4), Ok(3)]);
    }

    #[test]
    fn test_turn_ambiguous_count_is_unparseable() {
        let scale = likert();
        let qs = [("Q1", &scale), ("Q2", &scale)];
        assert_eq!(
            parse_turn("4, 3 or maybe 2", &qs),
            vec![Err(ParseError::Unparseable), Err(ParseError::Unparseable)]
        );
        assert_eq!(
            parse_turn("4", &qs),
            vec![Err(ParseError::Unparseable), Err(ParseError::Unparseable)]
        );
    }

    #[test]
    fn test_turn_labelled_any_order() {
        let scale = likert();
        let qs = [("Q1", &scale), ("Q2", &scale)];
        let reply = "Q2: 5\nQ1: 2\nOverall I am 3 out of 5 creative.";
        assert_eq!(parse_turn(reply, &qs), vec![Ok(2), Ok(5)]);
    }

    #[test]
    fn test_turn_labelled_variants() {
        let scale = likert();
        let qs = [("1", &scale), ("2", &scale), ("3", &scale)];
        let reply = "1) 4\n[2] = 3\nQuestion 3 - 1";
        assert_eq!(parse_turn(reply, &qs), vec![Ok(4), Ok(3), Ok(1)]);
    }

    #[test]
    fn test_turn_numeric_ids_ignore_range_mentions() {
        let scale = likert();
        let qs = [("1", &scale), ("2", &scale)];
        assert_eq!(
            parse_turn("On the 1-5 scale:\n1: 4\n2: 3", &qs),
            vec![Ok(4), Ok(3)]
        );
        assert_eq!(parse_turn("1: 4, 2: 3", &qs), vec![Ok(4), Ok(3)]);
    }

    #[test]
    fn test_turn_label_and_value_share_a_line() {
        let scale = likert();
        let qs = [("1", &scale), ("2", &scale)];
        assert_eq!(parse_turn("1: 2.\n2: 4", &qs), vec![Ok(2), Ok(4)]);
        // A dangling label does not borrow the next line's number.
        assert_eq!(labelled_value("1 =\n3", "1"), None);
    }

    #[test]
    fn test_turn_labelled_range_checked_individually() {
        let scale = likert();
        let qs = [("Q1", &scale), ("Q2", &scale)];
        assert_eq!(
            parse_turn("Q1: 9\nQ2: 2", &qs),
            vec![Err(ParseError::OutOfRange { value: 9, min: 1, max: 5 }), Ok(2)]
        );
        assert_eq!(
            parse_turn("Q1: 2.5\nQ2: 2", &qs),
            vec![Err(ParseError::Unparseable), Ok(2)]
        );
    }

    #[test]
    fn test_turn_partial_labels_fall_back_to_positional() {
        let scale = likert();
        let qs = [("Q1", &scale), ("Q2", &scale)];
        // Only Q1 is labelled; the two integer tokens are used positionally.
        assert_eq!(parse_turn("Q1: 4, and the other one 2", &qs), vec![Ok(4), Ok(2)]);
    }

    #[test]
    fn test_turn_mixed_ranges() {
        let five = likert();
        let seven = ResponseScale::likert(1, 7);
        let qs = [("Q1", &five), ("Q2", &seven)];
        assert_eq!(
            parse_turn("6 and 6", &qs),
            vec![Err(ParseError::OutOfRange { value: 6, min: 1, max: 5 }), Ok(6)]
        );
    }
}
