//! Building blocks of the ATerm format used for derivation
//! serialization: double-quoted strings, tuples `(a,b,c)` and lists
//! `[x,y,z]`.

use nom::branch::alt;
use nom::bytes::complete::{escaped_transform, is_not, tag};
use nom::character::complete::char as nomchar;
use nom::combinator::{map, map_opt, value};
use nom::multi::separated_list0;
use nom::sequence::delimited;
use nom::IResult;

/// Escapes a string for emission inside double quotes. `"` and `\` are
/// backslash-escaped; newline, CR and tab become `\n`, `\r`, `\t`.
pub(crate) fn escape_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}

fn parse_escaped_bytes(i: &[u8]) -> IResult<&[u8], Vec<u8>> {
    escaped_transform(
        is_not("\"\\"),
        '\\',
        alt((
            value("\\".as_bytes(), nomchar('\\')),
            value("\n".as_bytes(), nomchar('n')),
            value("\t".as_bytes(), nomchar('t')),
            value("\r".as_bytes(), nomchar('r')),
            value("\"".as_bytes(), nomchar('\"')),
        )),
    )(i)
}

/// Parses a double-quoted field, undoing escapes, into a [String].
/// Fails if the contents are not valid UTF-8.
pub(crate) fn parse_string_field(i: &[u8]) -> IResult<&[u8], String> {
    delimited(
        nomchar('"'),
        alt((
            map_opt(parse_escaped_bytes, |bytes| String::from_utf8(bytes).ok()),
            map(tag(b""), |_| String::new()),
        )),
        nomchar('"'),
    )(i)
}

/// Parses a bracketed list of string fields.
pub(crate) fn parse_string_list(i: &[u8]) -> IResult<&[u8], Vec<String>> {
    delimited(
        nomchar('['),
        separated_list0(nomchar(','), parse_string_field),
        nomchar(']'),
    )(i)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    #[rstest]
    #[case::empty("", "")]
    #[case::plain("Hello World", "Hello World")]
    #[case::doublequote("\"", "\\\"")]
    #[case::backslash("\\", "\\\\")]
    #[case::newline_tab("a\nb\tc", "a\\nb\\tc")]
    #[case::colon(":", ":")]
    fn escape(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(super::escape_string(input), expected);
    }

    #[rstest]
    #[case::empty(br#""""#, "", b"")]
    #[case::hello_world(br#""Hello World""#, "Hello World", b"")]
    #[case::doublequote(br#""\"""#, "\"", b"")]
    #[case::escapes(br#""a\nb\tc""#, "a\nb\tc", b"")]
    #[case::rest(br#""x"rest"#, "x", b"rest")]
    fn parse_string_field(#[case] input: &[u8], #[case] expected: &str, #[case] rest: &[u8]) {
        let (i, parsed) = super::parse_string_field(input).expect("must parse");
        assert_eq!(parsed, expected);
        assert_eq!(i, rest);
    }

    #[rstest]
    #[case::empty_list(b"[]".as_slice(), vec![])]
    #[case::single(br#"["foo"]"#.as_slice(), vec!["foo".to_string()])]
    #[case::two(br#"["foo","bar"]"#.as_slice(), vec!["foo".to_string(), "bar".to_string()])]
    fn parse_string_list(#[case] input: &[u8], #[case] expected: Vec<String>) {
        let (i, parsed) = super::parse_string_list(input).expect("must parse");
        assert_eq!(parsed, expected);
        assert!(i.is_empty());
    }

    #[test]
    fn escape_round_trip() {
        let raw = "a\"b\\c\nd\te\rf";
        let quoted = format!("\"{}\"", super::escape_string(raw));
        let (_, parsed) = super::parse_string_field(quoted.as_bytes()).expect("must parse");
        assert_eq!(parsed, raw);
    }
}
