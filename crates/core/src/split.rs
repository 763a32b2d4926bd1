#![forbid(unsafe_code)]

//! English sentence segmentation. The rules are regex rewrites over an
//! internal `{SEP}` sentinel so the behavior is deterministic and the
//! test vectors stay stable.

use regex::Regex;
use std::sync::OnceLock;

const SEP: &str = "{SEP}";
const PERIOD_MASK: &str = "__PERIOD__";

fn regex_of(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static sentence pattern"))
}

fn abbreviation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex_of(
        &RE,
        r"(?i)(mrs|mr|ms|jr|dr|prof|st|etc|i\.e|a\.m|p\.m|vs)\.",
    )
}

fn initial_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex_of(&RE, r"(\W)([A-Z])\.")
}

fn terminator_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex_of(&RE, r"([a-zA-Z])([.!?;]+)(\s+)([A-Z])")
}

fn long_run_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex_of(&RE, r"([^.!?;{}]{100,})([.!?;]+)(\s+)")
}

fn opening_quote_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex_of(&RE, "([.!?;]+)(\\s+)([\"“‘*\\p{Ps}])")
}

fn closing_quote_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex_of(&RE, "([.!?;]+[\"”’\\p{Pe}])")
}

/// Segment `text` into trimmed, non-empty sentences.
///
/// Abbreviation-terminal periods ("Mr.", "i.e.", single initials) are
/// masked before the break rules run, then restored. Breaks go after a
/// terminator run followed by whitespace and a capital, after 100+
/// terminator-free characters that end in a terminator, around opening
/// and closing quotation marks and brackets next to a terminator.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut norm = text.trim().to_string();
    norm = abbreviation_re()
        .replace_all(&norm, "${1}__PERIOD__")
        .into_owned();
    norm = initial_re()
        .replace_all(&norm, "${1}${2}__PERIOD__")
        .into_owned();
    norm = terminator_re()
        .replace_all(&norm, "${1}${2}{SEP}${4}")
        .into_owned();
    norm = long_run_re()
        .replace_all(&norm, "${1}${2}{SEP}")
        .into_owned();
    norm = opening_quote_re()
        .replace_all(&norm, "${1}{SEP}${2}${3}")
        .into_owned();
    norm = closing_quote_re().replace_all(&norm, "${1}{SEP}").into_owned();
    norm = norm.replace(PERIOD_MASK, ".");
    norm.split(SEP)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_terminator_before_capital() {
        assert_eq!(
            split_sentences("He loved linguistics. It gave him wisdom."),
            vec!["He loved linguistics.", "It gave him wisdom."]
        );
    }

    #[test]
    fn keeps_single_sentence_whole() {
        assert_eq!(
            split_sentences("He loved linguistics."),
            vec!["He loved linguistics."]
        );
    }

    #[test]
    fn protects_abbreviations() {
        assert_eq!(
            split_sentences("Dr. Brown met Mrs. Green. They talked."),
            vec!["Dr. Brown met Mrs. Green.", "They talked."]
        );
    }

    #[test]
    fn protects_single_initials() {
        assert_eq!(
            split_sentences("It was J. Smith. He waved."),
            vec!["It was J. Smith.", "He waved."]
        );
    }

    #[test]
    fn breaks_before_opening_quote() {
        assert_eq!(
            split_sentences("He nodded. “Hello there,” she said."),
            vec!["He nodded.", "“Hello there,” she said."]
        );
    }

    #[test]
    fn breaks_after_closing_quote() {
        assert_eq!(
            split_sentences("“Run!” They ran away together."),
            vec!["“Run!”", "They ran away together."]
        );
    }

    #[test]
    fn forces_break_after_long_run() {
        let long_clause = "they walked and walked through the endless valley under \
a heavy gray sky that would not lift for days on end, ";
        let text = format!("{long_clause}and then some. and then they rested a while");
        let sentences = split_sentences(&text);
        assert_eq!(sentences.len(), 2);
        assert!(sentences[0].ends_with("and then some."));
        assert_eq!(sentences[1], "and then they rested a while");
    }

    #[test]
    fn drops_empty_segments_and_trims() {
        assert_eq!(split_sentences("   "), Vec::<String>::new());
        assert_eq!(
            split_sentences("  One thing. Another thing.  "),
            vec!["One thing.", "Another thing."]
        );
    }

    #[test]
    fn semicolon_counts_as_terminator() {
        assert_eq!(
            split_sentences("It rained all day; Nobody left the house."),
            vec!["It rained all day;", "Nobody left the house."]
        );
    }
}
