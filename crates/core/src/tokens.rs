#![forbid(unsafe_code)]

//! Deterministic token counts over the cl100k_base BPE vocabulary, used
//! for cost estimation and analysis batch sizing.

use std::sync::OnceLock;
use tiktoken_rs::CoreBPE;

fn encoder() -> &'static CoreBPE {
    static CL100K: OnceLock<CoreBPE> = OnceLock::new();
    CL100K.get_or_init(|| tiktoken_rs::cl100k_base().expect("embedded cl100k_base vocabulary"))
}

pub fn count_tokens(text: &str) -> usize {
    encoder().encode_with_special_tokens(text).len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_has_no_tokens() {
        assert_eq!(count_tokens(""), 0);
    }

    #[test]
    fn longer_text_never_counts_fewer_tokens() {
        let short = count_tokens("He loved linguistics.");
        let long = count_tokens("He loved linguistics. It gave him wisdom.");
        assert!(short > 0);
        assert!(long > short);
    }

    #[test]
    fn counts_are_stable_across_calls() {
        let text = "現在の場面の要約を1文で記述してください。";
        assert_eq!(count_tokens(text), count_tokens(text));
    }
}
