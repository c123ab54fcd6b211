//! C1 — Text Filter.
//!
//! A pure predicate over a [`PageCandidate`], returning a [`FilterVerdict`].
//! The thresholds below are part of the contract, not tuning knobs: an
//! implementation must use exactly these numbers.

use std::sync::OnceLock;

use regex::Regex;

use crate::types::{DropReason, FilterVerdict, PageCandidate};

fn toc_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^.*\.{3,}\d+\s*$").expect("valid regex"))
}

fn figure_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*(図\d+|表\d+)").expect("valid regex"))
}

/// Evaluates C1's four drop conditions against one page, in the order the
/// design lists them: length, foreign-character ratio, ToC heuristic,
/// figure/table-directory heuristic.
pub fn evaluate(page: &PageCandidate) -> FilterVerdict {
    let non_ws_count = page.text.chars().filter(|c| !c.is_whitespace()).count();
    if non_ws_count < 50 {
        return FilterVerdict::drop_for(DropReason::TooShort);
    }

    if foreign_ratio(&page.text) > 0.7 {
        return FilterVerdict::drop_for(DropReason::NonJapaneseRatio);
    }

    if toc_line_re().find_iter(&page.text).count() >= 5 {
        return FilterVerdict::drop_for(DropReason::TableOfContents);
    }

    if figure_line_re().find_iter(&page.text).count() >= 3 {
        return FilterVerdict::drop_for(DropReason::FigureIndex);
    }

    FilterVerdict::keep()
}

/// Ratio of characters that are neither Japanese (hiragana, katakana, CJK
/// unified ideographs, the full-width punctuation block) nor ASCII
/// letters, over all non-whitespace characters. Returns 0.0 for an
/// all-whitespace (already-dropped-by-length) page rather than dividing
/// by zero.
fn foreign_ratio(text: &str) -> f64 {
    let mut total = 0usize;
    let mut foreign = 0usize;
    for c in text.chars() {
        if c.is_whitespace() {
            continue;
        }
        total += 1;
        if !is_japanese(c) && !c.is_ascii_alphabetic() {
            foreign += 1;
        }
    }
    if total == 0 {
        0.0
    } else {
        foreign as f64 / total as f64
    }
}

fn is_japanese(c: char) -> bool {
    matches!(c as u32,
        0x3040..=0x309F   // Hiragana
        | 0x30A0..=0x30FF // Katakana
        | 0x4E00..=0x9FFF // CJK Unified Ideographs
        | 0x3400..=0x4DBF // CJK Extension A
        | 0x3000..=0x303F // CJK punctuation
        | 0xFF00..=0xFFEF // Full-width forms
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(text: &str) -> PageCandidate {
        PageCandidate { page_number: 1, text: text.to_string() }
    }

    #[test]
    fn keeps_a_normal_japanese_page() {
        let text = "機械学習は統計と最適化の交点にある。".repeat(3);
        let verdict = evaluate(&page(&text));
        assert!(verdict.keep);
        assert_eq!(verdict.reason, None);
    }

    #[test]
    fn drops_pages_under_fifty_non_whitespace_chars() {
        let verdict = evaluate(&page("短い。"));
        assert!(!verdict.keep);
        assert_eq!(verdict.reason, Some(DropReason::TooShort));
    }

    #[test]
    fn drops_pages_dominated_by_foreign_characters() {
        let text = "∑∫∂≈≠±×÷√∞∝∀∃∈∉⊂⊃∪∩¬∧∨⇒⇔∴∵".repeat(3);
        let verdict = evaluate(&page(&text));
        assert!(!verdict.keep);
        assert_eq!(verdict.reason, Some(DropReason::NonJapaneseRatio));
    }

    #[test]
    fn drops_table_of_contents_pages() {
        let mut text = String::new();
        for i in 1..=6 {
            text.push_str(&format!("第{}章 はじめに..............{}\n", i, i * 10));
        }
        let verdict = evaluate(&page(&text));
        assert_eq!(verdict.reason, Some(DropReason::TableOfContents));
    }

    #[test]
    fn drops_figure_index_pages() {
        let text = "図1 モデル構成\n図2 学習曲線\n図3 評価結果\n追加の説明文章がここに入る。".to_string();
        let verdict = evaluate(&page(&text));
        assert_eq!(verdict.reason, Some(DropReason::FigureIndex));
    }

    #[test]
    fn four_dotted_leader_lines_are_not_enough_to_drop() {
        let mut text = String::new();
        for i in 1..=4 {
            text.push_str(&format!("第{}章 はじめに..............{}\n", i, i * 10));
        }
        text.push_str("ここからは本文が続き、十分な文字数を満たしている説明である。");
        let verdict = evaluate(&page(&text));
        assert!(verdict.keep);
    }
}
