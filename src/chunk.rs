//! Boundary-seeking text chunker with overlap.
//!
//! Splits document text into [`Passage`]s of at most `max_chars` bytes,
//! where consecutive passages share `overlap_chars` bytes so that a clause
//! cut at a boundary still appears whole in one of its neighbours.
//!
//! # Algorithm
//!
//! 1. Start a window at the current offset, `max_chars` long (snapped back to
//!    a UTF-8 char boundary).
//! 2. If the rest of the text fits in the window, emit it and stop.
//! 3. Otherwise look for the last boundary inside the window, in order of
//!    preference: paragraph break (`\n\n`), sentence end (`.`, `!`, `?`
//!    followed by whitespace), line break, any whitespace.
//! 4. With no usable boundary, hard-cut at the window end.
//! 5. Emit `[start, cut)`, then restart at `cut - overlap_chars`.
//!
//! A boundary is only usable if it lies past `start + overlap_chars`, which
//! guarantees forward progress. Offsets are byte offsets into the original
//! text, so `&text[p.start_offset..p.end_offset] == p.text` always holds.
//!
//! # Example
//!
//! ```rust
//! use policy_qa::chunk::chunk_text;
//!
//! let passages = chunk_text("Cover A applies.\n\nCover B applies.", 1000, 200).unwrap();
//! assert_eq!(passages.len(), 1);
//! assert_eq!(passages[0].index, 0);
//! ```

use crate::error::{QaError, QaResult};
use crate::models::Passage;

const SENTENCE_TERMINATORS: [char; 3] = ['.', '!', '?'];

/// Split `text` into overlapping passages of at most `max_chars` bytes.
///
/// # Errors
///
/// - [`QaError::EmptyDocument`] if `text` has no non-whitespace characters.
/// - [`QaError::InvalidArgument`] if `max_chars == 0` or
///   `overlap_chars >= max_chars`.
///
/// # Guarantees
///
/// - Deterministic for identical inputs.
/// - Indices are contiguous from 0 and follow document order.
/// - Start offsets strictly increase, so no two passages share a range.
/// - Every non-whitespace character lies inside at least one passage.
pub fn chunk_text(text: &str, max_chars: usize, overlap_chars: usize) -> QaResult<Vec<Passage>> {
    if max_chars == 0 {
        return Err(QaError::invalid("max_chars must be > 0"));
    }
    if overlap_chars >= max_chars {
        return Err(QaError::invalid(format!(
            "overlap_chars ({}) must be smaller than max_chars ({})",
            overlap_chars, max_chars
        )));
    }
    if text.trim().is_empty() {
        return Err(QaError::EmptyDocument);
    }

    let mut passages: Vec<Passage> = Vec::new();
    let mut start = 0usize;

    loop {
        if text.len() - start <= max_chars {
            push_passage(&mut passages, text, start, text.len());
            break;
        }

        let window_end = snap_to_char_boundary(text, start + max_chars);
        let min_cut = start + overlap_chars + 1;
        let cut = find_boundary(text, start, window_end, min_cut).unwrap_or(window_end);
        // A window narrower than one char (tiny max_chars, wide glyph) still has to advance.
        let cut = if cut <= start {
            next_char_boundary(text, start)
        } else {
            cut
        };
        push_passage(&mut passages, text, start, cut);

        let mut next = snap_to_char_boundary(text, cut.saturating_sub(overlap_chars));
        if next <= start {
            next = next_char_boundary(text, start);
        }
        start = next;
    }

    Ok(passages)
}

/// Find the best cut position in `text[start..window_end]`, at or past `min_cut`.
fn find_boundary(text: &str, start: usize, window_end: usize, min_cut: usize) -> Option<usize> {
    let window = &text[start..window_end];
    let usable = |cut: usize| if cut >= min_cut { Some(cut) } else { None };

    if let Some(cut) = window.rfind("\n\n").and_then(|pos| usable(start + pos + 2)) {
        return Some(cut);
    }

    let mut prev: Option<char> = None;
    let mut sentence_cut = None;
    for (i, c) in window.char_indices() {
        if c.is_whitespace() && prev.is_some_and(|p| SENTENCE_TERMINATORS.contains(&p)) {
            sentence_cut = Some(start + i + c.len_utf8());
        }
        prev = Some(c);
    }
    if let Some(cut) = sentence_cut.and_then(usable) {
        return Some(cut);
    }

    if let Some(cut) = window.rfind('\n').and_then(|pos| usable(start + pos + 1)) {
        return Some(cut);
    }

    window
        .char_indices()
        .rev()
        .find(|(_, c)| c.is_whitespace())
        .and_then(|(pos, c)| usable(start + pos + c.len_utf8()))
}

/// Append `text[start..end]` unless it is whitespace only.
fn push_passage(passages: &mut Vec<Passage>, text: &str, start: usize, end: usize) {
    let slice = &text[start..end];
    if slice.trim().is_empty() {
        return;
    }
    passages.push(Passage {
        index: passages.len(),
        text: slice.to_string(),
        start_offset: start,
        end_offset: end,
    });
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// The byte index just past the char starting at `index`.
fn next_char_boundary(s: &str, index: usize) -> usize {
    s[index..]
        .chars()
        .next()
        .map(|c| index + c.len_utf8())
        .unwrap_or(s.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY: &str = "Hospitalization is covered up to $50,000. \
        Pre-existing conditions are excluded for 24 months.";

    fn assert_covers(text: &str, passages: &[Passage]) {
        let mut covered = vec![false; text.len()];
        for p in passages {
            assert_eq!(&text[p.start_offset..p.end_offset], p.text);
            for flag in covered.iter_mut().take(p.end_offset).skip(p.start_offset) {
                *flag = true;
            }
        }
        for (i, c) in text.char_indices() {
            if !c.is_whitespace() {
                assert!(covered[i], "char {:?} at byte {} not covered", c, i);
            }
        }
    }

    #[test]
    fn test_small_text_single_passage() {
        let passages = chunk_text("Hello, world!", 1000, 200).unwrap();
        assert_eq!(passages.len(), 1);
        assert_eq!(passages[0].index, 0);
        assert_eq!(passages[0].text, "Hello, world!");
        assert_eq!(passages[0].start_offset, 0);
        assert_eq!(passages[0].end_offset, 13);
    }

    #[test]
    fn test_empty_text() {
        assert!(matches!(chunk_text("", 1000, 200), Err(QaError::EmptyDocument)));
        assert!(matches!(
            chunk_text(" \n\n\t ", 1000, 200),
            Err(QaError::EmptyDocument)
        ));
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(matches!(
            chunk_text("text", 0, 0),
            Err(QaError::InvalidArgument(_))
        ));
        assert!(matches!(
            chunk_text("text", 10, 10),
            Err(QaError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_policy_scenario() {
        let passages = chunk_text(POLICY, 60, 10).unwrap();
        assert!(
            (2..=3).contains(&passages.len()),
            "got {} passages",
            passages.len()
        );
        assert!(passages[0].text.starts_with("Hospitalization is covered"));
        assert!(passages.iter().any(|p| p.text.contains("24 months.")));
        for p in &passages {
            assert!(p.text.len() <= 60);
        }
        assert_covers(POLICY, &passages);
    }

    #[test]
    fn test_prefers_sentence_boundary() {
        let passages = chunk_text(POLICY, 60, 10).unwrap();
        // The first sentence is 41 bytes; the cut lands right after it.
        assert_eq!(passages[0].text, "Hospitalization is covered up to $50,000. ");
    }

    #[test]
    fn test_prefers_paragraph_boundary() {
        let text = "Section one. It has two sentences.\n\nSection two follows here.";
        let passages = chunk_text(text, 45, 5).unwrap();
        assert!(passages[0].text.ends_with("\n\n"));
        assert_covers(text, &passages);
    }

    #[test]
    fn test_hard_cut_without_boundaries() {
        let text = "a".repeat(250);
        let passages = chunk_text(&text, 100, 10).unwrap();
        let ranges: Vec<(usize, usize)> = passages
            .iter()
            .map(|p| (p.start_offset, p.end_offset))
            .collect();
        assert_eq!(ranges, vec![(0, 100), (90, 190), (180, 250)]);
    }

    #[test]
    fn test_consecutive_passages_overlap() {
        let text = (0..40)
            .map(|i| format!("Clause {} applies to the insured.", i))
            .collect::<Vec<_>>()
            .join(" ");
        let passages = chunk_text(&text, 120, 30).unwrap();
        assert!(passages.len() > 1);
        for pair in passages.windows(2) {
            assert!(pair[1].start_offset < pair[0].end_offset);
            assert!(pair[1].start_offset > pair[0].start_offset);
        }
        assert_covers(&text, &passages);
    }

    #[test]
    fn test_indices_contiguous() {
        let text = (0..50)
            .map(|i| format!("Paragraph number {}.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let passages = chunk_text(&text, 40, 8).unwrap();
        for (i, p) in passages.iter().enumerate() {
            assert_eq!(p.index, i, "Index mismatch at position {}", i);
        }
        assert_covers(&text, &passages);
    }

    #[test]
    fn test_multibyte_utf8_chars() {
        let text = "┌──────────────────┐\n│ Hello world      │\n└──────────────────┘";
        let passages = chunk_text(text, 7, 2).unwrap();
        assert!(!passages.is_empty());
        assert_covers(text, &passages);
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha beta.\n\nGamma delta. Epsilon zeta.\n\nEta theta iota kappa.";
        let a = chunk_text(text, 20, 4).unwrap();
        let b = chunk_text(text, 20, 4).unwrap();
        assert_eq!(a, b);
    }
}
