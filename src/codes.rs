//! Activity-code (OKVED2) taxonomy filter.
//!
//! Filters are either a section letter (`A`..`U`) or a dotted numeric code
//! (`01`, `01.10`, `01.10.01`). A dotted filter selects itself and every
//! descendant, i.e. every code whose leading segments equal the filter.

use std::collections::HashSet;

use log::warn;

/// OKVED2 sections keyed by the inclusive range of two-digit divisions.
const SECTIONS: [(u8, u8, char); 21] = [
    (1, 3, 'A'),
    (5, 9, 'B'),
    (10, 33, 'C'),
    (35, 35, 'D'),
    (36, 39, 'E'),
    (41, 43, 'F'),
    (45, 47, 'G'),
    (49, 53, 'H'),
    (55, 56, 'I'),
    (58, 63, 'J'),
    (64, 66, 'K'),
    (68, 68, 'L'),
    (69, 75, 'M'),
    (77, 82, 'N'),
    (84, 84, 'O'),
    (85, 85, 'P'),
    (86, 88, 'Q'),
    (90, 93, 'R'),
    (94, 96, 'S'),
    (97, 98, 'T'),
    (99, 99, 'U'),
];

/// Section letter for a two-digit division, if the division exists.
pub fn section_for_division(division: u8) -> Option<char> {
    SECTIONS
        .iter()
        .find(|(first, last, _)| (*first..=*last).contains(&division))
        .map(|(_, _, letter)| *letter)
}

/// Splits a dotted code into its numeric segments. `None` for anything that
/// is not a non-empty sequence of digit groups separated by single dots.
fn split_segments(code: &str) -> Option<Vec<&str>> {
    let code = code.trim();
    if code.is_empty() {
        return None;
    }
    let segments: Vec<&str> = code.split('.').collect();
    if segments
        .iter()
        .all(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
    {
        Some(segments)
    } else {
        None
    }
}

/// Section letter of a dotted code, derived from its first segment.
pub fn section_of(code: &str) -> Option<char> {
    let segments = split_segments(code)?;
    let division: u8 = segments[0].parse().ok()?;
    if segments[0].len() != 2 {
        return None;
    }
    section_for_division(division)
}

fn parse_section_letter(raw: &str) -> Option<char> {
    let mut chars = raw.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_alphabetic() => {
            let letter = c.to_ascii_uppercase();
            SECTIONS.iter().any(|(_, _, l)| *l == letter).then_some(letter)
        }
        _ => None,
    }
}

/// Read-only filter index built once per extraction run.
#[derive(Debug, Clone, Default)]
pub struct CodeTree {
    groups: HashSet<char>,
    codes: HashSet<String>,
    /// Distinct segment counts among `codes`, so matching only truncates to
    /// depths that some filter actually has.
    depths: Vec<usize>,
}

impl CodeTree {
    pub fn new<S: AsRef<str>>(filters: &[S]) -> Self {
        let mut tree = CodeTree::default();
        for raw in filters {
            let raw = raw.as_ref().trim();
            if let Some(letter) = parse_section_letter(raw) {
                tree.groups.insert(letter);
            } else if let Some(segments) = split_segments(raw) {
                let depth = segments.len();
                tree.codes.insert(segments.join("."));
                if !tree.depths.contains(&depth) {
                    tree.depths.push(depth);
                }
            } else {
                warn!("Ignoring malformed activity code filter '{}'", raw);
            }
        }
        tree.depths.sort_unstable();
        tree
    }

    /// True when no usable filter was configured.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.codes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.groups.len() + self.codes.len()
    }

    pub fn matches(&self, code: &str) -> bool {
        if self.is_empty() {
            return true;
        }
        let Some(segments) = split_segments(code) else {
            return false;
        };
        if !self.groups.is_empty() {
            if let Some(letter) = section_of(code) {
                if self.groups.contains(&letter) {
                    return true;
                }
            }
        }
        self.depths
            .iter()
            .take_while(|depth| **depth <= segments.len())
            .any(|depth| self.codes.contains(&segments[..*depth].join(".")))
    }
}
