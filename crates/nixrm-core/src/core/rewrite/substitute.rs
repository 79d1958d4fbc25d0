use nixrm_domain::{RootMapping, HASH_LEN};
use regex::bytes::Regex;

use super::format::{ContentFormat, FormatKind};

/// Result of patching one buffer in place.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Substitution {
    pub format: FormatKind,
    pub replacements: usize,
}

/// A root occurrence that prevents the buffer from being rewritten.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferenceIssue {
    /// Root, `/` and a full-length hash with no `-` after it, in opaque content.
    Ambiguous { offset: usize },
    /// A full reference that survived patching.
    Residual { offset: usize },
}

/// Nix base-32 digits as a regex class.
const HASH_CLASS: &str = "0-9a-df-np-sv-z";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Occurrence {
    /// `<root>/<hash>-`
    Full,
    /// `<root>/` and a full-length hash with no `-` after it.
    Ambiguous,
}

/// Locates store references under one root.
///
/// Compiled once per rewrite pass and shared across workers. Occurrences of
/// the root that are not followed by `/` and a hash never match.
#[derive(Clone, Debug)]
pub struct ReferenceScanner {
    pattern: Regex,
}

impl ReferenceScanner {
    /// Scanner for references to `root`.
    ///
    /// # Errors
    ///
    /// Fails when the pattern for `root` exceeds the regex size limits.
    pub fn new(root: &str) -> Result<Self, regex::Error> {
        let pattern = format!(
            "{}/([{HASH_CLASS}]{{1,{HASH_LEN}}})(-)?",
            regex::escape(root)
        );
        Ok(Self {
            pattern: Regex::new(&pattern)?,
        })
    }

    fn occurrences<'a>(
        &'a self,
        content: &'a [u8],
    ) -> impl Iterator<Item = (usize, Occurrence)> + 'a {
        self.pattern.captures_iter(content).filter_map(|captures| {
            let start = captures.get(0)?.start();
            if captures.get(2).is_some() {
                Some((start, Occurrence::Full))
            } else if captures.get(1)?.len() == HASH_LEN {
                Some((start, Occurrence::Ambiguous))
            } else {
                None
            }
        })
    }

    /// Offset of the first full reference in `content`.
    pub(crate) fn find_full(&self, content: &[u8]) -> Option<usize> {
        self.occurrences(content)
            .find(|(_, occurrence)| *occurrence == Occurrence::Full)
            .map(|(offset, _)| offset)
    }
}

/// Rewrites every store reference in `content` from the original root to the
/// replacement root, in place.
///
/// Full references (`<root>/<hash>-`) are replaced wherever they appear. For
/// ELF images and scripts the interpreter and search path strings also have a
/// leading root replaced element by element. Other occurrences of the root are
/// left alone. The buffer length never changes.
///
/// `references` must scan for `mapping.original()`.
pub fn rewrite_bytes(
    content: &mut [u8],
    mapping: &RootMapping,
    references: &ReferenceScanner,
) -> Result<Substitution, ReferenceIssue> {
    let format = ContentFormat::detect(content);
    let original = mapping.original().as_bytes();
    let replacement = mapping.replacement().as_bytes();
    let mut replacements = 0;

    let found: Vec<(usize, Occurrence)> = references.occurrences(content).collect();
    for (offset, occurrence) in found {
        match occurrence {
            Occurrence::Full => {
                content[offset..offset + original.len()].copy_from_slice(replacement);
                replacements += 1;
            }
            Occurrence::Ambiguous if format == ContentFormat::Opaque => {
                return Err(ReferenceIssue::Ambiguous { offset });
            }
            Occurrence::Ambiguous => {}
        }
    }

    for field in format.path_fields() {
        let lengths: Vec<usize> = content[field.clone()]
            .split(|&b| b == b':')
            .map(<[u8]>::len)
            .collect();
        let mut start = field.start;
        for element in lengths {
            let range = start..start + element;
            if let Some(patched) = mapping.rewrite_prefix(&content[range.clone()]) {
                content[range].copy_from_slice(&patched);
                replacements += 1;
            }
            start += element + 1;
        }
    }

    if let Some(offset) = references.find_full(content) {
        return Err(ReferenceIssue::Residual { offset });
    }
    Ok(Substitution {
        format: format.kind(),
        replacements,
    })
}
