use std::ops::Range;

use serde::{Deserialize, Serialize};

use super::elf::{self, ElfField};

/// How a regular file's content is interpreted while rewriting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContentFormat {
    /// ELF image with the byte ranges of its interpreter and search path strings.
    Elf(Vec<(ElfField, Range<usize>)>),
    /// `#!` script; `interpreter` covers the interpreter path on the first line.
    Script { interpreter: Range<usize> },
    Text,
    Opaque,
}

/// Serializable name of a [`ContentFormat`], used in rewrite reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatKind {
    Elf,
    Script,
    Text,
    Opaque,
}

impl ContentFormat {
    #[must_use]
    pub fn detect(content: &[u8]) -> Self {
        if content.starts_with(elf::MAGIC) {
            return Self::Elf(elf::search_path_fields(content).unwrap_or_default());
        }
        if let Some(interpreter) = shebang_interpreter(content) {
            return Self::Script { interpreter };
        }
        if !content.contains(&0) && std::str::from_utf8(content).is_ok() {
            return Self::Text;
        }
        Self::Opaque
    }

    #[must_use]
    pub fn kind(&self) -> FormatKind {
        match self {
            Self::Elf(_) => FormatKind::Elf,
            Self::Script { .. } => FormatKind::Script,
            Self::Text => FormatKind::Text,
            Self::Opaque => FormatKind::Opaque,
        }
    }

    /// Byte ranges whose store-root prefixes are rewritten even when they are
    /// not full references, split on `:` like a search path.
    pub(crate) fn path_fields(&self) -> Vec<Range<usize>> {
        match self {
            Self::Elf(fields) => fields.iter().map(|(_, range)| range.clone()).collect(),
            Self::Script { interpreter } => vec![interpreter.clone()],
            Self::Text | Self::Opaque => Vec::new(),
        }
    }
}

fn shebang_interpreter(content: &[u8]) -> Option<Range<usize>> {
    let rest = content.strip_prefix(b"#!")?;
    let line_end = rest
        .iter()
        .position(|&b| b == b'\n')
        .unwrap_or(rest.len());
    let line = &rest[..line_end];
    let start = line.iter().position(|&b| b != b' ' && b != b'\t')?;
    let len = line[start..]
        .iter()
        .position(|b| b.is_ascii_whitespace())
        .unwrap_or(line.len() - start);
    let start = start + 2;
    Some(start..start + len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_content() {
        assert_eq!(ContentFormat::detect(b"plain text\n"), ContentFormat::Text);
        assert_eq!(ContentFormat::detect(b"bin\0ary"), ContentFormat::Opaque);
        assert_eq!(ContentFormat::detect(&[0xff, 0xfe, 0x41]), ContentFormat::Opaque);
        assert_eq!(ContentFormat::detect(b""), ContentFormat::Text);
        assert_eq!(ContentFormat::detect(b"\x7fELF").kind(), FormatKind::Elf);
    }

    #[test]
    fn locates_shebang_interpreter() {
        let script = b"#! /nix/store/abcd-bash/bin/bash -e\necho hi\n";
        let ContentFormat::Script { interpreter } = ContentFormat::detect(script) else {
            panic!("expected a script");
        };
        assert_eq!(&script[interpreter], b"/nix/store/abcd-bash/bin/bash");

        let bare = b"#!/bin/sh";
        let ContentFormat::Script { interpreter } = ContentFormat::detect(bare) else {
            panic!("expected a script");
        };
        assert_eq!(&bare[interpreter], b"/bin/sh");
        assert_eq!(ContentFormat::detect(b"#!\n"), ContentFormat::Text);
    }
}
