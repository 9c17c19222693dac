//! Extraction of typed references from documents.
//!
//! [`scan`] is a pure function of a document. Whether a reference currently
//! points at something is decided later against live state through a
//! [`TargetResolver`].
use serde::{Deserialize, Serialize};

use crate::{Block, BlockId, BlockKind, Document, Inline, LinkTarget, NoteId};

/// What a reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Note,
    Tag,
    Block,
}

/// How the target key addresses its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Addressing {
    /// The key is an identifier (note id, block id, tag name).
    Id,
    /// The key is a note title and must be resolved by name.
    Title,
}

/// A directed pointer from one note's block to a note, tag or block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub from_note_id: NoteId,
    pub from_block_id: BlockId,
    pub target_kind: TargetKind,
    pub target_key: String,
    pub addressing: Addressing,
    pub resolved: bool,
}

impl Reference {
    pub fn is_title_link(&self) -> bool {
        self.target_kind == TargetKind::Note && self.addressing == Addressing::Title
    }
}

/// Live state a reference is resolved against.
pub trait TargetResolver {
    /// Whether a live note has this id.
    fn note_exists(&self, id: &str) -> bool;

    /// The live note a title-addressed link points at, if any.
    fn resolve_title(&self, title: &str) -> Option<NoteId>;

    /// Whether a live note owns a block with this id.
    fn block_exists(&self, id: &str) -> bool;
}

/// Extracts every reference in `document`, in document order.
///
/// Tags come back resolved; note and block references come back unresolved
/// until passed through [`resolve`].
pub fn scan(note_id: &str, document: &Document) -> Vec<Reference> {
    let mut references = Vec::new();
    for block in &document.blocks {
        scan_block(note_id, block, &mut references);
    }
    references
}

fn scan_block(note_id: &str, block: &Block, out: &mut Vec<Reference>) {
    let reference = |target_kind, target_key: &str, addressing| Reference {
        from_note_id: note_id.to_string(),
        from_block_id: block.id.clone(),
        target_kind,
        target_key: target_key.to_string(),
        addressing,
        resolved: target_kind == TargetKind::Tag,
    };

    match &block.kind {
        BlockKind::BlockReference { block_id } => {
            out.push(reference(TargetKind::Block, block_id.as_str(), Addressing::Id));
        }
        BlockKind::Table { rows } => {
            for cell in rows.iter().flat_map(|row| row.cells.iter()) {
                scan_inlines(cell, &reference, out);
            }
        }
        _ => {}
    }
    scan_inlines(&block.content, &reference, out);

    for child in &block.children {
        scan_block(note_id, child, out);
    }
}

fn scan_inlines(
    inlines: &[Inline],
    reference: &impl Fn(TargetKind, &str, Addressing) -> Reference,
    out: &mut Vec<Reference>,
) {
    for inline in inlines {
        match inline {
            Inline::NoteLink { target, .. } => out.push(match target {
                LinkTarget::Id(id) => reference(TargetKind::Note, id.as_str(), Addressing::Id),
                LinkTarget::Title(title) => reference(TargetKind::Note, title.as_str(), Addressing::Title),
            }),
            Inline::Tag { name } => out.push(reference(TargetKind::Tag, name.as_str(), Addressing::Id)),
            Inline::BlockRef { block_id } => {
                out.push(reference(TargetKind::Block, block_id.as_str(), Addressing::Id))
            }
            _ => {}
        }
    }
}

/// Whether `reference` points at something that exists right now.
pub fn is_resolved(reference: &Reference, resolver: &impl TargetResolver) -> bool {
    match (reference.target_kind, reference.addressing) {
        (TargetKind::Tag, _) => true,
        (TargetKind::Note, Addressing::Id) => resolver.note_exists(&reference.target_key),
        (TargetKind::Note, Addressing::Title) => {
            resolver.resolve_title(&reference.target_key).is_some()
        }
        (TargetKind::Block, _) => resolver.block_exists(&reference.target_key),
    }
}

/// Fills in `resolved` for every reference against live state.
pub fn resolve(references: &mut [Reference], resolver: &impl TargetResolver) {
    for reference in references {
        reference.resolved = is_resolved(reference, resolver);
    }
}
