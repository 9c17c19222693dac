//! Reverse index from reference targets to the references pointing at them.
use std::collections::{BTreeMap, HashMap};

use log::trace;

use crate::{is_resolved, NoteId, Reference, TargetKind, TargetResolver};

/// How a target is looked up. Title-addressed note links match
/// case-insensitively; every other key matches exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum IndexKey {
    Exact(String),
    Title(String),
}

impl IndexKey {
    fn of(reference: &Reference) -> Self {
        if reference.is_title_link() {
            IndexKey::Title(reference.target_key.to_lowercase())
        } else {
            IndexKey::Exact(reference.target_key.clone())
        }
    }
}

/// Position of a reference inside its source note's scan.
type Positioned = (usize, Reference);

/// Target -> references, plus the per-source list that keeps updates
/// proportional to the size of one note.
#[derive(Debug, Default, Clone)]
pub struct BacklinkIndex {
    by_target: HashMap<IndexKey, BTreeMap<NoteId, Vec<Positioned>>>,
    by_source: HashMap<NoteId, Vec<Reference>>,
}

impl BacklinkIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces every reference recorded for `note_id` with `references`.
    pub fn update(&mut self, note_id: &str, references: Vec<Reference>) {
        self.retract(note_id);
        if references.is_empty() {
            return;
        }

        for (position, reference) in references.iter().enumerate() {
            self.by_target
                .entry(IndexKey::of(reference))
                .or_default()
                .entry(note_id.to_string())
                .or_default()
                .push((position, reference.clone()));
        }
        trace!("indexed {} references from {}", references.len(), note_id);
        self.by_source.insert(note_id.to_string(), references);
    }

    /// Removes every reference from `note_id`. References to it stay.
    pub fn retract(&mut self, note_id: &str) {
        let Some(old) = self.by_source.remove(note_id) else {
            return;
        };
        for reference in &old {
            let key = IndexKey::of(reference);
            if let Some(sources) = self.by_target.get_mut(&key) {
                sources.remove(note_id);
                if sources.is_empty() {
                    self.by_target.remove(&key);
                }
            }
        }
    }

    /// References whose key is `key`: exact matches for ids, tags and block
    /// ids, plus case-insensitive matches of title-addressed links.
    ///
    /// Grouped by source note (sorted by id), document order inside a group.
    pub fn backlinks_for(&self, key: &str) -> Vec<Reference> {
        let exact = self.by_target.get(&IndexKey::Exact(key.to_string()));
        let titled = self.by_target.get(&IndexKey::Title(key.to_lowercase()));
        merge_groups([exact, titled])
    }

    /// Title-addressed note links whose title matches `title`.
    pub fn backlinks_for_title(&self, title: &str) -> Vec<Reference> {
        merge_groups([self.by_target.get(&IndexKey::Title(title.to_lowercase()))])
    }

    /// Id-addressed references of `kind` whose key is exactly `key`.
    pub fn backlinks_for_kind(&self, kind: TargetKind, key: &str) -> Vec<Reference> {
        merge_groups([self.by_target.get(&IndexKey::Exact(key.to_string()))])
            .into_iter()
            .filter(|r| r.target_kind == kind)
            .collect()
    }

    /// Note links to `id`, plus title-addressed links matching `title`.
    pub fn backlinks_for_note(&self, id: &str, title: Option<&str>) -> Vec<Reference> {
        let titled = title.and_then(|t| self.by_target.get(&IndexKey::Title(t.to_lowercase())));
        merge_groups([self.by_target.get(&IndexKey::Exact(id.to_string())), titled])
            .into_iter()
            .filter(|r| r.target_kind == TargetKind::Note)
            .collect()
    }

    /// The references `note_id` currently makes, in document order.
    pub fn references_from(&self, note_id: &str) -> &[Reference] {
        self.by_source
            .get(note_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Usage count of every tag.
    pub fn tags(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for reference in self.by_source.values().flatten() {
            if reference.target_kind == TargetKind::Tag {
                *counts.entry(reference.target_key.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    /// References that point at nothing live, sorted by source note id.
    pub fn unresolved(&self, resolver: &impl TargetResolver) -> Vec<Reference> {
        let mut sources: Vec<&NoteId> = self.by_source.keys().collect();
        sources.sort();
        sources
            .into_iter()
            .flat_map(|source| self.by_source[source].iter())
            .filter(|r| !is_resolved(r, resolver))
            .map(|r| Reference {
                resolved: false,
                ..r.clone()
            })
            .collect()
    }

    /// Total number of indexed references.
    pub fn len(&self) -> usize {
        self.by_source.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_source.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_target.clear();
        self.by_source.clear();
    }
}

fn merge_groups<const N: usize>(
    groups: [Option<&BTreeMap<NoteId, Vec<Positioned>>>; N],
) -> Vec<Reference> {
    let mut merged: BTreeMap<&NoteId, Vec<&Positioned>> = BTreeMap::new();
    for group in groups.into_iter().flatten() {
        for (source, refs) in group {
            merged.entry(source).or_default().extend(refs.iter());
        }
    }
    merged
        .into_values()
        .flat_map(|mut refs| {
            refs.sort_by_key(|(position, _)| *position);
            refs.into_iter().map(|(_, r)| r.clone())
        })
        .collect()
}
