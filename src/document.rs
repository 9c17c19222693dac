//! Structured, block-addressable note documents.
//!
//! A [`Document`] is an ordered list of [`Block`]s. Every block carries an id
//! that is unique inside its document and survives a trip through the text
//! form, so other notes can point at it with a block reference.
//!
//! The text form is markdown with four additions:
//!
//! * `[[Title]]`, `[[Title|text]]`, `[[@note-id]]`, `[[@note-id|text]]` note links
//! * `#name` tags (at the start of a line or after whitespace)
//! * `((block-id))` block references
//! * `^block-id` anchors that carry block ids through the file
//!
//! Parsing never fails. Anything the model has no block for is kept as
//! paragraph text so the note stays editable.
use std::collections::HashSet;
use std::sync::LazyLock;

use log::trace;
use pulldown_cmark::{CodeBlockKind, Event, HeadingLevel, Options, Parser, Tag, TagEnd};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{NoteGraphError, Result};

/// Identifier of a block, unique within its document.
pub type BlockId = String;

static INLINE_SYNTAX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\[\[(?P<link>[^\[\]\n]+?)\]\]|\(\((?P<block>[A-Za-z0-9_-]+)\)\)|#(?P<tag>[^\s#\[\]()\x{FDD0}-\x{FDD2}]+)",
    )
    .unwrap()
});

static ANCHOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\s)\^(?P<id>[A-Za-z0-9_-]+)\s*$").unwrap());

/// Punctuation that ends a tag instead of belonging to it.
const TAG_TRAILING: &[char] = &['.', ',', ';', ':', '!', '?', '"', '\''];

/// Stand-ins for backslash-escaped syntax characters while inline syntax is
/// recognised. Noncharacters never appear in note text.
const SHIELDED: [(char, char); 3] = [('#', '\u{FDD0}'), ('[', '\u{FDD1}'), ('(', '\u{FDD2}')];

/// Inline formatting applied to a run of text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marks {
    pub bold: bool,
    pub italic: bool,
    pub code: bool,
    pub strikethrough: bool,
}

/// How a note link addresses its target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "by", content = "value", rename_all = "lowercase")]
pub enum LinkTarget {
    /// Direct address by note id. Survives renames.
    Id(String),
    /// Address by title, resolved against live notes at query time.
    Title(String),
}

/// Inline content of a block. Inline elements have no identity of their own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Inline {
    Text { text: String, marks: Marks },
    Link { url: String, text: String },
    Image { url: String, alt: String },
    NoteLink { target: LinkTarget, text: Option<String> },
    Tag { name: String },
    BlockRef { block_id: BlockId },
    LineBreak,
}

impl Inline {
    /// Plain, unformatted text run.
    pub fn text(text: impl Into<String>) -> Self {
        Inline::Text {
            text: text.into(),
            marks: Marks::default(),
        }
    }

    /// Link to a note by title.
    pub fn note_link(title: impl Into<String>) -> Self {
        Inline::NoteLink {
            target: LinkTarget::Title(title.into()),
            text: None,
        }
    }

    /// Link to a note by id.
    pub fn note_link_by_id(id: impl Into<String>) -> Self {
        Inline::NoteLink {
            target: LinkTarget::Id(id.into()),
            text: None,
        }
    }

    pub fn tag(name: impl Into<String>) -> Self {
        Inline::Tag { name: name.into() }
    }

    pub fn block_ref(block_id: impl Into<String>) -> Self {
        Inline::BlockRef {
            block_id: block_id.into(),
        }
    }

    fn plain_text(&self) -> String {
        match self {
            Inline::Text { text, .. } | Inline::Link { text, .. } => text.clone(),
            Inline::Image { alt, .. } => alt.clone(),
            Inline::NoteLink { target, text } => match (text, target) {
                (Some(text), _) => text.clone(),
                (None, LinkTarget::Title(title)) => title.clone(),
                (None, LinkTarget::Id(id)) => id.clone(),
            },
            Inline::Tag { name } => format!("#{name}"),
            Inline::BlockRef { block_id } => format!("(({block_id}))"),
            Inline::LineBreak => "\n".to_string(),
        }
    }
}

/// A table row: one inline sequence per cell. The first row is the header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRow {
    pub cells: Vec<Vec<Inline>>,
}

/// Block variants with their kind-specific attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BlockKind {
    Paragraph,
    Heading { level: u8 },
    ListItem { ordered: bool },
    ChecklistItem { checked: bool },
    Blockquote,
    CodeBlock { lang: Option<String>, code: String },
    ThematicBreak,
    Image { url: String, caption: Option<String> },
    BlockReference { block_id: BlockId },
    Table { rows: Vec<TableRow> },
}

impl BlockKind {
    /// Whether other notes may point at blocks of this kind.
    pub fn is_referenceable(&self) -> bool {
        !matches!(self, BlockKind::Table { .. })
    }

    /// Kinds that keep nested blocks in the text form.
    pub fn holds_children(&self) -> bool {
        matches!(
            self,
            BlockKind::ListItem { .. } | BlockKind::ChecklistItem { .. } | BlockKind::Blockquote
        )
    }

    fn is_list_item(&self) -> bool {
        matches!(
            self,
            BlockKind::ListItem { .. } | BlockKind::ChecklistItem { .. }
        )
    }

    /// Kinds whose id is written as a standalone `^id` line after the block.
    fn takes_trailing_anchor(&self) -> bool {
        matches!(
            self,
            BlockKind::ThematicBreak | BlockKind::Table { .. } | BlockKind::Blockquote
        )
    }
}

/// An element of a document's content tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub kind: BlockKind,
    /// Inline content owned directly by this block.
    pub content: Vec<Inline>,
    /// Nested blocks. Only list items and blockquotes hold children.
    pub children: Vec<Block>,
}

impl Block {
    pub fn new(id: impl Into<BlockId>, kind: BlockKind) -> Self {
        Block {
            id: id.into(),
            kind,
            content: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_content(mut self, content: Vec<Inline>) -> Self {
        self.content = content;
        self
    }

    pub fn with_children(mut self, children: Vec<Block>) -> Self {
        self.children = children;
        self
    }

    /// Text of this block's own inline content.
    pub fn plain_text(&self) -> String {
        match &self.kind {
            BlockKind::CodeBlock { code, .. } => code.clone(),
            BlockKind::Image { caption, .. } => caption.clone().unwrap_or_default(),
            BlockKind::BlockReference { block_id } => format!("(({block_id}))"),
            BlockKind::Table { rows } => rows
                .iter()
                .map(|row| {
                    row.cells
                        .iter()
                        .map(|cell| cell.iter().map(Inline::plain_text).collect::<String>())
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .collect::<Vec<_>>()
                .join("\n"),
            _ => self.content.iter().map(Inline::plain_text).collect(),
        }
    }

    /// Visits this block and its descendants in document order.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Block)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }

    fn contains(&self, id: &str) -> bool {
        let mut found = false;
        self.walk(&mut |block| found |= block.id == id);
        found
    }
}

/// A note's structured content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub blocks: Vec<Block>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a document from existing blocks. Ids are taken as given;
    /// inline content of a blockquote moves into a leading paragraph.
    pub fn from_blocks(mut blocks: Vec<Block>) -> Self {
        let mut taken = HashSet::new();
        for block in &blocks {
            block.walk(&mut |b| {
                taken.insert(b.id.clone());
            });
        }
        for block in &mut blocks {
            fold_quote_content(block, &mut taken);
        }
        Document { blocks }
    }

    /// Parses the markdown-like text form. Never fails.
    pub fn parse(text: &str) -> Document {
        let mut options = Options::empty();
        options.insert(Options::ENABLE_TABLES);
        options.insert(Options::ENABLE_STRIKETHROUGH);
        options.insert(Options::ENABLE_TASKLISTS);

        let mut builder = Builder::new();
        for (event, range) in Parser::new_ext(text, options).into_offset_iter() {
            // an escaped character starts its own text event right after the backslash
            let escaped = range.start > 0 && text.as_bytes()[range.start - 1] == b'\\';
            builder.event(event, escaped);
        }

        let mut blocks = builder.finish();
        assign_ids(&mut blocks);
        Document { blocks }
    }

    /// Renders the document to its text form. Every block id is written out.
    pub fn serialize(&self) -> String {
        let mut out = write_blocks(&self.blocks);
        if !out.is_empty() {
            out.push('\n');
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// A fresh id that no block in this document uses.
    pub fn generate_block_id(&self) -> BlockId {
        let taken: HashSet<BlockId> = self.block_ids().into_iter().collect();
        fresh_id(&taken)
    }

    /// Creates a block with a fresh id. The block is not inserted.
    ///
    /// A blockquote keeps no inline content of its own: `content` becomes
    /// its first paragraph.
    pub fn create_referenceable_block(&self, kind: BlockKind, content: Vec<Inline>) -> Block {
        let mut taken: HashSet<BlockId> = self.block_ids().into_iter().collect();
        let id = fresh_id(&taken);
        taken.insert(id.clone());
        let mut block = Block::new(id, kind).with_content(content);
        fold_quote_content(&mut block, &mut taken);
        block
    }

    /// Every block in document order (pre-order).
    pub fn blocks_preorder(&self) -> Vec<&Block> {
        let mut out = Vec::new();
        for block in &self.blocks {
            block.walk(&mut |b| out.push(b));
        }
        out
    }

    pub fn block_ids(&self) -> Vec<BlockId> {
        self.blocks_preorder()
            .into_iter()
            .map(|b| b.id.clone())
            .collect()
    }

    pub fn contains_block(&self, id: &str) -> bool {
        self.blocks.iter().any(|b| b.contains(id))
    }

    pub fn find_block(&self, id: &str) -> Option<&Block> {
        self.blocks_preorder().into_iter().find(|b| b.id == id)
    }

    pub fn find_block_mut(&mut self, id: &str) -> Option<&mut Block> {
        find_in_mut(&mut self.blocks, id)
    }

    /// Inserts a top-level block at `index` (clamped to the end).
    pub fn insert_block(&mut self, index: usize, block: Block) -> Result<()> {
        let block = self.prepare_insert(block)?;
        let index = index.min(self.blocks.len());
        self.blocks.insert(index, block);
        Ok(())
    }

    /// Inserts `block` as a child of `parent` at `index` (clamped). Only list
    /// items and blockquotes take children.
    pub fn insert_child(&mut self, parent: &str, index: usize, block: Block) -> Result<()> {
        self.check_container(parent)?;
        let block = self.prepare_insert(block)?;
        let parent = self
            .find_block_mut(parent)
            .ok_or_else(|| NoteGraphError::BlockNotFound {
                id: parent.to_string(),
            })?;
        let index = index.min(parent.children.len());
        parent.children.insert(index, block);
        Ok(())
    }

    /// Removes a block (and its subtree) wherever it sits.
    pub fn remove_block(&mut self, id: &str) -> Result<Block> {
        remove_from(&mut self.blocks, id).ok_or_else(|| NoteGraphError::BlockNotFound {
            id: id.to_string(),
        })
    }

    /// Moves a block under `new_parent` (top level when `None`) at `index`.
    pub fn move_block(&mut self, id: &str, new_parent: Option<&str>, index: usize) -> Result<()> {
        let block = self
            .find_block(id)
            .ok_or_else(|| NoteGraphError::BlockNotFound { id: id.to_string() })?;
        if let Some(parent) = new_parent {
            if block.contains(parent) {
                return Err(NoteGraphError::InvalidMove {
                    message: format!("block {id} cannot move into its own subtree"),
                });
            }
            self.check_container(parent)?;
        }

        let block = self.remove_block(id)?;
        match new_parent {
            Some(parent) => self.insert_child(parent, index, block),
            None => self.insert_block(index, block),
        }
    }

    /// Replaces the inline content of a block, keeping its id. For a
    /// blockquote this is the text of its first paragraph.
    pub fn set_content(&mut self, id: &str, content: Vec<Inline>) -> Result<()> {
        let fresh = self.generate_block_id();
        let block = self
            .find_block_mut(id)
            .ok_or_else(|| NoteGraphError::BlockNotFound { id: id.to_string() })?;
        if block.kind != BlockKind::Blockquote {
            block.content = content;
            return Ok(());
        }
        match block.children.first_mut() {
            Some(first) if first.kind == BlockKind::Paragraph => first.content = content,
            _ => block
                .children
                .insert(0, Block::new(fresh, BlockKind::Paragraph).with_content(content)),
        }
        Ok(())
    }

    /// Text of every block, one block per line.
    pub fn plain_text(&self) -> String {
        self.blocks_preorder()
            .into_iter()
            .map(Block::plain_text)
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn check_container(&self, parent: &str) -> Result<()> {
        let block = self
            .find_block(parent)
            .ok_or_else(|| NoteGraphError::BlockNotFound {
                id: parent.to_string(),
            })?;
        if block.kind.holds_children() {
            Ok(())
        } else {
            Err(NoteGraphError::InvalidMove {
                message: format!("block {parent} cannot hold nested blocks"),
            })
        }
    }

    fn prepare_insert(&self, mut block: Block) -> Result<Block> {
        self.check_new_ids(&block)?;
        let mut taken: HashSet<BlockId> = self.block_ids().into_iter().collect();
        block.walk(&mut |b| {
            taken.insert(b.id.clone());
        });
        fold_quote_content(&mut block, &mut taken);
        Ok(block)
    }

    fn check_new_ids(&self, block: &Block) -> Result<()> {
        let mut taken: HashSet<BlockId> = self.block_ids().into_iter().collect();
        let mut duplicate = None;
        block.walk(&mut |b| {
            if duplicate.is_none() && !taken.insert(b.id.clone()) {
                duplicate = Some(b.id.clone());
            }
        });
        match duplicate {
            Some(id) => Err(NoteGraphError::DuplicateBlockId { id }),
            None => Ok(()),
        }
    }
}

fn find_in_mut<'a>(blocks: &'a mut [Block], id: &str) -> Option<&'a mut Block> {
    for block in blocks {
        if block.id == id {
            return Some(block);
        }
        if let Some(found) = find_in_mut(&mut block.children, id) {
            return Some(found);
        }
    }
    None
}

fn remove_from(blocks: &mut Vec<Block>, id: &str) -> Option<Block> {
    if let Some(pos) = blocks.iter().position(|b| b.id == id) {
        return Some(blocks.remove(pos));
    }
    blocks
        .iter_mut()
        .find_map(|block| remove_from(&mut block.children, id))
}

/// Moves inline content held directly by blockquotes into a leading
/// paragraph, which is how the text form stores it.
fn fold_quote_content(block: &mut Block, taken: &mut HashSet<BlockId>) {
    if block.kind == BlockKind::Blockquote && !block.content.is_empty() {
        let id = fresh_id(taken);
        taken.insert(id.clone());
        let content = std::mem::take(&mut block.content);
        block
            .children
            .insert(0, Block::new(id, BlockKind::Paragraph).with_content(content));
    }
    for child in &mut block.children {
        fold_quote_content(child, taken);
    }
}

fn fresh_id(taken: &HashSet<BlockId>) -> BlockId {
    loop {
        let id = Uuid::new_v4().simple().to_string()[..10].to_string();
        if !taken.contains(&id) {
            return id;
        }
    }
}

/// Keeps the first occurrence of every anchored id and gives every other
/// block a fresh one.
fn assign_ids(blocks: &mut [Block]) {
    fn clear_duplicates(blocks: &mut [Block], seen: &mut HashSet<BlockId>) {
        for block in blocks {
            if !block.id.is_empty() && !seen.insert(block.id.clone()) {
                trace!("duplicate block anchor {} dropped", block.id);
                block.id.clear();
            }
            clear_duplicates(&mut block.children, seen);
        }
    }

    fn fill_missing(blocks: &mut [Block], seen: &mut HashSet<BlockId>) {
        for block in blocks {
            if block.id.is_empty() {
                block.id = fresh_id(seen);
                seen.insert(block.id.clone());
            }
            fill_missing(&mut block.children, seen);
        }
    }

    let mut seen = HashSet::new();
    clear_duplicates(blocks, &mut seen);
    fill_missing(blocks, &mut seen);
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum FrameKind {
    Root,
    Paragraph,
    Heading(u8),
    BlockQuote,
    List { ordered: bool },
    Item { ordered: bool, checked: Option<bool> },
    CodeBlock { info: String, code: String },
    Table { rows: Vec<TableRow>, row: Vec<Vec<Inline>> },
    TableCell,
}

#[derive(Debug)]
struct Frame {
    kind: FrameKind,
    content: Vec<Inline>,
    children: Vec<Block>,
    anchor: Option<BlockId>,
    content_done: bool,
    /// The last child has no id yet and may take a standalone `^id` line.
    open_anchor_slot: bool,
}

impl Frame {
    fn new(kind: FrameKind) -> Self {
        Frame {
            kind,
            content: Vec::new(),
            children: Vec::new(),
            anchor: None,
            content_done: false,
            open_anchor_slot: false,
        }
    }
}

/// Turns the pulldown-cmark event stream into blocks.
struct Builder {
    frames: Vec<Frame>,
    bold: usize,
    italic: usize,
    strike: usize,
    link: Option<(String, String)>,
    image: Option<(String, String)>,
}

impl Builder {
    fn new() -> Self {
        Builder {
            frames: vec![Frame::new(FrameKind::Root)],
            bold: 0,
            italic: 0,
            strike: 0,
            link: None,
            image: None,
        }
    }

    fn current(&mut self) -> &mut Frame {
        if self.frames.is_empty() {
            self.frames.push(Frame::new(FrameKind::Root));
        }
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    fn open(&mut self, kind: FrameKind) {
        self.frames.push(Frame::new(kind));
    }

    fn pop(&mut self) -> Option<Frame> {
        if self.frames.len() > 1 {
            self.frames.pop()
        } else {
            None
        }
    }

    fn push_block(&mut self, block: Block) {
        let anchorable = block.id.is_empty() && block.kind.takes_trailing_anchor();
        let parent = self.current();
        parent.children.push(block);
        parent.open_anchor_slot = anchorable;
    }

    fn push_inline(&mut self, inline: Inline) {
        self.current().content.push(inline);
    }

    fn event(&mut self, event: Event<'_>, escaped: bool) {
        match event {
            Event::Start(tag) => self.start(tag),
            Event::End(tag) => self.end(tag),
            Event::Text(text) if escaped => self.escaped_text(&text),
            Event::Text(text) => self.text(&text, false),
            Event::Code(text) => self.text(&text, true),
            Event::Html(html) | Event::InlineHtml(html) => {
                trace!("keeping raw html as text");
                self.raw_lines(&html);
            }
            Event::SoftBreak | Event::HardBreak => self.line_break(),
            Event::Rule => self.push_block(Block::new(String::new(), BlockKind::ThematicBreak)),
            Event::TaskListMarker(checked) => self.task_marker(checked),
            Event::FootnoteReference(label) => self.text(&format!("[^{label}]"), false),
            other => trace!("ignoring markdown event {:?}", other),
        }
    }

    fn start(&mut self, tag: Tag<'_>) {
        match tag {
            Tag::Paragraph | Tag::HtmlBlock => self.open(FrameKind::Paragraph),
            Tag::Heading { level, .. } => self.open(FrameKind::Heading(heading_level(level))),
            Tag::BlockQuote(_) => self.open(FrameKind::BlockQuote),
            Tag::CodeBlock(kind) => {
                let info = match kind {
                    CodeBlockKind::Fenced(info) => info.to_string(),
                    CodeBlockKind::Indented => String::new(),
                };
                self.open(FrameKind::CodeBlock {
                    info,
                    code: String::new(),
                });
            }
            Tag::List(start) => self.open(FrameKind::List {
                ordered: start.is_some(),
            }),
            Tag::Item => {
                let ordered = matches!(
                    self.frames.last().map(|f| &f.kind),
                    Some(FrameKind::List { ordered: true })
                );
                self.open(FrameKind::Item {
                    ordered,
                    checked: None,
                });
            }
            Tag::Table(_) => self.open(FrameKind::Table {
                rows: Vec::new(),
                row: Vec::new(),
            }),
            Tag::TableCell => self.open(FrameKind::TableCell),
            Tag::Emphasis => self.italic += 1,
            Tag::Strong => self.bold += 1,
            Tag::Strikethrough => self.strike += 1,
            Tag::Link { dest_url, .. } => self.link = Some((dest_url.to_string(), String::new())),
            Tag::Image { dest_url, .. } => {
                self.image = Some((dest_url.to_string(), String::new()))
            }
            _ => {}
        }
    }

    fn end(&mut self, tag: TagEnd) {
        match tag {
            TagEnd::Paragraph | TagEnd::HtmlBlock => self.close_paragraph(),
            TagEnd::Heading(_) => self.close_heading(),
            TagEnd::BlockQuote(_) => self.close_blockquote(),
            TagEnd::CodeBlock => self.close_code_block(),
            TagEnd::List(_) => self.close_list(),
            TagEnd::Item => self.close_item(),
            TagEnd::TableHead | TagEnd::TableRow => self.close_row(),
            TagEnd::TableCell => self.close_cell(),
            TagEnd::Table => self.close_table(),
            TagEnd::Emphasis => self.italic = self.italic.saturating_sub(1),
            TagEnd::Strong => self.bold = self.bold.saturating_sub(1),
            TagEnd::Strikethrough => self.strike = self.strike.saturating_sub(1),
            TagEnd::Link => {
                if let Some((url, text)) = self.link.take() {
                    self.push_inline(Inline::Link { url, text });
                }
            }
            TagEnd::Image => {
                if let Some((url, alt)) = self.image.take() {
                    self.push_inline(Inline::Image { url, alt });
                }
            }
            _ => {}
        }
    }

    fn text(&mut self, text: &str, is_code: bool) {
        if let Some((_, alt)) = self.image.as_mut() {
            alt.push_str(text);
            return;
        }
        if let Some((_, label)) = self.link.as_mut() {
            label.push_str(text);
            return;
        }

        let marks = Marks {
            bold: self.bold > 0,
            italic: self.italic > 0,
            code: is_code,
            strikethrough: self.strike > 0,
        };
        let frame = self.current();
        if let FrameKind::CodeBlock { code, .. } = &mut frame.kind {
            code.push_str(text);
            return;
        }
        push_text(&mut frame.content, text, marks);
    }

    /// Text whose first character was backslash-escaped in the source. A
    /// syntax character there is shielded so it stays literal.
    fn escaped_text(&mut self, text: &str) {
        let literal = self.image.is_none()
            && self.link.is_none()
            && !matches!(self.current().kind, FrameKind::CodeBlock { .. });
        let mut chars = text.chars();
        let shield = chars
            .next()
            .and_then(|c| SHIELDED.iter().find(|(plain, _)| *plain == c))
            .map(|(_, shield)| *shield);
        match shield {
            Some(shield) if literal => {
                let mut owned = String::with_capacity(text.len() + 2);
                owned.push(shield);
                owned.push_str(chars.as_str());
                self.text(&owned, false);
            }
            _ => self.text(text, false),
        }
    }

    fn raw_lines(&mut self, html: &str) {
        if let FrameKind::CodeBlock { code, .. } = &mut self.current().kind {
            code.push_str(html);
            return;
        }
        for line in html.split_inclusive('\n') {
            let trimmed = line.trim_end_matches(['\n', '\r']);
            self.text(trimmed, false);
            if trimmed.len() != line.len() {
                self.line_break();
            }
        }
    }

    fn line_break(&mut self) {
        if let Some((_, alt)) = self.image.as_mut() {
            alt.push(' ');
        } else if let Some((_, label)) = self.link.as_mut() {
            label.push(' ');
        } else {
            self.push_inline(Inline::LineBreak);
        }
    }

    fn task_marker(&mut self, value: bool) {
        for frame in self.frames.iter_mut().rev() {
            if let FrameKind::Item { checked, .. } = &mut frame.kind {
                *checked = Some(value);
                break;
            }
        }
    }

    fn close_paragraph(&mut self) {
        let Some(frame) = self.pop() else { return };
        let mut content = normalize_inlines(frame.content);
        let anchor = take_anchor(&mut content);

        let parent = self.current();
        // The first paragraph of a loose list item is the item's own text.
        if matches!(parent.kind, FrameKind::Item { .. })
            && !parent.content_done
            && parent.content.is_empty()
            && parent.children.is_empty()
        {
            parent.content = content;
            parent.anchor = anchor;
            parent.content_done = true;
            return;
        }

        if content.is_empty() && parent.open_anchor_slot {
            if let (Some(id), Some(last)) = (anchor.as_ref(), parent.children.last_mut()) {
                last.id = id.clone();
                parent.open_anchor_slot = false;
                return;
            }
        }

        let block = paragraph_block(content, anchor.unwrap_or_default());
        self.push_block(block);
    }

    fn close_heading(&mut self) {
        let Some(frame) = self.pop() else { return };
        let FrameKind::Heading(level) = frame.kind else {
            return;
        };
        let mut content = normalize_inlines(frame.content);
        let anchor = take_anchor(&mut content);
        self.push_block(
            Block::new(anchor.unwrap_or_default(), BlockKind::Heading { level })
                .with_content(content),
        );
    }

    fn close_blockquote(&mut self) {
        let Some(frame) = self.pop() else { return };
        self.push_block(Block::new(String::new(), BlockKind::Blockquote).with_children(frame.children));
    }

    fn close_code_block(&mut self) {
        let Some(frame) = self.pop() else { return };
        let FrameKind::CodeBlock { info, mut code } = frame.kind else {
            return;
        };
        if code.ends_with('\n') {
            code.pop();
        }

        let mut words: Vec<&str> = info.split_whitespace().collect();
        let anchor = match words.last() {
            Some(word) if is_anchor_word(word) => {
                let id = word[1..].to_string();
                words.pop();
                Some(id)
            }
            _ => None,
        };
        let lang = (!words.is_empty()).then(|| words.join(" "));

        self.push_block(Block::new(
            anchor.unwrap_or_default(),
            BlockKind::CodeBlock { lang, code },
        ));
    }

    fn close_list(&mut self) {
        let Some(frame) = self.pop() else { return };
        let parent = self.current();
        parent.children.extend(frame.children);
        parent.open_anchor_slot = false;
    }

    fn close_item(&mut self) {
        let Some(frame) = self.pop() else { return };
        let FrameKind::Item { ordered, checked } = frame.kind else {
            return;
        };
        let (content, anchor) = if frame.content_done {
            (frame.content, frame.anchor)
        } else {
            let mut content = normalize_inlines(frame.content);
            let anchor = take_anchor(&mut content);
            (content, anchor)
        };
        let kind = match checked {
            Some(checked) => BlockKind::ChecklistItem { checked },
            None => BlockKind::ListItem { ordered },
        };
        self.push_block(
            Block::new(anchor.unwrap_or_default(), kind)
                .with_content(content)
                .with_children(frame.children),
        );
    }

    fn close_cell(&mut self) {
        let Some(frame) = self.pop() else { return };
        let content = normalize_inlines(frame.content);
        if let FrameKind::Table { row, .. } = &mut self.current().kind {
            row.push(content);
        }
    }

    fn close_row(&mut self) {
        if let FrameKind::Table { rows, row } = &mut self.current().kind {
            rows.push(TableRow {
                cells: std::mem::take(row),
            });
        }
    }

    fn close_table(&mut self) {
        let Some(frame) = self.pop() else { return };
        if let FrameKind::Table { rows, .. } = frame.kind {
            self.push_block(Block::new(String::new(), BlockKind::Table { rows }));
        }
    }

    fn finish(mut self) -> Vec<Block> {
        while self.frames.len() > 1 {
            match self.frames.last().map(|f| &f.kind) {
                Some(FrameKind::Paragraph) => self.close_paragraph(),
                Some(FrameKind::Heading(_)) => self.close_heading(),
                Some(FrameKind::Item { .. }) => self.close_item(),
                Some(FrameKind::List { .. }) => self.close_list(),
                Some(FrameKind::BlockQuote) => self.close_blockquote(),
                Some(FrameKind::CodeBlock { .. }) => self.close_code_block(),
                Some(FrameKind::Table { .. }) => self.close_table(),
                _ => {
                    self.pop();
                }
            }
        }
        let root = self.current();
        let mut blocks = std::mem::take(&mut root.children);
        let stray = normalize_inlines(std::mem::take(&mut root.content));
        if !stray.is_empty() {
            blocks.push(paragraph_block(stray, String::new()));
        }
        blocks
    }
}

fn heading_level(level: HeadingLevel) -> u8 {
    match level {
        HeadingLevel::H1 => 1,
        HeadingLevel::H2 => 2,
        _ => 3,
    }
}

fn is_anchor_word(word: &str) -> bool {
    word.len() > 1
        && word.starts_with('^')
        && word[1..]
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn paragraph_block(content: Vec<Inline>, id: BlockId) -> Block {
    match content.as_slice() {
        [Inline::Image { url, alt }] => Block::new(
            id,
            BlockKind::Image {
                url: url.clone(),
                caption: (!alt.is_empty()).then(|| alt.clone()),
            },
        ),
        [Inline::BlockRef { block_id }] => Block::new(
            id,
            BlockKind::BlockReference {
                block_id: block_id.clone(),
            },
        ),
        _ => Block::new(id, BlockKind::Paragraph).with_content(content),
    }
}

fn push_text(content: &mut Vec<Inline>, text: &str, marks: Marks) {
    if text.is_empty() {
        return;
    }
    if let Some(Inline::Text {
        text: last,
        marks: last_marks,
    }) = content.last_mut()
    {
        if *last_marks == marks {
            last.push_str(text);
            return;
        }
    }
    content.push(Inline::Text {
        text: text.to_string(),
        marks,
    });
}

/// Merges text runs, trims edge line breaks and lifts note links, tags and
/// block references out of plain text.
fn normalize_inlines(content: Vec<Inline>) -> Vec<Inline> {
    let mut merged: Vec<Inline> = Vec::with_capacity(content.len());
    for inline in content {
        match inline {
            Inline::Text { text, marks } => push_text(&mut merged, &text, marks),
            other => merged.push(other),
        }
    }
    while matches!(merged.last(), Some(Inline::LineBreak)) {
        merged.pop();
    }
    let leading = merged
        .iter()
        .take_while(|i| matches!(i, Inline::LineBreak))
        .count();
    merged.drain(..leading);

    let mut out = Vec::with_capacity(merged.len());
    for inline in merged {
        match inline {
            Inline::Text { text, marks } if !marks.code => {
                let boundary = ends_at_boundary(out.last());
                split_syntax(&text, marks, boundary, &mut out);
            }
            other => out.push(other),
        }
    }
    for inline in &mut out {
        if let Inline::Text { text, .. } = inline {
            if text.contains(|c: char| SHIELDED.iter().any(|(_, shield)| *shield == c)) {
                *text = unshield(text);
            }
        }
    }
    out
}

fn unshield(text: &str) -> String {
    text.chars()
        .map(|c| {
            SHIELDED
                .iter()
                .find(|(_, shield)| *shield == c)
                .map_or(c, |(plain, _)| *plain)
        })
        .collect()
}

fn ends_at_boundary(prev: Option<&Inline>) -> bool {
    match prev {
        None | Some(Inline::LineBreak) => true,
        Some(Inline::Text { text, .. }) => text.ends_with(char::is_whitespace),
        _ => false,
    }
}

fn split_syntax(text: &str, marks: Marks, at_boundary: bool, out: &mut Vec<Inline>) {
    let mut cursor = 0;
    for caps in INLINE_SYNTAX.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        let (inline, end) = if let Some(link) = caps.name("link") {
            (parse_note_link(link.as_str()), whole.end())
        } else if let Some(block) = caps.name("block") {
            (Some(Inline::block_ref(block.as_str())), whole.end())
        } else if let Some(tag) = caps.name("tag") {
            let preceded_ok = if whole.start() == 0 {
                at_boundary
            } else {
                text[..whole.start()].ends_with(char::is_whitespace)
            };
            let name = tag.as_str().trim_end_matches(TAG_TRAILING);
            if preceded_ok && !name.is_empty() {
                (Some(Inline::tag(name)), whole.start() + 1 + name.len())
            } else {
                (None, whole.end())
            }
        } else {
            (None, whole.end())
        };

        if let Some(inline) = inline {
            if cursor < whole.start() {
                push_text(out, &text[cursor..whole.start()], marks);
            }
            out.push(inline);
            cursor = end;
        }
    }
    if cursor < text.len() {
        push_text(out, &text[cursor..], marks);
    }
}

fn parse_note_link(inner: &str) -> Option<Inline> {
    let (target, label) = match inner.split_once('|') {
        Some((target, label)) => (target.trim(), Some(label.trim())),
        None => (inner.trim(), None),
    };
    if target.is_empty() {
        return None;
    }
    let target = match target.strip_prefix('@').map(str::trim) {
        Some(id) if !id.is_empty() => LinkTarget::Id(id.to_string()),
        _ => LinkTarget::Title(target.to_string()),
    };
    Some(Inline::NoteLink {
        target,
        text: label.filter(|l| !l.is_empty()).map(str::to_string),
    })
}

/// Strips a trailing `^id` anchor from the last text run.
fn take_anchor(content: &mut Vec<Inline>) -> Option<BlockId> {
    let (id, now_empty) = match content.last_mut() {
        Some(Inline::Text { text, marks }) if !marks.code => {
            let caps = ANCHOR.captures(text)?;
            let id = caps.name("id")?.as_str().to_string();
            let start = caps.get(0)?.start();
            text.truncate(start);
            let kept = text.trim_end().len();
            text.truncate(kept);
            (id, text.is_empty())
        }
        _ => return None,
    };
    if now_empty {
        content.pop();
    }
    while matches!(content.last(), Some(Inline::LineBreak)) {
        content.pop();
    }
    Some(id)
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

fn write_blocks(blocks: &[Block]) -> String {
    // children of kinds that cannot nest are written after their parent
    fn flatten<'a>(blocks: &'a [Block], out: &mut Vec<&'a Block>) {
        for block in blocks {
            out.push(block);
            if !block.kind.holds_children() {
                flatten(&block.children, out);
            }
        }
    }
    let mut flat = Vec::with_capacity(blocks.len());
    flatten(blocks, &mut flat);

    let mut out = String::new();
    let mut ordinal = 0;
    let mut prev_item = false;
    for block in flat {
        let is_item = block.kind.is_list_item();
        ordinal = match block.kind {
            BlockKind::ListItem { ordered: true } => ordinal + 1,
            _ => 0,
        };
        if !out.is_empty() {
            out.push_str(if prev_item && is_item { "\n" } else { "\n\n" });
        }
        out.push_str(&write_block(block, ordinal));
        prev_item = is_item;
    }
    out
}

fn write_block(block: &Block, ordinal: usize) -> String {
    let id = &block.id;
    match &block.kind {
        BlockKind::Paragraph => with_anchor(write_inlines(&block.content, false), id),
        BlockKind::Heading { level } => format!(
            "{} {}",
            "#".repeat(usize::from((*level).clamp(1, 3))),
            with_anchor(write_inlines(&block.content, true), id)
        ),
        BlockKind::ListItem { ordered } => {
            let marker = if *ordered {
                format!("{ordinal}. ")
            } else {
                "- ".to_string()
            };
            write_item(block, &marker, "")
        }
        BlockKind::ChecklistItem { checked } => {
            write_item(block, "- ", if *checked { "[x] " } else { "[ ] " })
        }
        BlockKind::Blockquote => {
            let mut inner = write_inlines(&block.content, false);
            let children = write_blocks(&block.children);
            if !inner.is_empty() && !children.is_empty() {
                inner.push_str("\n\n");
            }
            inner.push_str(&children);
            let quoted = if inner.is_empty() {
                ">".to_string()
            } else {
                inner
                    .lines()
                    .map(|line| {
                        if line.is_empty() {
                            ">".to_string()
                        } else {
                            format!("> {line}")
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            };
            format!("{quoted}\n\n^{id}")
        }
        BlockKind::CodeBlock { lang, code } => {
            let fence = "`".repeat((longest_run(code, '`') + 1).max(3));
            let info = match lang {
                Some(lang) => format!("{lang} ^{id}"),
                None => format!("^{id}"),
            };
            let mut out = format!("{fence}{info}\n{code}");
            if !code.is_empty() {
                out.push('\n');
            }
            out.push_str(&fence);
            out
        }
        BlockKind::ThematicBreak => format!("***\n\n^{id}"),
        BlockKind::Image { url, caption } => format!(
            "![{}]({}) ^{id}",
            escape_text(caption.as_deref().unwrap_or_default(), false),
            link_destination(url)
        ),
        BlockKind::BlockReference { block_id } => format!("(({block_id})) ^{id}"),
        BlockKind::Table { rows } => format!("{}\n\n^{id}", write_table(rows)),
    }
}

fn write_item(block: &Block, marker: &str, task: &str) -> String {
    let width = marker.len();
    let body = with_anchor(write_inlines(&block.content, false), &block.id);
    let mut out = format!("{marker}{task}{}", indent_continuation(&body, width));

    let inner = write_blocks(&block.children);
    if let Some(first) = block.children.first() {
        out.push_str(if first.kind.is_list_item() { "\n" } else { "\n\n" });
        out.push_str(&indent(&inner, width));
    }
    out
}

fn write_table(rows: &[TableRow]) -> String {
    let columns = rows
        .iter()
        .map(|row| row.cells.len())
        .max()
        .unwrap_or(0)
        .max(1);
    let render_row = |row: Option<&TableRow>| {
        let cells = (0..columns)
            .map(|i| {
                row.and_then(|r| r.cells.get(i))
                    .map(|cell| write_inlines(cell, true))
                    .unwrap_or_default()
            })
            .collect::<Vec<_>>();
        format!("| {} |", cells.join(" | "))
    };

    let mut lines = vec![
        render_row(rows.first()),
        format!("|{}", " --- |".repeat(columns)),
    ];
    lines.extend(rows.iter().skip(1).map(|row| render_row(Some(row))));
    lines.join("\n")
}

fn with_anchor(text: String, id: &str) -> String {
    if text.is_empty() {
        format!("^{id}")
    } else {
        format!("{text} ^{id}")
    }
}

fn write_inlines(content: &[Inline], single_line: bool) -> String {
    let mut out = String::new();
    let mut line_start = true;
    for (i, inline) in content.iter().enumerate() {
        match inline {
            Inline::Text { text, marks } => out.push_str(&write_text(text, *marks, line_start)),
            Inline::Link { url, text } => out.push_str(&format!(
                "[{}]({})",
                escape_text(text, false),
                link_destination(url)
            )),
            Inline::Image { url, alt } => out.push_str(&format!(
                "![{}]({})",
                escape_text(alt, false),
                link_destination(url)
            )),
            Inline::NoteLink { target, text } => {
                let target = match target {
                    LinkTarget::Id(id) => format!("@{id}"),
                    LinkTarget::Title(title) => title.clone(),
                };
                match text {
                    Some(text) => out.push_str(&format!("[[{target}|{text}]]")),
                    None => out.push_str(&format!("[[{target}]]")),
                }
            }
            Inline::Tag { name } => {
                if !out.is_empty() && !out.ends_with(char::is_whitespace) {
                    out.push(' ');
                }
                out.push('#');
                out.push_str(name);
                if let Some(Inline::Text { text, .. }) = content.get(i + 1) {
                    if text.starts_with(|c: char| !c.is_whitespace() && !TAG_TRAILING.contains(&c))
                    {
                        out.push(' ');
                    }
                }
            }
            Inline::BlockRef { block_id } => out.push_str(&format!("(({block_id}))")),
            Inline::LineBreak => out.push(if single_line { ' ' } else { '\n' }),
        }
        line_start = matches!(inline, Inline::LineBreak) && !single_line;
    }
    out
}

fn write_text(text: &str, marks: Marks, line_start: bool) -> String {
    let core = text.trim();
    if core.is_empty() {
        return text.to_string();
    }
    let lead = &text[..text.len() - text.trim_start().len()];
    let trail = &text[text.trim_end().len()..];

    let body = if marks.code {
        code_span(core)
    } else {
        escape_text(core, line_start && lead.is_empty())
    };

    let mut open = String::new();
    if marks.strikethrough {
        open.push_str("~~");
    }
    if marks.bold {
        open.push_str("**");
    }
    if marks.italic {
        open.push('*');
    }
    let close: String = open.chars().rev().collect();
    format!("{lead}{open}{body}{close}{trail}")
}

fn code_span(text: &str) -> String {
    let fence = "`".repeat(longest_run(text, '`') + 1);
    if text.starts_with('`') || text.ends_with('`') {
        format!("{fence} {text} {fence}")
    } else {
        format!("{fence}{text}{fence}")
    }
}

fn escape_text(text: &str, line_start: bool) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    for (i, ch) in text.char_indices() {
        let escape = match ch {
            '\\' | '*' | '_' | '`' | '[' | ']' | '~' | '<' | '|' => true,
            // a tag starts at a boundary
            '#' => i == 0 || text[..i].ends_with(char::is_whitespace),
            '(' => text[i + 1..].starts_with('('),
            '>' | '-' | '+' | '=' => i == 0 && line_start,
            '.' | ')' => line_start && i > 0 && text[..i].chars().all(|c| c.is_ascii_digit()),
            _ => false,
        };
        if escape {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn link_destination(url: &str) -> String {
    if url.contains(|c: char| c.is_whitespace() || c == '(' || c == ')') {
        format!("<{url}>")
    } else {
        url.to_string()
    }
}

fn longest_run(text: &str, needle: char) -> usize {
    let mut longest = 0;
    let mut current = 0;
    for ch in text.chars() {
        if ch == needle {
            current += 1;
            longest = longest.max(current);
        } else {
            current = 0;
        }
    }
    longest
}

fn indent(text: &str, width: usize) -> String {
    let pad = " ".repeat(width);
    text.lines()
        .map(|line| {
            if line.is_empty() {
                String::new()
            } else {
                format!("{pad}{line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn indent_continuation(text: &str, width: usize) -> String {
    let pad = " ".repeat(width);
    text.split('\n')
        .enumerate()
        .map(|(i, line)| {
            if i == 0 || line.is_empty() {
                line.to_string()
            } else {
                format!("{pad}{line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(doc: &Document) -> Vec<BlockKind> {
        doc.blocks_preorder()
            .into_iter()
            .map(|b| b.kind.clone())
            .collect()
    }

    /// Blocks with ids, kinds and the inline elements other notes care about.
    fn shape(doc: &Document) -> Vec<(BlockId, BlockKind, Vec<Inline>)> {
        doc.blocks_preorder()
            .into_iter()
            .map(|b| {
                let refs = b
                    .content
                    .iter()
                    .filter(|i| {
                        matches!(
                            i,
                            Inline::NoteLink { .. } | Inline::Tag { .. } | Inline::BlockRef { .. }
                        )
                    })
                    .cloned()
                    .collect();
                (b.id.clone(), b.kind.clone(), refs)
            })
            .collect()
    }

    #[test]
    fn parses_common_blocks() {
        let doc = Document::parse(
            "# Title\n\nSome *text*.\n\n- one\n- two\n\n1. first\n\n> quoted\n\n```rust\nfn main() {}\n```\n\n---\n",
        );
        let kinds = kinds(&doc);
        assert_eq!(kinds[0], BlockKind::Heading { level: 1 });
        assert_eq!(kinds[1], BlockKind::Paragraph);
        assert_eq!(kinds[2], BlockKind::ListItem { ordered: false });
        assert_eq!(kinds[3], BlockKind::ListItem { ordered: false });
        assert_eq!(kinds[4], BlockKind::ListItem { ordered: true });
        assert_eq!(kinds[5], BlockKind::Blockquote);
        assert_eq!(kinds[6], BlockKind::Paragraph);
        assert_eq!(
            kinds[7],
            BlockKind::CodeBlock {
                lang: Some("rust".to_string()),
                code: "fn main() {}".to_string()
            }
        );
        assert_eq!(kinds[8], BlockKind::ThematicBreak);
    }

    #[test]
    fn deep_headings_clamp_to_level_three() {
        let doc = Document::parse("#### Deep\n");
        assert_eq!(doc.blocks[0].kind, BlockKind::Heading { level: 3 });
    }

    #[test]
    fn extracts_inline_reference_syntax() {
        let doc = Document::parse("See [[Foo]] and [[@abc-123|the note]] #idea ((blk-1))\n");
        let content = &doc.blocks[0].content;
        assert!(content.contains(&Inline::note_link("Foo")));
        assert!(content.contains(&Inline::NoteLink {
            target: LinkTarget::Id("abc-123".to_string()),
            text: Some("the note".to_string()),
        }));
        assert!(content.contains(&Inline::tag("idea")));
        assert!(content.contains(&Inline::block_ref("blk-1")));
    }

    #[test]
    fn tags_need_a_word_boundary() {
        let doc = Document::parse("C# is not a tag but #rust. is\n");
        let tags: Vec<_> = doc.blocks[0]
            .content
            .iter()
            .filter_map(|i| match i {
                Inline::Tag { name } => Some(name.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(tags, vec!["rust".to_string()]);
    }

    #[test]
    fn tags_are_case_sensitive() {
        let doc = Document::parse("#Rust #rust\n");
        assert!(doc.blocks[0].content.contains(&Inline::tag("Rust")));
        assert!(doc.blocks[0].content.contains(&Inline::tag("rust")));
    }

    #[test]
    fn anchors_set_block_ids() {
        let doc = Document::parse(
            "Para ^blk-1\n\n## Head ^h-2\n\n- item ^li-3\n- [x] done ^task-4\n\n```sh ^code-5\nls\n```\n\n***\n\n^rule-6\n",
        );
        assert_eq!(
            doc.block_ids(),
            vec!["blk-1", "h-2", "li-3", "task-4", "code-5", "rule-6"]
        );
        assert_eq!(doc.blocks[0].content, vec![Inline::text("Para")]);
        assert_eq!(doc.blocks[3].kind, BlockKind::ChecklistItem { checked: true });
        assert_eq!(
            doc.blocks[4].kind,
            BlockKind::CodeBlock {
                lang: Some("sh".to_string()),
                code: "ls".to_string()
            }
        );
    }

    #[test]
    fn standalone_image_and_block_reference_become_blocks() {
        let doc = Document::parse("![cat](img/cat.png) ^img-1\n\n((blk-9)) ^ref-1\n");
        assert_eq!(
            doc.blocks[0].kind,
            BlockKind::Image {
                url: "img/cat.png".to_string(),
                caption: Some("cat".to_string())
            }
        );
        assert_eq!(doc.blocks[0].id, "img-1");
        assert_eq!(
            doc.blocks[1].kind,
            BlockKind::BlockReference {
                block_id: "blk-9".to_string()
            }
        );
        assert_eq!(doc.blocks[1].id, "ref-1");
    }

    #[test]
    fn duplicate_anchors_keep_the_first() {
        let doc = Document::parse("a ^same\n\nb ^same\n");
        assert_eq!(doc.blocks[0].id, "same");
        assert_ne!(doc.blocks[1].id, "same");
        assert!(!doc.blocks[1].id.is_empty());
    }

    #[test]
    fn missing_anchors_get_fresh_unique_ids() {
        let doc = Document::parse("a\n\nb\n\nc\n");
        let ids: HashSet<_> = doc.block_ids().into_iter().collect();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn nested_lists_become_children() {
        let doc = Document::parse("- parent\n  - child\n  - [ ] todo\n- sibling\n");
        assert_eq!(doc.blocks.len(), 2);
        assert_eq!(doc.blocks[0].content, vec![Inline::text("parent")]);
        assert_eq!(doc.blocks[0].children.len(), 2);
        assert_eq!(
            doc.blocks[0].children[1].kind,
            BlockKind::ChecklistItem { checked: false }
        );
    }

    #[test]
    fn loose_list_items_keep_their_text() {
        let doc = Document::parse("- first ^a1\n\n  more\n\n- second\n");
        assert_eq!(doc.blocks.len(), 2);
        assert_eq!(doc.blocks[0].id, "a1");
        assert_eq!(doc.blocks[0].content, vec![Inline::text("first")]);
        assert_eq!(doc.blocks[0].children[0].kind, BlockKind::Paragraph);
    }

    #[test]
    fn tables_parse_rows_and_cells() {
        let doc = Document::parse("| a | b |\n| --- | --- |\n| [[X]] | 2 |\n\n^tbl\n");
        let BlockKind::Table { rows } = &doc.blocks[0].kind else {
            panic!("expected table, got {:?}", doc.blocks[0].kind);
        };
        assert_eq!(doc.blocks[0].id, "tbl");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].cells[0], vec![Inline::note_link("X")]);
    }

    #[test]
    fn malformed_input_falls_back_to_paragraphs() {
        let doc = Document::parse("<div>\nraw **html**\n</div>\n\n[[unclosed and ((also\n");
        assert!(!doc.is_empty());
        assert!(doc
            .blocks
            .iter()
            .all(|b| matches!(b.kind, BlockKind::Paragraph)));
        assert!(doc.plain_text().contains("[[unclosed"));
    }

    #[test]
    fn round_trip_keeps_ids_kinds_and_references() {
        let text = "# Plan ^h1\n\nMeet [[Alice|her]] about #project-x and ((blk-1)).\n\n\
                    - step one\n  1. sub *a*\n  2. sub `b`\n- [ ] open task\n\n\
                    > quoted [[@n-1]]\n\n```\nplain ``` fence\n```\n\n\
                    ![diagram](a b.png)\n\n| h | i |\n| --- | --- |\n| #t | x |\n\n***\n\nend\n";
        let first = Document::parse(text);
        let second = Document::parse(&first.serialize());
        assert_eq!(shape(&first), shape(&second));

        let third = Document::parse(&second.serialize());
        assert_eq!(second, third);
    }

    #[test]
    fn round_trip_of_edited_document() {
        let mut doc = Document::new();
        let heading = doc.create_referenceable_block(
            BlockKind::Heading { level: 2 },
            vec![Inline::text("Links")],
        );
        doc.insert_block(0, heading).unwrap();
        let para = doc.create_referenceable_block(
            BlockKind::Paragraph,
            vec![
                Inline::text("see "),
                Inline::note_link("Bar"),
                Inline::text(" tagged "),
                Inline::tag("x"),
            ],
        );
        doc.insert_block(1, para).unwrap();
        let quote = doc.create_referenceable_block(BlockKind::Blockquote, vec![]);
        let quote_id = quote.id.clone();
        doc.insert_block(2, quote).unwrap();
        let inner = doc.create_referenceable_block(BlockKind::Paragraph, vec![Inline::text("inner")]);
        doc.insert_child(&quote_id, 0, inner).unwrap();
        let rule = doc.create_referenceable_block(BlockKind::ThematicBreak, vec![]);
        doc.insert_block(3, rule).unwrap();
        let empty = doc.create_referenceable_block(BlockKind::Paragraph, vec![]);
        doc.insert_block(4, empty).unwrap();

        let reparsed = Document::parse(&doc.serialize());
        assert_eq!(shape(&doc), shape(&reparsed));
    }

    #[test]
    fn special_characters_survive_round_trip() {
        let doc = Document::from_blocks(vec![
            Block::new("p1", BlockKind::Paragraph)
                .with_content(vec![Inline::text("2 * 3 = 6_ish [x] ~y~ <b> a|b")]),
            Block::new("p2", BlockKind::Paragraph).with_content(vec![Inline::text(
                "issue #42 and [[not a link]] and ((abc))",
            )]),
            Block::new("h1", BlockKind::Heading { level: 2 })
                .with_content(vec![Inline::text("#hash (plain) text")]),
        ]);
        let reparsed = Document::parse(&doc.serialize());
        assert_eq!(reparsed.block_ids(), vec!["p1", "p2", "h1"]);
        for (before, after) in doc.blocks.iter().zip(&reparsed.blocks) {
            assert_eq!(after.content, before.content);
        }
    }

    #[test]
    fn escaped_syntax_in_source_stays_text() {
        let doc = Document::parse("a \\#tag, \\[[x]] and \\((y)) but #real\n");
        let content = &doc.blocks[0].content;
        assert_eq!(
            content,
            &vec![
                Inline::text("a #tag, [[x]] and ((y)) but "),
                Inline::tag("real")
            ]
        );

        let code = Document::parse("`\\#kept`\n");
        assert_eq!(code.blocks[0].content[0].plain_text(), "\\#kept");
    }

    #[test]
    fn only_containers_take_children() {
        let mut doc = Document::parse("para ^p\n\n## head ^h\n\n- item ^i\n");
        let child = doc.create_referenceable_block(BlockKind::Paragraph, vec![Inline::text("c")]);
        let err = doc.insert_child("p", 0, child.clone()).unwrap_err();
        assert!(matches!(err, NoteGraphError::InvalidMove { .. }));
        let err = doc.move_block("i", Some("h"), 0).unwrap_err();
        assert!(matches!(err, NoteGraphError::InvalidMove { .. }));
        assert_eq!(doc.block_ids(), vec!["p", "h", "i"]);

        doc.insert_child("i", 0, child).unwrap();
        let reparsed = Document::parse(&doc.serialize());
        assert_eq!(reparsed.block_ids(), doc.block_ids());
    }

    #[test]
    fn stray_children_are_written_after_their_parent() {
        let doc = Document::from_blocks(vec![Block::new("p", BlockKind::Paragraph)
            .with_content(vec![Inline::text("parent")])
            .with_children(vec![Block::new("c", BlockKind::Paragraph)
                .with_content(vec![Inline::text("see "), Inline::note_link("Target")])])]);
        let reparsed = Document::parse(&doc.serialize());
        assert_eq!(reparsed.block_ids(), vec!["p", "c"]);
        assert_eq!(
            reparsed.blocks[1].content,
            vec![Inline::text("see "), Inline::note_link("Target")]
        );
    }

    #[test]
    fn quote_text_lives_in_a_paragraph() {
        let mut doc = Document::new();
        let quote = doc.create_referenceable_block(
            BlockKind::Blockquote,
            vec![Inline::text("said "), Inline::note_link("Target")],
        );
        assert!(quote.content.is_empty());
        assert_eq!(quote.children.len(), 1);
        let quote_id = quote.id.clone();
        doc.insert_block(0, quote).unwrap();

        let reparsed = Document::parse(&doc.serialize());
        assert_eq!(shape(&reparsed), shape(&doc));
        assert_eq!(reparsed.plain_text(), "said Target");

        doc.set_content(&quote_id, vec![Inline::tag("new")]).unwrap();
        assert_eq!(doc.blocks[0].children.len(), 1);
        assert_eq!(doc.blocks[0].children[0].content, vec![Inline::tag("new")]);

        let built = Document::from_blocks(vec![Block::new("q", BlockKind::Blockquote)
            .with_content(vec![Inline::text("quoted "), Inline::block_ref("b1")])]);
        assert!(built.blocks[0].content.is_empty());
        let reparsed = Document::parse(&built.serialize());
        assert_eq!(shape(&reparsed), shape(&built));
    }

    #[test]
    fn quote_content_set_directly_is_still_written() {
        let mut doc = Document::parse("> inner ^in\n\n^q\n");
        doc.blocks[0].content = vec![Inline::text("lead "), Inline::note_link("Target")];
        let reparsed = Document::parse(&doc.serialize());
        assert_eq!(reparsed.plain_text(), "lead Target\ninner");
        assert!(reparsed.blocks[0].children[0]
            .content
            .contains(&Inline::note_link("Target")));
    }

    #[test]
    fn create_block_ids_are_fresh() {
        let doc = Document::parse("a ^x1\n");
        let block = doc.create_referenceable_block(BlockKind::Paragraph, vec![]);
        assert_ne!(block.id, "x1");
        assert!(!block.id.is_empty());
    }

    #[test]
    fn editing_preserves_unaffected_ids() {
        let mut doc = Document::parse("a ^a\n\nb ^b\n\n- c ^c\n");
        doc.remove_block("b").unwrap();
        doc.set_content("a", vec![Inline::text("changed")]).unwrap();
        doc.move_block("a", Some("c"), 0).unwrap();
        assert_eq!(doc.block_ids(), vec!["c", "a"]);
        assert_eq!(doc.find_block("a").unwrap().plain_text(), "changed");
    }

    #[test]
    fn inserting_duplicate_id_fails() {
        let mut doc = Document::parse("a ^a\n");
        let err = doc
            .insert_block(1, Block::new("a", BlockKind::Paragraph))
            .unwrap_err();
        assert!(matches!(err, NoteGraphError::DuplicateBlockId { .. }));
    }

    #[test]
    fn moving_into_own_subtree_fails() {
        let mut doc = Document::parse("- a ^a\n  - b ^b\n");
        let err = doc.move_block("a", Some("b"), 0).unwrap_err();
        assert!(matches!(err, NoteGraphError::InvalidMove { .. }));
        assert_eq!(doc.block_ids(), vec!["a", "b"]);
    }

    #[test]
    fn missing_blocks_are_reported() {
        let mut doc = Document::new();
        assert!(matches!(
            doc.remove_block("nope"),
            Err(NoteGraphError::BlockNotFound { .. })
        ));
        assert!(matches!(
            doc.set_content("nope", vec![]),
            Err(NoteGraphError::BlockNotFound { .. })
        ));
    }
}
