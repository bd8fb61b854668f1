//! Request batching: deduplication of repeated inputs and provider-sized chunking.

use std::collections::HashMap;

/// Callback that writes a translated string back to wherever its input came from
pub type ApplyFn<'a> = Box<dyn FnMut(&str) + 'a>;

/// An input string paired with the callback that receives its translation
pub struct PendingItem<'a> {
    pub input: String,
    apply: ApplyFn<'a>,
}

impl<'a> PendingItem<'a> {
    pub fn new(input: impl Into<String>, apply: impl FnMut(&str) + 'a) -> Self {
        Self {
            input: input.into(),
            apply: Box::new(apply),
        }
    }

    pub fn apply(&mut self, output: &str) {
        (self.apply)(output)
    }
}

/// Collapse items with identical inputs into one canonical item per input
///
/// The canonical item keeps the position of the first occurrence and its
/// callback fans the output out to every grouped item's original callback.
pub fn deduplicate(items: Vec<PendingItem<'_>>) -> Vec<PendingItem<'_>> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(String, Vec<ApplyFn<'_>>)> = Vec::new();

    for item in items {
        match positions.get(&item.input) {
            Some(&position) => groups[position].1.push(item.apply),
            None => {
                positions.insert(item.input.clone(), groups.len());
                groups.push((item.input, vec![item.apply]));
            }
        }
    }

    groups
        .into_iter()
        .map(|(input, mut applies)| {
            if applies.len() == 1 {
                if let Some(apply) = applies.pop() {
                    return PendingItem { input, apply };
                }
            }
            PendingItem::new(input, move |output: &str| {
                for apply in applies.iter_mut() {
                    apply(output);
                }
            })
        })
        .collect()
}

/// Invoke each item's callback with the output at the same position
pub fn apply_outputs(items: &mut [PendingItem<'_>], outputs: &[String]) {
    for (item, output) in items.iter_mut().zip(outputs) {
        item.apply(output);
    }
}

/// Per-request size limits of one provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLimits {
    pub max_items: usize,
    pub max_characters: usize,
}

/// A cache miss remembered with its position in the request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Miss {
    pub index: usize,
    pub input: String,
}

impl AsRef<str> for Miss {
    fn as_ref(&self) -> &str {
        &self.input
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk<T> {
    pub items: Vec<T>,
    pub characters: usize,
}

impl<T> Chunk<T> {
    fn empty() -> Self {
        Self { items: Vec::new(), characters: 0 }
    }
}

/// Characters billed for a string, counted in UTF-16 code units as the vendors do
pub fn character_count(text: &str) -> usize {
    text.encode_utf16().count()
}

/// Greedily pack items, in order, into chunks that respect `limits`
///
/// A new chunk starts when the current one already holds `max_items` items or
/// when adding the next item would bring its characters to `max_characters` or
/// beyond. An item too large for any chunk still gets a chunk of its own.
pub fn chunk<T: AsRef<str>>(items: impl IntoIterator<Item = T>, limits: ChunkLimits) -> Vec<Chunk<T>> {
    let mut chunks = Vec::new();
    let mut current = Chunk::empty();

    for item in items {
        let characters = character_count(item.as_ref());
        let full = current.items.len() >= limits.max_items
            || current.characters + characters >= limits.max_characters;
        if full && !current.items.is_empty() {
            chunks.push(std::mem::replace(&mut current, Chunk::empty()));
        }
        current.characters += characters;
        current.items.push(item);
    }

    if !current.items.is_empty() {
        chunks.push(current);
    }
    chunks
}

pub fn total_characters<T>(chunks: &[Chunk<T>]) -> usize {
    chunks.iter().map(|chunk| chunk.characters).sum()
}
