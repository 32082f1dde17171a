//! Input layout resolution from the bound vertex streams.

use super::buffer::VertexStream;
use super::element::{VertexElementSemantic, VertexElementType};

/// One attribute of a resolved input layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutElement {
    pub semantic: VertexElementSemantic,
    pub semantic_index: u8,
    pub element_type: VertexElementType,
    pub buffer_slot: u32,
    pub offset: u32,
    pub per_instance: bool,
    pub instance_step_rate: u32,
}

/// Input layout built from the vertex streams bound at pipeline creation time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VertexLayoutDescription {
    pub elements: Vec<LayoutElement>,
    /// Vertex stride per slot, zero for unbound slots
    pub strides: Vec<u32>,
    pub hash: u64,
}

impl VertexLayoutDescription {
    /// Whether any attribute sourced from `slot` advances per instance.
    pub fn is_instanced_slot(&self, slot: u32) -> bool {
        self.elements
            .iter()
            .any(|e| e.buffer_slot == slot && e.per_instance)
    }
}

/// Builds input layouts and layout hashes from vertex streams.
pub struct VertexLayoutResolver;

impl VertexLayoutResolver {
    /// Combined hash of all bound streams.
    ///
    /// Each stream's element hash is shifted by 16 bits per slot and the results
    /// are ORed together. Element hashes wider than 16 bits spill into the next
    /// slot's bits, so distinct layouts can share a hash.
    pub fn layout_hash(streams: &[Option<VertexStream>]) -> u64 {
        streams
            .iter()
            .enumerate()
            .filter_map(|(slot, stream)| stream.as_ref().map(|s| s.buffer_hash(slot)))
            .fold(0, |hash, buffer_hash| hash | buffer_hash)
    }

    /// Resolve the full input layout.
    ///
    /// An element whose semantic and index were already provided by a lower
    /// slot replaces that entry's source instead of adding a second attribute.
    /// Entries added by the same slot are never replaced.
    pub fn resolve(streams: &[Option<VertexStream>]) -> VertexLayoutDescription {
        let mut elements: Vec<LayoutElement> = Vec::new();
        let mut strides = Vec::with_capacity(streams.len());

        for (slot, stream) in streams.iter().enumerate() {
            let Some(stream) = stream else {
                strides.push(0);
                continue;
            };
            strides.push(stream.vertex_size);

            let previous_count = elements.len();
            for src in stream.elements.iter() {
                let step_rate = if src.per_instance { 1 } else { 0 };

                let existing = elements[..previous_count]
                    .iter_mut()
                    .find(|e| e.semantic == src.semantic && e.semantic_index == src.index);

                match existing {
                    Some(entry) => {
                        entry.buffer_slot = slot as u32;
                        entry.offset = src.offset;
                        entry.per_instance = src.per_instance;
                        entry.instance_step_rate = step_rate;
                    }
                    None => elements.push(LayoutElement {
                        semantic: src.semantic,
                        semantic_index: src.index,
                        element_type: src.element_type,
                        buffer_slot: slot as u32,
                        offset: src.offset,
                        per_instance: src.per_instance,
                        instance_step_rate: step_rate,
                    }),
                }
            }
        }

        // Trailing unbound slots carry nothing
        while strides.last() == Some(&0) {
            strides.pop();
        }

        VertexLayoutDescription {
            elements,
            strides,
            hash: Self::layout_hash(streams),
        }
    }
}
