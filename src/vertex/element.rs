//! Vertex element descriptions and per-buffer element hashing.

/// Value type of a vertex element. Discriminants feed the element hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum VertexElementType {
    Int = 0,
    Float,
    Vector2,
    Vector3,
    Vector4,
    UByte4,
    UByte4Norm,
}

impl VertexElementType {
    /// Size in bytes.
    pub fn size(&self) -> u32 {
        match self {
            VertexElementType::Int | VertexElementType::Float => 4,
            VertexElementType::Vector2 => 8,
            VertexElementType::Vector3 => 12,
            VertexElementType::Vector4 => 16,
            VertexElementType::UByte4 | VertexElementType::UByte4Norm => 4,
        }
    }

    pub fn component_count(&self) -> u32 {
        match self {
            VertexElementType::Int | VertexElementType::Float => 1,
            VertexElementType::Vector2 => 2,
            VertexElementType::Vector3 => 3,
            VertexElementType::Vector4
            | VertexElementType::UByte4
            | VertexElementType::UByte4Norm => 4,
        }
    }

    pub fn is_normalized(&self) -> bool {
        matches!(self, VertexElementType::UByte4Norm)
    }
}

/// Semantic of a vertex element. Discriminants feed the element hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum VertexElementSemantic {
    Position = 0,
    Normal,
    Binormal,
    Tangent,
    TexCoord,
    Color,
    BlendWeights,
    BlendIndices,
    ObjectIndex,
}

impl VertexElementSemantic {
    pub fn name(&self) -> &'static str {
        match self {
            VertexElementSemantic::Position => "POSITION",
            VertexElementSemantic::Normal => "NORMAL",
            VertexElementSemantic::Binormal => "BINORMAL",
            VertexElementSemantic::Tangent => "TANGENT",
            VertexElementSemantic::TexCoord => "TEXCOORD",
            VertexElementSemantic::Color => "COLOR",
            VertexElementSemantic::BlendWeights => "BLENDWEIGHT",
            VertexElementSemantic::BlendIndices => "BLENDINDICES",
            VertexElementSemantic::ObjectIndex => "OBJECTINDEX",
        }
    }
}

/// One element of a vertex buffer's layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexElement {
    pub element_type: VertexElementType,
    pub semantic: VertexElementSemantic,
    pub index: u8,
    pub per_instance: bool,
    /// Byte offset inside the vertex, filled by [`update_offsets`]
    pub offset: u32,
}

impl VertexElement {
    pub fn new(element_type: VertexElementType, semantic: VertexElementSemantic) -> Self {
        Self {
            element_type,
            semantic,
            index: 0,
            per_instance: false,
            offset: 0,
        }
    }

    pub fn with_index(mut self, index: u8) -> Self {
        self.index = index;
        self
    }

    pub fn per_instance(mut self) -> Self {
        self.per_instance = true;
        self
    }
}

/// Assign packed offsets to `elements` and return the vertex size.
pub fn update_offsets(elements: &mut [VertexElement]) -> u32 {
    let mut offset = 0;
    for element in elements.iter_mut() {
        element.offset = offset;
        offset += element.element_type.size();
    }
    offset
}

/// Hash of a buffer's element list.
///
/// Each element shifts the accumulator left by 6 bits before adding
/// `(type + 1) * (semantic + 1) + index`, so long layouts overflow the
/// 16 bits a slot gets in the combined layout hash.
pub fn element_hash(elements: &[VertexElement]) -> u64 {
    let mut hash = 0u64;
    for element in elements {
        hash <<= 6;
        hash = hash.wrapping_add(
            (element.element_type as u64 + 1) * (element.semantic as u64 + 1)
                + element.index as u64,
        );
    }
    hash
}
