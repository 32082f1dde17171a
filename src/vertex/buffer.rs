//! CPU-side vertex and index buffers with optional shadow copies.

use std::sync::Arc;

use crate::backend::{
    BufferDescriptor, BufferHandle, BufferUsage, GraphicsBackend, IndexFormat,
};
use crate::error::{GraphicsError, GraphicsResult};

use super::element::{element_hash, update_offsets, VertexElement};

/// A vertex buffer as seen by the state tracker: the GPU buffer, its layout
/// and the byte offset it is bound at.
#[derive(Debug, Clone)]
pub struct VertexStream {
    pub buffer: BufferHandle,
    pub elements: Arc<[VertexElement]>,
    pub vertex_size: u32,
    pub element_hash: u64,
    pub offset: u64,
}

impl VertexStream {
    /// This stream's contribution to the combined layout hash when bound at `slot`.
    pub fn buffer_hash(&self, slot: usize) -> u64 {
        self.element_hash << (slot * 16)
    }

    pub fn has_instance_data(&self) -> bool {
        self.elements.iter().any(|e| e.per_instance)
    }
}

impl PartialEq for VertexStream {
    fn eq(&self, other: &Self) -> bool {
        self.buffer == other.buffer
            && self.offset == other.offset
            && self.vertex_size == other.vertex_size
            && (Arc::ptr_eq(&self.elements, &other.elements) || self.elements == other.elements)
    }
}

#[derive(Debug)]
enum LockState {
    None,
    Shadow { start: u32, count: u32 },
    Scratch { start: u32, data: Vec<u8> },
}

/// Vertex buffer
#[derive(Debug)]
pub struct VertexBuffer {
    handle: Option<BufferHandle>,
    elements: Arc<[VertexElement]>,
    element_hash: u64,
    vertex_size: u32,
    vertex_count: u32,
    dynamic: bool,
    shadowed: bool,
    shadow_data: Vec<u8>,
    lock: LockState,
}

impl VertexBuffer {
    pub fn new(shadowed: bool) -> Self {
        Self {
            handle: None,
            elements: Arc::from(Vec::new()),
            element_hash: 0,
            vertex_size: 0,
            vertex_count: 0,
            dynamic: false,
            shadowed,
            shadow_data: Vec::new(),
            lock: LockState::None,
        }
    }

    /// Enable or disable the CPU shadow copy. Existing shadow data is dropped
    /// when disabled.
    pub fn set_shadowed(&mut self, enable: bool) {
        if enable != self.shadowed {
            self.shadowed = enable;
            if enable {
                self.shadow_data = vec![0; self.byte_size()];
            } else {
                self.shadow_data = Vec::new();
            }
        }
    }

    /// Define the layout and vertex count, recreating the GPU buffer.
    pub fn set_size<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        vertex_count: u32,
        elements: &[VertexElement],
        dynamic: bool,
    ) -> GraphicsResult<()> {
        if self.is_locked() {
            log::error!("Can not resize a locked vertex buffer");
            return Err(GraphicsError::AlreadyLocked);
        }

        let mut elements = elements.to_vec();
        self.vertex_size = update_offsets(&mut elements);
        self.element_hash = element_hash(&elements);
        self.elements = Arc::from(elements);
        self.vertex_count = vertex_count;
        self.dynamic = dynamic;

        if self.shadowed {
            self.shadow_data = vec![0; self.byte_size()];
        }

        self.create(backend)
    }

    fn create<B: GraphicsBackend>(&mut self, backend: &mut B) -> GraphicsResult<()> {
        self.release(backend);
        if self.byte_size() == 0 {
            return Ok(());
        }

        let handle = backend.create_buffer(&BufferDescriptor {
            label: Some("VertexBuffer".into()),
            size: self.byte_size() as u64,
            usage: BufferUsage::VERTEX | BufferUsage::COPY_DST,
        })?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Destroy the GPU buffer. Layout and shadow data are kept.
    pub fn release<B: GraphicsBackend>(&mut self, backend: &mut B) {
        if let Some(handle) = self.handle.take() {
            backend.destroy_buffer(handle);
        }
    }

    /// Replace the whole buffer contents.
    pub fn set_data<B: GraphicsBackend>(&mut self, backend: &mut B, data: &[u8]) -> GraphicsResult<()> {
        if data.is_empty() {
            log::error!("Null pointer for vertex buffer data");
            return Err(GraphicsError::EmptyData("vertex buffer".into()));
        }
        if self.vertex_size == 0 {
            log::error!("Vertex elements not defined, can not set vertex buffer data");
            return Err(GraphicsError::InvalidParameter("vertex elements not defined".into()));
        }
        let size = self.byte_size();
        if data.len() < size {
            log::error!("Vertex buffer data too short ({} < {} bytes)", data.len(), size);
            return Err(GraphicsError::InvalidRange(format!(
                "{} bytes supplied for {} byte vertex buffer",
                data.len(),
                size
            )));
        }

        if self.shadowed {
            self.shadow_data[..size].copy_from_slice(&data[..size]);
        }
        if let Some(handle) = self.handle {
            backend.write_buffer(handle, 0, &data[..size]);
        }
        Ok(())
    }

    /// Replace `count` vertices starting at `start`.
    pub fn set_data_range<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        data: &[u8],
        start: u32,
        count: u32,
    ) -> GraphicsResult<()> {
        if start == 0 && count == self.vertex_count {
            return self.set_data(backend, data);
        }
        if data.is_empty() {
            log::error!("Null pointer for vertex buffer data");
            return Err(GraphicsError::EmptyData("vertex buffer".into()));
        }
        if self.vertex_size == 0 {
            log::error!("Vertex elements not defined, can not set vertex buffer data");
            return Err(GraphicsError::InvalidParameter("vertex elements not defined".into()));
        }
        self.check_range(start, count)?;
        if count == 0 {
            return Ok(());
        }

        let offset = (start * self.vertex_size) as usize;
        let size = (count * self.vertex_size) as usize;
        if data.len() < size {
            log::error!("Vertex buffer data too short ({} < {} bytes)", data.len(), size);
            return Err(GraphicsError::InvalidRange(format!(
                "{} bytes supplied for {} vertices",
                data.len(),
                count
            )));
        }

        if self.shadowed {
            self.shadow_data[offset..offset + size].copy_from_slice(&data[..size]);
        }
        if let Some(handle) = self.handle {
            backend.write_buffer(handle, offset as u64, &data[..size]);
        }
        Ok(())
    }

    /// Lock a vertex range for writing. The returned slice is uploaded by [`unlock`](Self::unlock).
    pub fn lock(&mut self, start: u32, count: u32) -> GraphicsResult<&mut [u8]> {
        if self.is_locked() {
            log::error!("Vertex buffer already locked");
            return Err(GraphicsError::AlreadyLocked);
        }
        if self.vertex_size == 0 {
            log::error!("Vertex elements not defined, can not lock vertex buffer");
            return Err(GraphicsError::InvalidParameter("vertex elements not defined".into()));
        }
        self.check_range(start, count)?;
        if count == 0 {
            return Ok(&mut []);
        }

        let offset = (start * self.vertex_size) as usize;
        let size = (count * self.vertex_size) as usize;
        if self.shadowed {
            self.lock = LockState::Shadow { start, count };
            Ok(&mut self.shadow_data[offset..offset + size])
        } else {
            self.lock = LockState::Scratch {
                start,
                data: vec![0; size],
            };
            match &mut self.lock {
                LockState::Scratch { data, .. } => Ok(data.as_mut_slice()),
                _ => Ok(&mut []),
            }
        }
    }

    /// Upload the locked range and release the lock.
    pub fn unlock<B: GraphicsBackend>(&mut self, backend: &mut B) {
        match std::mem::replace(&mut self.lock, LockState::None) {
            LockState::None => {}
            LockState::Shadow { start, count } => {
                let offset = (start * self.vertex_size) as usize;
                let size = (count * self.vertex_size) as usize;
                if let Some(handle) = self.handle {
                    backend.write_buffer(handle, offset as u64, &self.shadow_data[offset..offset + size]);
                }
            }
            LockState::Scratch { start, data } => {
                let offset = (start * self.vertex_size) as u64;
                if let Some(handle) = self.handle {
                    backend.write_buffer(handle, offset, &data);
                }
            }
        }
    }

    fn check_range(&self, start: u32, count: u32) -> GraphicsResult<()> {
        if start.checked_add(count).map_or(true, |end| end > self.vertex_count) {
            log::error!("Illegal range for setting new vertex buffer data");
            return Err(GraphicsError::InvalidRange(format!(
                "vertices {}..{} of {}",
                start,
                start as u64 + count as u64,
                self.vertex_count
            )));
        }
        Ok(())
    }

    fn byte_size(&self) -> usize {
        (self.vertex_count * self.vertex_size) as usize
    }

    /// Snapshot for binding. Instance data streams start `instance_offset` vertices in.
    pub fn stream(&self, instance_offset: u32) -> Option<VertexStream> {
        let buffer = self.handle?;
        let mut stream = VertexStream {
            buffer,
            elements: self.elements.clone(),
            vertex_size: self.vertex_size,
            element_hash: self.element_hash,
            offset: 0,
        };
        if stream.has_instance_data() {
            stream.offset = instance_offset as u64 * self.vertex_size as u64;
        }
        Some(stream)
    }

    pub fn handle(&self) -> Option<BufferHandle> {
        self.handle
    }

    pub fn elements(&self) -> &[VertexElement] {
        &self.elements
    }

    pub fn element_hash(&self) -> u64 {
        self.element_hash
    }

    /// Element hash shifted into the bits owned by `slot`.
    pub fn buffer_hash(&self, slot: usize) -> u64 {
        self.element_hash << (slot * 16)
    }

    pub fn vertex_size(&self) -> u32 {
        self.vertex_size
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    pub fn is_shadowed(&self) -> bool {
        self.shadowed
    }

    pub fn is_locked(&self) -> bool {
        !matches!(self.lock, LockState::None)
    }

    pub fn shadow_data(&self) -> Option<&[u8]> {
        self.shadowed.then_some(self.shadow_data.as_slice())
    }
}

/// Index buffer
#[derive(Debug)]
pub struct IndexBuffer {
    handle: Option<BufferHandle>,
    index_size: u32,
    index_count: u32,
    dynamic: bool,
    shadowed: bool,
    shadow_data: Vec<u8>,
}

impl IndexBuffer {
    pub fn new(shadowed: bool) -> Self {
        Self {
            handle: None,
            index_size: 0,
            index_count: 0,
            dynamic: false,
            shadowed,
            shadow_data: Vec::new(),
        }
    }

    /// Set index count and width, recreating the GPU buffer.
    pub fn set_size<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        index_count: u32,
        large_indices: bool,
        dynamic: bool,
    ) -> GraphicsResult<()> {
        self.index_count = index_count;
        self.index_size = if large_indices { 4 } else { 2 };
        self.dynamic = dynamic;
        if self.shadowed {
            self.shadow_data = vec![0; self.byte_size()];
        }

        self.release(backend);
        // GPU buffers are padded to a multiple of four bytes
        let size = (self.byte_size() as u64 + 3) & !3;
        if size > 0 {
            self.handle = Some(backend.create_buffer(&BufferDescriptor {
                label: Some("IndexBuffer".into()),
                size,
                usage: BufferUsage::INDEX | BufferUsage::COPY_DST,
            })?);
        }
        Ok(())
    }

    pub fn release<B: GraphicsBackend>(&mut self, backend: &mut B) {
        if let Some(handle) = self.handle.take() {
            backend.destroy_buffer(handle);
        }
    }

    pub fn set_data<B: GraphicsBackend>(&mut self, backend: &mut B, data: &[u8]) -> GraphicsResult<()> {
        self.set_data_range(backend, data, 0, self.index_count)
    }

    pub fn set_data_range<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        data: &[u8],
        start: u32,
        count: u32,
    ) -> GraphicsResult<()> {
        if data.is_empty() {
            log::error!("Null pointer for index buffer data");
            return Err(GraphicsError::EmptyData("index buffer".into()));
        }
        if self.index_size == 0 {
            log::error!("Index size not defined, can not set index buffer data");
            return Err(GraphicsError::InvalidParameter("index size not defined".into()));
        }
        if start.checked_add(count).map_or(true, |end| end > self.index_count) {
            log::error!("Illegal range for setting new index buffer data");
            return Err(GraphicsError::InvalidRange(format!(
                "indices {}..{} of {}",
                start,
                start as u64 + count as u64,
                self.index_count
            )));
        }
        if count == 0 {
            return Ok(());
        }

        let offset = (start * self.index_size) as usize;
        let size = (count * self.index_size) as usize;
        if data.len() < size {
            log::error!("Index buffer data too short ({} < {} bytes)", data.len(), size);
            return Err(GraphicsError::InvalidRange(format!(
                "{} bytes supplied for {} indices",
                data.len(),
                count
            )));
        }

        if self.shadowed {
            self.shadow_data[offset..offset + size].copy_from_slice(&data[..size]);
        }
        if let Some(handle) = self.handle {
            // Queue writes must be four byte aligned
            let aligned_start = offset & !3;
            let aligned_end = (offset + size + 3) & !3;
            if aligned_start == offset && aligned_end == offset + size {
                backend.write_buffer(handle, offset as u64, &data[..size]);
            } else if self.shadowed {
                let mut staging = vec![0u8; aligned_end - aligned_start];
                let end = aligned_end.min(self.shadow_data.len());
                staging[..end - aligned_start].copy_from_slice(&self.shadow_data[aligned_start..end]);
                backend.write_buffer(handle, aligned_start as u64, &staging);
            } else {
                log::error!("Unaligned index buffer update requires shadow data");
                return Err(GraphicsError::InvalidRange(format!(
                    "unaligned update of indices {}..{} without shadow data",
                    start,
                    start + count
                )));
            }
        }
        Ok(())
    }

    fn byte_size(&self) -> usize {
        (self.index_count * self.index_size) as usize
    }

    pub fn handle(&self) -> Option<BufferHandle> {
        self.handle
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    pub fn index_size(&self) -> u32 {
        self.index_size
    }

    pub fn index_format(&self) -> IndexFormat {
        if self.index_size == 4 {
            IndexFormat::Uint32
        } else {
            IndexFormat::Uint16
        }
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    pub fn shadow_data(&self) -> Option<&[u8]> {
        self.shadowed.then_some(self.shadow_data.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::{BackendCall, DummyBackend};
    use crate::vertex::element::{VertexElementSemantic, VertexElementType};

    fn elements() -> Vec<VertexElement> {
        vec![
            VertexElement::new(VertexElementType::Vector3, VertexElementSemantic::Position),
            VertexElement::new(VertexElementType::Vector2, VertexElementSemantic::TexCoord),
        ]
    }

    #[test]
    fn test_streams_compare_layouts_not_hashes() {
        let stream = VertexStream {
            buffer: BufferHandle(1),
            elements: Arc::from(elements()),
            vertex_size: 20,
            element_hash: 42,
            offset: 0,
        };
        let same = VertexStream {
            elements: Arc::from(elements()),
            ..stream.clone()
        };
        assert_eq!(stream, same);

        let mut other_elements = elements();
        other_elements[1] =
            VertexElement::new(VertexElementType::Vector2, VertexElementSemantic::Normal);
        let colliding = VertexStream {
            elements: Arc::from(other_elements),
            ..stream.clone()
        };
        assert_eq!(colliding.element_hash, stream.element_hash);
        assert_ne!(stream, colliding);
    }

    #[test]
    fn test_set_size_computes_offsets() {
        let mut backend = DummyBackend::new();
        let mut buffer = VertexBuffer::new(true);
        buffer.set_size(&mut backend, 4, &elements(), false).unwrap();

        assert_eq!(buffer.vertex_size(), 20);
        assert_eq!(buffer.elements()[1].offset, 12);
        assert_eq!(buffer.shadow_data().map(<[u8]>::len), Some(80));
        assert!(buffer.handle().is_some());
    }

    #[test]
    fn test_set_data_too_short() {
        let mut backend = DummyBackend::new();
        let mut buffer = VertexBuffer::new(false);
        buffer.set_size(&mut backend, 4, &elements(), false).unwrap();

        let result = buffer.set_data(&mut backend, &[0u8; 40]);
        assert!(matches!(result, Err(GraphicsError::InvalidRange(_))));
        assert!(matches!(
            buffer.set_data(&mut backend, &[]),
            Err(GraphicsError::EmptyData(_))
        ));
    }

    #[test]
    fn test_lock_writes_shadow_and_uploads_range() {
        let mut backend = DummyBackend::new();
        let mut buffer = VertexBuffer::new(true);
        buffer.set_size(&mut backend, 4, &elements(), false).unwrap();
        backend.clear_calls();

        let locked = buffer.lock(1, 2).unwrap();
        assert_eq!(locked.len(), 40);
        locked.fill(7);
        assert!(buffer.is_locked());
        assert!(matches!(buffer.lock(0, 1), Err(GraphicsError::AlreadyLocked)));

        buffer.unlock(&mut backend);
        assert!(!buffer.is_locked());
        assert_eq!(
            backend.calls(),
            &[BackendCall::WriteBuffer {
                buffer: buffer.handle().unwrap(),
                offset: 20,
                size: 40,
            }]
        );
        let shadow = buffer.shadow_data().unwrap();
        assert!(shadow[..20].iter().all(|&b| b == 0));
        assert!(shadow[20..60].iter().all(|&b| b == 7));
    }

    #[test]
    fn test_lock_out_of_range() {
        let mut backend = DummyBackend::new();
        let mut buffer = VertexBuffer::new(false);
        buffer.set_size(&mut backend, 4, &elements(), false).unwrap();

        assert!(matches!(buffer.lock(3, 2), Err(GraphicsError::InvalidRange(_))));
        assert!(!buffer.is_locked());
    }

    #[test]
    fn test_instance_stream_offset() {
        let mut backend = DummyBackend::new();
        let mut geometry = VertexBuffer::new(false);
        geometry.set_size(&mut backend, 4, &elements(), false).unwrap();
        let mut instances = VertexBuffer::new(false);
        let transform = VertexElement::new(VertexElementType::Vector4, VertexElementSemantic::TexCoord)
            .with_index(4)
            .per_instance();
        instances.set_size(&mut backend, 8, &[transform], true).unwrap();

        assert_eq!(geometry.stream(3).unwrap().offset, 0);
        assert_eq!(instances.stream(3).unwrap().offset, 48);
        assert!(VertexBuffer::new(false).stream(0).is_none());
    }

    #[test]
    fn test_index_buffer_format_and_padding() {
        let mut backend = DummyBackend::new();
        let mut small = IndexBuffer::new(true);
        small.set_size(&mut backend, 3, false, false).unwrap();
        assert_eq!(small.index_format(), IndexFormat::Uint16);
        assert_eq!(small.shadow_data().map(<[u8]>::len), Some(6));

        let mut large = IndexBuffer::new(false);
        large.set_size(&mut backend, 3, true, false).unwrap();
        assert_eq!(large.index_format(), IndexFormat::Uint32);
        assert!(large.shadow_data().is_none());
    }

    #[test]
    fn test_unaligned_index_update_uses_shadow() {
        let mut backend = DummyBackend::new();
        let mut buffer = IndexBuffer::new(true);
        buffer.set_size(&mut backend, 4, false, false).unwrap();
        backend.clear_calls();

        buffer.set_data_range(&mut backend, &[1, 0], 1, 1).unwrap();
        assert_eq!(
            backend.calls(),
            &[BackendCall::WriteBuffer {
                buffer: buffer.handle().unwrap(),
                offset: 0,
                size: 4,
            }]
        );

        let mut unshadowed = IndexBuffer::new(false);
        unshadowed.set_size(&mut backend, 4, false, false).unwrap();
        assert!(unshadowed.set_data_range(&mut backend, &[1, 0], 1, 1).is_err());
    }
}
