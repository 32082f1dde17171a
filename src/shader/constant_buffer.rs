//! Constant buffers with CPU shadow data.

use std::collections::HashMap;

use crate::backend::{BufferDescriptor, BufferHandle, BufferUsage, GraphicsBackend, ShaderStage};
use crate::error::{GraphicsError, GraphicsResult};

use super::ShaderParameterGroup;

/// Constant buffer backed by a zero-initialised shadow copy
#[derive(Debug)]
pub struct ConstantBuffer {
    handle: BufferHandle,
    shadow_data: Vec<u8>,
    dirty: bool,
}

impl ConstantBuffer {
    /// Create a buffer of at least `size` bytes, rounded up to 16.
    pub fn new<B: GraphicsBackend>(backend: &mut B, size: u32) -> GraphicsResult<Self> {
        if size == 0 {
            log::error!("Can not create zero-sized constant buffer");
            return Err(GraphicsError::InvalidParameter("zero-sized constant buffer".into()));
        }
        let size = (size + 15) & !15;

        let handle = backend.create_buffer(&BufferDescriptor {
            label: Some("ConstantBuffer".into()),
            size: size as u64,
            usage: BufferUsage::UNIFORM | BufferUsage::COPY_DST,
        })?;

        Ok(Self {
            handle,
            shadow_data: vec![0; size as usize],
            dirty: false,
        })
    }

    /// Copy `data` into the shadow copy at `offset`. Writes past the end are
    /// logged and ignored.
    pub fn set_parameter(&mut self, offset: u32, data: &[u8]) {
        let start = offset as usize;
        let in_range = start
            .checked_add(data.len())
            .filter(|end| *end <= self.shadow_data.len());
        let Some(end) = in_range else {
            log::error!(
                "Constant buffer write of {} bytes at offset {} exceeds size {}",
                data.len(),
                offset,
                self.shadow_data.len()
            );
            return;
        };
        self.shadow_data[start..end].copy_from_slice(data);
        self.dirty = true;
    }

    /// Upload the shadow copy if it changed.
    pub fn apply<B: GraphicsBackend>(&mut self, backend: &mut B) {
        if self.dirty {
            backend.write_buffer(self.handle, 0, &self.shadow_data);
            self.dirty = false;
        }
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn size(&self) -> u32 {
        self.shadow_data.len() as u32
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn shadow_data(&self) -> &[u8] {
        &self.shadow_data
    }
}

/// Index of a buffer inside a [`ConstantBufferPool`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConstantBufferId(usize);

/// Constant buffers shared by every program that uses the same stage, group and size
#[derive(Debug, Default)]
pub struct ConstantBufferPool {
    buffers: Vec<ConstantBuffer>,
    lookup: HashMap<(ShaderStage, ShaderParameterGroup, u32), ConstantBufferId>,
    pending: Vec<ConstantBufferId>,
}

impl ConstantBufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        stage: ShaderStage,
        group: ShaderParameterGroup,
        size: u32,
    ) -> GraphicsResult<ConstantBufferId> {
        let key = (stage, group, size);
        if let Some(id) = self.lookup.get(&key) {
            return Ok(*id);
        }

        let buffer = ConstantBuffer::new(backend, size)?;
        let id = ConstantBufferId(self.buffers.len());
        self.buffers.push(buffer);
        self.lookup.insert(key, id);
        Ok(id)
    }

    pub fn get(&self, id: ConstantBufferId) -> Option<&ConstantBuffer> {
        self.buffers.get(id.0)
    }

    /// Write a parameter and queue the buffer for upload on the next draw.
    pub fn set_parameter(&mut self, id: ConstantBufferId, offset: u32, data: &[u8]) {
        let Some(buffer) = self.buffers.get_mut(id.0) else {
            return;
        };
        let was_dirty = buffer.is_dirty();
        buffer.set_parameter(offset, data);
        if !was_dirty && buffer.is_dirty() {
            self.pending.push(id);
        }
    }

    /// Upload every queued buffer and clear the queue.
    pub fn apply_pending<B: GraphicsBackend>(&mut self, backend: &mut B) {
        for id in self.pending.drain(..) {
            if let Some(buffer) = self.buffers.get_mut(id.0) {
                buffer.apply(backend);
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn release_all<B: GraphicsBackend>(&mut self, backend: &mut B) {
        for buffer in self.buffers.drain(..) {
            backend.destroy_buffer(buffer.handle);
        }
        self.lookup.clear();
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::{BackendCall, DummyBackend};

    #[test]
    fn test_size_rounds_up_to_16() {
        let mut backend = DummyBackend::new();
        let buffer = ConstantBuffer::new(&mut backend, 20).unwrap();
        assert_eq!(buffer.size(), 32);
        assert!(buffer.shadow_data().iter().all(|b| *b == 0));
    }

    #[test]
    fn test_zero_size_rejected() {
        let mut backend = DummyBackend::new();
        assert!(matches!(
            ConstantBuffer::new(&mut backend, 0),
            Err(GraphicsError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_out_of_range_write_ignored() {
        let mut backend = DummyBackend::new();
        let mut buffer = ConstantBuffer::new(&mut backend, 16).unwrap();
        buffer.set_parameter(8, &[1; 16]);
        buffer.set_parameter(u32::MAX, &[1; 4]);
        assert!(!buffer.is_dirty());
        assert!(buffer.shadow_data().iter().all(|b| *b == 0));

        buffer.set_parameter(12, &[7; 4]);
        assert!(buffer.is_dirty());
        assert_eq!(&buffer.shadow_data()[12..], &[7; 4]);
    }

    #[test]
    fn test_pool_shares_and_uploads_once() {
        let mut backend = DummyBackend::new();
        let mut pool = ConstantBufferPool::new();
        let a = pool
            .get_or_create(&mut backend, ShaderStage::Pixel, ShaderParameterGroup::Material, 32)
            .unwrap();
        let b = pool
            .get_or_create(&mut backend, ShaderStage::Pixel, ShaderParameterGroup::Material, 32)
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(pool.len(), 1);

        pool.set_parameter(a, 0, &[1; 4]);
        pool.set_parameter(a, 4, &[2; 4]);
        assert_eq!(pool.pending_count(), 1);

        backend.clear_calls();
        pool.apply_pending(&mut backend);
        let writes = backend
            .calls()
            .iter()
            .filter(|c| matches!(c, BackendCall::WriteBuffer { .. }))
            .count();
        assert_eq!(writes, 1);
        assert_eq!(pool.pending_count(), 0);
    }
}
