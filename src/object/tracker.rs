//! Object state tracker.
//!
//! Maps object identities to their [`GlobalObjectState`]. A tracker belongs
//! to one execution plan; it is only touched by the engine that owns it.

use std::collections::HashMap;

use crate::backend::DeviceId;
use crate::error::{ForgeResult, TaskForgeError};
use crate::memory::{BufferHandle, DeviceBufferManager};
use crate::object::{GlobalObjectState, LogicalObject, ObjectId};

#[derive(Debug, Default)]
pub struct ObjectStateTracker {
    states: HashMap<ObjectId, GlobalObjectState>,
}

impl ObjectStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// State for `object`, created on first use. Fails when the object was
    /// resized since it was last resolved.
    pub fn resolve(&mut self, object: &LogicalObject) -> ForgeResult<&mut GlobalObjectState> {
        let shape = object.shape()?;
        let state = self
            .states
            .entry(object.id())
            .or_insert_with(|| GlobalObjectState::new(object.id(), shape.clone()));

        if state.shape() != &shape {
            return Err(TaskForgeError::ShapeMismatch {
                object: object.id().0,
                expected: state.shape().to_string(),
                found: shape.to_string(),
            });
        }
        Ok(state)
    }

    pub fn get(&self, object: ObjectId) -> Option<&GlobalObjectState> {
        self.states.get(&object)
    }

    pub fn get_mut(&mut self, object: ObjectId) -> ForgeResult<&mut GlobalObjectState> {
        self.states
            .get_mut(&object)
            .ok_or(TaskForgeError::ObjectNotFound(object.0))
    }

    pub fn set_owner(&mut self, object: ObjectId, device: DeviceId) -> ForgeResult<()> {
        self.get_mut(object)?.record_write(device);
        Ok(())
    }

    pub fn invalidate(&mut self, object: ObjectId) -> ForgeResult<()> {
        self.get_mut(object)?.invalidate();
        Ok(())
    }

    pub fn invalidate_all(&mut self) {
        for state in self.states.values_mut() {
            state.invalidate();
        }
    }

    pub fn invalidate_device(&mut self, device: DeviceId) {
        for state in self.states.values_mut() {
            state.invalidate_device(device);
        }
    }

    /// Forget `object` and release its device buffers
    pub fn clear(&mut self, object: ObjectId, buffers: &DeviceBufferManager) -> ForgeResult<()> {
        if let Some(mut state) = self.states.remove(&object) {
            for handle in state.take_buffers() {
                buffers.release(&handle)?;
            }
        }
        Ok(())
    }

    /// Release every tracked buffer, keeping the states
    pub fn release_all(&mut self, buffers: &DeviceBufferManager) -> ForgeResult<()> {
        for state in self.states.values_mut() {
            for handle in state.take_buffers() {
                buffers.release(&handle)?;
            }
            state.invalidate();
        }
        Ok(())
    }

    /// Drop buffer handles without releasing them (their heap was reset)
    pub fn forget_buffers(&mut self, device: DeviceId) {
        for state in self.states.values_mut() {
            let ds = state.device_state_mut(device);
            ds.take_buffer();
            state.invalidate_device(device);
        }
    }

    /// Drop handles whose heap was reset or discarded underneath this
    /// tracker, for instance by another plan resetting a shared device.
    /// The affected device copies are invalidated so the next execution
    /// re-materialises them. Returns the dropped handles.
    pub fn forget_stale_buffers(&mut self, buffers: &DeviceBufferManager) -> ForgeResult<Vec<BufferHandle>> {
        let mut stale = Vec::new();
        for state in self.states.values_mut() {
            let mut gone = Vec::new();
            for (device, ds) in state.devices() {
                if let Some(handle) = ds.buffer() {
                    if !buffers.is_live(handle)? {
                        gone.push(*device);
                    }
                }
            }
            if !gone.is_empty() {
                state.clear_first_copy_out();
            }
            for device in gone {
                if let Some(handle) = state.device_state_mut(device).take_buffer() {
                    stale.push(handle);
                }
                state.invalidate_device(device);
            }
        }
        Ok(stale)
    }

    /// Move the state of `old` to `new`; device buffers stay attached but
    /// every copy must be refreshed
    pub fn rebind(&mut self, old: ObjectId, new: ObjectId) {
        if let Some(mut state) = self.states.remove(&old) {
            state.rebind(new);
            self.states.insert(new, state);
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
