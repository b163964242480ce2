use crate::resource::pin;
use std::collections::HashMap;

/// What a named shader binding can resolve to.
#[derive(Clone, Copy, Debug)]
pub enum BindingValue {
    Buffer(pin::Buffer),
    Texture(pin::Texture),
    AccelerationStructure(pin::AccelerationStructure),
}

/// Name → bindable resource entries consumed at draw time to satisfy
/// reflected bindings. Tables stack: the first table containing a name wins.
#[derive(Default)]
pub struct BindingTable {
    entries: HashMap<String, BindingValue>,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind_buffer(&mut self, name: impl Into<String>, buffer: pin::Buffer) -> &mut Self {
        self.entries.insert(name.into(), BindingValue::Buffer(buffer));
        self
    }

    pub fn bind_texture(&mut self, name: impl Into<String>, texture: pin::Texture) -> &mut Self {
        self.entries.insert(name.into(), BindingValue::Texture(texture));
        self
    }

    pub fn bind_acceleration_structure(
        &mut self,
        name: impl Into<String>,
        tlas: pin::AccelerationStructure,
    ) -> &mut Self {
        self.entries
            .insert(name.into(), BindingValue::AccelerationStructure(tlas));
        self
    }

    pub fn try_find(&self, name: &str) -> Option<BindingValue> {
        self.entries.get(name).copied()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
