use gpu_core::{self as gpu, Handle};

/// Marker for bindless resident texture ids.
pub enum ResidentTexture {}

/// Bindless slot allocator. A resident id is the slot index into the
/// bindless image array (set 2); slots are reclaimed on removal and the
/// image-info array is rebuilt each frame for the update-after-bind write.
pub struct TextureRegistry {
    slots: Vec<Option<gpu::ImageInfo>>,
    free: Vec<u32>,
    max_descriptors: u32,
}

impl TextureRegistry {
    pub fn new(max_descriptors: u32) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            max_descriptors,
        }
    }

    pub fn max_descriptor_count(&self) -> u32 {
        self.max_descriptors
    }

    pub fn acquire(&mut self) -> Handle<ResidentTexture> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                assert!((self.slots.len() as u32) < self.max_descriptors, "bindless slots exhausted");
                self.slots.push(None);
                self.slots.len() as u32 - 1
            }
        };

        // Resident id 0 is a valid slot; the generation field disambiguates
        // it from a null handle.
        Handle::from_parts(index, 1)
    }

    pub fn set_external_texture(
        &mut self,
        resident: Handle<ResidentTexture>,
        image: Handle<gpu::Image>,
        state: gpu::ImageState,
    ) {
        let index = resident.index() as usize;
        if index < self.slots.len() {
            self.slots[index] = Some(gpu::ImageInfo { image, state });
        }
    }

    pub fn remove(&mut self, resident: Handle<ResidentTexture>) {
        let index = resident.index() as usize;
        if index < self.slots.len() && self.slots[index].is_some() {
            self.slots[index] = None;
            self.free.push(index as u32);
        }
    }

    /// Bindless slot index shaders use to address the image.
    pub fn get_resident_id(resident: Handle<ResidentTexture>) -> u32 {
        resident.index()
    }

    /// Dense image-info array for the bindless descriptor write; empty slots
    /// hold a null image (a real backend substitutes a dummy view).
    pub fn image_infos(&self) -> Vec<gpu::ImageInfo> {
        self.slots
            .iter()
            .map(|slot| {
                slot.unwrap_or(gpu::ImageInfo {
                    image: Handle::NONE,
                    state: gpu::ImageState::Undefined,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_reclaimed() {
        let mut registry = TextureRegistry::new(16);
        let a = registry.acquire();
        let b = registry.acquire();
        assert_ne!(TextureRegistry::get_resident_id(a), TextureRegistry::get_resident_id(b));

        registry.remove(a);
        let c = registry.acquire();
        assert_eq!(TextureRegistry::get_resident_id(a), TextureRegistry::get_resident_id(c));
    }

    #[test]
    fn image_infos_follow_slot_assignment() {
        let mut registry = TextureRegistry::new(16);
        let a = registry.acquire();
        let image = Handle::from_parts(5, 1);
        registry.set_external_texture(a, image, gpu::ImageState::ShaderRead);

        let infos = registry.image_infos();
        assert_eq!(infos[TextureRegistry::get_resident_id(a) as usize].image, image);
    }
}
