use gpu_core::{self as gpu, Handle};
use std::collections::HashMap;

/// Tracks the current layout/stage of every image touched during execute,
/// so per-pass transitions respect externally modified layouts.
#[derive(Default)]
pub(crate) struct ImageStateTracker {
    states: HashMap<Handle<gpu::Image>, (gpu::PipelineStages, gpu::ImageState)>,
}

impl ImageStateTracker {
    pub fn add_tracking(
        &mut self,
        image: Handle<gpu::Image>,
        stages: gpu::PipelineStages,
        state: gpu::ImageState,
    ) {
        self.states.insert(image, (stages, state));
    }

    pub fn try_get_state(&self, image: Handle<gpu::Image>) -> Option<gpu::ImageState> {
        self.states.get(&image).map(|(_, state)| *state)
    }

    /// Records a transition into `new_state`; returns the barrier to emit,
    /// or `None` when the image is already in that state (the stages merge
    /// into the tracking instead).
    pub fn add_transition(
        &mut self,
        image: Handle<gpu::Image>,
        stages: gpu::PipelineStages,
        new_state: gpu::ImageState,
    ) -> Option<gpu::ImageTransition> {
        let entry = self
            .states
            .entry(image)
            .or_insert((gpu::PipelineStages::TOP_OF_PIPE, gpu::ImageState::Undefined));

        let (previous_stages, previous_state) = *entry;

        if previous_state == new_state {
            entry.0 |= stages;
            return None;
        }

        *entry = (stages, new_state);

        Some(gpu::ImageTransition {
            image,
            previous_pipelines: previous_stages,
            next_pipelines: stages,
            previous_state,
            next_state: new_state,
        })
    }

    pub fn final_states(
        &self,
    ) -> impl Iterator<Item = (Handle<gpu::Image>, gpu::PipelineStages, gpu::ImageState)> + '_ {
        self.states
            .iter()
            .map(|(image, (stages, state))| (*image, *stages, *state))
    }
}
