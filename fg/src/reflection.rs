use anyhow::{anyhow, bail, Result};
use byte_slice_cast::AsByteSlice;
use gpu_core::{self as gpu, ShaderStage, ShaderStageFlags};

/// Set 0 carries the pipeline-specific resources; sets 1 and 2 are the
/// immutable samplers and the bindless image array (see pass manager).
pub const PIPELINE_DESCRIPTOR_SET: u32 = 0;
pub const SAMPLERS_DESCRIPTOR_SET: u32 = 1;
pub const BINDLESS_TEXTURES_DESCRIPTOR_SET: u32 = 2;
pub const SAMPLERS_BINDING: u32 = 32;
pub const BINDLESS_TEXTURES_BINDING: u32 = 33;

/// Push constant member recognised through reflection and patched per draw.
pub const INSTANCE_TABLE_ID_MEMBER: &str = "instanceTableId";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResourceKind {
    VertexStageInput,
    UniformBuffer,
    StorageBuffer,
    SampledImage,
    SeparateImage,
    StorageImage,
    AccelerationStructure,
}

#[derive(Clone, Debug)]
pub struct ShaderResource {
    pub name: String,
    pub location: u32,
    pub binding: u32,
    pub kind: ResourceKind,
    pub stages: ShaderStageFlags,
    pub read_only: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct PushConstantReflection {
    pub stages: ShaderStageFlags,
    pub size: u32,
    pub instance_table_id_offset: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct DescriptorBinding {
    pub name: String,
    pub binding: u32,
    pub kind: gpu::DescriptorKind,
    pub stages: ShaderStageFlags,
    pub read_only: bool,
}

impl Default for PushConstantReflection {
    fn default() -> Self {
        Self {
            stages: ShaderStageFlags::empty(),
            size: 0,
            instance_table_id_offset: None,
        }
    }
}

/// Accumulated reflection of every stage of one pipeline.
#[derive(Default)]
pub struct PipelineReflection {
    pub resources: Vec<ShaderResource>,
    pub push_constants: Option<PushConstantReflection>,
    pub vertex_bindings: Vec<gpu::VertexBindingDesc>,
    pub vertex_attributes: Vec<gpu::VertexAttributeDesc>,
    pub requires_bindless: bool,
    pub compute_local_size: Option<[u32; 3]>,
}

fn stage_flags(stage: ShaderStage) -> ShaderStageFlags {
    stage.flags()
}

fn vertex_input_format(scalar_width: u32, components: u32) -> Option<gpu::Format> {
    match (scalar_width, components.max(1)) {
        (32, 1) => Some(gpu::Format::R32Sfloat),
        (32, 2) => Some(gpu::Format::Rg32Sfloat),
        (32, 3) => Some(gpu::Format::Rgb32Sfloat),
        (32, 4) => Some(gpu::Format::Rgba32Sfloat),
        _ => None,
    }
}

impl PipelineReflection {
    /// Reflects one stage's SPIR-V and folds it into the pipeline-wide view.
    pub fn add_stage(&mut self, spirv: &[u32], stage: ShaderStage) -> Result<()> {
        let module = spirv_reflect::ShaderModule::load_u8_data(spirv.as_byte_slice())
            .map_err(|err| anyhow!("SPIR-V reflection error: {}", err))?;

        let flags = stage_flags(stage);

        if stage == ShaderStage::Vertex {
            self.reflect_vertex_inputs(&module, flags)?;
        }

        if stage == ShaderStage::Compute {
            self.compute_local_size = Some(get_compute_local_size(spirv)?);
        }

        let bindings = module
            .enumerate_descriptor_bindings(None)
            .map_err(|err| anyhow!("SPIR-V reflection error: {}", err))?;

        for binding in &bindings {
            use spirv_reflect::types::ReflectDescriptorType as Dt;

            if binding.set == BINDLESS_TEXTURES_DESCRIPTOR_SET {
                self.requires_bindless = true;
                continue;
            }

            if binding.set != PIPELINE_DESCRIPTOR_SET {
                continue;
            }

            let kind = match binding.descriptor_type {
                Dt::UniformBuffer => ResourceKind::UniformBuffer,
                Dt::StorageBuffer => ResourceKind::StorageBuffer,
                Dt::StorageImage => ResourceKind::StorageImage,
                Dt::CombinedImageSampler => ResourceKind::SampledImage,
                Dt::SampledImage => ResourceKind::SeparateImage,
                Dt::AccelerationStructureNV => ResourceKind::AccelerationStructure,
                _ => continue,
            };

            let read_only = match kind {
                ResourceKind::UniformBuffer
                | ResourceKind::SampledImage
                | ResourceKind::SeparateImage
                | ResourceKind::AccelerationStructure => true,
                ResourceKind::StorageBuffer | ResourceKind::StorageImage => {
                    // SRV vs UAV distinction as reported by the reflector.
                    binding.resource_type
                        == spirv_reflect::types::ReflectResourceType::ShaderResourceView
                }
                ResourceKind::VertexStageInput => false,
            };

            self.resources.push(ShaderResource {
                name: binding.name.clone(),
                location: 0,
                binding: binding.binding,
                kind,
                stages: flags,
                read_only,
            });
        }

        let push_constants = module
            .enumerate_push_constant_blocks(None)
            .map_err(|err| anyhow!("SPIR-V reflection error: {}", err))?;

        for block in &push_constants {
            let entry = self.push_constants.get_or_insert_with(Default::default);
            entry.stages |= flags;
            entry.size = entry.size.max(block.size);

            for member in &block.members {
                if member.name == INSTANCE_TABLE_ID_MEMBER {
                    entry.instance_table_id_offset = Some(member.absolute_offset);
                }
            }
        }

        Ok(())
    }

    fn reflect_vertex_inputs(
        &mut self,
        module: &spirv_reflect::ShaderModule,
        flags: ShaderStageFlags,
    ) -> Result<()> {
        let inputs = module
            .enumerate_input_variables(None)
            .map_err(|err| anyhow!("SPIR-V reflection error: {}", err))?;

        let mut attribute_index = self.vertex_attributes.len() as u32;

        for input in &inputs {
            // Built-ins (gl_VertexIndex etc.) have no application location.
            if input.location == !0u32 || input.name.starts_with("gl_") {
                continue;
            }

            let components = input.numeric.vector.component_count.max(1);
            let columns = input.numeric.matrix.column_count.max(1);
            let scalar_width = input.numeric.scalar.width.max(32);

            let format = vertex_input_format(scalar_width, components)
                .ok_or_else(|| anyhow!("unsupported vertex input type for {}", input.name))?;

            // One binding per attribute, in declaration order.
            let stride = (scalar_width / 8) * components * columns;

            self.resources.push(ShaderResource {
                name: input.name.clone(),
                location: input.location,
                binding: attribute_index,
                kind: ResourceKind::VertexStageInput,
                stages: flags,
                read_only: true,
            });

            self.vertex_bindings.push(gpu::VertexBindingDesc {
                binding: attribute_index,
                stride,
            });

            self.vertex_attributes.push(gpu::VertexAttributeDesc {
                location: input.location,
                binding: attribute_index,
                format,
                offset: 0,
            });

            attribute_index += 1;
        }

        Ok(())
    }

    /// Merges per-stage resources into the set-0 descriptor binding list.
    ///
    /// Resources identical in (kind, binding, location) across stages merge
    /// by OR-ing stage flags and AND-ing read-only; two distinct resources
    /// colliding on one binding abort the pipeline with both names.
    pub fn build_descriptor_bindings(&mut self, label: &str) -> Result<Vec<DescriptorBinding>> {
        self.resources
            .sort_by(|a, b| (a.kind, a.binding, a.location).cmp(&(b.kind, b.binding, b.location)));

        let mut merged: Vec<ShaderResource> = Vec::with_capacity(self.resources.len());

        for resource in &self.resources {
            match merged.last_mut() {
                Some(last)
                    if (last.kind, last.binding, last.location)
                        == (resource.kind, resource.binding, resource.location) =>
                {
                    last.stages |= resource.stages;
                    last.read_only &= resource.read_only;
                }
                _ => merged.push(resource.clone()),
            }
        }

        let mut bindings = Vec::with_capacity(merged.len());
        let mut seen: std::collections::HashMap<u32, String> = Default::default();

        for resource in &merged {
            let kind = match resource.kind {
                ResourceKind::VertexStageInput => continue,
                ResourceKind::UniformBuffer => gpu::DescriptorKind::UniformBuffer,
                ResourceKind::StorageBuffer => gpu::DescriptorKind::StorageBuffer,
                ResourceKind::StorageImage => gpu::DescriptorKind::StorageImage,
                ResourceKind::SampledImage => gpu::DescriptorKind::CombinedImageSampler,
                ResourceKind::SeparateImage => gpu::DescriptorKind::SampledImage,
                ResourceKind::AccelerationStructure => gpu::DescriptorKind::AccelerationStructure,
            };

            if let Some(previous) = seen.get(&resource.binding) {
                if previous != &resource.name {
                    bail!(
                        "shader binding collision while compiling {}: {} and {} both use binding {}",
                        label,
                        previous,
                        resource.name,
                        resource.binding
                    );
                }
                continue;
            }
            seen.insert(resource.binding, resource.name.clone());

            bindings.push(DescriptorBinding {
                name: resource.name.clone(),
                binding: resource.binding,
                kind,
                stages: resource.stages,
                read_only: resource.read_only,
            });
        }

        Ok(bindings)
    }
}

/// Parses the `LocalSize` execution mode out of a compute module.
pub fn get_compute_local_size(spirv: &[u32]) -> Result<[u32; 3]> {
    let mut loader = rspirv::dr::Loader::new();
    rspirv::binary::parse_words(spirv, &mut loader).map_err(|err| anyhow!("{:?}", err))?;
    let module = loader.module();

    for inst in &module.execution_modes {
        if inst.class.opcode != rspirv::spirv::Op::ExecutionMode {
            continue;
        }

        if let rspirv::dr::Operand::ExecutionMode(mode) = &inst.operands[1] {
            if *mode != rspirv::spirv::ExecutionMode::LocalSize {
                continue;
            }

            use rspirv::dr::Operand::LiteralInt32;
            if let (&LiteralInt32(x), &LiteralInt32(y), &LiteralInt32(z)) =
                (&inst.operands[2], &inst.operands[3], &inst.operands[4])
            {
                return Ok([x, y, z]);
            }

            bail!("could not parse the LocalSize execution mode");
        }
    }

    Err(anyhow!("no LocalSize execution mode in compute module"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(kind: ResourceKind, binding: u32, name: &str, stages: ShaderStageFlags, read_only: bool) -> ShaderResource {
        ShaderResource {
            name: name.to_owned(),
            location: 0,
            binding,
            kind,
            stages,
            read_only,
        }
    }

    #[test]
    fn stages_merge_for_identical_resources() {
        let mut reflection = PipelineReflection::default();
        reflection.resources.push(resource(
            ResourceKind::StorageBuffer,
            0,
            "b_Instances",
            ShaderStageFlags::VERTEX,
            true,
        ));
        reflection.resources.push(resource(
            ResourceKind::StorageBuffer,
            0,
            "b_Instances",
            ShaderStageFlags::FRAGMENT,
            false,
        ));

        let bindings = reflection.build_descriptor_bindings("test").unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(
            bindings[0].stages,
            ShaderStageFlags::VERTEX | ShaderStageFlags::FRAGMENT
        );
        // Writable in any stage makes the merged binding writable.
        assert!(!bindings[0].read_only);
    }

    #[test]
    fn binding_collisions_are_reported_with_both_names() {
        let mut reflection = PipelineReflection::default();
        reflection.resources.push(resource(
            ResourceKind::StorageBuffer,
            3,
            "b_First",
            ShaderStageFlags::COMPUTE,
            true,
        ));
        reflection.resources.push(resource(
            ResourceKind::StorageBuffer,
            3,
            "b_Second",
            ShaderStageFlags::COMPUTE,
            true,
        ));

        let err = reflection.build_descriptor_bindings("collide").unwrap_err();
        let message = format!("{}", err);
        assert!(message.contains("b_First") && message.contains("b_Second"));
    }

    #[test]
    fn vertex_inputs_do_not_become_descriptors() {
        let mut reflection = PipelineReflection::default();
        reflection.resources.push(resource(
            ResourceKind::VertexStageInput,
            0,
            "in_Position",
            ShaderStageFlags::VERTEX,
            true,
        ));
        reflection.resources.push(resource(
            ResourceKind::UniformBuffer,
            0,
            "b_Camera",
            ShaderStageFlags::VERTEX,
            true,
        ));

        let bindings = reflection.build_descriptor_bindings("test").unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].name, "b_Camera");
    }
}
