//! Shader compilation, program layouts and graphics pipeline creation

use std::ffi::CString;

use ash::vk;

use crate::backend::traits::{BackendError, BackendResult, ProgramDescriptor};
use crate::backend::types::*;

/// Compile WGSL to a Vulkan shader module through naga
pub(crate) fn compile_shader(
    device: &ash::Device,
    source: &str,
    stage: ShaderStage,
    entry_point: &str,
) -> BackendResult<vk::ShaderModule> {
    let module = naga::front::wgsl::parse_str(source).map_err(|e| {
        BackendError::ShaderCreationFailed(format!("WGSL parse error: {}", e.emit_to_string(source)))
    })?;

    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    let info = validator
        .validate(&module)
        .map_err(|e| BackendError::ShaderCreationFailed(format!("Validation error: {}", e)))?;

    let naga_stage = match stage {
        ShaderStage::Vertex => naga::ShaderStage::Vertex,
        ShaderStage::Fragment => naga::ShaderStage::Fragment,
    };

    if !module
        .entry_points
        .iter()
        .any(|ep| ep.name == entry_point && ep.stage == naga_stage)
    {
        return Err(BackendError::ShaderCreationFailed(format!(
            "Entry point '{}' not found for stage {:?}",
            entry_point, stage
        )));
    }

    let options = naga::back::spv::Options {
        lang_version: (1, 3),
        flags: naga::back::spv::WriterFlags::empty(),
        capabilities: None,
        bounds_check_policies: naga::proc::BoundsCheckPolicies::default(),
        binding_map: Default::default(),
        debug_info: None,
        zero_initialize_workgroup_memory: naga::back::spv::ZeroInitializeWorkgroupMemoryMode::None,
    };
    let pipeline_options = naga::back::spv::PipelineOptions {
        shader_stage: naga_stage,
        entry_point: entry_point.to_string(),
    };

    let spv = naga::back::spv::write_vec(&module, &info, &options, Some(&pipeline_options))
        .map_err(|e| BackendError::ShaderCreationFailed(format!("SPIR-V generation error: {}", e)))?;

    let create_info = vk::ShaderModuleCreateInfo::default().code(&spv);
    unsafe { device.create_shader_module(&create_info, None) }
        .map_err(|e| BackendError::ShaderCreationFailed(format!("vkCreateShaderModule: {:?}", e)))
}

/// A linked vertex + fragment program and its descriptor layout
pub(crate) struct VkProgram {
    pub vertex_module: vk::ShaderModule,
    pub fragment_module: vk::ShaderModule,
    pub vertex_entry: CString,
    pub fragment_entry: CString,
    pub set_layout: vk::DescriptorSetLayout,
    pub pipeline_layout: vk::PipelineLayout,
    /// Sorted, so dynamic offsets follow binding order
    pub uniform_bindings: Vec<u32>,
    pub rate_image_binding: Option<u32>,
    pub front_face: FrontFace,
    pub cull_mode: CullMode,
    pub depth_compare: CompareFunction,
}

impl VkProgram {
    pub fn create(device: &ash::Device, desc: &ProgramDescriptor) -> BackendResult<Self> {
        let vertex_entry = entry_name(&desc.vertex.entry_point)?;
        let fragment_entry = entry_name(&desc.fragment.entry_point)?;

        let vertex_module = compile_shader(
            device,
            &desc.vertex.source,
            ShaderStage::Vertex,
            &desc.vertex.entry_point,
        )?;
        let fragment_module = match compile_shader(
            device,
            &desc.fragment.source,
            ShaderStage::Fragment,
            &desc.fragment.entry_point,
        ) {
            Ok(module) => module,
            Err(e) => {
                unsafe { device.destroy_shader_module(vertex_module, None) };
                return Err(e);
            }
        };

        let mut uniform_bindings = desc.uniform_bindings.clone();
        uniform_bindings.sort_unstable();
        uniform_bindings.dedup();

        let mut bindings: Vec<vk::DescriptorSetLayoutBinding> = uniform_bindings
            .iter()
            .map(|&binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            })
            .collect();
        if let Some(binding) = desc.rate_image_binding {
            bindings.push(
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding)
                    .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::FRAGMENT),
            );
        }

        let destroy_modules = || unsafe {
            device.destroy_shader_module(vertex_module, None);
            device.destroy_shader_module(fragment_module, None);
        };

        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let set_layout = match unsafe { device.create_descriptor_set_layout(&layout_info, None) } {
            Ok(layout) => layout,
            Err(e) => {
                destroy_modules();
                return Err(BackendError::PipelineCreationFailed(format!(
                    "Failed to create descriptor set layout: {:?}",
                    e
                )));
            }
        };

        let set_layouts = [set_layout];
        let pipeline_layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        let pipeline_layout =
            match unsafe { device.create_pipeline_layout(&pipeline_layout_info, None) } {
                Ok(layout) => layout,
                Err(e) => {
                    unsafe { device.destroy_descriptor_set_layout(set_layout, None) };
                    destroy_modules();
                    return Err(BackendError::PipelineCreationFailed(format!(
                        "Failed to create pipeline layout: {:?}",
                        e
                    )));
                }
            };

        Ok(Self {
            vertex_module,
            fragment_module,
            vertex_entry,
            fragment_entry,
            set_layout,
            pipeline_layout,
            uniform_bindings,
            rate_image_binding: desc.rate_image_binding,
            front_face: desc.front_face,
            cull_mode: desc.cull_mode,
            depth_compare: desc.depth_compare,
        })
    }

    /// # Safety
    /// No pipeline created from this program may still be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_pipeline_layout(self.pipeline_layout, None);
        device.destroy_descriptor_set_layout(self.set_layout, None);
        device.destroy_shader_module(self.vertex_module, None);
        device.destroy_shader_module(self.fragment_module, None);
    }
}

fn entry_name(name: &str) -> BackendResult<CString> {
    CString::new(name).map_err(|e| {
        BackendError::ShaderCreationFailed(format!("Invalid entry point name '{}': {}", name, e))
    })
}

/// Everything a graphics pipeline depends on besides the program's own state
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct PipelineKey {
    pub program: u64,
    pub vertex_layouts: Vec<(u32, VertexBufferLayout)>,
    pub render_pass: vk::RenderPass,
    /// Shading rate image enable is baked into the viewport state
    pub shading_rate: bool,
}

pub(crate) fn create_graphics_pipeline(
    device: &ash::Device,
    program: &VkProgram,
    key: &PipelineKey,
) -> BackendResult<vk::Pipeline> {
    let stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(program.vertex_module)
            .name(&program.vertex_entry),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(program.fragment_module)
            .name(&program.fragment_entry),
    ];

    let binding_descriptions: Vec<vk::VertexInputBindingDescription> = key
        .vertex_layouts
        .iter()
        .map(|(slot, layout)| {
            vk::VertexInputBindingDescription::default()
                .binding(*slot)
                .stride(layout.array_stride as u32)
                .input_rate(match layout.step_mode {
                    VertexStepMode::Vertex => vk::VertexInputRate::VERTEX,
                    VertexStepMode::Instance => vk::VertexInputRate::INSTANCE,
                })
        })
        .collect();

    let attribute_descriptions: Vec<vk::VertexInputAttributeDescription> = key
        .vertex_layouts
        .iter()
        .flat_map(|(slot, layout)| {
            layout.attributes.iter().map(move |attr| {
                vk::VertexInputAttributeDescription::default()
                    .location(attr.location)
                    .binding(*slot)
                    .format(convert_vertex_format(attr.format))
                    .offset(attr.offset as u32)
            })
        })
        .collect();

    let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&binding_descriptions)
        .vertex_attribute_descriptions(&attribute_descriptions);

    let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    // Palettes are dynamic; only the enable and the viewport count are static
    let mut shading_rate_state = vk::PipelineViewportShadingRateImageStateCreateInfoNV {
        shading_rate_image_enable: vk::TRUE,
        viewport_count: 1,
        ..Default::default()
    };
    let mut viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);
    if key.shading_rate {
        viewport_state = viewport_state.push_next(&mut shading_rate_state);
    }

    let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(convert_cull_mode(program.cull_mode))
        .front_face(convert_front_face(program.front_face))
        .depth_bias_enable(false);

    let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(true)
        .depth_write_enable(true)
        .depth_compare_op(convert_compare_op(program.depth_compare))
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(false)];
    let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let mut dynamic_states = vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    if key.shading_rate {
        dynamic_states.push(vk::DynamicState::VIEWPORT_SHADING_RATE_PALETTE_NV);
    }
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stages)
        .vertex_input_state(&vertex_input_state)
        .input_assembly_state(&input_assembly_state)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization_state)
        .multisample_state(&multisample_state)
        .depth_stencil_state(&depth_stencil_state)
        .color_blend_state(&color_blend_state)
        .dynamic_state(&dynamic_state)
        .layout(program.pipeline_layout)
        .render_pass(key.render_pass)
        .subpass(0);

    let pipelines = unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    }
    .map_err(|(_, e)| {
        BackendError::PipelineCreationFailed(format!("Failed to create graphics pipeline: {:?}", e))
    })?;

    pipelines
        .into_iter()
        .next()
        .ok_or_else(|| BackendError::PipelineCreationFailed("No pipeline returned".into()))
}

pub(crate) fn convert_format(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::Rgba8UnormSrgb => vk::Format::R8G8B8A8_SRGB,
        TextureFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        TextureFormat::Bgra8UnormSrgb => vk::Format::B8G8R8A8_SRGB,
        TextureFormat::Depth24PlusStencil8 => vk::Format::D24_UNORM_S8_UINT,
        TextureFormat::R8Uint => vk::Format::R8_UINT,
    }
}

pub(crate) fn convert_shading_rate(rate: ShadingRate) -> vk::ShadingRatePaletteEntryNV {
    match rate {
        ShadingRate::NoInvocations => vk::ShadingRatePaletteEntryNV::NO_INVOCATIONS,
        ShadingRate::OneInvocationPerPixel => {
            vk::ShadingRatePaletteEntryNV::TYPE_1_INVOCATION_PER_PIXEL
        }
        ShadingRate::OneInvocationPer2x2Pixels => {
            vk::ShadingRatePaletteEntryNV::TYPE_1_INVOCATION_PER_2X2_PIXELS
        }
        ShadingRate::OneInvocationPer4x4Pixels => {
            vk::ShadingRatePaletteEntryNV::TYPE_1_INVOCATION_PER_4X4_PIXELS
        }
    }
}

fn convert_vertex_format(format: VertexFormat) -> vk::Format {
    match format {
        VertexFormat::Float32x2 => vk::Format::R32G32_SFLOAT,
        VertexFormat::Float32x3 => vk::Format::R32G32B32_SFLOAT,
        VertexFormat::Float32x4 => vk::Format::R32G32B32A32_SFLOAT,
    }
}

fn convert_cull_mode(mode: CullMode) -> vk::CullModeFlags {
    match mode {
        CullMode::None => vk::CullModeFlags::NONE,
        CullMode::Front => vk::CullModeFlags::FRONT,
        CullMode::Back => vk::CullModeFlags::BACK,
    }
}

// Viewports are flipped with a negative height, which keeps GL winding
fn convert_front_face(face: FrontFace) -> vk::FrontFace {
    match face {
        FrontFace::Ccw => vk::FrontFace::COUNTER_CLOCKWISE,
        FrontFace::Cw => vk::FrontFace::CLOCKWISE,
    }
}

fn convert_compare_op(func: CompareFunction) -> vk::CompareOp {
    match func {
        CompareFunction::Never => vk::CompareOp::NEVER,
        CompareFunction::Less => vk::CompareOp::LESS,
        CompareFunction::Equal => vk::CompareOp::EQUAL,
        CompareFunction::LessEqual => vk::CompareOp::LESS_OR_EQUAL,
        CompareFunction::Greater => vk::CompareOp::GREATER,
        CompareFunction::NotEqual => vk::CompareOp::NOT_EQUAL,
        CompareFunction::GreaterEqual => vk::CompareOp::GREATER_OR_EQUAL,
        CompareFunction::Always => vk::CompareOp::ALWAYS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ShadingRate::NoInvocations, vk::ShadingRatePaletteEntryNV::NO_INVOCATIONS)]
    #[case(
        ShadingRate::OneInvocationPerPixel,
        vk::ShadingRatePaletteEntryNV::TYPE_1_INVOCATION_PER_PIXEL
    )]
    #[case(
        ShadingRate::OneInvocationPer4x4Pixels,
        vk::ShadingRatePaletteEntryNV::TYPE_1_INVOCATION_PER_4X4_PIXELS
    )]
    fn test_shading_rate_entries(
        #[case] rate: ShadingRate,
        #[case] expected: vk::ShadingRatePaletteEntryNV,
    ) {
        assert_eq!(convert_shading_rate(rate), expected);
    }

    #[test]
    fn test_rate_image_format_is_single_byte() {
        assert_eq!(convert_format(TextureFormat::R8Uint), vk::Format::R8_UINT);
        assert_eq!(
            convert_format(TextureFormat::Depth24PlusStencil8),
            vk::Format::D24_UNORM_S8_UINT
        );
    }

    #[test]
    fn test_pipeline_key_distinguishes_shading_rate() {
        let key = PipelineKey {
            program: 1,
            vertex_layouts: Vec::new(),
            render_pass: vk::RenderPass::null(),
            shading_rate: true,
        };
        let other = PipelineKey {
            shading_rate: false,
            ..key.clone()
        };
        assert_ne!(key, other);
    }
}
