//! Common types shared between backends

/// Texture format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    Depth24PlusStencil8,
    /// Single channel unsigned byte, used for shading rate images
    R8Uint,
}

impl TextureFormat {
    pub fn is_depth(&self) -> bool {
        matches!(self, TextureFormat::Depth24PlusStencil8)
    }

    pub fn has_stencil(&self) -> bool {
        matches!(self, TextureFormat::Depth24PlusStencil8)
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8UnormSrgb
            | TextureFormat::Bgra8Unorm
            | TextureFormat::Bgra8UnormSrgb
            | TextureFormat::Depth24PlusStencil8 => 4,
            TextureFormat::R8Uint => 1,
        }
    }
}

/// Texture usage flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureUsage(u32);

impl TextureUsage {
    pub const COPY_SRC: Self = Self(1 << 0);
    pub const COPY_DST: Self = Self(1 << 1);
    pub const TEXTURE_BINDING: Self = Self(1 << 2);
    pub const RENDER_ATTACHMENT: Self = Self(1 << 3);
    /// Texture can be bound as a shading rate image
    pub const SHADING_RATE: Self = Self(1 << 4);

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for TextureUsage {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Buffer usage flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferUsage(u32);

impl BufferUsage {
    pub const COPY_SRC: Self = Self(1 << 0);
    pub const COPY_DST: Self = Self(1 << 1);
    pub const INDEX: Self = Self(1 << 2);
    pub const VERTEX: Self = Self(1 << 3);
    pub const UNIFORM: Self = Self(1 << 4);

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for BufferUsage {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Texture descriptor
#[derive(Debug, Clone)]
pub struct TextureDescriptor {
    pub label: Option<String>,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            width: 1,
            height: 1,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
        }
    }
}

/// Buffer descriptor
#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    pub label: Option<String>,
    pub size: u64,
    pub usage: BufferUsage,
}

/// Vertex attribute format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Float32x2,
    Float32x3,
    Float32x4,
}

impl VertexFormat {
    pub fn size(&self) -> u64 {
        match self {
            VertexFormat::Float32x2 => 8,
            VertexFormat::Float32x3 => 12,
            VertexFormat::Float32x4 => 16,
        }
    }
}

/// Vertex attribute description
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u64,
}

/// Vertex buffer layout
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VertexBufferLayout {
    pub array_stride: u64,
    pub step_mode: VertexStepMode,
    pub attributes: Vec<VertexAttribute>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexStepMode {
    Vertex,
    Instance,
}

/// Index format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

/// Front face winding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrontFace {
    Ccw,
    Cw,
}

/// Cull mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CullMode {
    None,
    Front,
    Back,
}

/// Compare function for depth/stencil
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareFunction {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

/// Shader stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

/// Shading invocation density a palette entry maps a rate class to.
///
/// Only the densities the demo programs are listed; coarser anisotropic
/// rates of the hardware are not used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShadingRate {
    /// Fragments in the tile are not shaded at all
    NoInvocations,
    OneInvocationPerPixel,
    OneInvocationPer2x2Pixels,
    OneInvocationPer4x4Pixels,
}

impl ShadingRate {
    /// Short label used in logs and the UI
    pub fn label(&self) -> &'static str {
        match self {
            ShadingRate::NoInvocations => "none",
            ShadingRate::OneInvocationPerPixel => "1x1",
            ShadingRate::OneInvocationPer2x2Pixels => "2x2",
            ShadingRate::OneInvocationPer4x4Pixels => "4x4",
        }
    }
}

/// Hardware limits of the shading rate image path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadingRateProperties {
    /// Width in pixels covered by one texel of the rate image
    pub tile_width: u32,
    /// Height in pixels covered by one texel of the rate image
    pub tile_height: u32,
    /// Number of entries in each viewport palette
    pub palette_size: u32,
}

impl Default for ShadingRateProperties {
    fn default() -> Self {
        Self {
            tile_width: 16,
            tile_height: 16,
            palette_size: 16,
        }
    }
}

impl std::str::FromStr for ShadingRate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(ShadingRate::NoInvocations),
            "1x1" => Ok(ShadingRate::OneInvocationPerPixel),
            "2x2" => Ok(ShadingRate::OneInvocationPer2x2Pixels),
            "4x4" => Ok(ShadingRate::OneInvocationPer4x4Pixels),
            other => Err(format!("unknown shading rate '{}', expected none, 1x1, 2x2 or 4x4", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_usage_flags_are_distinct() {
        let vertex = BufferUsage::VERTEX | BufferUsage::COPY_DST;
        assert!(vertex.contains(BufferUsage::VERTEX));
        assert!(vertex.contains(BufferUsage::COPY_DST));
        assert!(!vertex.contains(BufferUsage::COPY_SRC));
        assert!(!vertex.contains(BufferUsage::INDEX));
        assert!(!BufferUsage::UNIFORM.contains(BufferUsage::VERTEX));
    }
}
