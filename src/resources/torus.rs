//! Procedural torus mesh

use std::f32::consts::TAU;

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};

use crate::backend::{
    BackendResult, BufferDescriptor, BufferHandle, BufferUsage, GraphicsBackend, IndexFormat,
    VertexAttribute, VertexBufferLayout, VertexFormat, VertexStepMode,
};

/// Whether the CPU and GPU geometry matches the current parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryState {
    Clean,
    Stale,
}

/// Full set of attributes of a torus surface point.
///
/// Only position and normal reach the GPU; the rest are derived for
/// completeness of the parametrization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TorusVertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
    pub tangent: Vec3,
    pub binormal: Vec3,
}

/// Interleaved vertex as uploaded to the vertex buffer
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
}

/// Torus around the Y axis, tessellated into `n` latitude and `m` longitude bands
#[derive(Debug)]
pub struct Torus {
    n: u32,
    m: u32,
    inner_radius: f32,
    outer_radius: f32,
    position_location: u32,
    normal_location: u32,
    state: GeometryState,
    vertices: Vec<GpuVertex>,
    indices: Vec<u32>,
    vertex_buffer: Option<BufferHandle>,
    index_buffer: Option<BufferHandle>,
    /// Index count of the buffer currently bound, not of the current parameters
    uploaded_index_count: u32,
    rebuild_count: u32,
}

impl Default for Torus {
    fn default() -> Self {
        Self::new()
    }
}

impl Torus {
    pub const MIN_TESSELLATION: u32 = 3;

    pub fn new() -> Self {
        Self {
            n: 8,
            m: 8,
            inner_radius: 0.8,
            outer_radius: 0.2,
            position_location: 0,
            normal_location: 1,
            state: GeometryState::Stale,
            vertices: Vec::new(),
            indices: Vec::new(),
            vertex_buffer: None,
            index_buffer: None,
            uploaded_index_count: 0,
            rebuild_count: 0,
        }
    }

    /// Change tessellation keeping the current radii
    pub fn set_tessellation(&mut self, n: u32, m: u32) {
        self.set_tessellation_with_radii(n, m, self.inner_radius, self.outer_radius);
    }

    pub fn set_tessellation_with_radii(&mut self, n: u32, m: u32, inner: f32, outer: f32) {
        let n = n.max(Self::MIN_TESSELLATION);
        let m = m.max(Self::MIN_TESSELLATION);
        let inner = inner.max(0.0);

        if n == self.n && m == self.m && inner == self.inner_radius && outer == self.outer_radius {
            return;
        }

        self.n = n;
        self.m = m;
        self.inner_radius = inner;
        self.outer_radius = outer;
        self.state = GeometryState::Stale;
    }

    /// Set the shader input locations fed by the position and normal attributes
    pub fn set_vertex_attribute_locations(&mut self, position: u32, normal: u32) {
        if position == self.position_location && normal == self.normal_location {
            return;
        }
        self.position_location = position;
        self.normal_location = normal;
        self.state = GeometryState::Stale;
    }

    pub fn tessellation_n(&self) -> u32 {
        self.n
    }

    pub fn tessellation_m(&self) -> u32 {
        self.m
    }

    pub fn vertex_count(&self) -> u32 {
        (self.n + 1) * (self.m + 1)
    }

    pub fn index_count(&self) -> u32 {
        6 * self.n * self.m
    }

    pub fn triangle_count(&self) -> u32 {
        2 * self.n * self.m
    }

    pub fn state(&self) -> GeometryState {
        self.state
    }

    /// Number of times the geometry has been regenerated
    pub fn rebuild_count(&self) -> u32 {
        self.rebuild_count
    }

    pub fn vertices(&self) -> &[GpuVertex] {
        &self.vertices
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    /// Vertex input layout matching the interleaved buffer
    pub fn vertex_layout(&self) -> VertexBufferLayout {
        VertexBufferLayout {
            array_stride: std::mem::size_of::<GpuVertex>() as u64,
            step_mode: VertexStepMode::Vertex,
            attributes: vec![
                VertexAttribute {
                    location: self.position_location,
                    format: VertexFormat::Float32x3,
                    offset: 0,
                },
                VertexAttribute {
                    location: self.normal_location,
                    format: VertexFormat::Float32x3,
                    offset: 12,
                },
            ],
        }
    }

    /// Evaluate the surface at grid point (`lat`, `lon`)
    pub fn vertex(&self, lat: u32, lon: u32) -> TorusVertex {
        let theta = lat as f32 * TAU / self.n as f32;
        let phi = lon as f32 * TAU / self.m as f32;
        let (sin_theta, cos_theta) = theta.sin_cos();
        let (sin_phi, cos_phi) = phi.sin_cos();
        let r = self.inner_radius + self.outer_radius * cos_theta;

        let position = Vec3::new(r * cos_phi, self.outer_radius * sin_theta, -r * sin_phi);
        let normal = Vec3::new(cos_phi * cos_theta, sin_theta, -sin_phi * cos_theta);
        let tangent = Vec3::new(-sin_phi, 0.0, -cos_phi);
        let binormal = normal.cross(tangent);

        TorusVertex {
            position,
            normal,
            uv: Vec2::new(lon as f32 / self.m as f32, lat as f32 / self.n as f32),
            tangent,
            binormal,
        }
    }

    fn rebuild(&mut self) {
        let row = self.m + 1;

        self.vertices.clear();
        self.vertices.reserve(self.vertex_count() as usize);
        for lat in 0..=self.n {
            for lon in 0..=self.m {
                let v = self.vertex(lat, lon);
                self.vertices.push(GpuVertex {
                    position: v.position.to_array(),
                    normal: v.normal.to_array(),
                });
            }
        }

        self.indices.clear();
        self.indices.reserve(self.index_count() as usize);
        for lat in 0..self.n {
            for lon in 0..self.m {
                let ll = lat * row + lon;
                let lr = ll + 1;
                let ul = ll + row;
                let ur = ul + 1;
                self.indices.extend_from_slice(&[ll, lr, ul, ul, lr, ur]);
            }
        }

        self.rebuild_count += 1;
        log::debug!(
            "Torus rebuilt: {}x{} ({} vertices, {} triangles)",
            self.n,
            self.m,
            self.vertices.len(),
            self.triangle_count()
        );
    }

    /// Regenerate stale geometry and bind vertex and index buffers
    pub fn set_buffer_state(&mut self, backend: &mut dyn GraphicsBackend) -> BackendResult<()> {
        if self.state == GeometryState::Stale || self.vertex_buffer.is_none() {
            self.rebuild();
            self.release_buffers(backend);

            let vertex_bytes: &[u8] = bytemuck::cast_slice(&self.vertices);
            let vertex_buffer = backend.create_buffer_init(
                &BufferDescriptor {
                    label: Some("Torus Vertex Buffer".into()),
                    size: vertex_bytes.len() as u64,
                    usage: BufferUsage::VERTEX | BufferUsage::COPY_DST,
                },
                vertex_bytes,
            )?;

            let index_bytes: &[u8] = bytemuck::cast_slice(&self.indices);
            let index_buffer = match backend.create_buffer_init(
                &BufferDescriptor {
                    label: Some("Torus Index Buffer".into()),
                    size: index_bytes.len() as u64,
                    usage: BufferUsage::INDEX | BufferUsage::COPY_DST,
                },
                index_bytes,
            ) {
                Ok(buffer) => buffer,
                Err(e) => {
                    backend.destroy_buffer(vertex_buffer);
                    return Err(e);
                }
            };

            self.vertex_buffer = Some(vertex_buffer);
            self.index_buffer = Some(index_buffer);
            self.uploaded_index_count = self.indices.len() as u32;
            self.state = GeometryState::Clean;
        }

        if let (Some(vertex_buffer), Some(index_buffer)) = (self.vertex_buffer, self.index_buffer) {
            let layout = self.vertex_layout();
            backend.set_vertex_buffer(0, vertex_buffer, &layout);
            backend.set_index_buffer(index_buffer, IndexFormat::Uint32);
        }
        Ok(())
    }

    /// Unbind vertex input state
    pub fn unset_buffer_state(&self, backend: &mut dyn GraphicsBackend) {
        backend.clear_vertex_buffers();
    }

    pub fn draw(&self, backend: &mut dyn GraphicsBackend) {
        if self.index_buffer.is_none() {
            log::warn!("Torus::draw called before set_buffer_state");
            return;
        }
        backend.draw_indexed(0..self.uploaded_index_count, 0, 0..1);
    }

    /// Release GPU buffers. The next `set_buffer_state` uploads again.
    pub fn destroy(&mut self, backend: &mut dyn GraphicsBackend) {
        self.release_buffers(backend);
        self.state = GeometryState::Stale;
    }

    fn release_buffers(&mut self, backend: &mut dyn GraphicsBackend) {
        if let Some(buffer) = self.vertex_buffer.take() {
            backend.destroy_buffer(buffer);
        }
        if let Some(buffer) = self.index_buffer.take() {
            backend.destroy_buffer(buffer);
        }
        self.uploaded_index_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Command, RecordingBackend};
    use rstest::rstest;

    #[rstest]
    #[case::minimal(3, 3)]
    #[case::default(8, 8)]
    #[case::uneven(5, 17)]
    #[case::dense(64, 64)]
    fn test_counts_match_generated_data(#[case] n: u32, #[case] m: u32) {
        let mut backend = RecordingBackend::new(64, 64);
        let mut torus = Torus::new();
        torus.set_tessellation(n, m);
        torus.set_buffer_state(&mut backend).unwrap();

        assert_eq!(torus.vertex_count(), (n + 1) * (m + 1));
        assert_eq!(torus.index_count(), 6 * n * m);
        assert_eq!(torus.triangle_count(), 2 * n * m);
        assert_eq!(torus.vertices().len() as u32, torus.vertex_count());
        assert_eq!(torus.indices().len() as u32, torus.index_count());
        assert!(torus.indices().iter().all(|&i| i < torus.vertex_count()));
    }

    #[test]
    fn test_identical_tessellation_rebuilds_once() {
        let mut backend = RecordingBackend::new(64, 64);
        let mut torus = Torus::new();

        torus.set_tessellation(12, 10);
        torus.set_buffer_state(&mut backend).unwrap();
        torus.set_tessellation(12, 10);
        torus.set_buffer_state(&mut backend).unwrap();

        assert_eq!(torus.rebuild_count(), 1);
        assert_eq!(torus.state(), GeometryState::Clean);
    }

    #[test]
    fn test_tessellation_is_clamped() {
        let mut torus = Torus::new();
        torus.set_tessellation_with_radii(0, 1, -2.0, 0.3);
        assert_eq!(torus.tessellation_n(), 3);
        assert_eq!(torus.tessellation_m(), 3);
        assert_eq!(torus.vertex(0, 0).position, Vec3::new(0.3, 0.0, 0.0));
    }

    #[test]
    fn test_attribute_slot_change_invalidates() {
        let mut backend = RecordingBackend::new(64, 64);
        let mut torus = Torus::new();
        torus.set_buffer_state(&mut backend).unwrap();

        torus.set_vertex_attribute_locations(0, 1);
        assert_eq!(torus.state(), GeometryState::Clean);

        torus.set_vertex_attribute_locations(2, 3);
        assert_eq!(torus.state(), GeometryState::Stale);
        let layout = torus.vertex_layout();
        assert_eq!(layout.attributes[0].location, 2);
        assert_eq!(layout.attributes[1].location, 3);
        assert_eq!(layout.array_stride, 24);
    }

    #[test]
    fn test_surface_points() {
        let torus = Torus::new();

        let outer_equator = torus.vertex(0, 0);
        assert!((outer_equator.position - Vec3::new(1.0, 0.0, 0.0)).length() < 1e-6);
        assert!((outer_equator.normal - Vec3::X).length() < 1e-6);

        // Quarter turn in longitude moves to -Z
        let quarter = torus.vertex(0, 2);
        assert!((quarter.position - Vec3::new(0.0, 0.0, -1.0)).length() < 1e-6);

        // Top of the tube
        let top = torus.vertex(2, 0);
        assert!((top.position - Vec3::new(0.8, 0.2, 0.0)).length() < 1e-6);
        assert!((top.normal - Vec3::Y).length() < 1e-6);
        assert_eq!(top.uv, Vec2::new(0.0, 0.25));
    }

    #[test]
    fn test_first_cell_winding() {
        let mut backend = RecordingBackend::new(64, 64);
        let mut torus = Torus::new();
        torus.set_buffer_state(&mut backend).unwrap();
        // Row stride is m + 1 = 9
        assert_eq!(&torus.indices()[..6], &[0, 1, 9, 9, 1, 10]);
    }

    #[test]
    fn test_rebuild_replaces_buffers() {
        let mut backend = RecordingBackend::new(64, 64);
        let mut torus = Torus::new();
        torus.set_buffer_state(&mut backend).unwrap();
        torus.set_tessellation(16, 16);
        torus.set_buffer_state(&mut backend).unwrap();

        assert_eq!(backend.count(|c| matches!(c, Command::DestroyBuffer(_))), 2);
        assert_eq!(backend.live_buffer_count(), 2);

        torus.draw(&mut backend);
        assert!(matches!(
            backend.commands().last(),
            Some(Command::DrawIndexed { index_count: 1536, instance_count: 1 })
        ));

        torus.destroy(&mut backend);
        assert_eq!(backend.live_buffer_count(), 0);
    }

    #[test]
    fn test_draw_uses_uploaded_indices_until_next_upload() {
        let mut backend = RecordingBackend::new(64, 64);
        let mut torus = Torus::new();
        torus.set_buffer_state(&mut backend).unwrap();
        let uploaded = torus.indices().len() as u32;

        torus.set_tessellation(16, 16);
        torus.draw(&mut backend);
        assert!(matches!(
            backend.commands().last(),
            Some(&Command::DrawIndexed { index_count, .. }) if index_count == uploaded
        ));
        assert_eq!(uploaded, 384);

        torus.set_buffer_state(&mut backend).unwrap();
        torus.draw(&mut backend);
        assert!(matches!(
            backend.commands().last(),
            Some(Command::DrawIndexed { index_count: 1536, .. })
        ));
    }
}
