//! Placement and coloring of the torus instances

use glam::{Mat4, Vec3};

const RING_RADIUS_X: f32 = 1.0;
const RING_RADIUS_Y: f32 = 1.0;
const SPACING_X: f32 = 1.0;
const SPACING_Y: f32 = 1.5;

/// Grid the instances are laid out on, scaled to fit the view
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridLayout {
    pub num_x: u32,
    pub num_y: u32,
    /// Center of the first cell
    pub x0: f32,
    pub y0: f32,
    pub dx: f32,
    pub dy: f32,
    /// Uniform scale bringing the whole grid into view
    pub scale: f32,
}

impl GridLayout {
    /// Model matrix of the cell at `column`, `row`
    pub fn cell_transform(&self, column: u32, row: u32) -> Mat4 {
        let x = self.x0 + column as f32 * self.dx;
        let y = self.y0 + row as f32 * self.dy;
        let tilt = if column % 2 == 0 { 45.0f32 } else { -45.0f32 };

        Mat4::from_scale(Vec3::splat(self.scale))
            * Mat4::from_translation(Vec3::new(x, y, 0.0))
            * Mat4::from_rotation_x(tilt.to_radians())
    }
}

/// Smallest grid holding `count` instances with roughly the given aspect ratio.
///
/// `num_x * num_y >= count` holds for every `count`; the cell counts saturate
/// at `u32::MAX` for counts beyond what the demo ever draws.
pub fn grid_layout(count: u32, aspect: f32) -> GridLayout {
    let count = count.max(1);
    let aspect = if aspect.is_finite() && aspect > 0.0 { aspect } else { 1.0 };

    let num_x = ((count as f32 * aspect).sqrt().ceil() as u32).max(1);
    let mut num_y = (num_x as f32 / aspect).floor() as u32;
    let cells = |num_y: u32| num_x as u64 * num_y as u64;
    if cells(num_y) < count as u64 {
        num_y = num_y.saturating_add(1);
    }
    // f32 rounding can leave the grid short for very large counts
    if cells(num_y) < count as u64 {
        num_y = count.div_ceil(num_x);
    }

    let sx = (num_x - 1) as f32 * SPACING_X + 2.0 * RING_RADIUS_X;
    let sy = (num_y - 1) as f32 * SPACING_Y + 2.0 * RING_RADIUS_Y;

    GridLayout {
        num_x,
        num_y,
        x0: -sx / 2.0 + RING_RADIUS_X,
        y0: -sy / 2.0 + RING_RADIUS_Y,
        dx: SPACING_X,
        dy: SPACING_Y,
        scale: (1.0 / sx).min(1.0 / sy) * 0.8,
    }
}

/// Model matrices of the first `count` cells, row-major
pub fn instance_transforms(count: u32, aspect: f32) -> impl Iterator<Item = Mat4> {
    let layout = grid_layout(count, aspect);
    (0..layout.num_y)
        .flat_map(move |row| (0..layout.num_x).map(move |column| (column, row)))
        .take(count as usize)
        .map(move |(column, row)| layout.cell_transform(column, row))
}

/// Whether instance `index` is drawn green and may skip rate reduction
pub fn is_full_rate_candidate(index: u32) -> bool {
    index % 5 == 4
}

pub fn instance_color(index: u32) -> Vec3 {
    if is_full_rate_candidate(index) {
        Vec3::new(0.0, 1.0, 0.0)
    } else {
        Vec3::new(0.0, 0.7, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_sixteen_square() {
        let layout = grid_layout(16, 1.0);
        assert_eq!((layout.num_x, layout.num_y), (4, 4));
        // sx = 3 + 2 = 5, sy = 4.5 + 2 = 6.5
        assert_eq!(layout.x0, -1.5);
        assert_eq!(layout.y0, -2.25);
        assert!((layout.scale - 0.8 / 6.5).abs() < 1e-6);
    }

    #[rstest]
    fn test_grid_holds_every_instance(
        #[values(1, 2, 5, 16, 17, 100, 999, 1000)] count: u32,
        #[values(0.5, 1.0, 4.0 / 3.0, 16.0 / 9.0, 3.0)] aspect: f32,
    ) {
        let layout = grid_layout(count, aspect);
        assert!(layout.num_x * layout.num_y >= count);
        assert_eq!(instance_transforms(count, aspect).count(), count as usize);
    }

    #[rstest]
    fn test_huge_counts_do_not_overflow(
        #[values(u32::MAX, u32::MAX / 2, 1 << 20)] count: u32,
        #[values(0.5, 1.0, 3.0)] aspect: f32,
    ) {
        let layout = grid_layout(count, aspect);
        assert!(layout.num_x as u64 * layout.num_y as u64 >= count as u64);
    }

    #[test]
    fn test_columns_alternate_tilt() {
        let layout = grid_layout(4, 1.0);
        let up = Vec3::Y;
        let even = layout.cell_transform(0, 0).transform_vector3(up);
        let odd = layout.cell_transform(1, 0).transform_vector3(up);
        // Rotation about X tips +Y towards +Z for positive angles
        assert!(even.z > 0.0);
        assert!(odd.z < 0.0);
    }

    #[test]
    fn test_first_instance_sits_at_grid_origin() {
        let layout = grid_layout(16, 1.0);
        let first = instance_transforms(16, 1.0).next().unwrap();
        let origin = first.transform_point3(Vec3::ZERO);
        assert!(origin.abs_diff_eq(Vec3::new(layout.x0, layout.y0, 0.0) * layout.scale, 1e-6));
    }

    #[test]
    fn test_every_fifth_instance_is_green() {
        let green: Vec<u32> = (0..16).filter(|&i| instance_color(i) == Vec3::Y).collect();
        assert_eq!(green, vec![4, 9, 14]);
        assert_eq!(instance_color(0), Vec3::new(0.0, 0.7, 1.0));
    }
}
