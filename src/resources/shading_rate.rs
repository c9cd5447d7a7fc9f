//! Shading rate images and viewport palettes
//!
//! Every texel of a rate image covers one hardware tile and holds a rate
//! class. The class indexes into the active viewport palette, which maps it
//! to an actual invocation density.

use std::fmt;
use std::str::FromStr;

use crate::backend::{
    BackendResult, GraphicsBackend, ShadingRate, ShadingRateProperties, TextureDescriptor,
    TextureFormat, TextureHandle, TextureUsage,
};

/// Palette used for regular draws
pub const ADAPTIVE_PALETTE: u32 = 0;
/// Palette used for draws exempt from rate reduction
pub const FULL_RATE_PALETTE: u32 = 1;

/// The rate images kept alive at all times
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShadingRateImage {
    /// Foveated around the framebuffer center
    Varying,
    /// Foveated around the pointer
    MouseTracking,
    Rate1x1,
    Rate2x2,
    Rate4x4,
}

impl ShadingRateImage {
    pub const ALL: [ShadingRateImage; 5] = [
        ShadingRateImage::Varying,
        ShadingRateImage::MouseTracking,
        ShadingRateImage::Rate1x1,
        ShadingRateImage::Rate2x2,
        ShadingRateImage::Rate4x4,
    ];

    fn index(self) -> usize {
        self as usize
    }

    fn label(self) -> &'static str {
        match self {
            ShadingRateImage::Varying => "Varying Rate Image",
            ShadingRateImage::MouseTracking => "Mouse Tracking Rate Image",
            ShadingRateImage::Rate1x1 => "1x1 Rate Image",
            ShadingRateImage::Rate2x2 => "2x2 Rate Image",
            ShadingRateImage::Rate4x4 => "4x4 Rate Image",
        }
    }
}

/// Shading mode selectable in the settings panel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ShadingMode {
    #[default]
    Varying,
    Rate1x1,
    Rate2x2,
    Rate4x4,
    MouseTracking,
}

impl ShadingMode {
    pub const ALL: [ShadingMode; 5] = [
        ShadingMode::Varying,
        ShadingMode::Rate1x1,
        ShadingMode::Rate2x2,
        ShadingMode::Rate4x4,
        ShadingMode::MouseTracking,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ShadingMode::Varying => "Varying shading rate",
            ShadingMode::Rate1x1 => "1x1 rate",
            ShadingMode::Rate2x2 => "2x2 rate",
            ShadingMode::Rate4x4 => "4x4 rate",
            ShadingMode::MouseTracking => "Mouse tracking rate",
        }
    }

    pub fn image(self) -> ShadingRateImage {
        match self {
            ShadingMode::Varying => ShadingRateImage::Varying,
            ShadingMode::Rate1x1 => ShadingRateImage::Rate1x1,
            ShadingMode::Rate2x2 => ShadingRateImage::Rate2x2,
            ShadingMode::Rate4x4 => ShadingRateImage::Rate4x4,
            ShadingMode::MouseTracking => ShadingRateImage::MouseTracking,
        }
    }
}

impl fmt::Display for ShadingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ShadingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "varying" => Ok(ShadingMode::Varying),
            "1x1" => Ok(ShadingMode::Rate1x1),
            "2x2" => Ok(ShadingMode::Rate2x2),
            "4x4" => Ok(ShadingMode::Rate4x4),
            "mouse" | "mouse-tracking" => Ok(ShadingMode::MouseTracking),
            other => Err(format!(
                "unknown shading mode '{}', expected varying, 1x1, 2x2, 4x4 or mouse",
                other
            )),
        }
    }
}

/// One viewport palette, always exactly `palette_size` entries long
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatePalette {
    rates: Vec<ShadingRate>,
}

impl RatePalette {
    /// `[periphery, 1x1, 2x2, 4x4]` followed by full rate in the remaining slots
    pub fn adaptive(palette_size: u32, periphery: ShadingRate) -> Self {
        let mut rates = vec![ShadingRate::OneInvocationPerPixel; palette_size as usize];
        let head = [
            periphery,
            ShadingRate::OneInvocationPerPixel,
            ShadingRate::OneInvocationPer2x2Pixels,
            ShadingRate::OneInvocationPer4x4Pixels,
        ];
        for (slot, rate) in rates.iter_mut().zip(head) {
            *slot = rate;
        }
        Self { rates }
    }

    /// Full rate in every slot
    pub fn full_rate(palette_size: u32) -> Self {
        Self {
            rates: vec![ShadingRate::OneInvocationPerPixel; palette_size as usize],
        }
    }

    pub fn rates(&self) -> &[ShadingRate] {
        &self.rates
    }
}

/// Owner of the five rate images and the palettes
#[derive(Debug)]
pub struct ShadingRateImages {
    properties: ShadingRateProperties,
    palettes: [RatePalette; 2],
    width: u32,
    height: u32,
    data: Vec<u8>,
    textures: [Option<TextureHandle>; 5],
    generation: u32,
}

impl ShadingRateImages {
    pub fn new(properties: ShadingRateProperties) -> Self {
        Self::with_periphery_rate(properties, ShadingRate::NoInvocations)
    }

    /// Like [`new`](Self::new) with an explicit density for rate class 0
    pub fn with_periphery_rate(properties: ShadingRateProperties, periphery: ShadingRate) -> Self {
        Self {
            properties,
            palettes: [
                RatePalette::adaptive(properties.palette_size, periphery),
                RatePalette::full_rate(properties.palette_size),
            ],
            width: 0,
            height: 0,
            data: Vec::new(),
            textures: [None; 5],
            generation: 0,
        }
    }

    /// Image width in tiles
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Image height in tiles
    pub fn height(&self) -> u32 {
        self.height
    }

    /// CPU copy of the last generated pattern
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn texture(&self, image: ShadingRateImage) -> Option<TextureHandle> {
        self.textures[image.index()]
    }

    pub fn palettes(&self) -> &[RatePalette; 2] {
        &self.palettes
    }

    pub fn properties(&self) -> ShadingRateProperties {
        self.properties
    }

    /// Number of times the images have been reallocated
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Match the images to a framebuffer of `width` x `height` pixels
    pub fn update_textures(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        width: u32,
        height: u32,
    ) -> BackendResult<()> {
        let tiles_x = width.div_ceil(self.properties.tile_width.max(1)).max(1);
        let tiles_y = height.div_ceil(self.properties.tile_height.max(1)).max(1);

        let allocated = self.textures.iter().all(Option::is_some);
        if allocated && tiles_x == self.width && tiles_y == self.height {
            return Ok(());
        }

        self.destroy(backend);
        self.width = tiles_x;
        self.height = tiles_y;
        self.generation += 1;
        log::debug!(
            "Allocating shading rate images: {}x{} tiles for {}x{} pixels",
            tiles_x,
            tiles_y,
            width,
            height
        );

        for image in ShadingRateImage::ALL {
            let texture = backend.create_texture(&TextureDescriptor {
                label: Some(image.label().to_string()),
                width: tiles_x,
                height: tiles_y,
                format: TextureFormat::R8Uint,
                usage: TextureUsage::SHADING_RATE
                    | TextureUsage::TEXTURE_BINDING
                    | TextureUsage::COPY_DST,
            })?;
            self.textures[image.index()] = Some(texture);
        }

        self.create_foveation_texture(0.5, 0.5);
        self.upload_foveation_data_to_texture(backend, ShadingRateImage::Varying)?;
        self.upload_foveation_data_to_texture(backend, ShadingRateImage::MouseTracking)?;

        for (image, value) in [
            (ShadingRateImage::Rate1x1, 1),
            (ShadingRateImage::Rate2x2, 2),
            (ShadingRateImage::Rate4x4, 3),
        ] {
            self.create_constant_foveation_texture(value);
            self.upload_foveation_data_to_texture(backend, image)?;
        }

        Ok(())
    }

    /// Fill the CPU buffer with concentric rate classes around a normalized center
    pub fn create_foveation_texture(&mut self, center_x: f32, center_y: f32) {
        let (width, height) = (self.width, self.height);
        self.data.clear();
        self.data.reserve((width * height) as usize);

        for y in 0..height {
            for x in 0..width {
                let fx = x as f32 / width as f32;
                let fy = y as f32 / height as f32;
                let d = ((fx - center_x).powi(2) + (fy - center_y).powi(2)).sqrt();
                let class = if d < 0.15 {
                    1
                } else if d < 0.3 {
                    2
                } else if d < 0.45 {
                    3
                } else {
                    0
                };
                self.data.push(class);
            }
        }
    }

    /// Fill the CPU buffer with a single rate class
    pub fn create_constant_foveation_texture(&mut self, value: u8) {
        self.data.clear();
        self.data.resize((self.width * self.height) as usize, value);
    }

    /// Copy the CPU buffer into one of the images
    pub fn upload_foveation_data_to_texture(
        &self,
        backend: &mut dyn GraphicsBackend,
        image: ShadingRateImage,
    ) -> BackendResult<()> {
        match self.texture(image) {
            Some(texture) => backend.write_texture(texture, &self.data, self.width, self.height),
            None => {
                log::warn!("{} not allocated, skipping upload", image.label());
                Ok(())
            }
        }
    }

    /// Regenerate the pointer-centered image from normalized cursor coordinates
    pub fn update_mouse_tracking(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        cursor_x: f32,
        cursor_y: f32,
    ) -> BackendResult<()> {
        self.create_foveation_texture(cursor_x, cursor_y);
        self.upload_foveation_data_to_texture(backend, ShadingRateImage::MouseTracking)
    }

    /// Program both viewport palettes.
    ///
    /// # Panics
    ///
    /// Panics if the device palette holds fewer than four entries.
    pub fn setup_shading_rate_palette(&self, backend: &mut dyn GraphicsBackend) {
        assert!(
            self.properties.palette_size >= 4,
            "shading rate palette holds {} entries, at least 4 are required",
            self.properties.palette_size
        );
        backend.set_shading_rate_palette(ADAPTIVE_PALETTE, self.palettes[0].rates());
        backend.set_shading_rate_palette(FULL_RATE_PALETTE, self.palettes[1].rates());
    }

    /// Bind the image for `mode`, enabling rate control only when `activate` is set
    pub fn bind_shading_rate_texture(
        &self,
        backend: &mut dyn GraphicsBackend,
        mode: ShadingMode,
        activate: bool,
    ) {
        match self.texture(mode.image()) {
            Some(texture) => backend.bind_shading_rate_image(texture),
            None => log::warn!("No shading rate image allocated for {}", mode),
        }
        backend.set_shading_rate_image_enabled(activate);
    }

    pub fn destroy(&mut self, backend: &mut dyn GraphicsBackend) {
        for texture in self.textures.iter_mut() {
            if let Some(texture) = texture.take() {
                backend.destroy_texture(texture);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Command, RecordingBackend};
    use rstest::rstest;

    fn images(width: u32, height: u32) -> (RecordingBackend, ShadingRateImages) {
        let mut backend = RecordingBackend::new(width, height);
        let mut images = ShadingRateImages::new(ShadingRateProperties::default());
        images.update_textures(&mut backend, width, height).unwrap();
        (backend, images)
    }

    #[rstest]
    #[case::exact(320, 160, 20, 10)]
    #[case::rounded_up(1200, 900, 75, 57)]
    #[case::tiny(1, 1, 1, 1)]
    fn test_size_rounds_up_to_tiles(
        #[case] width: u32,
        #[case] height: u32,
        #[case] tiles_x: u32,
        #[case] tiles_y: u32,
    ) {
        let (_, images) = images(width, height);
        assert_eq!((images.width(), images.height()), (tiles_x, tiles_y));
    }

    #[test]
    fn test_origin_tile_at_origin_center_is_full_rate() {
        let (_, mut images) = images(320, 320);
        images.create_foveation_texture(0.0, 0.0);
        assert_eq!(images.data()[0], 1);
    }

    #[test]
    fn test_far_tiles_fall_to_class_zero() {
        let (_, mut images) = images(320, 320);
        images.create_foveation_texture(0.5, 0.5);
        // Tile (0, 0) lies at distance sqrt(0.5) from the center
        assert_eq!(images.data()[0], 0);
        // Tile (10, 10) is the center itself
        assert_eq!(images.data()[10 * 20 + 10], 1);
    }

    #[rstest]
    #[case::inner(0.1, 1)]
    #[case::middle(0.2, 2)]
    #[case::outer(0.4, 3)]
    #[case::periphery(0.45, 0)]
    fn test_foveation_rings(#[case] distance: f32, #[case] class: u8) {
        let (_, mut images) = images(1600, 16);
        // 100 tiles wide, one row; tile x sits at fx = x / 100
        images.create_foveation_texture(0.0, 0.0);
        let x = (distance * 100.0).round() as usize;
        assert_eq!(images.data()[x], class);
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(3)]
    fn test_constant_fill(#[case] value: u8) {
        let (_, mut images) = images(200, 100);
        images.create_constant_foveation_texture(value);
        assert_eq!(images.data().len(), 13 * 7);
        assert!(images.data().iter().all(|&v| v == value));
    }

    #[test]
    fn test_unchanged_size_does_not_reallocate() {
        let (mut backend, mut images) = images(640, 480);
        let created = backend.count(|c| matches!(c, Command::CreateTexture { .. }));
        assert_eq!(created, 5);

        images.update_textures(&mut backend, 640, 480).unwrap();
        // Same tile count from a slightly different pixel size
        images.update_textures(&mut backend, 636, 470).unwrap();

        assert_eq!(images.generation(), 1);
        assert_eq!(backend.count(|c| matches!(c, Command::CreateTexture { .. })), 5);

        images.update_textures(&mut backend, 1280, 960).unwrap();
        assert_eq!(images.generation(), 2);
        assert_eq!(backend.live_texture_count(), 5);
    }

    #[test]
    fn test_constant_images_are_uploaded() {
        let (backend, images) = images(64, 32);
        let texture = images.texture(ShadingRateImage::Rate4x4).unwrap();
        assert_eq!(backend.texture_data(texture), Some(&[3u8; 8][..]));
    }

    #[test]
    fn test_palettes() {
        let images = ShadingRateImages::new(ShadingRateProperties::default());
        let [adaptive, full] = images.palettes();
        assert_eq!(adaptive.rates().len(), 16);
        assert_eq!(
            &adaptive.rates()[..4],
            &[
                ShadingRate::NoInvocations,
                ShadingRate::OneInvocationPerPixel,
                ShadingRate::OneInvocationPer2x2Pixels,
                ShadingRate::OneInvocationPer4x4Pixels,
            ]
        );
        assert!(adaptive.rates()[4..]
            .iter()
            .all(|&r| r == ShadingRate::OneInvocationPerPixel));
        assert!(full.rates().iter().all(|&r| r == ShadingRate::OneInvocationPerPixel));
    }

    #[test]
    #[should_panic(expected = "at least 4 are required")]
    fn test_small_palette_is_fatal() {
        let mut backend = RecordingBackend::new(64, 64);
        let images = ShadingRateImages::new(ShadingRateProperties {
            palette_size: 3,
            ..Default::default()
        });
        images.setup_shading_rate_palette(&mut backend);
    }

    #[test]
    fn test_mouse_tracking_follows_cursor() {
        let (mut backend, mut images) = images(320, 320);
        images.update_mouse_tracking(&mut backend, 0.0, 0.0).unwrap();
        let texture = images.texture(ShadingRateImage::MouseTracking).unwrap();
        let data = backend.texture_data(texture).unwrap();
        assert_eq!(data[0], 1);
        assert_eq!(data[data.len() - 1], 0);
    }

    #[rstest]
    #[case::active(true)]
    #[case::inactive(false)]
    fn test_bind_respects_activation(#[case] activate: bool) {
        let (mut backend, images) = images(64, 64);
        backend.clear_commands();
        images.bind_shading_rate_texture(&mut backend, ShadingMode::Rate2x2, activate);

        let expected = images.texture(ShadingRateImage::Rate2x2).unwrap();
        assert_eq!(
            backend.commands(),
            &[
                Command::BindShadingRateImage(expected),
                Command::SetShadingRateImageEnabled(activate),
            ]
        );
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("4x4".parse::<ShadingMode>(), Ok(ShadingMode::Rate4x4));
        assert_eq!("Mouse".parse::<ShadingMode>(), Ok(ShadingMode::MouseTracking));
        assert!("8x8".parse::<ShadingMode>().is_err());
        assert_eq!(ShadingMode::Rate1x1.to_string(), "1x1 rate");
    }
}
