use std::fs::File;
use std::io::BufWriter;

use anyhow::Result;
use glam::{Mat4, Vec3};
use lazy_static::lazy_static;
use log::info;

use voxray::{FrameInput, Renderer, RendererParameter, VolumeDescriptor};

lazy_static! {
    // A warm ramp: dark red through orange into white, with the
    // faintest densities fully transparent.
    static ref DEMO_LUT: Vec<[f32; 4]> = (0..256)
        .map(|i| {
            let t = i as f32 / 255.0;
            let alpha = if t < 0.05 { 0.0 } else { t * t };
            [t, t * t, t * t * t, alpha]
        })
        .collect();
}

fn main() -> Result<()> {
    std::env::set_var("RUST_LOG", "info");
    pretty_env_logger::init();

    // A procedural test volume: a soft density blob with a
    // denser core, falling off towards the boundary.
    let n = 128_usize;
    let desc = VolumeDescriptor {
        size: (n, n, n),
        bpc: 1,
        extent: Vec3::splat(2.0),
        position: Vec3::ZERO,
    };

    let mut raw = vec![0u8; desc.voxel_count()];
    for z in 0..n {
        for y in 0..n {
            for x in 0..n {
                let p = Vec3::new(x as f32, y as f32, z as f32) / (n - 1) as f32 * 2.0 - 1.0;
                let density = (1.0 - p.length()).max(0.0);
                raw[(z * n + y) * n + x] = (density * density * 255.0) as u8;
            }
        }
    }

    let mut renderer = Renderer::new(desc, &[raw])?;
    renderer.update_transfer_function(&DEMO_LUT)?;
    renderer.set_parameter(RendererParameter::Lighting(true));
    renderer.set_parameter(RendererParameter::Quality(2.0));

    let (width, height) = (800_usize, 600_usize);
    let model_view = Mat4::look_at_rh(Vec3::new(1.2, 1.0, 2.4), Vec3::ZERO, Vec3::Y);
    let projection = Mat4::perspective_rh_gl(
        45.0_f32.to_radians(),
        width as f32 / height as f32,
        0.1,
        100.0,
    );

    renderer.render(&FrameInput {
        width,
        height,
        model_view: model_view.to_cols_array(),
        projection: projection.to_cols_array(),
        background: [0.0, 0.0, 0.0, 0.0],
    })?;

    write_png("volume.png", &renderer)?;
    info!("Wrote volume.png ({width}x{height}).");

    Ok(())
}

// Packs the strided framebuffer rows tightly and encodes them.
fn write_png(path: &str, renderer: &Renderer) -> Result<()> {
    let fb = renderer.framebuffer();
    let (width, height, stride) = (fb.width(), fb.height(), fb.tex_width());

    let mut rows = Vec::with_capacity(width * height * 4);
    for y in 0..height {
        let offset = y * stride * 4;
        rows.extend_from_slice(&fb.color()[offset..offset + width * 4]);
    }

    let file = File::create(path)?;
    let mut encoder = png::Encoder::new(BufWriter::new(file), width as u32, height as u32);
    encoder.set_color(png::ColorType::Rgba);
    encoder.set_depth(png::BitDepth::Eight);

    let mut writer = encoder.write_header()?;
    writer.write_image_data(&rows)?;

    Ok(())
}
