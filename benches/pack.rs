use criterion::{Criterion, criterion_group, criterion_main};
use image::{Rgba, RgbaImage};
use vrm_atlas::atlas::{RectSize, composite, pack_textures_nfdh};

/// Deterministic spread of texture sizes typical for avatar materials.
fn make_sizes(n: u32) -> Vec<RectSize> {
    (0..n)
        .map(|i| {
            let w = 64 << (i % 4);
            let h = if i % 3 == 0 { w / 2 } else { w };
            RectSize::new(w, h)
        })
        .collect()
}

fn bench_pack(c: &mut Criterion) {
    let sizes = make_sizes(48);

    c.bench_function("pack_nfdh_48_textures", |b| {
        b.iter(|| pack_textures_nfdh(&sizes, 4096, 4096, 4));
    });

    // Forces several retry-ladder steps
    c.bench_function("pack_nfdh_48_textures_downscaled", |b| {
        b.iter(|| pack_textures_nfdh(&sizes, 1024, 1024, 4));
    });
}

fn bench_composite(c: &mut Criterion) {
    let sizes = make_sizes(16);
    let packing = pack_textures_nfdh(&sizes, 2048, 2048, 4).expect("pack");
    let sources: Vec<Option<RgbaImage>> = packing
        .placements
        .iter()
        .map(|p| {
            let shade = (p.source_index * 15) as u8;
            Some(RgbaImage::from_pixel(p.width, p.height, Rgba([shade, 128, 255 - shade, 255])))
        })
        .collect();

    c.bench_function("composite_16_textures_bleed4", |b| {
        b.iter(|| composite(&packing, &sources, 4));
    });
}

criterion_group!(benches, bench_pack, bench_composite);
criterion_main!(benches);
