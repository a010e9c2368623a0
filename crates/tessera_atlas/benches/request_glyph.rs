//! Glyph lookup benchmarks
//!
//! - hit path: a warm working set that fits in the atlas
//! - miss path: a key stream twice the atlas capacity, so every request
//!   evicts
//! - frame: a paragraph worth of new glyphs queued and recorded

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

use tessera_atlas::headless::{HeadlessBackend, HeadlessCommands};
use tessera_atlas::{
    AtlasConfig, AtlasManager, DispatchMode, GlyphCache, GlyphKey, RasterError, RasterizedGlyph,
};

type Raster = fn(&GlyphKey) -> Result<RasterizedGlyph, RasterError>;

fn glyph(_key: &GlyphKey) -> Result<RasterizedGlyph, RasterError> {
    Ok(RasterizedGlyph::new(10, 14, vec![0x80; 140]))
}

fn atlas(config: AtlasConfig) -> AtlasManager<HeadlessBackend, Raster> {
    let backend = HeadlessBackend::new(&config).with_row_alignment(256);
    match AtlasManager::new(config, backend, glyph as Raster, DispatchMode::Inline) {
        Ok(atlas) => atlas,
        Err(e) => panic!("failed to create atlas: {}", e),
    }
}

fn bench_cache_hit(c: &mut Criterion) {
    let mut cache = GlyphCache::new(&AtlasConfig::default());
    let keys: Vec<GlyphKey> = (0..512).map(|cp| GlyphKey::new(0, cp, 14 << 16)).collect();
    for key in &keys {
        cache.request(*key);
    }

    let mut i = 0;
    c.bench_function("cache_hit", |b| {
        b.iter(|| {
            i = (i + 1) % keys.len();
            black_box(cache.request(keys[i]));
        });
    });
}

fn bench_cache_miss_evicting(c: &mut Criterion) {
    let config = AtlasConfig::square(1024, 64);
    let capacity = config.page_capacity() as u32;

    c.bench_function("cache_miss_evicting", |b| {
        b.iter_batched(
            || {
                let mut atlas = atlas(config.clone());
                for cp in 0..capacity {
                    let _ = atlas.request_glyph(GlyphKey::new(0, cp, 14 << 16));
                }
                atlas
            },
            |mut atlas| {
                for cp in capacity..capacity * 2 {
                    let _ = black_box(atlas.request_glyph(GlyphKey::new(0, cp, 14 << 16)));
                }
                atlas
            },
            BatchSize::LargeInput,
        );
    });
}

fn bench_upload_frame(c: &mut Criterion) {
    let config = AtlasConfig::default();

    c.bench_function("upload_frame_96_glyphs", |b| {
        b.iter_batched(
            || atlas(config.clone()),
            |mut atlas| {
                for cp in 0..96 {
                    let _ = atlas.request_glyph(GlyphKey::new(0, 0x20 + cp, 14 << 16));
                }
                let mut cmd = HeadlessCommands::default();
                let _ = black_box(atlas.process_uploads(&mut cmd));
                atlas
            },
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(
    benches,
    bench_cache_hit,
    bench_cache_miss_evicting,
    bench_upload_frame
);
criterion_main!(benches);
