//! Benchmarks for image validation and flash programming

use std::hint::black_box;
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use switchfw_update::image::check_header;
use switchfw_update::prelude::*;

const SOC: u32 = 0x7468;

fn validator(keys: StaticKeyProvider) -> ImageValidator {
    let config = FirmwareConfig {
        system: SystemIdentity {
            soc_family: SOC,
            machine: None,
        },
        ..FirmwareConfig::default()
    };
    ImageValidator::new(Arc::new(keys), &config)
}

fn bench_check_header(c: &mut Criterion) {
    let image = ImageBuilder::new("demo", SOC)
        .kernel(vec![0u8; 1024])
        .build()
        .expect("Image build failed");
    c.bench_function("check_header", |b| {
        b.iter(|| check_header(black_box(&image), SOC).expect("Header rejected"));
    });
}

fn bench_check_image(c: &mut Criterion) {
    let mut group = c.benchmark_group("check_image");
    let keypair = KeyPair::generate().expect("Key generation failed");
    let signed_validator = validator(StaticKeyProvider::with_firmware_key(
        keypair.public_key.clone(),
    ));
    let md5_validator = validator(StaticKeyProvider::new());

    for size in [1024usize, 64 * 1024, 1024 * 1024] {
        let kernel: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        group.throughput(Throughput::Bytes(size as u64));

        let md5 = ImageBuilder::new("demo", SOC)
            .kernel(kernel.clone())
            .build()
            .expect("Image build failed");
        group.bench_with_input(BenchmarkId::new("md5", size), &md5, |b, image| {
            b.iter(|| md5_validator.check_image(image, None).expect("Image rejected"));
        });

        let sha256 = ImageBuilder::new("demo", SOC)
            .kernel(kernel)
            .signature(SignatureType::Sha256)
            .signing_key(
                KeyPair::from_bytes(&keypair.secret_bytes(), "bench")
                    .expect("Key copy failed"),
            )
            .build()
            .expect("Image build failed");
        group.bench_with_input(BenchmarkId::new("sha256", size), &sha256, |b, image| {
            b.iter(|| {
                signed_validator
                    .check_image(image, None)
                    .expect("Image rejected")
            });
        });
    }

    group.finish();
}

fn bench_program(c: &mut Criterion) {
    let mut group = c.benchmark_group("program");
    for size in [4096usize, 256 * 1024] {
        let data = vec![0x5Au8; size];
        let bank = SimFlashBank::new();
        bank.add_partition("linux", size as u64, 4096);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("erase_program", size), &data, |b, data| {
            b.iter(|| {
                let mut handle = FlashHandle::open(&bank, "linux").expect("Open failed");
                handle.erase(data.len() as u64).expect("Erase failed");
                handle.program(data).expect("Program failed");
                handle.close();
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_check_header, bench_check_image, bench_program);
criterion_main!(benches);
